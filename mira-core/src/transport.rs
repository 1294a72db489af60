//! Transport negotiation and datagram listeners.
//!
//! The datagram pair is bound once at service start (with port retry)
//! so the advertiser can publish the real ports. SETUP answers with that
//! pair and starts the receive loops the first time it is needed:
//!
//! - **data** port: every payload goes to the [`Demuxer`].
//! - **control** port: drained and discarded so the sender never stalls.
//!
//! ## Transport header
//!
//! ```text
//! request:  RTP/AVP/UDP;unicast;client_port=<c1>-<c2>
//! response: RTP/AVP/UDP;unicast;client_port=<c1>-<c2>;server_port=<s1>-<s2>
//! ```

use std::future::Future;
use std::io;
use std::ops::ControlFlow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::demux::Demuxer;
use crate::error::MiraError;
use crate::events::{DecodePipeline, EventSender, SinkEvent};

/// Client ports assumed when the request names none.
pub const DEFAULT_CLIENT_PORTS: (u16, u16) = (0, 1);

/// Receive buffer per datagram; larger than any sane UDP payload.
const RECV_BUFFER: usize = 64 * 1024;

// ── Transport header ─────────────────────────────────────────────

/// Server-side datagram ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerPorts {
    pub data: u16,
    pub control: u16,
}

/// Extract `client_port=<a>-<b>` from a transport header value.
pub fn parse_client_ports(header: &str) -> (u16, u16) {
    header
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("client_port="))
        .find_map(|range| {
            let (a, b) = range.split_once('-')?;
            Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
        })
        .unwrap_or(DEFAULT_CLIENT_PORTS)
}

/// The negotiated transport header value for the response.
pub fn transport_response(client_ports: (u16, u16), server: ServerPorts) -> String {
    format!(
        "RTP/AVP/UDP;unicast;client_port={}-{};server_port={}-{}",
        client_ports.0, client_ports.1, server.data, server.control
    )
}

// ── Port retry ───────────────────────────────────────────────────

/// Bind with retry: attempt `n` binds `base + n * step`.
///
/// A base of 0 asks the OS for an ephemeral port on every attempt.
/// Each attempt is bounded by `wait`.
pub async fn bind_with_retry<T, F, Fut>(
    base: u16,
    step: u16,
    attempts: u16,
    wait: Duration,
    mut bind: F,
) -> Result<T, MiraError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let attempts = attempts.max(1);

    for n in 0..attempts {
        let port = if base == 0 {
            0
        } else {
            match n.checked_mul(step).and_then(|off| base.checked_add(off)) {
                Some(port) => port,
                None => break,
            }
        };
        match tokio::time::timeout(wait, bind(port)).await {
            Ok(Ok(bound)) => return Ok(bound),
            Ok(Err(e)) => warn!(port, "bind failed: {e}"),
            Err(_) => warn!(port, "bind timed out after {wait:?}"),
        }
    }

    Err(MiraError::Bind {
        port: base,
        attempts,
    })
}

// ── DatagramPair ─────────────────────────────────────────────────

/// The bound data/control sockets and their receive loops.
pub struct DatagramPair {
    data: Arc<UdpSocket>,
    control: Arc<UdpSocket>,
    ports: ServerPorts,
    streaming: Arc<AtomicBool>,
    loops: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl DatagramPair {
    /// Bind `base` (data) and the port after it (control), moving up two
    /// ports per failed attempt. With a base of 0 the data port is
    /// ephemeral and control still takes the next one.
    pub async fn bind(
        addr: IpAddr,
        base: u16,
        attempts: u16,
        wait: Duration,
    ) -> Result<Self, MiraError> {
        let (data, control) = bind_with_retry(base, 2, attempts, wait, |port| async move {
            let data = UdpSocket::bind(SocketAddr::new(addr, port)).await?;
            let control_port = data.local_addr()?.port().checked_add(1).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no port after data port")
            })?;
            let control = UdpSocket::bind(SocketAddr::new(addr, control_port)).await?;
            Ok::<_, std::io::Error>((data, control))
        })
        .await?;

        let ports = ServerPorts {
            data: data.local_addr()?.port(),
            control: control.local_addr()?.port(),
        };
        info!(data = ports.data, control = ports.control, "datagram ports bound");

        Ok(Self {
            data: Arc::new(data),
            control: Arc::new(control),
            ports,
            streaming: Arc::new(AtomicBool::new(false)),
            loops: Mutex::new(None),
        })
    }

    pub fn ports(&self) -> ServerPorts {
        self.ports
    }

    /// Shared "a session is streaming" flag checked by the data loop.
    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// True while both receive loops are running.
    pub fn is_listening(&self) -> bool {
        self.loops
            .lock()
            .as_ref()
            .is_some_and(|(data, control)| !data.is_finished() && !control.is_finished())
    }

    /// Start both receive loops unless they are already running. Loops
    /// that ended (cancelled or failed) are replaced.
    pub fn ensure_listening(
        &self,
        pipeline: Arc<dyn DecodePipeline>,
        events: EventSender,
        cancel: CancellationToken,
    ) {
        let mut loops = self.loops.lock();
        if let Some((data, control)) = loops.take() {
            if !data.is_finished() && !control.is_finished() {
                *loops = Some((data, control));
                return;
            }
            data.abort();
            control.abort();
            info!("restarting datagram receive loops");
        }

        let data = tokio::spawn(data_loop(
            Arc::clone(&self.data),
            Demuxer::new(pipeline),
            Arc::clone(&self.streaming),
            events.clone(),
            cancel.clone(),
        ));
        let control = tokio::spawn(drain_loop(Arc::clone(&self.control), events, cancel));
        *loops = Some((data, control));
        debug!("datagram receive loops started");
    }
}

impl std::fmt::Debug for DatagramPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramPair")
            .field("ports", &self.ports)
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

async fn data_loop(
    socket: Arc<UdpSocket>,
    mut demux: Demuxer,
    streaming: Arc<AtomicBool>,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        let received = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            _ = cancel.cancelled() => break,
        };

        match received {
            Ok((len, from)) => {
                if !streaming.load(Ordering::SeqCst) {
                    debug!(%from, len, "datagram outside a streaming session; dropped");
                    continue;
                }
                demux.push(&buf[..len]);
            }
            Err(e) => {
                if on_receive_error("data", e, &events).is_break() {
                    break;
                }
            }
        }
    }

    let stats = demux.stats();
    info!(
        frames = stats.frames,
        dropped = stats.dropped,
        ignored = stats.ignored,
        "data listener stopped"
    );
}

async fn drain_loop(socket: Arc<UdpSocket>, events: EventSender, cancel: CancellationToken) {
    let mut buf = vec![0u8; RECV_BUFFER];
    let mut drained: u64 = 0;

    loop {
        tokio::select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(_) => drained += 1,
                Err(e) => {
                    if on_receive_error("control", e, &events).is_break() {
                        break;
                    }
                }
            },
            _ = cancel.cancelled() => break,
        }
    }

    debug!(drained, "control listener stopped");
}

/// Errors a peer can provoke on one datagram; the socket stays usable.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
    )
}

/// Keep going on transient errors. Anything else stops the loop and is
/// reported; the next SETUP restarts it.
fn on_receive_error(socket: &str, e: io::Error, events: &EventSender) -> ControlFlow<()> {
    if is_transient(&e) {
        warn!("{socket} socket receive error: {e}; continuing");
        return ControlFlow::Continue(());
    }

    error!("{socket} socket receive failed: {e}");
    let event = SinkEvent::Error {
        description: format!("{socket} listener stopped: {e}"),
    };
    if events.send(event).is_err() {
        debug!("event receiver dropped");
    }
    ControlFlow::Break(())
}

// ── Tests ────────────────────────────────────────────────────────
