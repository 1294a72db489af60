//! The receiver service: listeners, accept loop and per-connection loops.
//!
//! ```text
//!  start()
//!    ├─ bind control TCP listener   (port retry)
//!    ├─ bind data/control UDP pair  (port retry)
//!    └─ spawn accept loop
//!          └─ per connection: Framed<TcpStream, RtspCodec>
//!                 read → Responder::handle → write   (sequential)
//! ```
//!
//! Cancelling the service token stops the accept loop, every connection
//! loop and both datagram loops.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Serialize, Serializer};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::MiraError;
use crate::events::{DecodePipeline, EventSender, SinkEvent};
use crate::identity::DeviceIdentity;
use crate::pairing::{DEFAULT_IDLE_TIMEOUT, PairingRegistry};
use crate::rtsp::info::PROTOCOL_VERSION;
use crate::rtsp::{ConnectionContext, DeviceInfo, Features, Inbound, Responder, RtspCodec};
use crate::transport::{DatagramPair, bind_with_retry};

// ── ReceiverConfig ───────────────────────────────────────────────

/// Runtime parameters for [`MirrorService`].
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub bind_address: IpAddr,
    /// Control connection port. 0 picks an ephemeral port.
    pub control_port: u16,
    /// Data datagram port; the control datagram port is the next one.
    pub data_port: u16,
    pub port_attempts: u16,
    /// Bound on each listener bind attempt.
    pub start_timeout: Duration,
    pub name: String,
    pub model: String,
    pub source_version: String,
    pub features: Features,
    pub pairing_idle_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: 7000,
            data_port: 7100,
            port_attempts: 10,
            start_timeout: Duration::from_secs(2),
            name: "Mira".to_string(),
            model: "AppleTV3,2".to_string(),
            source_version: "220.68".to_string(),
            features: Features::RECEIVER,
            pairing_idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

// ── Advertisement ────────────────────────────────────────────────

/// What the discovery advertiser needs to publish this receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advertisement {
    pub name: String,
    pub device_id: String,
    #[serde(serialize_with = "advertised_features")]
    pub features: Features,
    pub model: String,
    pub source_version: String,
    #[serde(serialize_with = "hex_key")]
    pub public_key: [u8; 32],
    pub instance_id: String,
    pub control_port: u16,
    pub data_port: u16,
}

impl Advertisement {
    /// Presence record key/value pairs.
    pub fn txt_records(&self) -> Vec<(String, String)> {
        vec![
            ("deviceid".into(), self.device_id.clone()),
            ("features".into(), self.features.to_advertised()),
            ("model".into(), self.model.clone()),
            ("pi".into(), self.instance_id.clone()),
            ("pk".into(), hex::encode(self.public_key)),
            ("srcvers".into(), self.source_version.clone()),
            ("vv".into(), PROTOCOL_VERSION.to_string()),
        ]
    }

    /// JSON form for an advertiser running in another process.
    pub fn to_json(&self) -> Result<String, MiraError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn advertised_features<S: Serializer>(features: &Features, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&features.to_advertised())
}

fn hex_key<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(key))
}

// ── MirrorService ────────────────────────────────────────────────

pub struct MirrorService {
    config: ReceiverConfig,
    identity: Arc<DeviceIdentity>,
    pipeline: Arc<dyn DecodePipeline>,
    events: EventSender,
    cancel: CancellationToken,
}

impl MirrorService {
    pub fn new(
        config: ReceiverConfig,
        identity: Arc<DeviceIdentity>,
        pipeline: Arc<dyn DecodePipeline>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            identity,
            pipeline,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the service when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Bind every listener and start accepting.
    ///
    /// A bind failure is reported as a [`SinkEvent::Error`] as well as
    /// returned; nothing is left running.
    pub async fn start(&self) -> Result<RunningService, MiraError> {
        match self.try_start().await {
            Ok(running) => Ok(running),
            Err(e) => {
                error!("receiver failed to start: {e}");
                let event = SinkEvent::Error {
                    description: e.to_string(),
                };
                if self.events.send(event).is_err() {
                    debug!("event receiver dropped");
                }
                Err(e)
            }
        }
    }

    /// Start and wait until the service is cancelled.
    pub async fn run(&self) -> Result<(), MiraError> {
        self.start().await?.join().await;
        Ok(())
    }

    async fn try_start(&self) -> Result<RunningService, MiraError> {
        let cfg = &self.config;
        let addr = cfg.bind_address;

        let listener = bind_with_retry(
            cfg.control_port,
            1,
            cfg.port_attempts,
            cfg.start_timeout,
            |port| TcpListener::bind(SocketAddr::new(addr, port)),
        )
        .await?;
        let local_addr = listener.local_addr()?;

        let datagrams = Arc::new(
            DatagramPair::bind(addr, cfg.data_port, cfg.port_attempts, cfg.start_timeout).await?,
        );

        let info = DeviceInfo::from_identity(
            &self.identity,
            cfg.features,
            &cfg.model,
            &cfg.source_version,
        )?;
        let advertisement = Advertisement {
            name: cfg.name.clone(),
            device_id: info.device_id.clone(),
            features: info.features,
            model: info.model.clone(),
            source_version: info.source_version.clone(),
            public_key: info.public_key,
            instance_id: info.instance_id.clone(),
            control_port: local_addr.port(),
            data_port: datagrams.ports().data,
        };

        let pairing =
            PairingRegistry::with_idle_timeout(Arc::clone(&self.identity), cfg.pairing_idle_timeout);
        let responder = Arc::new(Responder::new(
            &info,
            pairing,
            datagrams,
            Arc::clone(&self.pipeline),
            self.events.clone(),
            self.cancel.clone(),
        )?);

        info!(
            control = %local_addr,
            data = advertisement.data_port,
            device_id = %advertisement.device_id,
            "receiver listening"
        );

        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&responder),
            self.cancel.clone(),
        ));

        Ok(RunningService {
            advertisement,
            local_addr,
            responder,
            accept,
        })
    }
}

impl std::fmt::Debug for MirrorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorService")
            .field("config", &self.config)
            .field("identity", &self.identity)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

// ── RunningService ───────────────────────────────────────────────

/// Handle to a started service.
#[derive(Debug)]
pub struct RunningService {
    advertisement: Advertisement,
    local_addr: SocketAddr,
    responder: Arc<Responder>,
    accept: JoinHandle<()>,
}

impl RunningService {
    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    /// Address of the control listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.responder.connection_count()
    }

    pub fn is_streaming(&self) -> bool {
        self.responder.datagrams().is_streaming()
    }

    /// Wait for the accept loop to finish.
    pub async fn join(self) {
        if let Err(e) = self.accept.await {
            error!("accept loop panicked: {e}");
        }
    }
}

// ── Loops ────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, responder: Arc<Responder>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = cancel.cancelled() => break,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept error: {e}");
                continue;
            }
        };

        tokio::spawn(serve_connection(
            stream,
            peer,
            Arc::clone(&responder),
            cancel.child_token(),
        ));
    }

    info!("receiver stopped accepting");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    responder: Arc<Responder>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "set_nodelay failed: {e}");
    }

    let mut ctx = ConnectionContext::new(peer);
    responder.open(&ctx);
    info!(conn = %ctx.id, %peer, "connection accepted");

    let mut framed = Framed::new(stream, RtspCodec::default());
    loop {
        let next = tokio::select! {
            item = framed.next() => item,
            _ = cancel.cancelled() => break,
        };

        match next {
            Some(Ok(Inbound::Request(request))) => {
                let response = responder.handle(&mut ctx, &request);
                if let Err(e) = framed.send(response).await {
                    warn!(conn = %ctx.id, "write failed: {e}");
                    break;
                }
            }
            Some(Ok(Inbound::Malformed(why))) => {
                warn!(conn = %ctx.id, "dropping malformed request: {why}");
            }
            Some(Err(e)) => {
                warn!(conn = %ctx.id, "read failed: {e}");
                break;
            }
            None => break,
        }
    }

    responder.close(ctx.id);
    info!(conn = %ctx.id, %peer, state = %ctx.session, "connection closed");
}

// ── Tests ────────────────────────────────────────────────────────
