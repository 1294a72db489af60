//! Request dispatch and connection bookkeeping.
//!
//! One [`Responder`] is shared by every control connection. Each
//! connection owns a [`ConnectionContext`] and calls
//! [`Responder::handle`] sequentially, so responses leave in request
//! order and always echo the request's CSeq.
//!
//! ```text
//!  GET  /info          → binary plist
//!  POST /pair-setup    → PairingRegistry::handle_setup
//!  POST /pair-verify   → PairingRegistry::handle_verify
//!  POST /feedback      → 200
//!  OPTIONS             → Public: ...
//!  ANNOUNCE            → 200 (body ignored)
//!  SETUP               → Transport + Session, listeners started
//!  RECORD              → streaming, Connected event
//!  TEARDOWN            → not streaming
//!  GET_/SET_PARAMETER  → 200
//!  anything else       → 501
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::info::{BINARY_PLIST, DeviceInfo};
use super::message::{Method, Request, Response, Status};
use crate::error::MiraError;
use crate::events::{DecodePipeline, EventSender, SinkEvent};
use crate::pairing::PairingRegistry;
use crate::session::{ConnectionId, SessionState};
use crate::transport::{DatagramPair, parse_client_ports, transport_response};

pub const PAIRING_TLV: &str = "application/pairing+tlv8";

pub const PUBLIC_METHODS: &str =
    "ANNOUNCE, SETUP, RECORD, TEARDOWN, OPTIONS, GET_PARAMETER, SET_PARAMETER, POST, GET";

// ── ConnectionContext ────────────────────────────────────────────

/// State owned by a single control connection.
#[derive(Debug)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub session: SessionState,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            session: SessionState::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionEntry {
    peer: SocketAddr,
    has_streamed: bool,
}

// ── Responder ────────────────────────────────────────────────────

pub struct Responder {
    info: Bytes,
    pairing: PairingRegistry,
    datagrams: Arc<DatagramPair>,
    pipeline: Arc<dyn DecodePipeline>,
    events: EventSender,
    cancel: CancellationToken,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

impl Responder {
    pub fn new(
        info: &DeviceInfo,
        pairing: PairingRegistry,
        datagrams: Arc<DatagramPair>,
        pipeline: Arc<dyn DecodePipeline>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<Self, MiraError> {
        Ok(Self {
            info: Bytes::from(info.to_plist()?),
            pairing,
            datagrams,
            pipeline,
            events,
            cancel,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn datagrams(&self) -> &DatagramPair {
        &self.datagrams
    }

    pub fn pairing(&self) -> &PairingRegistry {
        &self.pairing
    }

    // ── Connection table ─────────────────────────────────────────

    /// Track a newly accepted connection.
    pub fn open(&self, ctx: &ConnectionContext) {
        self.connections.lock().insert(
            ctx.id,
            ConnectionEntry {
                peer: ctx.peer,
                has_streamed: false,
            },
        );
        debug!(conn = %ctx.id, peer = %ctx.peer, "connection tracked");
    }

    /// Forget a closed connection and its pairing session.
    ///
    /// Returns `true` when this was the last connection that had reached
    /// streaming, in which case `Disconnected` has been emitted.
    pub fn close(&self, id: ConnectionId) -> bool {
        self.pairing.remove(id);

        let mut connections = self.connections.lock();
        let Some(entry) = connections.remove(&id) else {
            return false;
        };
        if !entry.has_streamed {
            debug!(conn = %id, peer = %entry.peer, "non-streaming connection closed");
            return false;
        }
        if connections.values().any(|e| e.has_streamed) {
            debug!(conn = %id, "streaming connection closed; others remain");
            return false;
        }
        drop(connections);

        self.datagrams.set_streaming(false);
        info!(conn = %id, peer = %entry.peer, "last streaming connection closed");
        self.emit(SinkEvent::Disconnected);
        true
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn mark_streamed(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.lock().get_mut(&id) {
            entry.has_streamed = true;
        }
    }

    fn emit(&self, event: SinkEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Answer one request. Never fails; every outcome is a response
    /// carrying the request's CSeq.
    pub fn handle(&self, ctx: &mut ConnectionContext, request: &Request) -> Response {
        debug!(
            conn = %ctx.id,
            method = %request.method,
            path = %request.path,
            cseq = %request.cseq,
            body = request.body.len(),
            "request"
        );

        match &request.method {
            Method::Get => self.get(request),
            Method::Post => self.post(ctx, request),
            Method::Options => Response::ok(request).with_header("Public", PUBLIC_METHODS),
            Method::Announce => {
                debug!(conn = %ctx.id, len = request.body.len(), "session description ignored");
                Response::ok(request)
            }
            Method::Setup => self.setup(ctx, request),
            Method::Record => self.record(ctx, request),
            Method::Teardown => self.teardown(ctx, request),
            Method::GetParameter | Method::SetParameter => Response::ok(request),
            Method::Other(token) => {
                warn!(conn = %ctx.id, method = %token, "method not implemented");
                Response::to(request, Status::NotImplemented)
            }
        }
    }

    fn get(&self, request: &Request) -> Response {
        match request.target_path() {
            "/info" => Response::ok(request).with_body(BINARY_PLIST, self.info.clone()),
            other => {
                warn!(path = other, "unknown GET target");
                Response::to(request, Status::NotFound)
            }
        }
    }

    fn post(&self, ctx: &ConnectionContext, request: &Request) -> Response {
        match request.target_path() {
            "/pair-setup" => {
                let reply = self.pairing.handle_setup(ctx.id, &request.body);
                Response::ok(request).with_body(PAIRING_TLV, reply)
            }
            "/pair-verify" => {
                let reply = self.pairing.handle_verify(ctx.id, &request.body);
                Response::ok(request).with_body(PAIRING_TLV, reply)
            }
            "/feedback" => Response::ok(request),
            other => {
                warn!(path = other, "unknown POST target");
                Response::to(request, Status::NotFound)
            }
        }
    }

    fn setup(&self, ctx: &mut ConnectionContext, request: &Request) -> Response {
        let client_ports = parse_client_ports(request.header("transport").unwrap_or_default());
        let session = ctx.session.negotiate(client_ports, self.datagrams.ports());
        self.datagrams.ensure_listening(
            Arc::clone(&self.pipeline),
            self.events.clone(),
            self.cancel.child_token(),
        );

        info!(
            conn = %ctx.id,
            session = %session.id,
            client = ?session.client_ports,
            server = ?session.server_ports,
            "transport negotiated"
        );

        Response::ok(request)
            .with_header(
                "Transport",
                transport_response(session.client_ports, session.server_ports),
            )
            .with_header("Session", session.id)
    }

    fn record(&self, ctx: &mut ConnectionContext, request: &Request) -> Response {
        let session = match ctx.session.record() {
            Ok(session) => session,
            Err(e) => {
                warn!(conn = %ctx.id, "{e}");
                return Response::to(request, Status::MethodNotValid);
            }
        };

        self.mark_streamed(ctx.id);
        self.datagrams.set_streaming(true);
        info!(conn = %ctx.id, session = %session.id, peer = %ctx.peer, "streaming");
        self.emit(SinkEvent::Connected {
            peer: ctx.peer.ip().to_string(),
        });

        Response::ok(request).with_header("Session", session.id)
    }

    fn teardown(&self, ctx: &mut ConnectionContext, request: &Request) -> Response {
        if ctx.session.teardown() {
            self.datagrams.set_streaming(false);
            info!(conn = %ctx.id, "streaming stopped");
        }
        Response::ok(request)
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("connections", &self.connection_count())
            .field("datagrams", &self.datagrams)
            .field("pairing", &self.pairing)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
