//! Per-connection transport session state machine.
//!
//! ```text
//!  Idle ──SETUP──► Negotiated ──RECORD──► Streaming
//!   ▲                  │                      │
//!   └─────────────── TEARDOWN ◄───────────────┘
//! ```
//!
//! The session identifier only exists inside `Negotiated` and
//! `Streaming`, so "RECORD before SETUP" is a typed error rather than a
//! missing value discovered later.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::MiraError;
use crate::transport::ServerPorts;

// ── ConnectionId ─────────────────────────────────────────────────

/// Identifier of one accepted control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ── TransportSession ─────────────────────────────────────────────

/// Ports and identity negotiated by one SETUP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSession {
    /// Server-minted session token, echoed in the `Session` header.
    pub id: String,
    /// Ports the peer asked us to send to.
    pub client_ports: (u16, u16),
    /// Ports we receive on.
    pub server_ports: ServerPorts,
}

impl TransportSession {
    pub fn new(client_ports: (u16, u16), server_ports: ServerPorts) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..16].to_uppercase();
        Self {
            id,
            client_ports,
            server_ports,
        }
    }
}

// ── SessionState ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No transport negotiated on this connection.
    #[default]
    Idle,

    /// SETUP accepted; listeners are up but RECORD has not arrived.
    Negotiated(TransportSession),

    /// RECORD accepted; media is expected on the data port.
    Streaming {
        session: TransportSession,
        since: Instant,
    },
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Negotiated(_) => write!(f, "Negotiated"),
            Self::Streaming { .. } => write!(f, "Streaming"),
        }
    }
}

impl SessionState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    /// The active transport session, if SETUP has been accepted.
    pub fn session(&self) -> Option<&TransportSession> {
        match self {
            Self::Idle => None,
            Self::Negotiated(session) | Self::Streaming { session, .. } => Some(session),
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Apply a SETUP.
    ///
    /// Valid from any state. A repeated SETUP keeps the existing
    /// session id and streaming status but takes the new client ports.
    pub fn negotiate(&mut self, client_ports: (u16, u16), server_ports: ServerPorts) -> TransportSession {
        match self {
            Self::Idle => {
                let session = TransportSession::new(client_ports, server_ports);
                *self = Self::Negotiated(session.clone());
                session
            }
            Self::Negotiated(session) | Self::Streaming { session, .. } => {
                session.client_ports = client_ports;
                session.server_ports = server_ports;
                session.clone()
            }
        }
    }

    /// Apply a RECORD.
    ///
    /// Valid from: `Negotiated`, `Streaming` (idempotent).
    pub fn record(&mut self) -> Result<TransportSession, MiraError> {
        match self {
            Self::Idle => Err(MiraError::InvalidState("RECORD without a negotiated session")),
            Self::Negotiated(session) => {
                let session = session.clone();
                *self = Self::Streaming {
                    session: session.clone(),
                    since: Instant::now(),
                };
                Ok(session)
            }
            Self::Streaming { session, .. } => Ok(session.clone()),
        }
    }

    /// Apply a TEARDOWN. Returns `true` if the connection was streaming.
    pub fn teardown(&mut self) -> bool {
        let was_streaming = self.is_streaming();
        *self = Self::Idle;
        was_streaming
    }
}

// ── Tests ────────────────────────────────────────────────────────
