//! Domain-specific error types for the mirroring receiver.
//!
//! All fallible operations return `Result<T, MiraError>`.
//! No panics on peer-supplied input: malformed requests and bad pairing
//! phases are typed and recoverable at the message granularity.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the receiver core.
#[derive(Debug, Error)]
pub enum MiraError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A control message could not be framed or parsed.
    #[error("malformed request: {0}")]
    Malformed(&'static str),

    /// A pairing message arrived out of phase or without a session.
    #[error("pairing error: {0}")]
    Pairing(&'static str),

    /// A request arrived in a state that cannot accept it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A value did not map to any known enum variant.
    #[error("unknown {type_name} value: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A value exceeded the size its container can carry.
    #[error("value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/UDP layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// No port in the retry range could be bound.
    #[error("could not bind port {port} after {attempts} attempts")]
    Bind { port: u16, attempts: u16 },

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization Errors ─────────────────────────────────────
    /// Property-list encoding of the info body failed.
    #[error("plist error: {0}")]
    Plist(String),

    /// The identity store could not be read or written.
    #[error("identity store error: {0}")]
    Store(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for MiraError {
    fn from(s: String) -> Self {
        MiraError::Other(s)
    }
}

impl From<&str> for MiraError {
    fn from(s: &str) -> Self {
        MiraError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MiraError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MiraError::ChannelClosed
    }
}

impl From<plist::Error> for MiraError {
    fn from(e: plist::Error) -> Self {
        MiraError::Plist(e.to_string())
    }
}

impl From<serde_json::Error> for MiraError {
    fn from(e: serde_json::Error) -> Self {
        MiraError::Store(e.to_string())
    }
}

impl MiraError {
    /// Returns `true` for errors that end the connection they occurred on.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, MiraError::Connection(_) | MiraError::ChannelClosed)
    }
}
