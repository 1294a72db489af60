//! Outbound interfaces to the collaborators around the core.
//!
//! - Presentation layer: [`SinkEvent`]s over an unbounded channel, so a
//!   slow UI never stalls a connection loop.
//! - Decode pipeline: the [`DecodePipeline`] trait, called from the data
//!   listener's receive loop in arrival order.

use bytes::Bytes;
use tokio::sync::mpsc;

// ── SinkEvent ────────────────────────────────────────────────────

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// A peer issued RECORD. Fires on every RECORD.
    Connected { peer: String },
    /// The last connection that reached streaming has closed.
    Disconnected,
    /// A fatal internal failure, e.g. a listener that could not bind.
    Error { description: String },
}

pub type EventSender = mpsc::UnboundedSender<SinkEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SinkEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

// ── Decode pipeline ──────────────────────────────────────────────

/// Parameter sets the decoder needs to build a format description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    /// Sequence parameter set (NAL type 7), without start code.
    pub sps: Bytes,
    /// Picture parameter set (NAL type 8), if one has been seen.
    pub pps: Option<Bytes>,
}

/// A frame ready for the decoder, reframed with a 4-byte big-endian
/// length prefix in place of the start code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub key_frame: bool,
    pub data: Bytes,
}

/// The hardware decode pipeline, as seen from the demuxer.
pub trait DecodePipeline: Send + Sync {
    /// Rebuild the format description and reset the decode session.
    fn configure(&self, format: &FormatDescription);

    /// Whether a decode session is ready to accept frames.
    fn has_session(&self) -> bool;

    /// Hand over one frame. Not acknowledged.
    fn submit(&self, frame: VideoFrame);
}
