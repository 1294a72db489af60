//! # mira-core
//!
//! Receiving side of a screen-mirroring control protocol.
//!
//! This crate contains:
//! - **TLV8**: `Tlv8` record codec used by the pairing bodies
//! - **Identity**: `DeviceIdentity` with a pluggable `KeyValueStore`
//! - **Pairing**: per-connection setup/verify state machines in `PairingRegistry`
//! - **Control protocol**: `RtspCodec` for framed TCP I/O via `tokio_util`, and the `Responder` dispatch table
//! - **Transport**: client port negotiation and the `DatagramPair` listeners
//! - **Demux**: `Demuxer` splitting the elementary stream for the decode pipeline
//! - **Service**: `MirrorService` accept loop and connection lifecycle
//! - **Error**: `MiraError`, a `thiserror`-based error hierarchy

pub mod demux;
pub mod error;
pub mod events;
pub mod identity;
pub mod pairing;
pub mod rtsp;
pub mod service;
pub mod session;
pub mod tlv;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use demux::{AccessUnit, DemuxStats, Demuxer, NalKind};
pub use error::MiraError;
pub use events::{
    DecodePipeline, EventReceiver, EventSender, FormatDescription, SinkEvent, VideoFrame,
    event_channel,
};
pub use identity::{DeviceIdentity, FileStore, KeyValueStore, MemoryStore};
pub use pairing::PairingRegistry;
pub use rtsp::{DeviceInfo, Features, RtspCodec};
pub use service::{Advertisement, MirrorService, ReceiverConfig, RunningService};
pub use session::{ConnectionId, SessionState, TransportSession};
pub use tlv::{Tlv8, TlvType};
pub use transport::{DatagramPair, ServerPorts};
