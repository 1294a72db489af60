//! Pair-setup and pair-verify handshake.
//!
//! Each control connection gets its own [`PairingRegistry`] entry, created
//! by the first `Start` marker and dropped when the exchange completes,
//! expires, or the connection closes.

mod phase;
mod registry;

pub use phase::{Marker, Outcome, SetupPhase, VerifyPhase};
pub use registry::{DEFAULT_IDLE_TIMEOUT, ERROR_UNKNOWN, PairingRegistry};
