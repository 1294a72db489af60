//! The control protocol: framing, dispatch and the `/info` body.

pub mod codec;
pub mod info;
pub mod message;
pub mod responder;

pub use codec::{Inbound, RtspCodec};
pub use info::{DeviceInfo, Features};
pub use message::{Method, Request, Response, Status};
pub use responder::{ConnectionContext, Responder};
