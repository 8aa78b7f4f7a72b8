//! Netlink wire protocol
//!
//! This module provides the message header, framing codec, endpoint
//! addressing, and the reference-counted message envelope.

mod address;
mod codec;
mod error;
mod header;
mod message;
pub(crate) mod metrics;
mod types;

pub use address::{Address, Credentials};
pub use codec::{Frame, Frames, align, encode, frames};
pub use error::{Error, Result};
pub use header::MessageHeader;
pub use message::{Envelope, EnvelopeBody, EnvelopeFlags, ErrorReply, PROTOCOL_UNSPEC};
pub use metrics::{MetricsSnapshot, snapshot as metrics_snapshot};
pub use types::{HeaderFlags, MessageType};

/// Message alignment boundary in bytes
pub const ALIGNTO: usize = 4;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Largest payload that fits the 32-bit length field
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize - HEADER_SIZE - ALIGNTO;

/// Default size of the initial receive buffer (one page)
pub const DEFAULT_MSG_BUF_SIZE: usize = 4096;
