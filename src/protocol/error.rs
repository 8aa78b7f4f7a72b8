//! Wire and envelope error types

use thiserror::Error;

/// Netlink framing and envelope lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer too small
    #[error("buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall {
        /// Needed size
        needed: usize,
        /// Actual size
        got: usize,
    },

    /// Length field shorter than the header itself
    #[error("invalid message length: {len}")]
    InvalidLength {
        /// Length found in the header
        len: u32,
    },

    /// Length field points past the end of the datagram
    #[error("truncated message: header declares {declared} bytes, {available} available")]
    Truncated {
        /// Length found in the header
        declared: usize,
        /// Bytes left in the datagram
        available: usize,
    },

    /// Payload too large
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Error reply without room for the error code
    #[error("error reply too short: {len} payload bytes")]
    ErrorReplyTooShort {
        /// Payload length of the reply
        len: usize,
    },

    /// Envelope released more times than it was retained
    #[error("envelope released with refcount already 0")]
    DoubleFree,

    /// Envelope accessed after its last reference was released
    #[error("envelope used after release")]
    Released,

    /// Mutation attempted through a shared envelope
    #[error("envelope is shared ({refcount} references); mutation needs a unique reference")]
    Shared {
        /// Current reference count
        refcount: u32,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
