//! Transport-level error types covering socket, flow, and dispatch failures.

use core::fmt;
use std::io;

use super::callback::CallbackKind;
use crate::protocol;

/// Unified error type for netlink transceiver operations.
#[derive(Debug)]
pub enum TransportError {
    /// The packet socket could not be allocated or configured.
    Connection(io::Error),
    /// Operation attempted before the socket was opened.
    NotConnected,
    /// Socket already has a local address.
    AlreadyBound {
        /// Port the socket is bound to.
        port: u32,
    },
    /// No free local port could be bound.
    AddressInUse {
        /// Number of ports tried before giving up.
        attempts: usize,
    },
    /// Writing to the packet socket failed.
    Send(io::Error),
    /// The packet socket accepted fewer bytes than the message holds.
    ShortWrite {
        /// Bytes accepted by the socket.
        sent: usize,
        /// Bytes in the encoded message.
        expected: usize,
    },
    /// Reading from the packet socket failed.
    Receive(io::Error),
    /// No datagram arrived before the deadline.
    Timeout,
    /// The kernel answered with an error reply.
    Protocol {
        /// Error code as carried in the reply (negative errno).
        code: i32,
    },
    /// A reply did not match the outstanding request.
    SequenceMismatch {
        /// Sequence number of the outstanding request.
        expected: u32,
        /// Sequence number found in the reply.
        found: u32,
    },
    /// Data was lost: the kernel reported an overrun or a datagram did not
    /// fit the largest permitted receive buffer.
    Overrun {
        /// Datagram size when known.
        required: Option<usize>,
    },
    /// A message failed validation.
    Invalid,
    /// A dump was interrupted by a concurrent change and is inconsistent.
    DumpInterrupted,
    /// A handler aborted the flow.
    Aborted {
        /// Stage whose handler aborted.
        stage: CallbackKind,
    },
    /// The error handler aborted the flow while handling an error reply.
    ErrorHandlerAborted {
        /// Error code of the reply being handled.
        code: i32,
    },
    /// Envelope framing or lifecycle failure.
    Message(protocol::Error),
}

impl TransportError {
    /// Check whether the error is a lifecycle violation that leaves an
    /// envelope unusable, as opposed to a per-flow failure.
    #[must_use]
    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(
            self,
            Self::Message(
                protocol::Error::DoubleFree
                    | protocol::Error::Released
                    | protocol::Error::Shared { .. }
            )
        )
    }

    /// Negative errno carried by a kernel error reply.
    #[must_use]
    pub fn protocol_code(&self) -> Option<i32> {
        match self {
            Self::Protocol { code } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn from_recv(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Receive(err),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(err) => write!(f, "connection error: {err}"),
            Self::NotConnected => write!(f, "socket is not connected"),
            Self::AlreadyBound { port } => write!(f, "socket already bound to port {port}"),
            Self::AddressInUse { attempts } => {
                write!(f, "no free local port after {attempts} attempts")
            }
            Self::Send(err) => write!(f, "send failed: {err}"),
            Self::ShortWrite { sent, expected } => {
                write!(f, "short write: sent {sent} of {expected} bytes")
            }
            Self::Receive(err) => write!(f, "receive failed: {err}"),
            Self::Timeout => write!(f, "timed out waiting for a reply"),
            Self::Protocol { code } => write!(
                f,
                "kernel error reply: {} ({code})",
                io::Error::from_raw_os_error(code.saturating_abs())
            ),
            Self::SequenceMismatch { expected, found } => {
                write!(f, "sequence mismatch: expected {expected}, got {found}")
            }
            Self::Overrun {
                required: Some(required),
            } => write!(f, "receive overrun: datagram of {required} bytes"),
            Self::Overrun { required: None } => write!(f, "receive overrun"),
            Self::Invalid => write!(f, "invalid message"),
            Self::DumpInterrupted => write!(f, "dump interrupted"),
            Self::Aborted { stage } => write!(f, "aborted by {stage} handler"),
            Self::ErrorHandlerAborted { code } => {
                write!(f, "aborted by error handler on reply code {code}")
            }
            Self::Message(err) => write!(f, "message error: {err}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(err) | Self::Send(err) | Self::Receive(err) => Some(err),
            Self::Message(err) => Some(err),
            _ => None,
        }
    }
}

impl From<protocol::Error> for TransportError {
    fn from(err: protocol::Error) -> Self {
        Self::Message(err)
    }
}
