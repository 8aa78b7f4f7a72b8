//! nlsock - Netlink socket transceiver
//!
//! This library opens netlink sockets, frames and sends request messages,
//! and dispatches replies and notifications to registered callbacks.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use nlsock::{CallbackKind, Action, HeaderFlags, MessageType, Socket};
//!
//! let mut socket = Socket::connect(nlsock::NETLINK_ROUTE)?;
//! socket.callbacks_mut().set(CallbackKind::Valid, |envelope, _| {
//!     println!("{:?}", envelope.header());
//!     Action::Proceed
//! });
//!
//! // RTM_GETLINK dump
//! let flags = HeaderFlags::new().with(HeaderFlags::DUMP);
//! socket.send_simple(MessageType::Other(18), flags, &[0u8; 16])?;
//! socket.receive_and_dispatch()?;
//! # Ok::<(), nlsock::TransportError>(())
//! ```
//!
//! # Features
//!
//! - **Reference-counted envelopes** - explicit retain/release with double-free detection
//! - **Callback table** - one handler per dispatch stage, with bound arguments
//! - **Sequence correlation** - replies are matched to the outstanding request
//! - **In-memory sockets** - [`MemoryBus`] for tests and replay
//! - **Packet capture** - pcap output behind the `debug-tools` feature

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod protocol;
pub mod transport;

pub use protocol::{
    Address, Credentials, Envelope, Error, HEADER_SIZE, HeaderFlags, MessageHeader, MessageType,
    Result, metrics_snapshot,
};
pub use transport::{
    Action, CallbackKind, Callbacks, Completion, DispatchContext, FailReason, FlowState,
    MemoryBus, MemorySocket, Outcome, Socket, SocketConfig, TransportError,
};

/// Routing and link configuration family
pub const NETLINK_ROUTE: i32 = 0;

/// Generic netlink family
pub const NETLINK_GENERIC: i32 = 16;

/// Kernel object event family
pub const NETLINK_KOBJECT_UEVENT: i32 = 15;
