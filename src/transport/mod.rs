//! Netlink socket transport and transceiver

mod callback;
#[cfg(feature = "debug-tools")]
mod debug;
mod error;
mod kernel;
mod memory;
mod port;
mod socket;
mod transceiver;
mod transport;

pub use callback::{
    Action, CallbackKind, Callbacks, DispatchContext, FailReason, RecvOverride, RecvmsgsOverride,
    SendOverride,
};
#[cfg(feature = "debug-tools")]
pub use debug::{Direction, PcapRecorder};
pub use error::TransportError;
pub use kernel::NetlinkSocket;
pub use memory::{MemoryBus, MemorySocket, RecvProbe, SentDatagram};
pub use port::{PORT_SLOTS, PortAllocator};
pub use socket::{Datagram, PacketSocket, RecvInfo, RecvOptions};
pub use transceiver::{Completion, Outcome};
pub use transport::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_MSG_SIZE, FlowState, Socket, SocketConfig, SocketFlags,
};
