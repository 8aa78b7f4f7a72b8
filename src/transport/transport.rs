//! Netlink socket state: addressing, sequence counters, and socket options.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(feature = "debug-tools")]
use std::path::PathBuf;

use crate::protocol::metrics::Metrics;
use crate::protocol::{Address, DEFAULT_MSG_BUF_SIZE};
use tracing::{debug, instrument, warn};

use super::callback::{Action, CallbackKind, Callbacks};
#[cfg(feature = "debug-tools")]
use super::debug::PcapRecorder;
use super::error::TransportError;
use super::kernel::NetlinkSocket;
use super::port::{PORT_SLOTS, PortAllocator};
use super::socket::PacketSocket;

/// Kernel socket buffer size applied at open unless configured otherwise.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Largest datagram the receive path grows its buffer to by default.
pub const DEFAULT_MAX_MSG_SIZE: usize = 1 << 20;

/// Progress of the current request/response flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    /// No request outstanding.
    #[default]
    Idle,
    /// A request was sent; no reply read yet.
    Sent,
    /// Replies are being read and dispatched.
    Receiving,
    /// The last flow completed successfully.
    Done,
    /// The last flow ended with an error.
    Failed,
}

/// Socket capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketFlags(u32);

impl SocketFlags {
    /// Kernel buffer sizes were set explicitly.
    pub const BUFSIZE_SET: u32 = 1 << 0;
    /// Receive sender credentials with every datagram.
    pub const PASSCRED: u32 = 1 << 1;
    /// The caller assigns the local port; port 0 lets the kernel choose.
    pub const OWN_PORT: u32 = 1 << 2;
    /// Probe datagram size with a peek before reading.
    pub const MSG_PEEK: u32 = 1 << 3;
    /// Do not request acknowledgments or check reply sequence numbers.
    pub const NO_AUTO_ACK: u32 = 1 << 4;

    /// Create empty flags
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Return the underlying bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Set a flag
    #[must_use]
    pub const fn with(mut self, flag: u32) -> Self {
        self.0 |= flag;
        self
    }

    /// Set a flag in place
    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    /// Clear a flag in place
    pub fn remove(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    /// Set or clear a flag
    pub fn set(&mut self, flag: u32, enabled: bool) {
        if enabled {
            self.insert(flag);
        } else {
            self.remove(flag);
        }
    }

    /// Check if flag is set
    #[must_use]
    pub const fn has(self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }
}

impl Default for SocketFlags {
    fn default() -> Self {
        Self::new().with(Self::MSG_PEEK)
    }
}

/// Socket configuration options.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Kernel receive buffer size in bytes.
    pub rx_buffer_size: usize,
    /// Kernel send buffer size in bytes.
    pub tx_buffer_size: usize,
    /// Initial receive buffer size in bytes.
    pub msg_buf_size: usize,
    /// Largest datagram accepted after truncation probing.
    pub max_msg_size: usize,
    /// Default deadline for reads; `None` blocks.
    pub recv_timeout: Option<Duration>,
    /// Initial capability flags.
    pub flags: SocketFlags,
    /// Optional PCAP capture path for outbound datagrams (debug builds only).
    #[cfg(feature = "debug-tools")]
    pub pcap_send_path: Option<PathBuf>,
    /// Optional PCAP capture path for inbound datagrams (debug builds only).
    #[cfg(feature = "debug-tools")]
    pub pcap_recv_path: Option<PathBuf>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: DEFAULT_BUFFER_SIZE,
            tx_buffer_size: DEFAULT_BUFFER_SIZE,
            msg_buf_size: DEFAULT_MSG_BUF_SIZE,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            recv_timeout: None,
            flags: SocketFlags::default(),
            #[cfg(feature = "debug-tools")]
            pcap_send_path: None,
            #[cfg(feature = "debug-tools")]
            pcap_recv_path: None,
        }
    }
}

/// Netlink socket with its addressing and dispatch state.
///
/// A socket is driven by one thread at a time; callers sharing one across
/// threads must synchronize externally. Failed flows leave the socket open
/// and usable.
#[derive(Debug)]
pub struct Socket {
    pub(super) config: SocketConfig,
    pub(super) local: Address,
    pub(super) peer: Address,
    pub(super) protocol: i32,
    pub(super) seq_next: u32,
    pub(super) seq_expect: Option<u32>,
    pub(super) flags: SocketFlags,
    pub(super) state: FlowState,
    pub(super) callbacks: Callbacks,
    pub(super) io: Option<Box<dyn PacketSocket>>,
    ports: Arc<PortAllocator>,
    allocated_port: Option<u32>,
    bound: bool,
    #[cfg(feature = "debug-tools")]
    pub(super) pcap_send: Option<PcapRecorder>,
    #[cfg(feature = "debug-tools")]
    pub(super) pcap_recv: Option<PcapRecorder>,
}

fn initial_seq() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    match secs as u32 {
        0 => 1,
        seq => seq,
    }
}

pub(super) const fn next_seq(seq: u32) -> u32 {
    match seq.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

impl Socket {
    /// Create an unopened socket with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SocketConfig::default())
    }

    /// Create an unopened socket with the given configuration.
    #[must_use]
    pub fn with_config(config: SocketConfig) -> Self {
        let flags = config.flags;
        Self {
            config,
            local: Address::default(),
            peer: Address::KERNEL,
            protocol: 0,
            seq_next: initial_seq(),
            seq_expect: None,
            flags,
            state: FlowState::Idle,
            callbacks: Callbacks::new(),
            io: None,
            ports: PortAllocator::global(),
            allocated_port: None,
            bound: false,
            #[cfg(feature = "debug-tools")]
            pcap_send: None,
            #[cfg(feature = "debug-tools")]
            pcap_recv: None,
        }
    }

    /// Draw auto-assigned ports from `ports` instead of the process-wide allocator.
    #[must_use]
    pub fn with_port_allocator(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    /// Open a kernel socket for `protocol` and bind it to an automatic port.
    #[instrument(level = "info")]
    pub fn connect(protocol: i32) -> Result<Self, TransportError> {
        let mut socket = Self::new();
        socket.open(protocol)?;
        socket.bind(0, 0)?;
        Ok(socket)
    }

    /// Open a kernel socket for `protocol`. Does not bind.
    #[instrument(level = "info", skip(self))]
    pub fn open(&mut self, protocol: i32) -> Result<(), TransportError> {
        if self.io.is_some() {
            return Err(TransportError::Connection(io::Error::from(
                io::ErrorKind::AlreadyExists,
            )));
        }
        let socket = NetlinkSocket::open(protocol).map_err(TransportError::Connection)?;
        self.attach(protocol, socket)
    }

    /// Use `io` as the packet socket for `protocol`. Does not bind.
    #[instrument(level = "debug", skip(self, io))]
    pub fn attach<S>(&mut self, protocol: i32, io: S) -> Result<(), TransportError>
    where
        S: PacketSocket + 'static,
    {
        if self.io.is_some() {
            return Err(TransportError::Connection(io::Error::from(
                io::ErrorKind::AlreadyExists,
            )));
        }
        let mut io: Box<dyn PacketSocket> = Box::new(io);
        io.set_buffer_sizes(self.config.rx_buffer_size, self.config.tx_buffer_size)
            .map_err(TransportError::Connection)?;
        if self.flags.has(SocketFlags::PASSCRED) {
            io.set_passcred(true).map_err(TransportError::Connection)?;
        }

        #[cfg(feature = "debug-tools")]
        {
            self.pcap_send = match &self.config.pcap_send_path {
                Some(path) => Some(PcapRecorder::create(path).map_err(TransportError::Connection)?),
                None => None,
            };
            self.pcap_recv = match &self.config.pcap_recv_path {
                Some(path) => Some(PcapRecorder::create(path).map_err(TransportError::Connection)?),
                None => None,
            };
        }

        self.protocol = protocol;
        self.io = Some(io);
        self.state = FlowState::Idle;
        Metrics::record_socket_open();
        debug!(protocol, "socket opened");
        Ok(())
    }

    /// Assign the local address.
    ///
    /// Port 0 allocates a process-unique port, retrying on collisions,
    /// unless the caller owns port assignment, in which case the kernel
    /// picks one.
    #[instrument(level = "debug", skip(self))]
    pub fn bind(&mut self, port: u32, groups: u32) -> Result<(), TransportError> {
        if self.bound {
            return Err(TransportError::AlreadyBound {
                port: self.local.port,
            });
        }
        let io = self.io.as_deref_mut().ok_or(TransportError::NotConnected)?;

        if port != 0 || self.flags.has(SocketFlags::OWN_PORT) {
            io.bind(Address::new(port, groups)).map_err(|err| {
                if err.kind() == io::ErrorKind::AddrInUse {
                    TransportError::AddressInUse { attempts: 1 }
                } else {
                    TransportError::Connection(err)
                }
            })?;
        } else {
            let mut attempts = 0;
            loop {
                let Some(candidate) = self.ports.allocate() else {
                    return Err(TransportError::AddressInUse { attempts });
                };
                attempts += 1;
                match io.bind(Address::new(candidate, groups)) {
                    Ok(()) => {
                        self.allocated_port = Some(candidate);
                        break;
                    }
                    // The slot stays marked; another process owns that port.
                    Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                        warn!(port = candidate, "local port taken, trying next");
                        if attempts >= PORT_SLOTS {
                            return Err(TransportError::AddressInUse { attempts });
                        }
                    }
                    Err(err) => {
                        self.ports.release(candidate);
                        return Err(TransportError::Connection(err));
                    }
                }
            }
        }

        self.local = io.local_addr().map_err(TransportError::Connection)?;
        self.bound = true;
        debug!(local = %self.local, "socket bound");
        Ok(())
    }

    /// Release the packet socket. Calling it again is a no-op.
    #[instrument(level = "debug", skip(self))]
    pub fn close(&mut self) {
        let Some(io) = self.io.take() else {
            return;
        };
        drop(io);
        if let Some(port) = self.allocated_port.take() {
            self.ports.release(port);
        }
        #[cfg(feature = "debug-tools")]
        {
            self.pcap_send = None;
            self.pcap_recv = None;
        }
        self.bound = false;
        self.local = Address::default();
        self.seq_expect = None;
        self.state = FlowState::Idle;
        Metrics::record_socket_close();
        debug!("socket closed");
    }

    /// Set kernel buffer sizes; zero selects the default.
    ///
    /// Applied immediately when the socket is open, otherwise at open.
    pub fn set_buffer_size(&mut self, rx: usize, tx: usize) -> Result<(), TransportError> {
        let rx = if rx == 0 { DEFAULT_BUFFER_SIZE } else { rx };
        let tx = if tx == 0 { DEFAULT_BUFFER_SIZE } else { tx };
        self.config.rx_buffer_size = rx;
        self.config.tx_buffer_size = tx;
        self.flags.insert(SocketFlags::BUFSIZE_SET);
        if let Some(io) = self.io.as_deref_mut() {
            io.set_buffer_sizes(rx, tx)
                .map_err(TransportError::Connection)?;
        }
        Ok(())
    }

    /// Set the initial receive buffer size; zero selects one page.
    pub fn set_msg_buf_size(&mut self, size: usize) {
        self.config.msg_buf_size = if size == 0 {
            DEFAULT_MSG_BUF_SIZE
        } else {
            size
        };
    }

    /// Initial receive buffer size.
    #[must_use]
    pub const fn msg_buf_size(&self) -> usize {
        self.config.msg_buf_size
    }

    /// Set the default read deadline.
    pub fn set_recv_timeout(&mut self, timeout: Option<Duration>) {
        self.config.recv_timeout = timeout;
    }

    /// Join a multicast group.
    pub fn add_membership(&mut self, group: u32) -> Result<(), TransportError> {
        let io = self.io.as_deref_mut().ok_or(TransportError::NotConnected)?;
        io.add_membership(group).map_err(TransportError::Connection)
    }

    /// Leave a multicast group.
    pub fn drop_membership(&mut self, group: u32) -> Result<(), TransportError> {
        let io = self.io.as_deref_mut().ok_or(TransportError::NotConnected)?;
        io.drop_membership(group).map_err(TransportError::Connection)
    }

    /// Set the port outgoing messages are addressed to by default.
    pub fn set_peer_port(&mut self, port: u32) {
        self.peer.port = port;
    }

    /// Set the groups outgoing messages are addressed to by default.
    pub fn set_peer_groups(&mut self, groups: u32) {
        self.peer.groups = groups;
    }

    /// Request acknowledgments and check reply sequence numbers (default).
    pub fn enable_auto_ack(&mut self) {
        self.flags.remove(SocketFlags::NO_AUTO_ACK);
    }

    /// Stop requesting acknowledgments and checking reply sequence numbers.
    pub fn disable_auto_ack(&mut self) {
        self.flags.insert(SocketFlags::NO_AUTO_ACK);
        self.seq_expect = None;
    }

    /// Enable or disable credential passing.
    pub fn set_passcred(&mut self, enabled: bool) -> Result<(), TransportError> {
        if let Some(io) = self.io.as_deref_mut() {
            io.set_passcred(enabled)
                .map_err(TransportError::Connection)?;
        }
        self.flags.set(SocketFlags::PASSCRED, enabled);
        Ok(())
    }

    /// Enable or disable size probing with peeked reads.
    pub fn set_msg_peek(&mut self, enabled: bool) {
        self.flags.set(SocketFlags::MSG_PEEK, enabled);
    }

    /// Let the caller (or the kernel, for port 0) own port assignment.
    pub fn set_own_port(&mut self, enabled: bool) {
        self.flags.set(SocketFlags::OWN_PORT, enabled);
    }

    /// Accept replies regardless of their sequence number.
    pub fn disable_seq_check(&mut self) {
        self.callbacks
            .set(CallbackKind::SequenceMismatch, |_, _| Action::Proceed);
    }

    /// Consume and return the next sequence number.
    pub fn use_seq(&mut self) -> u32 {
        let seq = self.seq_next;
        self.seq_next = next_seq(seq);
        seq
    }

    /// Sequence number the next request will carry.
    #[must_use]
    pub const fn seq_next(&self) -> u32 {
        self.seq_next
    }

    /// Sequence number of the outstanding request, if any.
    #[must_use]
    pub const fn seq_expect(&self) -> Option<u32> {
        self.seq_expect
    }

    /// Descriptor of the underlying socket, if it has one.
    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.io.as_ref().and_then(|io| io.raw_fd())
    }

    /// Local address; port 0 until bound.
    #[must_use]
    pub const fn local(&self) -> Address {
        self.local
    }

    /// Default destination of outgoing messages.
    #[must_use]
    pub const fn peer(&self) -> Address {
        self.peer
    }

    /// Protocol the socket was opened for.
    #[must_use]
    pub const fn protocol(&self) -> i32 {
        self.protocol
    }

    /// Capability flags.
    #[must_use]
    pub const fn flags(&self) -> SocketFlags {
        self.flags
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// State of the current or last flow.
    #[must_use]
    pub const fn flow_state(&self) -> FlowState {
        self.state
    }

    /// Check whether a packet socket is attached.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    /// Check whether a local address is assigned.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound
    }

    /// Callback configuration.
    #[must_use]
    pub const fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Mutable callback configuration.
    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    /// Replace the callback configuration, returning the previous one.
    pub fn set_callbacks(&mut self, callbacks: Callbacks) -> Callbacks {
        std::mem::replace(&mut self.callbacks, callbacks)
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBus;

    fn attached(bus: &MemoryBus) -> Socket {
        let mut socket = Socket::new().with_port_allocator(Arc::new(PortAllocator::new(4321)));
        socket.attach(crate::NETLINK_ROUTE, bus.socket()).unwrap();
        socket
    }

    #[test]
    fn test_operations_require_open() {
        let mut socket = Socket::new();
        assert!(matches!(
            socket.bind(0, 0),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            socket.add_membership(1),
            Err(TransportError::NotConnected)
        ));
        assert!(!socket.is_connected());
    }

    #[test]
    fn test_bind_auto_port_and_rebind() {
        let bus = MemoryBus::new();
        let mut socket = attached(&bus);
        socket.bind(0, 0).unwrap();

        assert_eq!(socket.local().port, 4321);
        assert!(bus.is_bound(4321));
        assert!(matches!(
            socket.bind(0, 0),
            Err(TransportError::AlreadyBound { port: 4321 })
        ));
    }

    #[test]
    fn test_bind_skips_taken_port() {
        let bus = MemoryBus::new();
        bus.reserve(4321);
        let mut socket = attached(&bus);
        socket.bind(0, 0).unwrap();

        assert_eq!(socket.local().port, 4321 | (1 << 22));
    }

    #[test]
    fn test_own_port_lets_bus_choose() {
        let bus = MemoryBus::new();
        let mut socket = attached(&bus);
        socket.set_own_port(true);
        socket.bind(0, 0).unwrap();

        assert_ne!(socket.local().port, 0);
        assert_ne!(socket.local().port, 4321);
    }

    #[test]
    fn test_close_is_idempotent_and_frees_port() {
        let bus = MemoryBus::new();
        let ports = Arc::new(PortAllocator::new(77));
        let mut socket = Socket::new().with_port_allocator(Arc::clone(&ports));
        socket.attach(crate::NETLINK_ROUTE, bus.socket()).unwrap();
        socket.bind(0, 0).unwrap();
        assert_eq!(ports.in_use(), 1);

        socket.close();
        socket.close();

        assert_eq!(ports.in_use(), 0);
        assert!(!bus.is_bound(77));
        assert!(matches!(
            socket.bind(0, 0),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_buffer_size_applied_when_open() {
        let bus = MemoryBus::new();
        let handle = bus.socket();
        let mut socket = Socket::new();
        socket.attach(crate::NETLINK_ROUTE, handle.clone()).unwrap();
        assert_eq!(
            handle.buffer_sizes(),
            Some((DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_SIZE))
        );

        socket.set_buffer_size(65536, 0).unwrap();
        assert_eq!(handle.buffer_sizes(), Some((65536, DEFAULT_BUFFER_SIZE)));
        assert!(socket.flags().has(SocketFlags::BUFSIZE_SET));
    }

    #[test]
    fn test_deferred_buffer_size() {
        let bus = MemoryBus::new();
        let handle = bus.socket();
        let mut socket = Socket::new();
        socket.set_buffer_size(1024, 2048).unwrap();
        socket.attach(crate::NETLINK_ROUTE, handle.clone()).unwrap();

        assert_eq!(handle.buffer_sizes(), Some((1024, 2048)));
    }

    #[test]
    fn test_use_seq_skips_zero_on_wrap() {
        let mut socket = Socket::new();
        socket.seq_next = u32::MAX;

        assert_eq!(socket.use_seq(), u32::MAX);
        assert_eq!(socket.use_seq(), 1);
    }

    #[test]
    fn test_flag_setters() {
        let mut socket = Socket::new();
        assert!(socket.flags().has(SocketFlags::MSG_PEEK));

        socket.set_msg_peek(false);
        socket.disable_auto_ack();
        socket.set_passcred(true).unwrap();

        assert!(!socket.flags().has(SocketFlags::MSG_PEEK));
        assert!(socket.flags().has(SocketFlags::NO_AUTO_ACK));
        assert!(socket.flags().has(SocketFlags::PASSCRED));

        socket.enable_auto_ack();
        assert!(!socket.flags().has(SocketFlags::NO_AUTO_ACK));
    }
}
