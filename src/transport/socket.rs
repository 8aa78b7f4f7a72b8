//! Packet socket abstraction the transceiver reads and writes through.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use bytes::Bytes;

use crate::protocol::{Address, Credentials};

/// Options for a single datagram read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvOptions {
    /// Leave the datagram queued after reading.
    pub peek: bool,
    /// How long to wait for a datagram; `None` blocks, zero polls.
    pub timeout: Option<Duration>,
}

/// Result of a datagram read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInfo {
    /// Full length of the datagram, even when it did not fit the buffer.
    pub len: usize,
    /// Sending endpoint.
    pub source: Address,
    /// Sender credentials when credential passing is enabled.
    pub credentials: Option<Credentials>,
}

impl RecvInfo {
    /// Check whether the datagram was larger than a buffer of `capacity` bytes.
    #[must_use]
    pub const fn truncated(&self, capacity: usize) -> bool {
        self.len > capacity
    }
}

/// One complete datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Raw bytes, possibly several messages back to back.
    pub data: Bytes,
    /// Sending endpoint.
    pub source: Address,
    /// Sender credentials when credential passing is enabled.
    pub credentials: Option<Credentials>,
}

/// Datagram socket bound to a kernel messaging family.
///
/// Closing the socket is dropping it.
pub trait PacketSocket: Send + fmt::Debug {
    /// Assign the local address. A zero port asks the implementation to
    /// pick one; read it back with [`PacketSocket::local_addr`].
    fn bind(&mut self, local: Address) -> io::Result<()>;

    /// Local address as assigned by the last bind.
    fn local_addr(&self) -> io::Result<Address>;

    /// Send one datagram, optionally carrying credentials.
    fn send_to(
        &mut self,
        buf: &[u8],
        destination: Address,
        credentials: Option<&Credentials>,
    ) -> io::Result<usize>;

    /// Read one datagram into `buf`.
    ///
    /// The returned length is the full datagram length. Without
    /// [`RecvOptions::peek`] a datagram larger than `buf` is consumed and
    /// its tail is lost. Deadline expiry is reported as
    /// [`io::ErrorKind::TimedOut`] or [`io::ErrorKind::WouldBlock`].
    fn recv_from(&mut self, buf: &mut [u8], options: RecvOptions) -> io::Result<RecvInfo>;

    /// Set kernel receive and send buffer sizes.
    fn set_buffer_sizes(&mut self, rx: usize, tx: usize) -> io::Result<()>;

    /// Enable or disable credential passing on received datagrams.
    fn set_passcred(&mut self, enabled: bool) -> io::Result<()>;

    /// Join a multicast group (1-based group number).
    fn add_membership(&mut self, group: u32) -> io::Result<()>;

    /// Leave a multicast group (1-based group number).
    fn drop_membership(&mut self, group: u32) -> io::Result<()>;

    /// Underlying descriptor for event loop integration, if any.
    fn raw_fd(&self) -> Option<RawFd>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_check() {
        let info = RecvInfo {
            len: 8192,
            source: Address::KERNEL,
            credentials: None,
        };
        assert!(info.truncated(4096));
        assert!(!info.truncated(8192));
    }
}
