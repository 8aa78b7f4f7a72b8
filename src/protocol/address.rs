//! Netlink endpoint addressing

use std::fmt;

/// Netlink endpoint: a port number plus a multicast group mask
///
/// Port 0 addresses the kernel when used as a destination, and means
/// "not yet assigned" when used as a local address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address {
    /// Port identifier of the socket
    pub port: u32,
    /// Multicast group bitmask
    pub groups: u32,
}

impl Address {
    /// The kernel endpoint
    pub const KERNEL: Self = Self { port: 0, groups: 0 };

    /// Create an address
    #[must_use]
    pub const fn new(port: u32, groups: u32) -> Self {
        Self { port, groups }
    }

    /// Check whether this addresses the kernel
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.port == 0
    }

    /// Check whether any multicast group is set
    #[must_use]
    pub const fn is_multicast(&self) -> bool {
        self.groups != 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nl:{}/{:#x}", self.port, self.groups)
    }
}

/// Process credentials carried as ancillary data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Credentials {
    /// Process id
    pub pid: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
}

impl Credentials {
    /// Credentials of the calling process
    #[must_use]
    pub fn current() -> Self {
        // SAFETY: these calls cannot fail and touch no memory.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            pid: std::process::id(),
            uid,
            gid,
        }
    }
}
