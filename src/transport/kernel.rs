//! `AF_NETLINK` packet socket backed by raw syscalls.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::trace;

use super::socket::{PacketSocket, RecvInfo, RecvOptions};
use crate::protocol::{Address, Credentials};

/// Kernel netlink socket.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
    protocol: i32,
}

impl NetlinkSocket {
    /// Open a raw netlink socket for `protocol` (e.g. [`crate::NETLINK_ROUTE`]).
    pub fn open(protocol: i32) -> io::Result<Self> {
        // SAFETY: plain syscall; the returned descriptor is checked below.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd, protocol })
    }

    /// Protocol this socket was opened for.
    #[must_use]
    pub const fn protocol(&self) -> i32 {
        self.protocol
    }

    fn setsockopt(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> io::Result<()> {
        // SAFETY: `value` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                level,
                name,
                (&raw const value).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<()> {
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: `pollfd` is a valid single-element array.
            let rc = unsafe { libc::poll(&raw mut pollfd, 1, millis) };
            match rc {
                0 => return Err(io::Error::from(io::ErrorKind::TimedOut)),
                n if n > 0 => return Ok(()),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }
        }
    }
}

fn sockaddr(address: Address) -> libc::sockaddr_nl {
    // SAFETY: all-zero is a valid `sockaddr_nl`.
    let mut sa: libc::sockaddr_nl = unsafe { mem::zeroed() };
    sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    sa.nl_pid = address.port;
    sa.nl_groups = address.groups;
    sa
}

const SOCKADDR_LEN: libc::socklen_t = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
const UCRED_LEN: u32 = mem::size_of::<libc::ucred>() as u32;

fn cmsg_space() -> usize {
    // SAFETY: pure size computation.
    unsafe { libc::CMSG_SPACE(UCRED_LEN) as usize }
}

impl PacketSocket for NetlinkSocket {
    fn bind(&mut self, local: Address) -> io::Result<()> {
        let sa = sockaddr(local);
        // SAFETY: `sa` is a valid `sockaddr_nl` of the advertised length.
        let rc = unsafe { libc::bind(self.fd.as_raw_fd(), (&raw const sa).cast(), SOCKADDR_LEN) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<Address> {
        let mut sa = sockaddr(Address::default());
        let mut len = SOCKADDR_LEN;
        // SAFETY: `sa` and `len` describe a writable buffer of the right size.
        let rc = unsafe {
            libc::getsockname(self.fd.as_raw_fd(), (&raw mut sa).cast(), &raw mut len)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if len != SOCKADDR_LEN || i32::from(sa.nl_family) != libc::AF_NETLINK {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected socket address family",
            ));
        }
        Ok(Address::new(sa.nl_pid, sa.nl_groups))
    }

    fn send_to(
        &mut self,
        buf: &[u8],
        destination: Address,
        credentials: Option<&Credentials>,
    ) -> io::Result<usize> {
        let mut sa = sockaddr(destination);
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr().cast_mut().cast(),
            iov_len: buf.len(),
        };
        let mut control = vec![0u8; cmsg_space()];

        // SAFETY: all-zero is a valid `msghdr`; every pointer set below stays
        // alive until `sendmsg` returns.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = (&raw mut sa).cast();
        msg.msg_namelen = SOCKADDR_LEN;
        msg.msg_iov = &raw mut iov;
        msg.msg_iovlen = 1;

        if let Some(creds) = credentials {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = control.len() as _;
            let ucred = libc::ucred {
                pid: creds.pid as libc::pid_t,
                uid: creds.uid,
                gid: creds.gid,
            };
            // SAFETY: the control buffer holds exactly one ucred message.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_CREDENTIALS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(UCRED_LEN) as _;
                std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::ucred>(), ucred);
            }
        }

        // SAFETY: `msg` points at live buffers for the duration of the call.
        let sent = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &raw const msg, 0) };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    fn recv_from(&mut self, buf: &mut [u8], options: RecvOptions) -> io::Result<RecvInfo> {
        let mut flags = libc::MSG_TRUNC;
        if options.peek {
            flags |= libc::MSG_PEEK;
        }
        if let Some(timeout) = options.timeout {
            self.wait_readable(timeout)?;
            flags |= libc::MSG_DONTWAIT;
        }

        let mut sa = sockaddr(Address::default());
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut control = vec![0u8; cmsg_space()];

        // SAFETY: all-zero is a valid `msghdr`; every pointer set below stays
        // alive until `recvmsg` returns.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = (&raw mut sa).cast();
        msg.msg_namelen = SOCKADDR_LEN;
        msg.msg_iov = &raw mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control.len() as _;

        let received = loop {
            // SAFETY: `msg` points at live, writable buffers.
            let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &raw mut msg, flags) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut credentials = None;
        // SAFETY: the kernel filled `control` up to `msg_controllen`; the CMSG
        // macros never walk past it.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS
                {
                    let ucred =
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::ucred>());
                    credentials = Some(Credentials {
                        pid: ucred.pid as u32,
                        uid: ucred.uid,
                        gid: ucred.gid,
                    });
                }
                cmsg = libc::CMSG_NXTHDR(&raw const msg, cmsg);
            }
        }

        trace!(len = received, peek = options.peek, "recvmsg");
        Ok(RecvInfo {
            len: received,
            source: Address::new(sa.nl_pid, sa.nl_groups),
            credentials,
        })
    }

    fn set_buffer_sizes(&mut self, rx: usize, tx: usize) -> io::Result<()> {
        let rx = libc::c_int::try_from(rx).unwrap_or(libc::c_int::MAX);
        let tx = libc::c_int::try_from(tx).unwrap_or(libc::c_int::MAX);
        self.setsockopt(libc::SOL_SOCKET, libc::SO_SNDBUF, tx)?;
        self.setsockopt(libc::SOL_SOCKET, libc::SO_RCVBUF, rx)
    }

    fn set_passcred(&mut self, enabled: bool) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_PASSCRED, libc::c_int::from(enabled))
    }

    fn add_membership(&mut self, group: u32) -> io::Result<()> {
        let group = libc::c_int::try_from(group)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.setsockopt(libc::SOL_NETLINK, libc::NETLINK_ADD_MEMBERSHIP, group)
    }

    fn drop_membership(&mut self, group: u32) -> io::Result<()> {
        let group = libc::c_int::try_from(group)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.setsockopt(libc::SOL_NETLINK, libc::NETLINK_DROP_MEMBERSHIP, group)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for NetlinkSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
