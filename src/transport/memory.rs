//! In-process packet sockets sharing a simulated port namespace.
//!
//! Sockets on the same [`MemoryBus`] deliver unicast datagrams to each
//! other and multicast datagrams to every member of the addressed groups.
//! Datagrams addressed to the kernel (port 0, no groups) are only recorded.
//! Tests inject kernel replies with [`MemorySocket::push`].

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;

use super::socket::{Datagram, PacketSocket, RecvInfo, RecvOptions};
use crate::protocol::{Address, Credentials};

/// First port handed out for binds that ask the bus to choose.
const AUTO_PORT_BASE: u32 = 0x8000_0000;

/// Shared port namespace.
#[derive(Clone, Debug, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusState>>,
}

#[derive(Debug, Default)]
struct BusState {
    sockets: HashMap<u32, Weak<Mutex<EndpointState>>>,
    reserved: Vec<u32>,
    next_auto: u32,
}

impl BusState {
    fn in_use(&self, port: u32) -> bool {
        self.reserved.contains(&port)
            || self
                .sockets
                .get(&port)
                .is_some_and(|weak| weak.strong_count() > 0)
    }
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.inner.lock().expect("memory bus mutex poisoned")
    }

    /// Create an unbound socket on this bus.
    #[must_use]
    pub fn socket(&self) -> MemorySocket {
        MemorySocket {
            state: Arc::new(Mutex::new(EndpointState {
                bus: self.clone(),
                local: None,
                memberships: 0,
                inbound: VecDeque::new(),
                sent: Vec::new(),
                recv_log: Vec::new(),
                buffer_sizes: None,
                passcred: false,
                short_write: None,
            })),
        }
    }

    /// Mark `port` as taken by something outside the bus.
    pub fn reserve(&self, port: u32) {
        self.lock().reserved.push(port);
    }

    /// Check whether `port` is bound or reserved.
    #[must_use]
    pub fn is_bound(&self, port: u32) -> bool {
        self.lock().in_use(port)
    }

    fn release(&self, port: u32) {
        let mut bus = self.lock();
        if bus
            .sockets
            .get(&port)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            bus.sockets.remove(&port);
        }
    }

    fn route(&self, destination: Address) -> Vec<Arc<Mutex<EndpointState>>> {
        // Endpoints are upgraded under the bus lock but inspected after it is
        // released; dropping the last handle re-enters the bus.
        let candidates: Vec<(u32, Arc<Mutex<EndpointState>>)> = {
            let bus = self.lock();
            bus.sockets
                .iter()
                .filter_map(|(port, weak)| Some((*port, weak.upgrade()?)))
                .collect()
        };
        candidates
            .into_iter()
            .filter(|(port, endpoint)| {
                let unicast = destination.port != 0 && *port == destination.port;
                unicast
                    || (destination.groups != 0 && {
                        let state = endpoint.lock().expect("memory socket mutex poisoned");
                        state.memberships & destination.groups != 0
                    })
            })
            .map(|(_, endpoint)| endpoint)
            .collect()
    }
}

/// Datagram written through a [`MemorySocket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    /// Bytes handed to the socket.
    pub data: Bytes,
    /// Destination address.
    pub destination: Address,
    /// Credentials attached to the datagram.
    pub credentials: Option<Credentials>,
}

/// One `recv_from` call as observed by a [`MemorySocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvProbe {
    /// Buffer size offered by the caller.
    pub capacity: usize,
    /// Whether the datagram was left queued.
    pub peek: bool,
}

#[derive(Debug)]
struct EndpointState {
    bus: MemoryBus,
    local: Option<Address>,
    memberships: u32,
    inbound: VecDeque<Datagram>,
    sent: Vec<SentDatagram>,
    recv_log: Vec<RecvProbe>,
    buffer_sizes: Option<(usize, usize)>,
    passcred: bool,
    short_write: Option<usize>,
}

impl Drop for EndpointState {
    fn drop(&mut self) {
        if let Some(local) = self.local {
            self.bus.release(local.port);
        }
    }
}

/// In-process [`PacketSocket`].
///
/// Clones share one endpoint, so a test can keep a clone to inject and
/// inspect traffic while a [`crate::Socket`] owns another.
#[derive(Clone, Debug)]
pub struct MemorySocket {
    state: Arc<Mutex<EndpointState>>,
}

impl MemorySocket {
    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().expect("memory socket mutex poisoned")
    }

    /// Queue an inbound datagram.
    pub fn push(&self, data: impl Into<Bytes>, source: Address) {
        self.push_datagram(Datagram {
            data: data.into(),
            source,
            credentials: None,
        });
    }

    /// Queue an inbound datagram with all metadata.
    pub fn push_datagram(&self, datagram: Datagram) {
        self.lock().inbound.push_back(datagram);
    }

    /// Number of datagrams waiting to be read.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Datagrams written so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.lock().sent.clone()
    }

    /// Drain the record of written datagrams.
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Every read attempt so far.
    #[must_use]
    pub fn recv_log(&self) -> Vec<RecvProbe> {
        self.lock().recv_log.clone()
    }

    /// Make subsequent writes accept at most `limit` bytes.
    pub fn set_short_write(&self, limit: Option<usize>) {
        self.lock().short_write = limit;
    }

    /// Kernel buffer sizes last configured as `(rx, tx)`.
    #[must_use]
    pub fn buffer_sizes(&self) -> Option<(usize, usize)> {
        self.lock().buffer_sizes
    }

    /// Whether credential passing is enabled.
    #[must_use]
    pub fn passcred(&self) -> bool {
        self.lock().passcred
    }

    /// Joined multicast groups as a bitmask.
    #[must_use]
    pub fn memberships(&self) -> u32 {
        self.lock().memberships
    }
}

fn group_bit(group: u32) -> io::Result<u32> {
    match group {
        1..=32 => Ok(1 << (group - 1)),
        _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
    }
}

impl PacketSocket for MemorySocket {
    fn bind(&mut self, local: Address) -> io::Result<()> {
        let bus = self.lock().bus.clone();
        let mut bus_state = bus.lock();

        let port = if local.port == 0 {
            loop {
                let candidate = AUTO_PORT_BASE.wrapping_add(bus_state.next_auto);
                bus_state.next_auto = bus_state.next_auto.wrapping_add(1);
                if candidate != 0 && !bus_state.in_use(candidate) {
                    break candidate;
                }
            }
        } else if bus_state.in_use(local.port) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        } else {
            local.port
        };

        bus_state.sockets.insert(port, Arc::downgrade(&self.state));
        drop(bus_state);

        let mut state = self.lock();
        state.local = Some(Address::new(port, local.groups));
        state.memberships |= local.groups;
        Ok(())
    }

    fn local_addr(&self) -> io::Result<Address> {
        self.lock()
            .local
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn send_to(
        &mut self,
        buf: &[u8],
        destination: Address,
        credentials: Option<&Credentials>,
    ) -> io::Result<usize> {
        let (bus, source, written) = {
            let mut state = self.lock();
            let written = state.short_write.map_or(buf.len(), |limit| limit.min(buf.len()));
            state.sent.push(SentDatagram {
                data: Bytes::copy_from_slice(&buf[..written]),
                destination,
                credentials: credentials.copied(),
            });
            (state.bus.clone(), state.local.unwrap_or_default(), written)
        };

        let datagram = Datagram {
            data: Bytes::copy_from_slice(&buf[..written]),
            source,
            credentials: credentials.copied(),
        };
        for endpoint in bus.route(destination) {
            endpoint
                .lock()
                .expect("memory socket mutex poisoned")
                .inbound
                .push_back(datagram.clone());
        }
        Ok(written)
    }

    fn recv_from(&mut self, buf: &mut [u8], options: RecvOptions) -> io::Result<RecvInfo> {
        let mut state = self.lock();
        state.recv_log.push(RecvProbe {
            capacity: buf.len(),
            peek: options.peek,
        });

        let Some(front) = state.inbound.front() else {
            let kind = if options.timeout.is_some() {
                io::ErrorKind::TimedOut
            } else {
                io::ErrorKind::WouldBlock
            };
            return Err(io::Error::from(kind));
        };

        let copied = front.data.len().min(buf.len());
        buf[..copied].copy_from_slice(&front.data[..copied]);
        let info = RecvInfo {
            len: front.data.len(),
            source: front.source,
            credentials: if state.passcred {
                front.credentials
            } else {
                None
            },
        };
        if !options.peek {
            state.inbound.pop_front();
        }
        Ok(info)
    }

    fn set_buffer_sizes(&mut self, rx: usize, tx: usize) -> io::Result<()> {
        self.lock().buffer_sizes = Some((rx, tx));
        Ok(())
    }

    fn set_passcred(&mut self, enabled: bool) -> io::Result<()> {
        self.lock().passcred = enabled;
        Ok(())
    }

    fn add_membership(&mut self, group: u32) -> io::Result<()> {
        let bit = group_bit(group)?;
        self.lock().memberships |= bit;
        Ok(())
    }

    fn drop_membership(&mut self, group: u32) -> io::Result<()> {
        let bit = group_bit(group)?;
        self.lock().memberships &= !bit;
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}
