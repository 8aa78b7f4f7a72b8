//! Reference-counted netlink message envelope

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};

use super::codec::{self, Frame};
use super::{
    Address, Credentials, Error, HEADER_SIZE, HeaderFlags, MessageHeader, MessageType, Result,
};

/// Protocol value meaning "use the protocol of the sending socket"
pub const PROTOCOL_UNSPEC: i32 = -1;

/// Envelope-level flags (not transmitted in the header)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopeFlags(u32);

impl EnvelopeFlags {
    /// Credentials are attached and must be sent as ancillary data
    pub const CRED_PRESENT: u32 = 1 << 0;

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

    /// Check if flag is set
    #[must_use]
    pub const fn has(self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }
}

/// Contents of an envelope
#[derive(Debug, Clone)]
pub struct EnvelopeBody {
    protocol: i32,
    flags: EnvelopeFlags,
    source: Address,
    destination: Address,
    credentials: Option<Credentials>,
    header: MessageHeader,
    payload: BytesMut,
}

impl EnvelopeBody {
    /// Protocol family member this message belongs to
    #[must_use]
    pub const fn protocol(&self) -> i32 {
        self.protocol
    }

    /// Set protocol
    pub fn set_protocol(&mut self, protocol: i32) {
        self.protocol = protocol;
    }

    /// Envelope flags
    #[must_use]
    pub const fn flags(&self) -> EnvelopeFlags {
        self.flags
    }

    /// Source endpoint
    #[must_use]
    pub const fn source(&self) -> Address {
        self.source
    }

    /// Set source endpoint
    pub fn set_source(&mut self, source: Address) {
        self.source = source;
    }

    /// Destination endpoint
    #[must_use]
    pub const fn destination(&self) -> Address {
        self.destination
    }

    /// Set destination endpoint
    pub fn set_destination(&mut self, destination: Address) {
        self.destination = destination;
    }

    /// Attached credentials
    #[must_use]
    pub const fn credentials(&self) -> Option<Credentials> {
        self.credentials
    }

    /// Attach credentials to be sent alongside the message
    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
        self.flags = self.flags.with(EnvelopeFlags::CRED_PRESENT);
    }

    /// Message header
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Mutable message header
    pub fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    /// Payload following the header
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Append bytes to the payload, keeping the length field current
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let new_len = self.payload.len() + data.len();
        if new_len > super::MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: new_len,
                max: super::MAX_PAYLOAD_SIZE,
            });
        }
        self.payload.extend_from_slice(data);
        self.header.set_len((HEADER_SIZE + new_len) as u32);
        Ok(())
    }

    /// Reserve payload capacity for at least `additional` more bytes
    pub fn reserve(&mut self, additional: usize) {
        self.payload.reserve(additional);
    }

    /// Encode to wire format
    pub fn encode(&self) -> Result<Bytes> {
        codec::encode(&self.header, &self.payload).map(BytesMut::freeze)
    }
}

struct Shared {
    refcount: AtomicU32,
    body: Mutex<Option<EnvelopeBody>>,
}

/// A netlink message plus its addressing metadata
///
/// Ownership is counted explicitly: [`Envelope::retain`] hands out another
/// reference and every holder calls [`Envelope::release`] exactly once. The
/// body is freed when the count reaches zero, and releasing past zero is
/// reported as [`Error::DoubleFree`].
///
/// Mutating accessors require the calling holder to be the only one.
pub struct Envelope {
    shared: Arc<Shared>,
}

impl Envelope {
    /// Allocate an empty envelope with a reference count of one
    #[must_use]
    pub fn allocate(protocol: i32, flags: EnvelopeFlags) -> Self {
        Self::from_body(EnvelopeBody {
            protocol,
            flags,
            source: Address::default(),
            destination: Address::default(),
            credentials: None,
            header: MessageHeader::new(MessageType::Other(0), HeaderFlags::new()),
            payload: BytesMut::new(),
        })
    }

    /// Allocate a message of the given type with the socket's protocol
    #[must_use]
    pub fn new(msg_type: MessageType, flags: HeaderFlags) -> Self {
        let envelope = Self::allocate(PROTOCOL_UNSPEC, EnvelopeFlags::new());
        if let Some(body) = envelope.lock().as_mut() {
            body.header = MessageHeader::new(msg_type, flags);
        }
        envelope
    }

    /// Wrap a message received from `source`
    #[must_use]
    pub fn from_frame(
        protocol: i32,
        frame: Frame,
        source: Address,
        credentials: Option<Credentials>,
    ) -> Self {
        let flags = if credentials.is_some() {
            EnvelopeFlags::new().with(EnvelopeFlags::CRED_PRESENT)
        } else {
            EnvelopeFlags::new()
        };

        Self::from_body(EnvelopeBody {
            protocol,
            flags,
            source,
            destination: Address::default(),
            credentials,
            header: frame.header,
            payload: BytesMut::from(frame.payload.as_ref()),
        })
    }

    fn from_body(body: EnvelopeBody) -> Self {
        Self {
            shared: Arc::new(Shared {
                refcount: AtomicU32::new(1),
                body: Mutex::new(Some(body)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<EnvelopeBody>> {
        self.shared.body.lock().expect("envelope mutex poisoned")
    }

    /// Take another reference to the same envelope
    pub fn retain(&self) -> Result<Self> {
        self.shared
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count != 0).then(|| count.saturating_add(1))
            })
            .map_err(|_| Error::Released)?;
        Ok(Self {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Drop one reference, freeing the body when it was the last
    pub fn release(&self) -> Result<()> {
        let previous = self
            .shared
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| Error::DoubleFree)?;

        if previous == 1 {
            self.lock().take();
        }
        Ok(())
    }

    /// Current reference count
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.shared.refcount.load(Ordering::Acquire)
    }

    /// Check whether more than one holder references this envelope
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.refcount() > 1
    }

    /// Check whether two handles reference the same envelope
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Read the body
    pub fn read<R>(&self, f: impl FnOnce(&EnvelopeBody) -> R) -> Result<R> {
        self.lock().as_ref().map(f).ok_or(Error::Released)
    }

    /// Mutate the body; fails while the envelope is shared
    pub fn modify<R>(&self, f: impl FnOnce(&mut EnvelopeBody) -> R) -> Result<R> {
        let refcount = self.refcount();
        if refcount > 1 {
            return Err(Error::Shared { refcount });
        }
        self.lock().as_mut().map(f).ok_or(Error::Released)
    }

    /// Message header
    pub fn header(&self) -> Result<MessageHeader> {
        self.read(|body| body.header)
    }

    /// Copy of the payload
    pub fn payload(&self) -> Result<Bytes> {
        self.read(|body| Bytes::copy_from_slice(&body.payload))
    }

    /// Protocol the envelope is tagged with
    pub fn protocol(&self) -> Result<i32> {
        self.read(EnvelopeBody::protocol)
    }

    /// Source endpoint
    pub fn source(&self) -> Result<Address> {
        self.read(EnvelopeBody::source)
    }

    /// Destination endpoint
    pub fn destination(&self) -> Result<Address> {
        self.read(EnvelopeBody::destination)
    }

    /// Attached credentials
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        self.read(EnvelopeBody::credentials)
    }

    /// Append bytes to the payload
    pub fn append(&self, data: &[u8]) -> Result<()> {
        self.modify(|body| body.append(data))?
    }

    /// Reserve payload capacity
    pub fn reserve(&self, additional: usize) -> Result<()> {
        self.modify(|body| body.reserve(additional))
    }

    /// Set destination endpoint
    pub fn set_destination(&self, destination: Address) -> Result<()> {
        self.modify(|body| body.set_destination(destination))
    }

    /// Attach credentials
    pub fn set_credentials(&self, credentials: Credentials) -> Result<()> {
        self.modify(|body| body.set_credentials(credentials))
    }

    /// Encode to wire format
    pub fn encode(&self) -> Result<Bytes> {
        self.read(EnvelopeBody::encode)?
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header = self.header().ok();
        f.debug_struct("Envelope")
            .field("refcount", &self.refcount())
            .field("header", &header)
            .finish_non_exhaustive()
    }
}

/// Decoded payload of an `ERROR` message
///
/// A code of zero is an acknowledgment; anything else is a negative errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReply {
    code: i32,
    request: Option<MessageHeader>,
}

impl ErrorReply {
    /// Bytes occupied by the error code
    pub const CODE_SIZE: usize = 4;

    /// Create a reply
    #[must_use]
    pub const fn new(code: i32, request: Option<MessageHeader>) -> Self {
        Self { code, request }
    }

    /// Parse the payload of an `ERROR` message
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let Some(raw) = payload.first_chunk::<{ Self::CODE_SIZE }>() else {
            return Err(Error::ErrorReplyTooShort { len: payload.len() });
        };
        let code = i32::from_ne_bytes(*raw);
        let request = MessageHeader::from_bytes(&payload[Self::CODE_SIZE..]).ok();
        Ok(Self { code, request })
    }

    /// Encode as an `ERROR` payload
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Self::CODE_SIZE + HEADER_SIZE);
        payload.extend_from_slice(&self.code.to_ne_bytes());
        if let Some(request) = &self.request {
            payload.extend_from_slice(&request.to_bytes());
        }
        payload
    }

    /// Raw code as sent by the kernel (zero or a negative errno)
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }

    /// Positive errno value
    #[must_use]
    pub const fn errno(&self) -> i32 {
        self.code.saturating_abs()
    }

    /// Check whether this is an acknowledgment
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        self.code == 0
    }

    /// Header of the request that caused this reply, if echoed
    #[must_use]
    pub const fn request(&self) -> Option<&MessageHeader> {
        self.request.as_ref()
    }
}
