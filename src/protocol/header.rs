//! Netlink message header
//!
//! The header is 16 bytes and encoded in host byte order, which is what the
//! kernel expects on every architecture.

use super::{HEADER_SIZE, HeaderFlags, MessageType};

/// Netlink message header (16 bytes)
///
/// # Wire Format
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Length (4)                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            Type (2)           |           Flags (2)           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      Sequence Number (4)                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Port (4)                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// `Length` covers the header itself plus the unpadded payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageHeader {
    len: u32,
    msg_type: u16,
    flags: u16,
    seq: u32,
    port: u32,
}

impl MessageHeader {
    /// Create a new header for a message without payload
    #[must_use]
    pub fn new(msg_type: MessageType, flags: HeaderFlags) -> Self {
        Self {
            len: HEADER_SIZE as u32,
            msg_type: msg_type.as_u16(),
            flags: flags.bits(),
            seq: 0,
            port: 0,
        }
    }

    /// Total message length (header + payload, unpadded)
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Check whether the message carries no payload
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len as usize <= HEADER_SIZE
    }

    /// Set total message length
    pub fn set_len(&mut self, len: u32) {
        self.len = len;
    }

    /// Payload length implied by the length field
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        (self.len as usize).saturating_sub(HEADER_SIZE)
    }

    /// Get raw type field
    #[must_use]
    pub const fn msg_type_raw(&self) -> u16 {
        self.msg_type
    }

    /// Get message type
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        MessageType::from_u16(self.msg_type)
    }

    /// Set message type
    pub fn set_message_type(&mut self, msg_type: MessageType) {
        self.msg_type = msg_type.as_u16();
    }

    /// Get flags
    #[must_use]
    pub const fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits(self.flags)
    }

    /// Set flags
    pub fn set_flags(&mut self, flags: HeaderFlags) {
        self.flags = flags.bits();
    }

    /// Get sequence number
    #[must_use]
    pub const fn seq(&self) -> u32 {
        self.seq
    }

    /// Set sequence number
    pub fn set_seq(&mut self, seq: u32) {
        self.seq = seq;
    }

    /// Get port of the originating socket
    #[must_use]
    pub const fn port(&self) -> u32 {
        self.port
    }

    /// Set port
    pub fn set_port(&mut self, port: u32) {
        self.port = port;
    }

    /// Validate header
    pub fn validate(&self) -> super::Result<()> {
        if (self.len as usize) < HEADER_SIZE {
            return Err(super::Error::InvalidLength { len: self.len });
        }
        Ok(())
    }

    /// Convert to bytes (host byte order)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..4].copy_from_slice(&self.len.to_ne_bytes());
        bytes[4..6].copy_from_slice(&self.msg_type.to_ne_bytes());
        bytes[6..8].copy_from_slice(&self.flags.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.seq.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.port.to_ne_bytes());

        bytes
    }

    /// Parse from bytes (host byte order)
    pub fn from_bytes(bytes: &[u8]) -> super::Result<Self> {
        let Some(raw) = bytes.first_chunk::<HEADER_SIZE>() else {
            return Err(super::Error::BufferTooSmall {
                needed: HEADER_SIZE,
                got: bytes.len(),
            });
        };

        let header = Self {
            len: u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
            msg_type: u16::from_ne_bytes([raw[4], raw[5]]),
            flags: u16::from_ne_bytes([raw[6], raw[7]]),
            seq: u32::from_ne_bytes([raw[8], raw[9], raw[10], raw[11]]),
            port: u32::from_ne_bytes([raw[12], raw[13], raw[14], raw[15]]),
        };

        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(std::mem::size_of::<MessageHeader>(), HEADER_SIZE);
    }

    #[test]
    fn test_header_roundtrip() {
        let mut header = MessageHeader::new(
            MessageType::Other(0x12),
            HeaderFlags::new().with(HeaderFlags::REQUEST),
        );
        header.set_seq(123);
        header.set_port(456);
        header.set_len(20);

        let decoded = MessageHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.payload_len(), 4);
        assert_eq!(decoded.message_type(), MessageType::Other(0x12));
    }

    #[test]
    fn test_invalid_length() {
        let mut header = MessageHeader::new(MessageType::Noop, HeaderFlags::new());
        header.set_len(8);

        let result = MessageHeader::from_bytes(&header.to_bytes());
        assert!(matches!(
            result,
            Err(super::super::Error::InvalidLength { len: 8 })
        ));
    }

    #[test]
    fn test_short_buffer() {
        let result = MessageHeader::from_bytes(&[0u8; 10]);
        assert!(matches!(
            result,
            Err(super::super::Error::BufferTooSmall { needed: 16, got: 10 })
        ));
    }
}
