//! Netlink message codec (encode/decode)
//!
//! A datagram carries one or more messages back to back. Each message is a
//! [`MessageHeader`] followed by its payload, padded to [`ALIGNTO`] bytes.

use bytes::{BufMut, Bytes, BytesMut};

use super::{ALIGNTO, Error, HEADER_SIZE, MAX_PAYLOAD_SIZE, MessageHeader, Result};

/// Round `len` up to the message alignment boundary
#[must_use]
pub const fn align(len: usize) -> usize {
    (len + ALIGNTO - 1) & !(ALIGNTO - 1)
}

/// Encode a header and payload into a padded wire message
///
/// The header's length field is rewritten to cover the payload.
///
/// # Format
///
/// ```text
/// [HEADER (16 bytes)] [PAYLOAD (variable)] [PADDING (0-3 bytes)]
/// ```
pub fn encode(header: &MessageHeader, payload: &[u8]) -> Result<BytesMut> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let total = HEADER_SIZE + payload.len();
    let mut header = *header;
    header.set_len(total as u32);

    let mut bytes = BytesMut::with_capacity(align(total));
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(payload);
    bytes.put_bytes(0, align(total) - total);

    Ok(bytes)
}

/// One decoded message borrowed out of a datagram
#[derive(Debug, Clone)]
pub struct Frame {
    /// Parsed header
    pub header: MessageHeader,
    /// Unpadded payload
    pub payload: Bytes,
}

/// Iterator over the messages packed into one datagram
///
/// Stops after the first malformed message; [`Frames::rest`] then exposes
/// the bytes that could not be framed.
#[derive(Debug, Clone)]
pub struct Frames {
    data: Bytes,
    offset: usize,
    failed: bool,
}

/// Split a datagram into messages
#[must_use]
pub fn frames(data: Bytes) -> Frames {
    Frames {
        data,
        offset: 0,
        failed: false,
    }
}

impl Frames {
    /// Bytes not yet consumed by the iterator
    #[must_use]
    pub fn rest(&self) -> Bytes {
        self.data.slice(self.offset.min(self.data.len())..)
    }
}

impl Iterator for Frames {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let available = self.data.len().saturating_sub(self.offset);
        // Trailing bytes shorter than a header are padding.
        if available < HEADER_SIZE {
            return None;
        }

        let header = match MessageHeader::from_bytes(&self.data[self.offset..]) {
            Ok(header) => header,
            Err(err) => {
                self.failed = true;
                return Some(Err(err));
            }
        };

        let declared = header.len() as usize;
        if declared > available {
            self.failed = true;
            return Some(Err(Error::Truncated {
                declared,
                available,
            }));
        }

        let payload = self
            .data
            .slice(self.offset + HEADER_SIZE..self.offset + declared);
        self.offset += align(declared).min(available);

        Some(Ok(Frame { header, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HeaderFlags, MessageType};

    fn message(seq: u32, payload: &[u8]) -> BytesMut {
        let mut header = MessageHeader::new(MessageType::Other(0x20), HeaderFlags::new());
        header.set_seq(seq);
        encode(&header, payload).unwrap()
    }

    #[test]
    fn test_align() {
        assert_eq!(align(0), 0);
        assert_eq!(align(1), 4);
        assert_eq!(align(4), 4);
        assert_eq!(align(17), 20);
    }

    #[test]
    fn test_encode_pads_payload() {
        let bytes = message(1, b"abcde");
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[21..24], &[0, 0, 0]);

        let header = MessageHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.len(), 21);
    }

    #[test]
    fn test_decode_batch() {
        let mut datagram = BytesMut::new();
        datagram.extend_from_slice(&message(1, b"one"));
        datagram.extend_from_slice(&message(2, b""));
        datagram.extend_from_slice(&message(3, b"three"));

        let decoded: Vec<Frame> = frames(datagram.freeze())
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].payload.as_ref(), b"one");
        assert!(decoded[1].payload.is_empty());
        assert_eq!(decoded[2].header.seq(), 3);
        assert_eq!(decoded[2].payload.as_ref(), b"three");
    }

    #[test]
    fn test_decode_truncated_message() {
        let mut datagram = BytesMut::new();
        datagram.extend_from_slice(&message(1, b"ok"));
        let second = message(2, b"payload that gets cut");
        datagram.extend_from_slice(&second[..20]);

        let mut iter = frames(datagram.freeze());
        assert!(iter.next().unwrap().is_ok());
        assert!(matches!(
            iter.next(),
            Some(Err(Error::Truncated { available: 20, .. }))
        ));
        assert_eq!(iter.rest().len(), 20);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let mut datagram = BytesMut::new();
        datagram.extend_from_slice(&message(9, b"x"));
        datagram.extend_from_slice(&[0u8; 7]);

        let decoded: Vec<_> = frames(datagram.freeze()).collect();
        assert_eq!(decoded.len(), 1);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any sequence of encoded messages splits back into the same payloads
            #[test]
            fn prop_batch_split_preserves_payloads(
                payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
            ) {
                let mut datagram = BytesMut::new();
                for (seq, payload) in payloads.iter().enumerate() {
                    datagram.extend_from_slice(&message(seq as u32, payload));
                }

                let decoded: Vec<Frame> = frames(datagram.freeze())
                    .collect::<Result<_>>()
                    .unwrap();

                prop_assert_eq!(decoded.len(), payloads.len());
                for (seq, (frame, payload)) in decoded.iter().zip(&payloads).enumerate() {
                    prop_assert_eq!(frame.header.seq(), seq as u32);
                    prop_assert_eq!(frame.payload.as_ref(), payload.as_slice());
                }
            }

            /// Arbitrary input never panics the decoder
            #[test]
            fn prop_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
                for frame in frames(Bytes::from(data)) {
                    let _ = frame;
                }
            }
        }
    }
}
