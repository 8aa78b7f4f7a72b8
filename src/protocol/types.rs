//! Netlink message types and header flags

use std::fmt;

/// Netlink message types
///
/// Types below [`MessageType::MIN_USER_TYPE`] are reserved for control
/// messages generated by the kernel; everything else belongs to the
/// subsystem the socket is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Nothing; the message should be ignored
    Noop,
    /// Error or acknowledgment reply
    Error,
    /// End of a multi-part batch
    Done,
    /// Data was lost in the kernel
    Overrun,
    /// Subsystem-specific type
    Other(u16),
}

impl MessageType {
    /// First type value available to subsystems
    pub const MIN_USER_TYPE: u16 = 0x10;

    const NOOP: u16 = 0x1;
    const ERROR: u16 = 0x2;
    const DONE: u16 = 0x3;
    const OVERRUN: u16 = 0x4;

    /// Convert from the raw header field
    #[must_use]
    pub const fn from_u16(value: u16) -> Self {
        match value {
            Self::NOOP => Self::Noop,
            Self::ERROR => Self::Error,
            Self::DONE => Self::Done,
            Self::OVERRUN => Self::Overrun,
            other => Self::Other(other),
        }
    }

    /// Convert to the raw header field
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Noop => Self::NOOP,
            Self::Error => Self::ERROR,
            Self::Done => Self::DONE,
            Self::Overrun => Self::OVERRUN,
            Self::Other(value) => value,
        }
    }

    /// Check if this is a kernel control message
    #[must_use]
    pub const fn is_control(self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<u16> for MessageType {
    fn from(value: u16) -> Self {
        Self::from_u16(value)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => write!(f, "NOOP"),
            Self::Error => write!(f, "ERROR"),
            Self::Done => write!(f, "DONE"),
            Self::Overrun => write!(f, "OVERRUN"),
            Self::Other(value) => write!(f, "{value:#06x}"),
        }
    }
}

/// Header flags
///
/// The GET and NEW modifier groups reuse the same bits; which meaning
/// applies depends on the request type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeaderFlags(u16);

impl HeaderFlags {
    /// Message is a request
    pub const REQUEST: u16 = 0x1;
    /// Part of a multi-part batch terminated by `DONE`
    pub const MULTI: u16 = 0x2;
    /// Sender wants an acknowledgment
    pub const ACK: u16 = 0x4;
    /// Echo this request back
    pub const ECHO: u16 = 0x8;
    /// Dump was inconsistent due to a concurrent change
    pub const DUMP_INTR: u16 = 0x10;
    /// Dump was filtered as requested
    pub const DUMP_FILTERED: u16 = 0x20;

    /// GET: return the complete table
    pub const ROOT: u16 = 0x100;
    /// GET: return all matching entries
    pub const MATCH: u16 = 0x200;
    /// GET: atomic snapshot
    pub const ATOMIC: u16 = 0x400;
    /// GET: full dump
    pub const DUMP: u16 = Self::ROOT | Self::MATCH;

    /// NEW: replace an existing object
    pub const REPLACE: u16 = 0x100;
    /// NEW: do not touch an existing object
    pub const EXCL: u16 = 0x200;
    /// NEW: create if it does not exist
    pub const CREATE: u16 = 0x400;
    /// NEW: add to the end of the list
    pub const APPEND: u16 = 0x800;

    /// Create empty flags
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Create from the raw header field
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Convert to the raw header field
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Set a flag
    #[must_use]
    pub const fn with(mut self, flag: u16) -> Self {
        self.0 |= flag;
        self
    }

    /// Set a flag in place
    pub fn insert(&mut self, flag: u16) {
        self.0 |= flag;
    }

    /// Clear a flag in place
    pub fn remove(&mut self, flag: u16) {
        self.0 &= !flag;
    }

    /// Check if all bits of `flag` are set
    #[must_use]
    pub const fn has(self, flag: u16) -> bool {
        (self.0 & flag) == flag
    }

    /// Check if more messages of the batch follow
    #[must_use]
    pub const fn is_multi(self) -> bool {
        self.has(Self::MULTI)
    }

    /// Check if the sender requested an acknowledgment
    #[must_use]
    pub const fn requests_ack(self) -> bool {
        self.has(Self::ACK)
    }

    /// Check if the dump was interrupted
    #[must_use]
    pub const fn is_dump_interrupted(self) -> bool {
        self.has(Self::DUMP_INTR)
    }
}

impl fmt::Display for HeaderFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 6] = [
            (HeaderFlags::REQUEST, "REQUEST"),
            (HeaderFlags::MULTI, "MULTI"),
            (HeaderFlags::ACK, "ACK"),
            (HeaderFlags::ECHO, "ECHO"),
            (HeaderFlags::DUMP_INTR, "DUMP_INTR"),
            (HeaderFlags::DUMP_FILTERED, "DUMP_FILTERED"),
        ];

        let mut parts: Vec<String> = NAMES
            .iter()
            .filter(|(bit, _)| self.has(*bit))
            .map(|(_, name)| (*name).to_string())
            .collect();
        let modifiers = self.0 & 0xF00;
        if modifiers != 0 {
            parts.push(format!("{modifiers:#05x}"));
        }
        if parts.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", parts.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        let types = [
            MessageType::Noop,
            MessageType::Error,
            MessageType::Done,
            MessageType::Overrun,
            MessageType::Other(0x10),
        ];

        for msg_type in types {
            assert_eq!(MessageType::from_u16(msg_type.as_u16()), msg_type);
        }
        assert!(MessageType::Done.is_control());
        assert!(!MessageType::Other(MessageType::MIN_USER_TYPE).is_control());
    }

    #[test]
    fn test_flags() {
        let flags = HeaderFlags::new()
            .with(HeaderFlags::REQUEST)
            .with(HeaderFlags::DUMP);

        assert!(flags.has(HeaderFlags::ROOT));
        assert!(flags.has(HeaderFlags::DUMP));
        assert!(!flags.is_multi());
        assert!(!flags.requests_ack());
        assert_eq!(HeaderFlags::from_bits(0x2).to_string(), "MULTI");
        assert_eq!(HeaderFlags::new().to_string(), "NONE");
    }
}
