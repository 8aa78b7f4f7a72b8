//! Per-process local port allocation.
//!
//! Candidate ports combine the low 22 bits of a base (the process id for
//! the global allocator) with a 10-bit slot number, giving 1024 distinct
//! ports per process. Uniqueness is best effort: another process may still
//! own a candidate, which the bind path handles by trying the next slot.

use std::sync::{Arc, Mutex, OnceLock};

/// Number of slots available per allocator.
pub const PORT_SLOTS: usize = 1024;

const SLOT_SHIFT: u32 = 22;
const BASE_MASK: u32 = (1 << SLOT_SHIFT) - 1;
const WORD_BITS: usize = u32::BITS as usize;

/// Bitmap of the slots handed out so far.
#[derive(Debug)]
pub struct PortAllocator {
    base: u32,
    used: Mutex<[u32; PORT_SLOTS / WORD_BITS]>,
}

impl PortAllocator {
    /// Create an allocator deriving ports from `base`.
    #[must_use]
    pub fn new(base: u32) -> Self {
        Self {
            base: base & BASE_MASK,
            used: Mutex::new([0; PORT_SLOTS / WORD_BITS]),
        }
    }

    /// Allocator shared by every socket in the process.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<PortAllocator>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new(std::process::id()))))
    }

    const fn port_for(&self, slot: usize) -> u32 {
        self.base | ((slot as u32) << SLOT_SHIFT)
    }

    /// Claim the next free port, or `None` when every slot is taken.
    pub fn allocate(&self) -> Option<u32> {
        let mut used = self.used.lock().expect("port allocator mutex poisoned");
        for slot in 0..PORT_SLOTS {
            let (word, bit) = (slot / WORD_BITS, slot % WORD_BITS);
            if used[word] & (1 << bit) != 0 {
                continue;
            }
            used[word] |= 1 << bit;
            let port = self.port_for(slot);
            // Base 0 and slot 0 would yield the kernel's port.
            if port == 0 {
                continue;
            }
            return Some(port);
        }
        None
    }

    /// Return `port` to the pool. Ports this allocator did not produce are ignored.
    pub fn release(&self, port: u32) {
        if port == 0 || port & BASE_MASK != self.base {
            return;
        }
        let slot = (port >> SLOT_SHIFT) as usize;
        let mut used = self.used.lock().expect("port allocator mutex poisoned");
        used[slot / WORD_BITS] &= !(1 << (slot % WORD_BITS));
    }

    /// Number of ports currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        let used = self.used.lock().expect("port allocator mutex poisoned");
        used.iter().map(|word| word.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_are_distinct() {
        let allocator = PortAllocator::new(1234);
        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();

        assert_eq!(first, 1234);
        assert_eq!(second, 1234 | (1 << 22));
        assert_ne!(first, second);
    }

    #[test]
    fn test_release_makes_slot_reusable() {
        let allocator = PortAllocator::new(99);
        let first = allocator.allocate().unwrap();
        let _second = allocator.allocate().unwrap();
        allocator.release(first);

        assert_eq!(allocator.allocate(), Some(first));
        assert_eq!(allocator.in_use(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = PortAllocator::new(7);
        for _ in 0..PORT_SLOTS {
            assert!(allocator.allocate().is_some());
        }
        assert_eq!(allocator.allocate(), None);
    }

    #[test]
    fn test_zero_base_never_yields_kernel_port() {
        let allocator = PortAllocator::new(0);
        let port = allocator.allocate().unwrap();
        assert_ne!(port, 0);
        assert_eq!(allocator.allocate().map(|p| p >> 22), Some(2));
    }
}
