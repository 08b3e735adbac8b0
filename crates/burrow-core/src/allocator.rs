//! Socket identifier allocation
//!
//! Local identifiers come from a single wrapping 32-bit counter per process.
//! Wraparound will eventually revisit old values; the registry's
//! destroy-before-reuse discipline is what makes that safe for long-lived
//! processes with bounded concurrent-socket counts.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::types::SocketId;

/// First identifier handed out, and the value the counter wraps back to
pub const FIRST_SOCKET_ID: u32 = 1;

// ----------------------------------------------------------------------------
// Socket Identifier Allocator
// ----------------------------------------------------------------------------

/// Produces a stream of unique, wrapping 32-bit socket identifiers
///
/// Identifiers start at 1 and increment by 1; after `u32::MAX` the counter
/// wraps back to 1, so 0 stays reserved as the unassigned sentinel.
#[derive(Debug)]
pub struct SocketIdAllocator {
    next: AtomicU32,
}

impl SocketIdAllocator {
    /// Create an allocator starting at [`FIRST_SOCKET_ID`]
    pub fn new() -> Self {
        Self::starting_at(FIRST_SOCKET_ID)
    }

    /// Create an allocator starting at an arbitrary identifier
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Allocate the next identifier
    pub fn next_id(&self) -> SocketId {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let next = if current == u32::MAX {
                FIRST_SOCKET_ID
            } else {
                current + 1
            };
            if self
                .next
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return SocketId::new(current);
            }
        }
    }
}

impl Default for SocketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let allocator = SocketIdAllocator::new();
        assert_eq!(allocator.next_id(), SocketId::new(1));
        assert_eq!(allocator.next_id(), SocketId::new(2));
        assert_eq!(allocator.next_id(), SocketId::new(3));
    }

    #[test]
    fn test_injective_over_run() {
        let allocator = SocketIdAllocator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(allocator.next_id()));
        }
    }

    #[test]
    fn test_wraparound_skips_unassigned_sentinel() {
        let allocator = SocketIdAllocator::starting_at(u32::MAX - 1);
        assert_eq!(allocator.next_id(), SocketId::new(u32::MAX - 1));
        assert_eq!(allocator.next_id(), SocketId::new(u32::MAX));
        assert_eq!(allocator.next_id(), SocketId::new(FIRST_SOCKET_ID));
    }
}
