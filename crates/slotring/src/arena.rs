//! Fixed-slot arena backing the MPMC queue.
//!
//! One zeroed block holds `capacity` slots laid out back to back:
//!
//! ```text
//! slot i (stride bytes, 8-byte aligned)
//! +------------------+---------+--------------------------+-----+
//! | next: AtomicU32  | (pad 4) | payload (payload_size)   | pad |
//! +------------------+---------+--------------------------+-----+
//! ```
//!
//! `next` is an index into the same arena, never an address. It links the
//! slot into the free list or the ready list, depending on where the slot is
//! in its lifecycle; only one of the two roles is active at a time.

use crate::block::{align_up, RawBlock, CACHE_LINE};
use crate::invariants::corrupted;
use crate::QueueError;
use std::sync::atomic::{AtomicU32, Ordering};

/// End of a list.
pub(crate) const TAIL: u32 = u32::MAX;
/// Claimed by a writer, not linked anywhere yet.
pub(crate) const UNUSED: u32 = u32::MAX - 1;
/// Reserved as a corruption marker; capacities stay below it.
pub(crate) const INVALID: u32 = u32::MAX - 2;

/// Bytes in front of each payload: the link word padded to keep payloads 8-aligned.
const LINK_HEADER: usize = 8;
const SLOT_ALIGN: usize = 8;

/// The free-list head: slot index plus an ABA version, packed into one word.
///
/// Every successful update bumps the version, so a CAS that observed
/// `{index, v}` fails if the list was popped and pushed back to the same
/// index in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeHead {
    pub(crate) index: u32,
    pub(crate) version: u32,
}

impl FreeHead {
    pub(crate) const INITIAL: Self = Self {
        index: 0,
        version: 1,
    };

    #[inline]
    pub(crate) const fn pack(self) -> u64 {
        ((self.index as u64) << 32) | self.version as u64
    }

    #[inline]
    pub(crate) const fn unpack(word: u64) -> Self {
        Self {
            index: (word >> 32) as u32,
            version: word as u32,
        }
    }

    /// The head that replaces `self` once `index` is the new first free slot.
    #[inline]
    pub(crate) const fn successor(self, index: u32) -> Self {
        Self {
            index,
            version: self.version.wrapping_add(1),
        }
    }
}

pub(crate) struct SlotArena {
    block: RawBlock,
    capacity: u32,
    stride: usize,
    payload_size: usize,
}

impl SlotArena {
    /// Allocates `capacity` slots and chains them 0 → 1 → … → TAIL.
    pub(crate) fn new(capacity: usize, payload_size: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidArgument {
                reason: "capacity must be > 0",
            });
        }
        if payload_size == 0 {
            return Err(QueueError::InvalidArgument {
                reason: "element size must be > 0",
            });
        }
        if capacity >= INVALID as usize {
            return Err(QueueError::InvalidArgument {
                reason: "capacity exceeds the 32-bit slot index space",
            });
        }

        let stride = LINK_HEADER
            .checked_add(payload_size)
            .and_then(|n| align_up(n, SLOT_ALIGN))
            .ok_or(QueueError::Overflow)?;
        let bytes = capacity.checked_mul(stride).ok_or(QueueError::Overflow)?;
        let block = RawBlock::zeroed(bytes, CACHE_LINE)?;

        let arena = Self {
            block,
            capacity: capacity as u32,
            stride,
            payload_size,
        };
        for index in 0..arena.capacity {
            let next = if index + 1 == arena.capacity {
                TAIL
            } else {
                index + 1
            };
            arena.link(index).store(next, Ordering::Relaxed);
        }
        Ok(arena)
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub(crate) fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub(crate) fn payload_size(&self) -> usize {
        self.payload_size
    }

    #[inline]
    pub(crate) fn contains(&self, index: u32) -> bool {
        index < self.capacity
    }

    /// Link word of slot `index`. Panics on an out-of-bounds index.
    #[inline]
    pub(crate) fn link(&self, index: u32) -> &AtomicU32 {
        let offset = self.offset(index);
        // SAFETY: offset is in bounds and 8-aligned (block is 64-aligned,
        // stride a multiple of 8). The bytes are zero-initialized and only
        // ever accessed as an AtomicU32.
        unsafe { &*self.block.as_ptr().add(offset).cast::<AtomicU32>() }
    }

    /// Payload of slot `index`.
    ///
    /// # Safety
    ///
    /// The caller must own the slot under the queue protocol (claimed for
    /// write, or part of a batch taken by `reader_prepare`) for as long as the
    /// returned slice lives.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self, index: u32) -> &mut [u8] {
        let offset = self.offset(index) + LINK_HEADER;
        std::slice::from_raw_parts_mut(self.block.as_ptr().add(offset), self.payload_size)
    }

    /// Read-only view of a payload. Same contract as [`Self::payload_mut`].
    #[inline]
    pub(crate) unsafe fn payload(&self, index: u32) -> &[u8] {
        let offset = self.offset(index) + LINK_HEADER;
        std::slice::from_raw_parts(self.block.as_ptr().add(offset), self.payload_size)
    }

    #[inline]
    fn offset(&self, index: u32) -> usize {
        if !self.contains(index) {
            corrupted!(
                "slot index {:#x} out of bounds (capacity {})",
                index,
                self.capacity
            );
        }
        index as usize * self.stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_head_packing() {
        let head = FreeHead {
            index: 7,
            version: 42,
        };
        assert_eq!(head.pack(), (7u64 << 32) | 42);
        assert_eq!(FreeHead::unpack(head.pack()), head);

        let wrapped = FreeHead {
            index: 3,
            version: u32::MAX,
        }
        .successor(9);
        assert_eq!(wrapped, FreeHead { index: 9, version: 0 });
    }

    #[test]
    fn test_same_index_different_version_differs() {
        let a = FreeHead::INITIAL;
        let b = a.successor(5).successor(0);
        assert_eq!(a.index, b.index);
        assert_ne!(a.pack(), b.pack());
    }

    #[test]
    fn test_arena_initial_chain() {
        let arena = SlotArena::new(4, 13).unwrap();
        assert_eq!(arena.stride(), 24);
        assert_eq!(arena.payload_size(), 13);

        let chain: Vec<u32> = (0..4).map(|i| arena.link(i).load(Ordering::Relaxed)).collect();
        assert_eq!(chain, vec![1, 2, 3, TAIL]);
    }

    #[test]
    fn test_arena_payloads_are_disjoint() {
        let arena = SlotArena::new(3, 8).unwrap();
        for i in 0..3u32 {
            // SAFETY: single-threaded test owns every slot.
            unsafe { arena.payload_mut(i).fill(i as u8 + 1) };
        }
        for i in 0..3u32 {
            // SAFETY: as above.
            let payload = unsafe { arena.payload(i) };
            assert!(payload.iter().all(|&b| b == i as u8 + 1));
        }
        assert_eq!(arena.link(2).load(Ordering::Relaxed), TAIL);
    }

    #[test]
    fn test_arena_rejects_bad_arguments() {
        assert!(matches!(
            SlotArena::new(0, 8),
            Err(QueueError::InvalidArgument { .. })
        ));
        assert!(matches!(
            SlotArena::new(8, 0),
            Err(QueueError::InvalidArgument { .. })
        ));
        assert!(matches!(
            SlotArena::new(INVALID as usize, 8),
            Err(QueueError::InvalidArgument { .. })
        ));
        assert_eq!(
            SlotArena::new(1 << 20, usize::MAX - 4).err(),
            Some(QueueError::Overflow)
        );
        assert_eq!(
            SlotArena::new(1 << 31, usize::MAX / 1024).err(),
            Some(QueueError::Overflow)
        );
    }

    #[test]
    #[should_panic(expected = "queue corrupted")]
    fn test_out_of_bounds_link_panics() {
        let arena = SlotArena::new(2, 8).unwrap();
        let _ = arena.link(2);
    }
}
