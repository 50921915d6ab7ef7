use crate::block::{RawBlock, PAGE_SIZE};
use crate::invariants::{
    debug_assert_bounded_count, debug_assert_monotonic, debug_assert_read_not_past_write,
    protocol_violation,
};
use crate::metrics::Metrics;
use crate::{Backoff, Config, MetricsSnapshot, QueueError};
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{self, AtomicU64, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// ## Position counters
//
// `write_pos` and `read_pos` are unbounded u64 counters, never wrapped
// indices. The slot of a position is `pos & mask`; the occupied count is
// `write_pos.wrapping_sub(read_pos)`. At 10 billion messages/second the
// counters take ~58 years to wrap, so wrap is not defended against.
//
// Storage has `capacity + 1` slots (a power of two). One slot stays reserved,
// so a full ring never has `write_pos & mask == read_pos & mask`.
//
// ## Memory ordering protocol
//
// **Producer:**
// 1. Load `write_pos` Relaxed (only the producer stores it)
// 2. Check space against the cached `read_pos`; refresh with Acquire if short
// 3. Write the slot (exclusive by protocol)
// 4. Store `write_pos + 1` with Release (publishes the slot)
//
// **Consumer:**
// 1. Load `read_pos` Relaxed (only the consumer stores it)
// 2. Load `write_pos` Acquire (synchronizes with the producer's Release)
// 3. Read slots in `[read_pos, write_pos)`
// 4. Store the new `read_pos` with Release (hands slots back to the producer)
//
// ## Single-writer invariants
//
// `split(&mut self)` hands out exactly one `SpscWriter` and one `SpscReader`,
// and each handle tracks its outstanding slot or batch, so at most one write
// slot and one read batch exist at a time.
//
// =============================================================================

/// Single-producer single-consumer ring of fixed-size byte elements.
pub struct SpscRing {
    // === PRODUCER HOT ===
    write_pos: CachePadded<AtomicU64>,

    // === CONSUMER HOT ===
    read_pos: CachePadded<AtomicU64>,

    // === COLD STATE ===
    metrics: Metrics,
    config: Config,
    capacity: usize,
    mask: u64,
    element_size: usize,

    // === DATA BUFFER === (page aligned)
    storage: RawBlock,
}

impl SpscRing {
    /// Creates a ring over `next_power_of_two(nmemb)` elements of
    /// `element_size` bytes.
    ///
    /// One slot stays reserved, so `capacity()` is
    /// `next_power_of_two(nmemb) - 1`; `nmemb == 1` leaves no usable slot and
    /// is rejected.
    pub fn new(nmemb: usize, element_size: usize) -> Result<Self, QueueError> {
        Self::with_config(Config::new(nmemb, element_size))
    }

    /// Creates a ring from a full configuration.
    pub fn with_config(config: Config) -> Result<Self, QueueError> {
        if config.capacity == 0 || config.element_size == 0 {
            return Err(QueueError::InvalidArgument {
                reason: "capacity and element size must be > 0",
            });
        }

        let slots = config
            .capacity
            .checked_next_power_of_two()
            .ok_or(QueueError::Overflow)?;
        if slots < 2 {
            return Err(QueueError::InvalidArgument {
                reason: "capacity must leave at least one usable slot",
            });
        }
        let bytes = slots
            .checked_mul(config.element_size)
            .ok_or(QueueError::Overflow)?;
        let storage = RawBlock::zeroed(bytes, PAGE_SIZE)?;

        let ring = Self {
            write_pos: CachePadded::new(AtomicU64::new(0)),
            read_pos: CachePadded::new(AtomicU64::new(0)),
            metrics: Metrics::new(),
            config,
            capacity: slots - 1,
            mask: (slots - 1) as u64,
            element_size: config.element_size,
            storage,
        };
        atomic::fence(Ordering::SeqCst);

        tracing::debug!(
            requested = config.capacity,
            capacity = ring.capacity,
            element_size = ring.element_size,
            "spsc ring created"
        );
        Ok(ring)
    }

    // ---------------------------------------------------------------------
    // CONSTANTS & STATUS
    // ---------------------------------------------------------------------

    /// Maximum number of elements held at once.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes per element.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Returns the current number of items in the ring.
    #[inline]
    pub fn len(&self) -> usize {
        // read_pos first: it never passes write_pos, so the difference is
        // non-negative even if both move in between.
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        (write.wrapping_sub(read) as usize).min(self.capacity)
    }

    /// Returns true if the ring is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the ring is full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Free element slots. Advisory.
    #[inline]
    pub fn available_space(&self) -> usize {
        self.capacity - self.len()
    }

    /// Get a snapshot of metrics if enabled.
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.config.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }

    /// Splits the ring into its producer and consumer handles.
    ///
    /// Borrowing `self` mutably guarantees there is one of each.
    pub fn split(&mut self) -> (SpscWriter<'_>, SpscReader<'_>) {
        let ring: &Self = self;
        let read = ring.read_pos.load(Ordering::Acquire);
        (
            SpscWriter {
                ring,
                cached_read: Cell::new(read),
                outstanding: Cell::new(false),
            },
            SpscReader {
                ring,
                outstanding: Cell::new(false),
            },
        )
    }

    // ---------------------------------------------------------------------
    // INTERNAL
    // ---------------------------------------------------------------------

    #[inline]
    fn element_ptr(&self, pos: u64) -> *mut u8 {
        let offset = (pos & self.mask) as usize * self.element_size;
        debug_assert!(offset + self.element_size <= self.storage.len());
        // SAFETY: offset + element_size is within the block (mask < slots).
        unsafe { self.storage.as_ptr().add(offset) }
    }

    fn publish(&self, pos: u64) {
        let write = self.write_pos.load(Ordering::Relaxed);
        if write != pos {
            protocol_violation!(
                "spsc commit order violation: slot at {} committed, write position is {}",
                pos,
                write
            );
        }
        let new_write = write.wrapping_add(1);
        let read = self.read_pos.load(Ordering::Relaxed);

        debug_assert_bounded_count!(new_write.wrapping_sub(read) as usize, self.capacity);
        debug_assert_monotonic!("write_pos", write, new_write);

        self.write_pos.store(new_write, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_written(1);
        }
    }

    fn release(&self, start: u64, end: u64) {
        let read = self.read_pos.load(Ordering::Relaxed);
        if read != start {
            protocol_violation!(
                "spsc concurrent read detected: batch started at {}, read position is {}",
                start,
                read
            );
        }
        debug_assert_read_not_past_write!(end, self.write_pos.load(Ordering::Relaxed));
        debug_assert_monotonic!("read_pos", read, end);

        self.read_pos.store(end, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_read(end.wrapping_sub(start));
        }
    }
}

impl std::fmt::Debug for SpscRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscRing")
            .field("capacity", &self.capacity)
            .field("element_size", &self.element_size)
            .field("write_pos", &self.write_pos.load(Ordering::Relaxed))
            .field("read_pos", &self.read_pos.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// PRODUCER
// =============================================================================

/// The ring's only producer.
///
/// At most one [`SpscWriteSlot`] is outstanding; preparing a second one before
/// the first is committed or dropped is a protocol violation.
pub struct SpscWriter<'a> {
    ring: &'a SpscRing,
    /// Producer's view of `read_pos` (avoids cross-core reads)
    cached_read: Cell<u64>,
    outstanding: Cell<bool>,
}

impl<'a> SpscWriter<'a> {
    /// The shared ring, for introspection while this handle is live.
    ///
    /// Status reads through it are advisory under concurrent use.
    #[inline]
    pub fn ring(&self) -> &'a SpscRing {
        self.ring
    }
}

impl SpscWriter<'_> {
    /// Next free element. Returns `None` if the ring is full.
    ///
    /// Fast path checks the cached read position; the shared counter is only
    /// loaded when the cache says the ring is full.
    pub fn writer_prepare(&self) -> Option<SpscWriteSlot<'_>> {
        if self.outstanding.get() {
            protocol_violation!("spsc writer_prepare with a slot already outstanding");
        }
        let ring = self.ring;
        let write = ring.write_pos.load(Ordering::Relaxed);

        if write.wrapping_sub(self.cached_read.get()) as usize >= ring.capacity
            && self.refresh_is_full(write)
        {
            if ring.config.enable_metrics {
                ring.metrics.add_full_rejections(1);
            }
            return None;
        }

        self.outstanding.set(true);
        Some(SpscWriteSlot {
            ring,
            outstanding: &self.outstanding,
            pos: write,
        })
    }

    /// Prepare with adaptive backoff. Spins, yields, then gives up.
    pub fn writer_prepare_with_backoff(&self) -> Option<SpscWriteSlot<'_>> {
        let mut backoff = Backoff::new();
        while !backoff.is_completed() {
            let write = self.ring.write_pos.load(Ordering::Relaxed);
            if !self.refresh_is_full(write) {
                return self.writer_prepare();
            }
            backoff.snooze();
        }
        None
    }

    /// Publishes a filled element.
    ///
    /// # Panics
    ///
    /// If the slot is not the one at the current write position.
    pub fn writer_commit(&self, slot: SpscWriteSlot<'_>) {
        if !ptr::eq(slot.ring, self.ring) {
            protocol_violation!("spsc slot committed to a ring it does not belong to");
        }
        slot.commit();
    }

    /// Copies `item` into the next element (zero-filling the rest) and commits it.
    pub fn push(&self, item: &[u8]) -> Result<(), QueueError> {
        let max = self.ring.element_size;
        if item.len() > max {
            return Err(QueueError::MessageSize {
                size: item.len(),
                max,
            });
        }
        let mut slot = self.writer_prepare().ok_or(QueueError::Full)?;
        let dst = slot.as_mut_slice();
        dst[..item.len()].copy_from_slice(item);
        dst[item.len()..].fill(0);
        slot.commit();
        Ok(())
    }

    fn refresh_is_full(&self, write: u64) -> bool {
        let read = self.ring.read_pos.load(Ordering::Acquire);
        self.cached_read.set(read);
        write.wrapping_sub(read) as usize >= self.ring.capacity
    }
}

/// An element reserved for writing. Dropping it without committing leaves the
/// write position unchanged.
pub struct SpscWriteSlot<'w> {
    ring: &'w SpscRing,
    outstanding: &'w Cell<bool>,
    pos: u64,
}

impl SpscWriteSlot<'_> {
    /// Position counter of this element.
    #[inline]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// The element's bytes.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the element at write_pos is outside [read_pos, write_pos), so
        // the consumer does not touch it, and the writer hands out one slot at
        // a time.
        unsafe {
            std::slice::from_raw_parts_mut(self.ring.element_ptr(self.pos), self.ring.element_size)
        }
    }

    /// Publishes the element to the consumer.
    #[inline]
    pub fn commit(self) {
        self.ring.publish(self.pos);
    }
}

impl Drop for SpscWriteSlot<'_> {
    fn drop(&mut self) {
        self.outstanding.set(false);
    }
}

// =============================================================================
// CONSUMER
// =============================================================================

/// The ring's only consumer. At most one [`SpscBatch`] is outstanding.
pub struct SpscReader<'a> {
    ring: &'a SpscRing,
    outstanding: Cell<bool>,
}

impl<'a> SpscReader<'a> {
    /// The shared ring, for introspection while this handle is live.
    ///
    /// Status reads through it are advisory under concurrent use.
    #[inline]
    pub fn ring(&self) -> &'a SpscRing {
        self.ring
    }
}

impl SpscReader<'_> {
    /// Snapshots every published element as one batch. `None` if empty.
    pub fn reader_prepare(&self) -> Option<SpscBatch<'_>> {
        if self.outstanding.get() {
            protocol_violation!("spsc reader_prepare with a batch already outstanding");
        }
        let ring = self.ring;
        let read = ring.read_pos.load(Ordering::Relaxed);
        let write = ring.write_pos.load(Ordering::Acquire);
        if read == write {
            return None;
        }

        debug_assert_bounded_count!(write.wrapping_sub(read) as usize, ring.capacity);
        if ring.config.enable_metrics {
            ring.metrics.add_batches_read(1);
        }
        self.outstanding.set(true);
        Some(SpscBatch {
            ring,
            outstanding: &self.outstanding,
            start: read,
            cursor: read,
            end: write,
            done: false,
        })
    }

    /// Publishes the consumed part of a batch.
    ///
    /// # Panics
    ///
    /// If the read position moved since the batch was prepared.
    pub fn reader_commit(&self, batch: SpscBatch<'_>) {
        if !ptr::eq(batch.ring, self.ring) {
            protocol_violation!("spsc batch committed to a ring it was not read from");
        }
        batch.commit();
    }

    /// Process ALL available items with a single read-position update.
    pub fn consume_batch<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        let Some(mut batch) = self.reader_prepare() else {
            return 0;
        };
        let mut count = 0;
        while let Some(item) = batch.next() {
            handler(item);
            count += 1;
        }
        batch.commit();
        count
    }
}

/// A snapshot `[read_pos, write_pos)` of published elements.
///
/// Committing (or dropping) publishes the elements returned by
/// [`next`](Self::next) so far; the rest are delivered again by the next
/// `reader_prepare`.
pub struct SpscBatch<'r> {
    ring: &'r SpscRing,
    outstanding: &'r Cell<bool>,
    start: u64,
    cursor: u64,
    end: u64,
    done: bool,
}

impl SpscBatch<'_> {
    /// Number of elements in the snapshot.
    #[inline]
    pub fn len(&self) -> usize {
        self.end.wrapping_sub(self.start) as usize
    }

    /// Always false: an empty `reader_prepare` returns `None`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Next element, oldest first.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&[u8]> {
        if self.cursor == self.end {
            return None;
        }
        let ptr = self.ring.element_ptr(self.cursor);
        self.cursor = self.cursor.wrapping_add(1);
        // SAFETY: elements in [start, end) were published by the producer's
        // Release store observed by our Acquire load, and the producer will not
        // reuse them until read_pos moves past them.
        Some(unsafe { std::slice::from_raw_parts(ptr, self.ring.element_size) })
    }

    /// Advances the read position past the elements consumed so far.
    pub fn commit(mut self) {
        self.done = true;
        self.ring.release(self.start, self.cursor);
    }
}

impl Drop for SpscBatch<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            self.ring.release(self.start, self.cursor);
        }
        self.outstanding.set(false);
    }
}
