//! Variable-length message ring over one contiguous byte arena.
//!
//! Every message is framed as a record:
//!
//! ```text
//! +-------------+------------------+---------+
//! | size: u32   | payload (size)   | padding |   record = align64(4 + size)
//! +-------------+------------------+---------+
//! ```
//!
//! Records never wrap. When the run before the physical end of the arena is
//! too short for the next record, the writer stamps a zero-size marker there
//! (if a header fits) and moves on to offset 0; readers treat a zero size, or a
//! run too short to hold a header, as "skip to the boundary".
//!
//! Like [`SpscRing`](crate::SpscRing) the ring has one producer and one
//! consumer, handed out by [`ByteRing::split`], and uses unbounded u64
//! position counters published with Release/Acquire.

use crate::block::{align_up, RawBlock, CACHE_LINE, PAGE_SIZE};
use crate::invariants::{
    corrupted, debug_assert_bounded_count, debug_assert_monotonic,
    debug_assert_read_not_past_write, protocol_violation,
};
use crate::metrics::Metrics;
use crate::{Backoff, Config, MetricsSnapshot, QueueError};
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{self, AtomicU64, Ordering};

/// Bytes of the size prefix in front of every payload.
const HEADER: usize = 4;

/// Framed length of a `len`-byte message. `None` on overflow.
#[inline]
fn record_len(len: usize) -> Option<usize> {
    align_up(HEADER.checked_add(len)?, CACHE_LINE)
}

/// Single-producer single-consumer ring of variable-length byte messages.
pub struct ByteRing {
    write_pos: CachePadded<AtomicU64>,
    read_pos: CachePadded<AtomicU64>,

    metrics: Metrics,
    config: Config,
    size: usize,
    mask: u64,
    max_message_size: usize,
    max_record: usize,

    storage: RawBlock,
}

impl ByteRing {
    /// Creates a ring of at least `size` bytes accepting messages up to
    /// `max_message_size` bytes.
    ///
    /// The arena is rounded up to a power of two (at least one cache line).
    pub fn new(size: usize, max_message_size: usize) -> Result<Self, QueueError> {
        Self::with_config(Config::new(size, max_message_size))
    }

    /// Creates a ring from a configuration; `capacity` is the arena size in
    /// bytes and `element_size` the maximum message size.
    pub fn with_config(config: Config) -> Result<Self, QueueError> {
        let max_message_size = config.element_size;
        if config.capacity == 0 || max_message_size == 0 {
            return Err(QueueError::InvalidArgument {
                reason: "ring size and max message size must be > 0",
            });
        }
        // checked on the requested size, before rounding
        let framed = max_message_size
            .checked_add(HEADER)
            .ok_or(QueueError::Overflow)?;
        if config.capacity < framed {
            return Err(QueueError::InvalidArgument {
                reason: "ring size must hold the max message plus its header",
            });
        }

        let size = config
            .capacity
            .max(CACHE_LINE)
            .checked_next_power_of_two()
            .ok_or(QueueError::Overflow)?;
        let max_record = record_len(max_message_size).ok_or(QueueError::Overflow)?;
        if max_record > size || max_message_size > u32::MAX as usize {
            return Err(QueueError::InvalidArgument {
                reason: "a framed max-size message does not fit in the ring",
            });
        }
        let storage = RawBlock::zeroed(size, PAGE_SIZE)?;

        let ring = Self {
            write_pos: CachePadded::new(AtomicU64::new(0)),
            read_pos: CachePadded::new(AtomicU64::new(0)),
            metrics: Metrics::new(),
            config,
            size,
            mask: (size - 1) as u64,
            max_message_size,
            max_record,
            storage,
        };
        atomic::fence(Ordering::SeqCst);

        tracing::debug!(
            requested = config.capacity,
            size,
            max_message_size,
            max_record,
            "byte ring created"
        );
        Ok(ring)
    }

    /// Arena size in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Bytes between the read and write positions, padding included.
    ///
    /// Advisory: the two counters are loaded separately.
    pub fn used_space(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        (write.wrapping_sub(read) as usize).min(self.size)
    }

    /// Free bytes. Advisory.
    #[inline]
    pub fn available_space(&self) -> usize {
        self.size - self.used_space()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_space() == 0
    }

    /// True if a max-size message could not be reserved right now.
    pub fn is_full(&self) -> bool {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        !self.can_reserve(write, read, self.max_record)
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
    pub fn split(&mut self) -> (ByteWriter<'_>, ByteReader<'_>) {
        let ring: &Self = self;
        (
            ByteWriter {
                ring,
                outstanding: Cell::new(false),
            },
            ByteReader {
                ring,
                outstanding: Cell::new(false),
            },
        )
    }

    // ---------------------------------------------------------------------
    // INTERNAL
    // ---------------------------------------------------------------------

    #[inline]
    fn offset(&self, pos: u64) -> usize {
        (pos & self.mask) as usize
    }

    /// Whether a record of `required` bytes fits at `write`, counting the
    /// padding needed to reach offset 0 first.
    fn can_reserve(&self, write: u64, read: u64, required: usize) -> bool {
        let free = self.size - (write.wrapping_sub(read) as usize).min(self.size);
        let until_wrap = self.size - self.offset(write);
        if until_wrap >= required {
            free >= required
        } else {
            free >= until_wrap + required
        }
    }

    fn write_header(&self, pos: u64, len: u32) {
        let offset = self.offset(pos);
        debug_assert!(offset + HEADER <= self.size);
        // SAFETY: offset is a multiple of the record alignment, so the header
        // is in bounds and 4-aligned, and [write_pos, read_pos + size) belongs
        // to the writer.
        unsafe { self.storage.as_ptr().add(offset).cast::<u32>().write(len) }
    }

    fn read_header(&self, pos: u64) -> u32 {
        let offset = self.offset(pos);
        // SAFETY: as write_header; the header was published by the writer's
        // Release store of write_pos, observed by the reader's Acquire load.
        unsafe { self.storage.as_ptr().add(offset).cast::<u32>().read() }
    }

    /// First position at or after `pos` that starts a real record, stopping
    /// at `end`.
    fn skip_padding(&self, mut pos: u64, end: u64) -> u64 {
        while pos != end {
            let until_wrap = (self.size - self.offset(pos)) as u64;
            if until_wrap < HEADER as u64 || self.read_header(pos) == 0 {
                pos = pos.wrapping_add(until_wrap);
            } else {
                break;
            }
        }
        pos
    }

    fn publish(&self, pos: u64, record: usize) {
        let write = self.write_pos.load(Ordering::Relaxed);
        if write != pos {
            protocol_violation!(
                "byte ring commit order violation: record at {} committed, write position is {}",
                pos,
                write
            );
        }
        let new_write = write.wrapping_add(record as u64);
        debug_assert_bounded_count!(
            new_write.wrapping_sub(self.read_pos.load(Ordering::Relaxed)) as usize,
            self.size
        );
        debug_assert_monotonic!("write_pos", write, new_write);

        self.write_pos.store(new_write, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_written(1);
        }
    }

    fn release(&self, start: u64, end: u64, messages: u64) {
        let read = self.read_pos.load(Ordering::Relaxed);
        if read != start {
            protocol_violation!(
                "byte ring concurrent read detected: batch started at {}, read position is {}",
                start,
                read
            );
        }
        debug_assert_read_not_past_write!(end, self.write_pos.load(Ordering::Relaxed));
        debug_assert_monotonic!("read_pos", read, end);

        self.read_pos.store(end, Ordering::Release);

        if self.config.enable_metrics {
            self.metrics.add_messages_read(messages);
        }
    }
}

impl std::fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteRing")
            .field("size", &self.size)
            .field("max_message_size", &self.max_message_size)
            .field("write_pos", &self.write_pos.load(Ordering::Relaxed))
            .field("read_pos", &self.read_pos.load(Ordering::Relaxed))
            .finish()
    }
}

/// The ring's only producer. At most one [`ByteWriteSlot`] is outstanding.
pub struct ByteWriter<'a> {
    ring: &'a ByteRing,
    outstanding: Cell<bool>,
}

impl<'a> ByteWriter<'a> {
    /// The shared ring, for introspection while this handle is live.
    ///
    /// Status reads through it are advisory under concurrent use.
    #[inline]
    pub fn ring(&self) -> &'a ByteRing {
        self.ring
    }
}

impl ByteWriter<'_> {
    /// Reserves room for a `len`-byte message.
    ///
    /// Returns `Ok(None)` when there is not enough free space, and
    /// [`QueueError::MessageSize`] when `len` is zero or above the maximum.
    /// May insert wrap padding before reserving, even if it then reports full.
    pub fn writer_prepare(&self, len: usize) -> Result<Option<ByteWriteSlot<'_>>, QueueError> {
        let ring = self.ring;
        if len == 0 || len > ring.max_message_size {
            return Err(QueueError::MessageSize {
                size: len,
                max: ring.max_message_size,
            });
        }
        if self.outstanding.get() {
            protocol_violation!("byte ring writer_prepare with a record already outstanding");
        }
        let required = record_len(len).ok_or(QueueError::Overflow)?;

        loop {
            let write = ring.write_pos.load(Ordering::Relaxed);
            let read = ring.read_pos.load(Ordering::Acquire);
            let used = write.wrapping_sub(read) as usize;
            debug_assert_bounded_count!(used, ring.size);
            let free = ring.size - used;
            let until_wrap = ring.size - ring.offset(write);

            if until_wrap < required {
                if free < until_wrap {
                    return Ok(self.reject());
                }
                if until_wrap >= HEADER {
                    ring.write_header(write, 0);
                }
                tracing::trace!(position = write, skipped = until_wrap, "byte ring wrap padding");
                ring.write_pos
                    .store(write.wrapping_add(until_wrap as u64), Ordering::Release);
                continue;
            }

            if free < required {
                return Ok(self.reject());
            }

            // len <= max_message_size, which was checked to fit in a u32
            ring.write_header(write, len as u32);
            self.outstanding.set(true);
            return Ok(Some(ByteWriteSlot {
                ring,
                outstanding: &self.outstanding,
                pos: write,
                len,
                record: required,
            }));
        }
    }

    /// Prepare with adaptive backoff. Spins, yields, then gives up.
    pub fn writer_prepare_with_backoff(
        &self,
        len: usize,
    ) -> Result<Option<ByteWriteSlot<'_>>, QueueError> {
        let mut backoff = Backoff::new();
        while !backoff.is_completed() {
            if let Some(slot) = self.writer_prepare(len)? {
                return Ok(Some(slot));
            }
            backoff.snooze();
        }
        Ok(None)
    }

    /// Publishes a filled record.
    pub fn writer_commit(&self, slot: ByteWriteSlot<'_>) {
        if !ptr::eq(slot.ring, self.ring) {
            protocol_violation!("byte ring record committed to a ring it does not belong to");
        }
        slot.commit();
    }

    /// Copies `message` into a new record and commits it.
    pub fn push(&self, message: &[u8]) -> Result<(), QueueError> {
        let mut slot = self.writer_prepare(message.len())?.ok_or(QueueError::Full)?;
        slot.as_mut_slice().copy_from_slice(message);
        slot.commit();
        Ok(())
    }

    fn reject<T>(&self) -> Option<T> {
        if self.ring.config.enable_metrics {
            self.ring.metrics.add_full_rejections(1);
        }
        None
    }
}

/// A reserved record. Dropping it without committing leaves the write
/// position where it was; the stamped header is overwritten by the next
/// reservation.
pub struct ByteWriteSlot<'w> {
    ring: &'w ByteRing,
    outstanding: &'w Cell<bool>,
    pos: u64,
    len: usize,
    record: usize,
}

impl ByteWriteSlot<'_> {
    /// Payload length requested at prepare.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let offset = self.ring.offset(self.pos) + HEADER;
        // SAFETY: the whole record lies before the wrap point and outside
        // [read_pos, write_pos), and the writer hands out one slot at a time.
        unsafe { std::slice::from_raw_parts_mut(self.ring.storage.as_ptr().add(offset), self.len) }
    }

    /// Publishes the record to the consumer.
    #[inline]
    pub fn commit(self) {
        self.ring.publish(self.pos, self.record);
    }
}

impl Drop for ByteWriteSlot<'_> {
    fn drop(&mut self) {
        self.outstanding.set(false);
    }
}

/// The ring's only consumer. At most one [`ByteBatch`] is outstanding.
pub struct ByteReader<'a> {
    ring: &'a ByteRing,
    outstanding: Cell<bool>,
}

impl<'a> ByteReader<'a> {
    /// The shared ring, for introspection while this handle is live.
    ///
    /// Status reads through it are advisory under concurrent use.
    #[inline]
    pub fn ring(&self) -> &'a ByteRing {
        self.ring
    }
}

impl ByteReader<'_> {
    /// Snapshots every published record. `None` if there are no messages.
    ///
    /// Padding at the read position is consumed on the way, so a snapshot
    /// holding nothing but padding frees it and returns `None`.
    pub fn reader_prepare(&self) -> Option<ByteBatch<'_>> {
        if self.outstanding.get() {
            protocol_violation!("byte ring reader_prepare with a batch already outstanding");
        }
        let ring = self.ring;
        let read = ring.read_pos.load(Ordering::Relaxed);
        let write = ring.write_pos.load(Ordering::Acquire);
        debug_assert_bounded_count!(write.wrapping_sub(read) as usize, ring.size);

        let first = ring.skip_padding(read, write);
        if first == write {
            if first != read {
                ring.release(read, first, 0);
            }
            return None;
        }

        if ring.config.enable_metrics {
            ring.metrics.add_batches_read(1);
        }
        self.outstanding.set(true);
        Some(ByteBatch {
            ring,
            outstanding: &self.outstanding,
            start: read,
            cursor: first,
            end: write,
            messages: 0,
            done: false,
        })
    }

    /// Publishes the consumed part of a batch.
    ///
    /// # Panics
    ///
    /// If the read position moved since the batch was prepared.
    pub fn reader_commit(&self, batch: ByteBatch<'_>) {
        if !ptr::eq(batch.ring, self.ring) {
            protocol_violation!("byte ring batch committed to a ring it was not read from");
        }
        batch.commit();
    }

    /// Hands every available message to `handler`, then commits once.
    pub fn consume_batch<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        let Some(mut batch) = self.reader_prepare() else {
            return 0;
        };
        let mut count = 0;
        while let Some(message) = batch.next() {
            handler(message);
            count += 1;
        }
        batch.commit();
        count
    }
}

/// A snapshot `[read_pos, write_pos)` of published records.
///
/// Committing (or dropping) frees the records returned by
/// [`next`](Self::next) so far.
pub struct ByteBatch<'r> {
    ring: &'r ByteRing,
    outstanding: &'r Cell<bool>,
    start: u64,
    cursor: u64,
    end: u64,
    messages: u64,
    done: bool,
}

impl ByteBatch<'_> {
    /// Bytes covered by the snapshot, headers and padding included.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.end.wrapping_sub(self.start) as usize
    }

    /// Next message, oldest first.
    ///
    /// # Panics
    ///
    /// If a record header is larger than the maximum message size or the
    /// record would cross the end of the arena or the write position.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&[u8]> {
        let ring = self.ring;
        self.cursor = ring.skip_padding(self.cursor, self.end);
        if self.cursor == self.end {
            return None;
        }

        let len = ring.read_header(self.cursor) as usize;
        let offset = ring.offset(self.cursor);
        if len > ring.max_message_size {
            corrupted!(
                "byte ring record at {} claims {} bytes (max {})",
                self.cursor,
                len,
                ring.max_message_size
            );
        }
        // len <= max_message_size, so this cannot overflow
        let record = record_len(len).unwrap_or(usize::MAX);
        if record > ring.size - offset || record as u64 > self.end.wrapping_sub(self.cursor) {
            corrupted!(
                "byte ring record at {} of {} bytes overruns the arena or write position",
                self.cursor,
                record
            );
        }

        self.cursor = self.cursor.wrapping_add(record as u64);
        self.messages += 1;
        // SAFETY: the record is within the arena and inside the snapshot
        // published by the writer; it is not reused until read_pos passes it.
        Some(unsafe {
            std::slice::from_raw_parts(ring.storage.as_ptr().add(offset + HEADER), len)
        })
    }

    /// Advances the read position past the messages consumed so far.
    pub fn commit(mut self) {
        self.done = true;
        self.ring.release(self.start, self.cursor, self.messages);
    }
}

impl Drop for ByteBatch<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            self.ring.release(self.start, self.cursor, self.messages);
        }
        self.outstanding.set(false);
    }
}
