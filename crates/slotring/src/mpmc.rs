use crate::arena::{FreeHead, SlotArena, TAIL, UNUSED};
use crate::invariants::{corrupted, debug_assert_batch_len, protocol_violation};
use crate::metrics::Metrics;
use crate::{Backoff, Config, MetricsSnapshot, QueueError};
use crossbeam_utils::CachePadded;
use std::ptr;
use std::sync::atomic::{self, AtomicU32, AtomicU64, Ordering};

// =============================================================================
// PROTOCOL
// =============================================================================
//
// Every slot cycles FREE -> CLAIMED -> READY -> FREE.
//
// ## Free list (Treiber stack with versioned head)
//
// `free` packs {head index, version}. Writers pop one slot per CAS; readers
// push a whole consumed batch back with one CAS. The version is bumped on
// every successful update, which is what defeats ABA on the pop path: the
// popped slot's `next` is read *before* the CAS, and without the version a
// pop/pop/push sequence elsewhere could leave the same head index with a
// different successor.
//
// ## Ready list (LIFO push, steal-all pop)
//
// Writers push committed slots onto `ready` (plain 32-bit index). Readers
// never pop a single node; they exchange the whole chain for TAIL. The value a
// writer links below its slot is always the head it CASes against, and a
// reader's exchange does not depend on the old value's successors, so the
// ready head needs no version.
//
// The stolen chain is private to the reader, which reverses it in place to
// get commit order (FIFO within the batch).
//
// ## Memory ordering
//
// - Slot links are AtomicU32 accessed Relaxed; they are published by the
//   Release half of the CAS/exchange that links or unlinks them.
// - writer_commit: payload + link writes, then CAS `ready` (Release).
// - reader_prepare: exchange `ready` (Acquire) before walking links/payloads.
// - reader_commit / abandon: relink, then CAS `free` (AcqRel); writer_prepare
//   loads `free` with Acquire before reading the popped slot's link.
//
// =============================================================================

/// Multi-producer multi-consumer queue of fixed-size byte slots.
///
/// Writers claim a slot with [`writer_prepare`](Self::writer_prepare), fill it
/// and commit it. Readers take every committed slot at once with
/// [`reader_prepare`](Self::reader_prepare), iterate the batch in commit order
/// and commit it, which returns all its slots to the free list in one CAS.
pub struct Queue {
    /// Packed {index, version} head of the free list
    free: CachePadded<AtomicU64>,
    /// Index of the most recently committed slot
    ready: CachePadded<AtomicU32>,
    arena: SlotArena,
    metrics: Metrics,
    config: Config,
}

impl Queue {
    /// Creates a queue of `capacity` slots holding `element_size` bytes each.
    pub fn new(capacity: usize, element_size: usize) -> Result<Self, QueueError> {
        Self::with_config(Config::new(capacity, element_size))
    }

    /// Creates a queue from a full configuration.
    pub fn with_config(config: Config) -> Result<Self, QueueError> {
        let arena = SlotArena::new(config.capacity, config.element_size)?;

        let queue = Self {
            free: CachePadded::new(AtomicU64::new(FreeHead::INITIAL.pack())),
            ready: CachePadded::new(AtomicU32::new(TAIL)),
            arena,
            metrics: Metrics::new(),
            config,
        };
        atomic::fence(Ordering::SeqCst);

        tracing::debug!(
            capacity = config.capacity,
            element_size = config.element_size,
            stride = queue.arena.stride(),
            "mpmc queue created"
        );
        Ok(queue)
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.arena.capacity() as usize
    }

    /// Payload bytes per slot.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.arena.payload_size()
    }

    /// True if no committed slot is waiting for a reader.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ready.load(Ordering::Acquire) == TAIL
    }

    /// True if the free list is exhausted.
    #[inline]
    pub fn is_full(&self) -> bool {
        FreeHead::unpack(self.free.load(Ordering::Acquire)).index == TAIL
    }

    /// Number of free slots.
    ///
    /// Walks the free list, so it is O(free slots). Exact when the queue is
    /// quiescent, advisory under concurrent use.
    pub fn available(&self) -> usize {
        let mut index = FreeHead::unpack(self.free.load(Ordering::Acquire)).index;
        let mut count = 0;
        while index != TAIL && self.arena.contains(index) && count < self.capacity() {
            count += 1;
            index = self.arena.link(index).load(Ordering::Relaxed);
        }
        count
    }

    /// Slots not on the free list (claimed, ready or being read). Advisory.
    #[inline]
    pub fn used(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Get a snapshot of metrics if enabled.
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.config.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Claims a free slot. Returns `None` if the queue is full.
    ///
    /// Retries the free-list CAS (with a spin hint) until it wins or the list
    /// is empty.
    pub fn writer_prepare(&self) -> Option<WriteSlot<'_>> {
        let mut backoff = Backoff::new();
        let mut word = self.free.load(Ordering::Acquire);

        loop {
            let head = FreeHead::unpack(word);
            if head.index == TAIL {
                self.record(|m| m.add_full_rejections(1));
                return None;
            }

            // May be stale if another writer pops this slot first; the
            // version makes the CAS below fail in that case.
            let next = self.arena.link(head.index).load(Ordering::Relaxed);
            let new_word = head.successor(next).pack();

            match self.free.compare_exchange_weak(
                word,
                new_word,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.arena.link(head.index).store(UNUSED, Ordering::Release);
                    self.record(|m| m.add_cas_retries(backoff.attempts()));
                    return Some(WriteSlot {
                        queue: self,
                        index: head.index,
                        done: false,
                    });
                }
                Err(current) => {
                    word = current;
                    backoff.spin();
                }
            }
        }
    }

    /// [`writer_prepare`](Self::writer_prepare) with adaptive backoff:
    /// spins, yields, then gives up.
    pub fn writer_prepare_with_backoff(&self) -> Option<WriteSlot<'_>> {
        let mut backoff = Backoff::new();
        while !backoff.is_completed() {
            if let Some(slot) = self.writer_prepare() {
                return Some(slot);
            }
            backoff.snooze();
        }
        None
    }

    /// Publishes a filled slot to readers.
    ///
    /// # Panics
    ///
    /// If `slot` was prepared on a different queue.
    pub fn writer_commit(&self, slot: WriteSlot<'_>) {
        if !ptr::eq(slot.queue, self) {
            protocol_violation!("slot {} committed to a queue it does not belong to", slot.index);
        }
        slot.commit();
    }

    /// Copies `payload` into a fresh slot and commits it.
    ///
    /// Bytes past `payload.len()` are zeroed. Fails with `MessageSize` if the
    /// payload is larger than a slot and with `Full` if no slot is free.
    pub fn push(&self, payload: &[u8]) -> Result<(), QueueError> {
        if payload.len() > self.element_size() {
            return Err(QueueError::MessageSize {
                size: payload.len(),
                max: self.element_size(),
            });
        }
        let mut slot = self.writer_prepare().ok_or(QueueError::Full)?;
        let dst = slot.as_mut_slice();
        dst[..payload.len()].copy_from_slice(payload);
        dst[payload.len()..].fill(0);
        slot.commit();
        Ok(())
    }

    /// Lock-free stack push of a claimed slot onto the ready list.
    fn publish(&self, index: u32) {
        let link = self.arena.link(index);
        let state = link.load(Ordering::Relaxed);
        if state != UNUSED {
            protocol_violation!("slot {} committed in state {:#x}, expected UNUSED", index, state);
        }

        let mut backoff = Backoff::new();
        let mut head = self.ready.load(Ordering::Relaxed);
        loop {
            link.store(head, Ordering::Relaxed);
            match self
                .ready
                .compare_exchange_weak(head, index, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }

        self.record(|m| {
            m.add_messages_written(1);
            m.add_cas_retries(backoff.attempts());
        });
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Takes every committed slot as one batch, in commit order.
    ///
    /// Returns `None` if nothing is ready. Writers keep pushing onto the
    /// (now empty) ready list while the batch is processed.
    ///
    /// # Panics
    ///
    /// If the ready chain holds an out-of-bounds link or a cycle.
    pub fn reader_prepare(&self) -> Option<ReadBatch<'_>> {
        if self.ready.load(Ordering::Relaxed) == TAIL {
            return None;
        }
        let newest = self.ready.swap(TAIL, Ordering::Acquire);
        if newest == TAIL {
            // another reader took it between the load and the swap
            return None;
        }

        // Reverse newest -> ... -> oldest into oldest -> ... -> newest.
        let capacity = self.arena.capacity() as usize;
        let mut prev = TAIL;
        let mut index = newest;
        let mut len = 0usize;
        while index != TAIL {
            let link = self.arena.link(index);
            let next = link.load(Ordering::Relaxed);
            link.store(prev, Ordering::Relaxed);
            prev = index;
            index = next;
            len += 1;
            if len > capacity {
                corrupted!("ready chain longer than capacity {}", capacity);
            }
        }

        self.record(|m| m.add_batches_read(1));
        Some(ReadBatch {
            queue: self,
            head: prev,
            tail: newest,
            cursor: prev,
            len,
            done: false,
        })
    }

    /// Returns a consumed batch to the free list.
    ///
    /// # Panics
    ///
    /// If `batch` was taken from a different queue.
    pub fn reader_commit(&self, batch: ReadBatch<'_>) {
        if !batch.belongs_to(self) {
            protocol_violation!("batch committed to a queue it was not read from");
        }
        batch.commit();
    }

    /// Process one batch with a single free-list update.
    ///
    /// Returns the number of payloads handed to `handler` (0 if empty).
    pub fn consume_batch<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(&[u8]),
    {
        let Some(mut batch) = self.reader_prepare() else {
            return 0;
        };
        while let Some(payload) = batch.next() {
            handler(payload);
        }
        let n = batch.len();
        batch.commit();
        n
    }

    /// Splices the chain `first ..= last` (already linked) onto the free list.
    fn release_chain(&self, first: u32, last: u32) {
        let last_link = self.arena.link(last);
        let mut backoff = Backoff::new();
        let mut word = self.free.load(Ordering::Acquire);

        loop {
            let head = FreeHead::unpack(word);
            last_link.store(head.index, Ordering::Relaxed);
            match self.free.compare_exchange_weak(
                word,
                head.successor(first).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => {
                    word = current;
                    backoff.spin();
                }
            }
        }

        self.record(|m| m.add_cas_retries(backoff.attempts()));
    }

    #[inline]
    fn record(&self, f: impl FnOnce(&Metrics)) {
        if self.config.enable_metrics {
            f(&self.metrics);
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = FreeHead::unpack(self.free.load(Ordering::Relaxed));
        f.debug_struct("Queue")
            .field("capacity", &self.capacity())
            .field("element_size", &self.element_size())
            .field("free_head", &head)
            .field("ready_head", &self.ready.load(Ordering::Relaxed))
            .finish()
    }
}

/// A claimed slot, writable until committed.
///
/// Dropping it without committing returns the slot to the free list.
pub struct WriteSlot<'a> {
    queue: &'a Queue,
    index: u32,
    done: bool,
}

impl WriteSlot<'_> {
    /// Slot index inside the queue's arena.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The slot's payload bytes (may hold data from an earlier message).
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the slot was popped from the free list by this handle and is
        // not reachable from either list until commit or drop.
        unsafe { self.queue.arena.payload_mut(self.index) }
    }

    /// Publishes the slot to readers.
    pub fn commit(mut self) {
        self.done = true;
        self.queue.publish(self.index);
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.queue.release_chain(self.index, self.index);
        }
    }
}

/// A batch of committed slots taken by one reader, iterated oldest first.
///
/// Dropping the batch without committing releases it like
/// [`commit`](Self::commit); unread payloads are discarded.
pub struct ReadBatch<'a> {
    queue: &'a Queue,
    head: u32,
    tail: u32,
    cursor: u32,
    len: usize,
    done: bool,
}

impl ReadBatch<'_> {
    /// Number of payloads in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: an empty `reader_prepare` returns `None`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn belongs_to(&self, queue: &Queue) -> bool {
        ptr::eq(self.queue, queue)
    }

    /// Next payload in commit order, `None` once the batch is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&[u8]> {
        let index = self.cursor;
        if index == TAIL {
            return None;
        }
        let next = self.queue.arena.link(index).load(Ordering::Relaxed);
        if next == TAIL && index != self.tail {
            corrupted!("batch ended at slot {}, expected tail {}", index, self.tail);
        }
        self.cursor = next;
        // SAFETY: the batch was unlinked from the ready list by this reader
        // and its slots stay off the free list until commit.
        Some(unsafe { self.queue.arena.payload(index) })
    }

    /// Returns every slot of the batch to the free list in one CAS.
    pub fn commit(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        #[cfg(debug_assertions)]
        {
            let mut walked = 0usize;
            let mut index = self.head;
            while index != TAIL {
                walked += 1;
                index = self.queue.arena.link(index).load(Ordering::Relaxed);
            }
            debug_assert_batch_len!(walked, self.len, self.queue.capacity());
        }

        self.queue.release_chain(self.head, self.tail);
        self.queue.record(|m| m.add_messages_read(self.len as u64));
    }
}

impl Drop for ReadBatch<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
