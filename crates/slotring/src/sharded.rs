use crate::invariants::protocol_violation;
use crate::{Config, MetricsSnapshot, Queue, QueueError, ReadBatch, WriteSlot};
use crossbeam_utils::CachePadded;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Smallest per-shard capacity.
const MIN_SHARD_CAPACITY: usize = 2;

/// A set of independent [`Queue`] shards.
///
/// Each writer handle is pinned to one shard, assigned round-robin, so
/// producers on different cores mostly touch different cache lines. Reader
/// handles rotate over the shards. Order is FIFO within a batch only; there
/// is no global order across shards.
pub struct ShardedQueue {
    write_seq: CachePadded<AtomicUsize>,
    shards: Box<[Queue]>,
}

impl ShardedQueue {
    /// Creates one shard per logical CPU sharing `capacity` slots between them.
    pub fn new(capacity: usize, element_size: usize) -> Result<Self, QueueError> {
        Self::with_config(Config::new(capacity, element_size))
    }

    /// Creates shards per `config`; `config.shards == 0` detects the CPU count.
    ///
    /// Each shard gets `max(ceil(capacity / shards), 2)` slots. If any shard
    /// fails to allocate, the ones already created are freed and the error is
    /// returned.
    pub fn with_config(config: Config) -> Result<Self, QueueError> {
        if config.capacity == 0 || config.element_size == 0 {
            return Err(QueueError::InvalidArgument {
                reason: "capacity and element size must be > 0",
            });
        }

        let count = if config.shards == 0 {
            cpu_count()
        } else {
            config.shards
        };
        let per_shard = config.capacity.div_ceil(count).max(MIN_SHARD_CAPACITY);
        let shard_config = Config {
            capacity: per_shard,
            ..config
        };

        let shards = build_shards(count, |_| Queue::with_config(shard_config))?;

        tracing::debug!(shards = count, per_shard, "sharded queue created");
        Ok(Self {
            write_seq: CachePadded::new(AtomicUsize::new(0)),
            shards,
        })
    }

    /// Number of shards.
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get a specific shard for dedicated access.
    pub fn shard(&self, index: usize) -> Option<&Queue> {
        self.shards.get(index)
    }

    /// Total slots across all shards (at least the requested capacity).
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(Queue::capacity).sum()
    }

    /// Free slots across all shards. Advisory.
    pub fn available(&self) -> usize {
        self.shards.iter().map(Queue::available).sum()
    }

    /// True if no shard has a committed slot.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(Queue::is_empty)
    }

    /// Aggregated metrics of all shards.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut total = MetricsSnapshot::default();
        for shard in self.shards.iter() {
            total += shard.metrics();
        }
        total
    }

    /// Creates a writer pinned to the next shard in round-robin order.
    pub fn writer(&self) -> ShardWriter<'_> {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let index = seq % self.shards.len();
        ShardWriter {
            shard: &self.shards[index],
            index,
        }
    }

    /// Creates a reader whose scan starts at shard 0.
    pub fn reader(&self) -> ShardReader<'_> {
        ShardReader {
            queue: self,
            cursor: 0,
        }
    }
}

impl std::fmt::Debug for ShardedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedQueue")
            .field("shards", &self.shards.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Builds `count` shards in order, stopping at the first failure.
///
/// Shards built before the failing one are dropped, freeing their arenas.
fn build_shards<T, F>(count: usize, make: F) -> Result<Box<[T]>, QueueError>
where
    F: FnMut(usize) -> Result<T, QueueError>,
{
    (0..count)
        .map(make)
        .collect::<Result<Vec<_>, _>>()
        .map(Vec::into_boxed_slice)
}

fn cpu_count() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Producer handle bound to one shard for its whole lifetime.
#[derive(Debug)]
pub struct ShardWriter<'a> {
    shard: &'a Queue,
    index: usize,
}

impl<'a> ShardWriter<'a> {
    /// Index of the shard this writer feeds.
    #[inline]
    pub fn shard_index(&self) -> usize {
        self.index
    }

    /// Claims a slot in this writer's shard. `None` if that shard is full.
    #[inline]
    pub fn writer_prepare(&self) -> Option<WriteSlot<'a>> {
        self.shard.writer_prepare()
    }

    /// Claim with adaptive backoff. Spins, yields, then gives up.
    #[inline]
    pub fn writer_prepare_with_backoff(&self) -> Option<WriteSlot<'a>> {
        self.shard.writer_prepare_with_backoff()
    }

    /// Publishes a slot obtained from this writer.
    #[inline]
    pub fn writer_commit(&self, slot: WriteSlot<'_>) {
        self.shard.writer_commit(slot);
    }

    /// Copies `payload` into this writer's shard.
    #[inline]
    pub fn push(&self, payload: &[u8]) -> Result<(), QueueError> {
        self.shard.push(payload)
    }
}

/// Consumer handle rotating over the shards.
#[derive(Debug)]
pub struct ShardReader<'a> {
    queue: &'a ShardedQueue,
    cursor: usize,
}

impl<'a> ShardReader<'a> {
    /// Shard the next scan starts at.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Takes a batch from the first non-empty shard at or after the cursor.
    ///
    /// On success the cursor moves past that shard, so consecutive calls
    /// rotate fairly. If every shard is empty returns `None` and leaves the
    /// cursor where it was.
    pub fn reader_prepare(&mut self) -> Option<ReadBatch<'a>> {
        let shards = &self.queue.shards;
        let count = shards.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            if let Some(batch) = shards[index].reader_prepare() {
                self.cursor = (index + 1) % count;
                return Some(batch);
            }
        }
        None
    }

    /// Returns a batch to the free list of the shard it came from.
    ///
    /// # Panics
    ///
    /// If the batch does not belong to this sharded queue.
    pub fn reader_commit(&mut self, batch: ReadBatch<'_>) {
        let owned = self
            .queue
            .shards
            .iter()
            .any(|shard| batch.belongs_to(shard));
        if !owned {
            protocol_violation!("batch committed to a sharded queue it was not read from");
        }
        batch.commit();
    }

    /// Process one batch from the next non-empty shard.
    pub fn consume_batch<F>(&mut self, mut handler: F) -> usize
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
}
