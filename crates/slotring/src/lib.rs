//! slotring - Lock-Free Queues over Preallocated Byte Arenas
//!
//! Three queue families share one prepare/commit protocol: a writer reserves
//! space, fills it in place, and commits; a reader takes a batch, walks it,
//! and commits it back. Nothing allocates after construction.
//!
//! - [`Queue`]: multi-producer multi-consumer queue of fixed-size slots. Free
//!   slots sit on a versioned Treiber stack; committed slots on a ready list
//!   that readers take whole, so one CAS frees an entire batch.
//! - [`ShardedQueue`]: one [`Queue`] per CPU, writers pinned round-robin,
//!   readers rotating across shards.
//! - [`SpscRing`]: single-producer single-consumer ring of fixed-size elements.
//! - [`ByteRing`]: single-producer single-consumer ring of variable-length
//!   messages, each framed with a size header and padded to a cache line.
//!
//! Full and empty are reported as `None`. Misuse of the protocol (committing a
//! handle to the wrong queue, committing out of order) and corrupted shared
//! state panic after logging through `tracing`.
//!
//! # Example
//!
//! ```
//! use slotring_rs::{Queue, SpscRing};
//!
//! let queue = Queue::new(4, 8).unwrap();
//! for i in 1u64..=4 {
//!     let mut slot = queue.writer_prepare().unwrap();
//!     slot.as_mut_slice().copy_from_slice(&i.to_le_bytes());
//!     queue.writer_commit(slot);
//! }
//! assert!(queue.writer_prepare().is_none());
//!
//! let mut batch = queue.reader_prepare().unwrap();
//! assert_eq!(batch.len(), 4);
//! while let Some(payload) = batch.next() {
//!     println!("{}", u64::from_le_bytes(payload.try_into().unwrap()));
//! }
//! queue.reader_commit(batch);
//! assert_eq!(queue.available(), 4);
//!
//! // Single producer/consumer: split hands out exactly one of each
//! let mut ring = SpscRing::new(16, 4).unwrap();
//! let (writer, reader) = ring.split();
//! writer.push(b"ping").unwrap();
//! assert_eq!(reader.consume_batch(|item| assert_eq!(item, b"ping")), 1);
//! ```

mod arena;
mod backoff;
mod block;
mod byte_ring;
mod config;
mod error;
mod invariants;
mod metrics;
mod mpmc;
mod sharded;
mod spsc;

pub use backoff::Backoff;
pub use byte_ring::{ByteBatch, ByteReader, ByteRing, ByteWriteSlot, ByteWriter};
pub use config::{Config, LARGE_MESSAGE_CONFIG, SMALL_MESSAGE_CONFIG};
pub use error::QueueError;
pub use metrics::MetricsSnapshot;
pub use mpmc::{Queue, ReadBatch, WriteSlot};
pub use sharded::{ShardReader, ShardWriter, ShardedQueue};
pub use spsc::{SpscBatch, SpscReader, SpscRing, SpscWriteSlot, SpscWriter};
