//! Multi-threaded end-to-end tests.
//!
//! Set `RUST_LOG=slotring_rs=trace` to see construction and wrap-padding
//! events while these run.

use slotring_rs::{ByteRing, Config, Queue, QueueError, ShardedQueue, SpscRing};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use tracing_subscriber::EnvFilter;

const POISON: u64 = u64::MAX;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn encode(producer: u64, seq: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&producer.to_le_bytes());
    buf[8..].copy_from_slice(&seq.to_le_bytes());
    buf
}

fn decode(payload: &[u8]) -> (u64, u64) {
    let producer = u64::from_le_bytes(payload[..8].try_into().unwrap());
    let seq = u64::from_le_bytes(payload[8..16].try_into().unwrap());
    (producer, seq)
}

/// Pushes until accepted, yielding while the queue is full.
fn push_blocking(mut push: impl FnMut() -> Result<(), QueueError>) {
    loop {
        match push() {
            Ok(()) => return,
            Err(QueueError::Full) => thread::yield_now(),
            Err(e) => panic!("unexpected push error: {e}"),
        }
    }
}

#[test]
fn test_sharded_producers_single_consumer_sees_everything() {
    init_tracing();
    const PRODUCERS: u64 = 4;
    const ITEMS: u64 = 5_000;

    let queue = ShardedQueue::with_config(Config::new(64, 16).with_shards(2)).unwrap();

    thread::scope(|s| {
        for p in 0..PRODUCERS {
            let writer = queue.writer();
            s.spawn(move || {
                for seq in 0..ITEMS {
                    push_blocking(|| writer.push(&encode(p, seq)));
                }
                push_blocking(|| writer.push(&encode(p, POISON)));
            });
        }

        let mut reader = queue.reader();
        let mut next_seq = vec![0u64; PRODUCERS as usize];
        let mut poisoned = 0;
        while poisoned < PRODUCERS {
            let n = reader.consume_batch(|payload| {
                let (p, seq) = decode(payload);
                if seq == POISON {
                    assert_eq!(next_seq[p as usize], ITEMS, "poison before all items");
                    poisoned += 1;
                } else {
                    // one writer feeds one shard, and there is one reader
                    assert_eq!(seq, next_seq[p as usize], "producer {p} out of order");
                    next_seq[p as usize] += 1;
                }
            });
            if n == 0 {
                thread::yield_now();
            }
        }
        assert!(next_seq.iter().all(|&n| n == ITEMS));
    });

    assert!(queue.is_empty());
    assert_eq!(queue.available(), queue.capacity());
}

#[test]
fn test_queue_many_producers_many_consumers() {
    init_tracing();
    const PRODUCERS: u64 = 3;
    const CONSUMERS: usize = 3;
    const ITEMS: u64 = 3_000;
    let total = (PRODUCERS * ITEMS) as usize;

    let queue = Queue::with_config(Config::new(32, 16).with_metrics(true)).unwrap();
    let consumed = AtomicUsize::new(0);
    let seen = Mutex::new(Vec::with_capacity(total));

    thread::scope(|s| {
        for p in 0..PRODUCERS {
            let queue = &queue;
            s.spawn(move || {
                for seq in 0..ITEMS {
                    loop {
                        if let Some(mut slot) = queue.writer_prepare_with_backoff() {
                            slot.as_mut_slice().copy_from_slice(&encode(p, seq));
                            queue.writer_commit(slot);
                            break;
                        }
                    }
                }
            });
        }

        for _ in 0..CONSUMERS {
            let (queue, consumed, seen) = (&queue, &consumed, &seen);
            s.spawn(move || {
                let mut local = Vec::new();
                while consumed.load(Ordering::Relaxed) < total {
                    let n = queue.consume_batch(|payload| local.push(decode(payload)));
                    if n == 0 {
                        thread::yield_now();
                    } else {
                        consumed.fetch_add(n, Ordering::Relaxed);
                    }
                }
                seen.lock().unwrap().extend(local);
            });
        }
    });

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.len(), total);
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), total, "duplicate deliveries");
    for p in 0..PRODUCERS {
        for seq in 0..ITEMS {
            assert!(unique.contains(&(p, seq)));
        }
    }

    assert_eq!(queue.available(), queue.capacity());
    let metrics = queue.metrics();
    assert_eq!(metrics.messages_written, total as u64);
}

#[test]
fn test_spsc_fifo_across_threads() {
    init_tracing();
    const ITEMS: u64 = 20_000;
    let mut ring = SpscRing::new(100, 8).unwrap();
    assert_eq!(ring.capacity(), 127);
    let (writer, reader) = ring.split();

    thread::scope(|s| {
        s.spawn(move || {
            for i in 0..ITEMS {
                loop {
                    if let Some(mut slot) = writer.writer_prepare_with_backoff() {
                        slot.as_mut_slice().copy_from_slice(&i.to_le_bytes());
                        writer.writer_commit(slot);
                        break;
                    }
                }
            }
        });

        s.spawn(move || {
            let mut expected = 0u64;
            while expected < ITEMS {
                let Some(mut batch) = reader.reader_prepare() else {
                    thread::yield_now();
                    continue;
                };
                while let Some(item) = batch.next() {
                    assert_eq!(u64::from_le_bytes(item.try_into().unwrap()), expected);
                    expected += 1;
                }
                reader.reader_commit(batch);
            }
        });
    });

    assert!(ring.is_empty());
}

#[test]
fn test_byte_ring_variable_messages_across_threads() {
    init_tracing();
    const MESSAGES: usize = 5_000;
    let mut ring = ByteRing::new(1024, 200).unwrap();
    let (writer, reader) = ring.split();

    // lengths cycle through values that force wrap padding at different offsets
    let message = |i: usize| -> Vec<u8> {
        let len = 1 + (i * 37) % 200;
        vec![(i % 251) as u8; len]
    };

    thread::scope(|s| {
        s.spawn(move || {
            for i in 0..MESSAGES {
                push_blocking(|| writer.push(&message(i)));
            }
        });

        s.spawn(move || {
            let mut next = 0;
            while next < MESSAGES {
                let n = reader.consume_batch(|m| {
                    assert_eq!(m, message(next).as_slice(), "message {next}");
                    next += 1;
                });
                if n == 0 {
                    thread::yield_now();
                }
            }
        });
    });

    assert!(ring.is_empty());
}

#[test]
fn test_status_readable_while_handles_are_live() {
    init_tracing();
    const ITEMS: u64 = 10_000;
    let mut ring = SpscRing::with_config(Config::new(16, 8).with_metrics(true)).unwrap();
    let capacity = ring.capacity();
    let (writer, reader) = ring.split();

    writer.push(&1u64.to_le_bytes()).unwrap();
    writer.push(&2u64.to_le_bytes()).unwrap();
    assert_eq!(writer.ring().len(), 2);
    assert_eq!(reader.ring().available_space(), capacity - 2);
    assert_eq!(reader.consume_batch(|_| {}), 2);
    assert!(writer.ring().is_empty());

    thread::scope(|s| {
        s.spawn(move || {
            for i in 0..ITEMS {
                while writer.push(&i.to_le_bytes()).is_err() {
                    assert!(writer.ring().len() <= capacity);
                    thread::yield_now();
                }
                let len = writer.ring().len();
                assert!(len <= capacity, "len {len} above capacity {capacity}");
            }
        });
        s.spawn(move || {
            let mut received = 0;
            while received < ITEMS {
                let free = reader.ring().available_space();
                assert!(free <= capacity);
                received += reader.consume_batch(|_| {}) as u64;
            }
            assert_eq!(reader.ring().metrics().messages_written, ITEMS + 2);
        });
    });
    assert!(ring.is_empty());
}

#[test]
fn test_byte_ring_space_readable_while_draining() {
    init_tracing();
    const MESSAGES: usize = 5_000;
    let mut ring = ByteRing::new(1024, 100).unwrap();
    let size = ring.capacity();
    let (writer, reader) = ring.split();

    writer.push(&[7; 100]).unwrap();
    assert_eq!(writer.ring().used_space(), 128);
    assert_eq!(reader.ring().available_space(), size - 128);
    reader.consume_batch(|_| {});

    thread::scope(|s| {
        s.spawn(move || {
            for i in 0..MESSAGES {
                let message = vec![i as u8; 1 + i % 100];
                while writer.push(&message).is_err() {
                    thread::yield_now();
                }
                let used = writer.ring().used_space();
                assert!(used <= size, "used {used} above size {size}");
            }
        });
        s.spawn(move || {
            let mut received = 0;
            while received < MESSAGES {
                assert!(reader.ring().available_space() <= size);
                received += reader.consume_batch(|m| assert!(!m.is_empty()));
            }
        });
    });
    assert!(ring.is_empty());
}
