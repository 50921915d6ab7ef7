use slotring_rs::{ByteRing, Config, ShardedQueue};
use std::thread;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const PRODUCERS: u64 = 4;
const ITEMS: u64 = 250_000;
const POISON: u64 = u64::MAX;

/// Producers feed a sharded queue of fixed 16-byte records; one stage
/// aggregates them and forwards variable-length summaries over a byte ring.
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("slotring sharded pipeline");
    println!("=========================\n");

    let config = Config::new(8192, 16).with_metrics(true);
    let queue = match ShardedQueue::with_config(config) {
        Ok(queue) => queue,
        Err(e) => {
            eprintln!("failed to create queue: {e}");
            return;
        }
    };
    let mut summaries = match ByteRing::new(1 << 14, 128) {
        Ok(ring) => ring,
        Err(e) => {
            eprintln!("failed to create byte ring: {e}");
            return;
        }
    };

    println!("Configuration:");
    println!("  Shards: {}", queue.shard_count());
    println!("  Total capacity: {} slots", queue.capacity());
    println!("  Producers: {PRODUCERS}");
    println!("  Items per producer: {ITEMS}\n");

    let start = Instant::now();
    let (summary_tx, summary_rx) = summaries.split();
    let queue = &queue;

    thread::scope(|s| {
        for id in 0..PRODUCERS {
            let writer = queue.writer();
            s.spawn(move || {
                for value in (0..ITEMS).chain([POISON]) {
                    loop {
                        if let Some(mut slot) = writer.writer_prepare_with_backoff() {
                            let buf = slot.as_mut_slice();
                            buf[..8].copy_from_slice(&id.to_le_bytes());
                            buf[8..].copy_from_slice(&value.to_le_bytes());
                            slot.commit();
                            break;
                        }
                    }
                }
            });
        }

        // aggregator: one summary line per drained batch
        s.spawn(move || {
            let mut reader = queue.reader();
            let mut finished = 0;
            let mut total = 0u64;
            while finished < PRODUCERS {
                let Some(mut batch) = reader.reader_prepare() else {
                    thread::yield_now();
                    continue;
                };
                let mut sum = 0u64;
                while let Some(record) = batch.next() {
                    let value = u64::from_le_bytes(record[8..16].try_into().unwrap_or_default());
                    if value == POISON {
                        finished += 1;
                    } else {
                        sum = sum.wrapping_add(value);
                        total += 1;
                    }
                }
                let line = format!("batch={} sum={sum} total={total}", batch.len());
                reader.reader_commit(batch);

                while summary_tx.push(line.as_bytes()).is_err() {
                    thread::yield_now();
                }
            }
            while summary_tx.push(b"done").is_err() {
                thread::yield_now();
            }
        });

        // sink
        s.spawn(move || {
            let mut batches = 0u64;
            let mut last = String::new();
            let mut done = false;
            while !done {
                summary_rx.consume_batch(|line| {
                    if line == b"done" {
                        done = true;
                    } else {
                        batches += 1;
                        last = String::from_utf8_lossy(line).into_owned();
                    }
                });
                thread::yield_now();
            }
            println!("Summaries received: {batches}");
            println!("Last summary: {last}");
        });
    });

    let elapsed = start.elapsed();
    let metrics = queue.metrics();
    println!("\nElapsed: {elapsed:?}");
    println!(
        "Throughput: {:.2} M records/s",
        (PRODUCERS * ITEMS) as f64 / elapsed.as_secs_f64() / 1e6
    );
    println!("Metrics: {metrics:?}");
}
