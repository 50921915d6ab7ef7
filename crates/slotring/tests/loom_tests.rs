//! Loom-based concurrency tests for slotring-rs.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! Loom exhaustively explores all possible thread interleavings to find
//! concurrency bugs that might only occur under specific scheduling.
//! Each model below reproduces one of the crate's synchronization protocols
//! in isolation, with a tiny capacity to keep the state space manageable.

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::cell::UnsafeCell;

const TAIL: u32 = u32::MAX;
const UNUSED: u32 = u32::MAX - 1;

fn pack(index: u32, version: u32) -> u64 {
    ((index as u64) << 32) | version as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Free list + ready list over three slots, the same protocol as `Queue`.
struct LoomQueue {
    free: AtomicU64,
    ready: AtomicU32,
    links: [AtomicU32; 3],
    payloads: [UnsafeCell<u64>; 3],
}

unsafe impl Send for LoomQueue {}
unsafe impl Sync for LoomQueue {}

impl LoomQueue {
    fn new() -> Self {
        Self {
            free: AtomicU64::new(pack(0, 1)),
            ready: AtomicU32::new(TAIL),
            links: [AtomicU32::new(1), AtomicU32::new(2), AtomicU32::new(TAIL)],
            payloads: [UnsafeCell::new(0), UnsafeCell::new(0), UnsafeCell::new(0)],
        }
    }

    /// Pops a free slot (versioned CAS).
    fn claim(&self) -> Option<u32> {
        let mut word = self.free.load(Ordering::Acquire);
        loop {
            let (index, version) = unpack(word);
            if index == TAIL {
                return None;
            }
            let next = self.links[index as usize].load(Ordering::Relaxed);
            match self.free.compare_exchange(
                word,
                pack(next, version.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.links[index as usize].store(UNUSED, Ordering::Release);
                    return Some(index);
                }
                Err(current) => word = current,
            }
        }
    }

    /// Writes the payload and pushes the slot onto the ready list.
    fn commit(&self, index: u32, value: u64) {
        // SAFETY: the slot was claimed by this thread.
        unsafe { *self.payloads[index as usize].get() = value };
        let mut head = self.ready.load(Ordering::Relaxed);
        loop {
            self.links[index as usize].store(head, Ordering::Relaxed);
            match self
                .ready
                .compare_exchange(head, index, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Steals the ready chain, reads it oldest first and frees it in one CAS.
    fn drain(&self) -> Vec<u64> {
        let newest = self.ready.swap(TAIL, Ordering::Acquire);
        if newest == TAIL {
            return Vec::new();
        }

        let mut prev = TAIL;
        let mut index = newest;
        while index != TAIL {
            let next = self.links[index as usize].load(Ordering::Relaxed);
            self.links[index as usize].store(prev, Ordering::Relaxed);
            prev = index;
            index = next;
        }

        let oldest = prev;
        let mut out = Vec::new();
        let mut index = oldest;
        while index != TAIL {
            // SAFETY: the chain was unlinked from the ready list by this thread.
            out.push(unsafe { *self.payloads[index as usize].get() });
            index = self.links[index as usize].load(Ordering::Relaxed);
        }

        self.release(oldest, newest);
        out
    }

    fn release(&self, first: u32, last: u32) {
        let mut word = self.free.load(Ordering::Acquire);
        loop {
            let (index, version) = unpack(word);
            self.links[last as usize].store(index, Ordering::Relaxed);
            match self.free.compare_exchange(
                word,
                pack(first, version.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => word = current,
            }
        }
    }

    fn free_count(&self) -> usize {
        let (mut index, _) = unpack(self.free.load(Ordering::Acquire));
        let mut count = 0;
        while index != TAIL && count <= 3 {
            count += 1;
            index = self.links[index as usize].load(Ordering::Relaxed);
        }
        count
    }
}

/// Two writers racing on the free list never claim the same slot.
#[test]
fn loom_free_list_claims_are_exclusive() {
    loom::model(|| {
        let q = Arc::new(LoomQueue::new());
        let q1 = Arc::clone(&q);
        let q2 = Arc::clone(&q);

        let a = thread::spawn(move || q1.claim());
        let b = thread::spawn(move || q2.claim());
        let a = a.join().unwrap().unwrap();
        let b = b.join().unwrap().unwrap();

        assert_ne!(a, b);
        assert_eq!(q.free_count(), 1);
    });
}

/// A claim racing with a release: both outcomes leave the list consistent.
#[test]
fn loom_free_list_claim_vs_release() {
    loom::model(|| {
        let q = Arc::new(LoomQueue::new());
        let held = q.claim().unwrap();
        let q1 = Arc::clone(&q);
        let q2 = Arc::clone(&q);

        let releaser = thread::spawn(move || q1.release(held, held));
        let claimer = thread::spawn(move || q2.claim());
        releaser.join().unwrap();
        let claimed = claimer.join().unwrap();

        assert!(claimed.is_some());
        assert_eq!(q.free_count(), 2);
    });
}

/// Payload written before commit is visible to the reader that steals it.
#[test]
fn loom_ready_steal_publishes_payload() {
    loom::model(|| {
        let q = Arc::new(LoomQueue::new());
        let q1 = Arc::clone(&q);

        let writer = thread::spawn(move || {
            let slot = q1.claim().unwrap();
            q1.commit(slot, 42);
        });
        let first = q.drain();
        writer.join().unwrap();
        let rest = q.drain();

        let all: Vec<u64> = first.into_iter().chain(rest).collect();
        assert_eq!(all, vec![42]);
        assert_eq!(q.free_count(), 3);
    });
}

/// Two committers and a concurrent reader: every value is delivered once.
#[test]
fn loom_ready_list_concurrent_commits() {
    loom::model(|| {
        let q = Arc::new(LoomQueue::new());
        let writers: Vec<_> = [1u64, 2]
            .into_iter()
            .map(|v| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let slot = q.claim().unwrap();
                    q.commit(slot, v);
                })
            })
            .collect();

        let mut seen = q.drain();
        for w in writers {
            w.join().unwrap();
        }
        seen.extend(q.drain());
        seen.sort_unstable();

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(q.free_count(), 3);
    });
}

/// SPSC position counters, capacity 1 (two slots, one reserved).
struct LoomSpsc {
    write_pos: AtomicU64,
    read_pos: AtomicU64,
    slots: [UnsafeCell<u64>; 2],
}

unsafe impl Send for LoomSpsc {}
unsafe impl Sync for LoomSpsc {}

impl LoomSpsc {
    fn new() -> Self {
        Self {
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            slots: [UnsafeCell::new(0), UnsafeCell::new(0)],
        }
    }

    fn push(&self, value: u64) -> bool {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        if write - read >= 1 {
            return false;
        }
        // SAFETY: the slot at write_pos is outside [read_pos, write_pos).
        unsafe { *self.slots[(write & 1) as usize].get() = value };
        self.write_pos.store(write + 1, Ordering::Release);
        true
    }

    fn pop(&self) -> Option<u64> {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        // SAFETY: published by the producer's Release store.
        let value = unsafe { *self.slots[(read & 1) as usize].get() };
        self.read_pos.store(read + 1, Ordering::Release);
        Some(value)
    }
}

/// Values arrive in order and the producer never overwrites an unread slot.
#[test]
fn loom_spsc_fifo() {
    loom::model(|| {
        let ring = Arc::new(LoomSpsc::new());
        let producer_ring = Arc::clone(&ring);

        let producer = thread::spawn(move || {
            let mut sent = 0u64;
            for v in 1..=2u64 {
                for _ in 0..3 {
                    if producer_ring.push(v) {
                        sent = v;
                        break;
                    }
                    thread::yield_now();
                }
                if sent != v {
                    break;
                }
            }
            sent
        });

        let mut received = Vec::new();
        for _ in 0..3 {
            if let Some(v) = ring.pop() {
                received.push(v);
            }
            thread::yield_now();
        }
        let sent = producer.join().unwrap();
        while let Some(v) = ring.pop() {
            received.push(v);
        }

        let expected: Vec<u64> = (1..=sent).collect();
        assert_eq!(received, expected);
    });
}
