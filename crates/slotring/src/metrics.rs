use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters kept by each queue when `enable_metrics` is set.
///
/// All counters use `Relaxed`; they are statistics, not synchronization.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    messages_written: AtomicU64,
    messages_read: AtomicU64,
    batches_read: AtomicU64,
    cas_retries: AtomicU64,
    full_rejections: AtomicU64,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_messages_written(&self, n: u64) {
        self.messages_written.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_messages_read(&self, n: u64) {
        self.messages_read.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_batches_read(&self, n: u64) {
        self.batches_read.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_cas_retries(&self, n: u64) {
        self.cas_retries.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_full_rejections(&self, n: u64) {
        self.full_rejections.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_written: self.messages_written.load(Ordering::Relaxed),
            messages_read: self.messages_read.load(Ordering::Relaxed),
            batches_read: self.batches_read.load(Ordering::Relaxed),
            cas_retries: self.cas_retries.load(Ordering::Relaxed),
            full_rejections: self.full_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a queue's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_written: u64,
    pub messages_read: u64,
    pub batches_read: u64,
    /// Failed compare-and-swap attempts (MPMC only)
    pub cas_retries: u64,
    /// `writer_prepare` calls that found the queue full
    pub full_rejections: u64,
}

impl std::ops::AddAssign for MetricsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        self.messages_written += rhs.messages_written;
        self.messages_read += rhs.messages_read;
        self.batches_read += rhs.batches_read;
        self.cas_retries += rhs.cas_retries;
        self.full_rejections += rhs.full_rejections;
    }
}
