/// Configuration shared by every queue family.
///
/// The meaning of the two size fields depends on the queue:
///
/// | Queue          | `capacity`             | `element_size`          |
/// |----------------|------------------------|-------------------------|
/// | `Queue`        | number of slots        | payload bytes per slot  |
/// | `ShardedQueue` | total slots (all shards) | payload bytes per slot |
/// | `SpscRing`     | minimum element count  | bytes per element       |
/// | `ByteRing`     | arena bytes            | maximum message bytes   |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Requested capacity (slots, elements or bytes)
    pub capacity: usize,
    /// Payload size per slot, or the maximum message size for `ByteRing`
    pub element_size: usize,
    /// Shard count for `ShardedQueue` (0 = one shard per logical CPU)
    pub shards: usize,
    /// Enable metrics collection (slight overhead)
    pub enable_metrics: bool,
}

impl Config {
    /// Creates a configuration with auto-detected shards and metrics disabled.
    pub const fn new(capacity: usize, element_size: usize) -> Self {
        Self {
            capacity,
            element_size,
            shards: 0,
            enable_metrics: false,
        }
    }

    /// Sets an explicit shard count.
    pub const fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Enables or disables metrics.
    pub const fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(4096, 64)
    }
}

/// Many small fixed-size records (64K slots of 64 bytes).
pub const SMALL_MESSAGE_CONFIG: Config = Config::new(1 << 16, 64);

/// Fewer, larger records (4K slots of 4 KiB).
pub const LARGE_MESSAGE_CONFIG: Config = Config::new(1 << 12, 4096);
