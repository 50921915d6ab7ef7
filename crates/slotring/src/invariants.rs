//! Invariant checks shared by the queue families.
//!
//! Two kinds live here:
//!
//! - `debug_assert_*` macros: internal bookkeeping invariants, compiled out in
//!   release builds.
//! - `protocol_violation!` / `corrupted!`: caller contract breaches and
//!   corrupted indices. These stay on in release builds, log through
//!   `tracing::error!` and panic, so a queue never keeps running on a bad index.

// =============================================================================
// Bounded occupancy
// =============================================================================

/// Assert that the occupied count does not exceed capacity.
///
/// **Invariant**: `0 ≤ (write_pos - read_pos) ≤ capacity`
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "bounded count violated: {} items exceed capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that the read position does not pass the write position.
macro_rules! debug_assert_read_not_past_write {
    ($new_read:expr, $write:expr) => {
        debug_assert!(
            $new_read <= $write,
            "read position {} advanced beyond write position {}",
            $new_read,
            $write
        )
    };
}

// =============================================================================
// Monotonic progress
// =============================================================================

/// Assert that a position counter only increases.
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

// =============================================================================
// Batch accounting
// =============================================================================

/// Assert that a reversed ready chain has as many slots as were counted.
macro_rules! debug_assert_batch_len {
    ($walked:expr, $len:expr, $capacity:expr) => {
        debug_assert!(
            $walked == $len && $len <= $capacity,
            "batch walked {} slots, counted {} (capacity {})",
            $walked,
            $len,
            $capacity
        )
    };
}

// =============================================================================
// Always-on guards
// =============================================================================

/// A caller broke the prepare/commit contract.
macro_rules! protocol_violation {
    ($($arg:tt)+) => {{
        ::tracing::error!($($arg)+);
        panic!("queue protocol violation: {}", format_args!($($arg)+))
    }};
}

/// Shared queue state holds a value that cannot be valid.
macro_rules! corrupted {
    ($($arg:tt)+) => {{
        ::tracing::error!($($arg)+);
        panic!("queue corrupted: {}", format_args!($($arg)+))
    }};
}

pub(crate) use corrupted;
pub(crate) use debug_assert_batch_len;
pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_read_not_past_write;
pub(crate) use protocol_violation;
