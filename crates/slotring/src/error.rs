//! Error types for queue construction and convenience operations.

use thiserror::Error;

/// Errors returned by queue constructors and `push`.
///
/// `Full`/`Empty` from the `prepare` calls are not errors: they come back as
/// `None`. Protocol violations are not errors either; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// A construction parameter is out of range.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument.
        reason: &'static str,
    },

    /// A message is empty or larger than the queue accepts.
    #[error("invalid message size {size} (max: {max})")]
    MessageSize {
        /// The rejected size.
        size: usize,
        /// The largest size the queue accepts.
        max: usize,
    },

    /// The allocator could not provide the backing block.
    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory {
        /// Size of the failed allocation.
        bytes: usize,
    },

    /// Sizing arithmetic overflowed `usize`.
    #[error("size computation overflowed")]
    Overflow,

    /// The queue has no free slot or space.
    #[error("queue is full")]
    Full,
}

impl QueueError {
    /// Returns `true` for backpressure (`Full`): retry later.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Returns `true` for errors a host should report as bad configuration.
    #[inline]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument { .. } | Self::OutOfMemory { .. } | Self::Overflow
        )
    }
}
