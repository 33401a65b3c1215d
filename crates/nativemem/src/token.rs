//! Tracking tokens

use crate::internal_prelude::*;

/// Everything needed to free a native block, independently of its handles
///
/// Made when the last reference to an unreleased block goes away,
/// and delivered to the engine's reclamation queue.
/// A token is consumed by exactly one free.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct Token {
    /// Start of the block, as returned by `NativeMemory::alloc`
    pub(crate) address: Address,

    /// Size of the block, as passed to `NativeMemory::alloc`
    pub(crate) size: usize,

    /// When the token was placed on the reclamation queue
    pub(crate) enqueued: Instant,
}

impl Token {
    /// Make a token for a block, stamped with the current time
    pub(crate) fn new(address: Address, size: usize) -> Self {
        Token {
            address,
            size,
            enqueued: Instant::now(),
        }
    }

    /// How long this token has been waiting, as of `now`
    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued)
    }
}
