//! Stream cursor: plans the next block range to fetch.

use serde::{Deserialize, Serialize};

/// A stream's position in the chain.
///
/// The cursor knows:
/// - Which block was last applied
/// - The confirmation depth (how far behind head a block must be to be fetched)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last block whose logs were applied.
    pub block_number: u64,
    /// Minimum number of confirmations before fetching a block.
    pub confirmation_depth: u64,
}

impl Cursor {
    pub fn new(block_number: u64, confirmation_depth: u64) -> Self {
        Self {
            block_number,
            confirmation_depth,
        }
    }

    /// Cursor for a stream that has never been processed: the block before
    /// `start_block`, so the first fetched range begins at `start_block`.
    pub fn before(start_block: u64, confirmation_depth: u64) -> Self {
        Self::new(start_block.saturating_sub(1), confirmation_depth)
    }

    /// The next inclusive range `[cursor + 1, min(confirmed_head, cursor + max_batch)]`,
    /// or `None` if nothing new is confirmed yet.
    pub fn next_range(&self, head: u64, max_batch: u64) -> Option<(u64, u64)> {
        let confirmed = head.saturating_sub(self.confirmation_depth);
        let to = confirmed.min(self.block_number.saturating_add(max_batch.max(1)));
        if to <= self.block_number {
            return None;
        }
        Some((self.block_number + 1, to))
    }
}
