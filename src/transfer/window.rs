//! Fixed-width selective-ack sliding window.
//!
//! Both endpoints run the same structure: the sender marks a slot when
//! the fragment's ack arrives, the receiver when the fragment itself
//! does. The watermark is the first fragment not yet marked; it only
//! advances over contiguous marked slots, so slot `watermark + WIDTH`
//! becomes usable exactly when the watermark moves.

use crate::config::TRANSFER_WINDOW_WIDTH;

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    watermark: u32,
    /// One bit per in-window fragment, indexed by `index % WIDTH`.
    bits: u32,
    fragment_count: u32,
}

impl SlidingWindow {
    pub fn new(fragment_count: u32) -> Self {
        Self {
            watermark: 0,
            bits: 0,
            fragment_count,
        }
    }

    pub fn watermark(&self) -> u32 {
        self.watermark
    }

    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    /// All fragments at or past the watermark are marked.
    pub fn is_complete(&self) -> bool {
        self.watermark >= self.fragment_count
    }

    /// Exclusive upper bound of the sendable/acceptable range.
    pub fn window_end(&self) -> u32 {
        (self.watermark.saturating_add(TRANSFER_WINDOW_WIDTH)).min(self.fragment_count)
    }

    pub fn in_window(&self, index: u32) -> bool {
        index >= self.watermark && index < self.window_end()
    }

    /// Mark `index` done. Returns `false` (no side effects) when the
    /// index is outside the window or already marked, so duplicates
    /// are naturally idempotent.
    pub fn mark(&mut self, index: u32) -> bool {
        if !self.in_window(index) {
            return false;
        }
        let mask = 1u32 << (index % TRANSFER_WINDOW_WIDTH);
        if self.bits & mask != 0 {
            return false;
        }
        self.bits |= mask;
        true
    }

    /// Slide over contiguous marked slots; returns how far it moved.
    pub fn advance(&mut self) -> u32 {
        let mut moved = 0;
        while self.watermark < self.fragment_count {
            let mask = 1u32 << (self.watermark % TRANSFER_WINDOW_WIDTH);
            if self.bits & mask == 0 {
                break;
            }
            self.bits &= !mask;
            self.watermark += 1;
            moved += 1;
        }
        moved
    }

    /// In-window fragments not yet marked, capped at `limit` (the
    /// highest index ever transmitted, for the sender's retransmit
    /// pass).
    pub fn unmarked_below(&self, limit: u32) -> Vec<u32> {
        let end = self.window_end().min(limit);
        (self.watermark..end)
            .filter(|&i| self.bits & (1u32 << (i % TRANSFER_WINDOW_WIDTH)) == 0)
            .collect()
    }
}
