//! Full-range duplicate suppression for server-push sequence numbers.
//!
//! One bit per possible u16 sequence value, 8 KiB total, so delivery
//! stays exactly-once regardless of how far apart duplicates arrive.

const WORDS: usize = (u16::MAX as usize + 1) / 64;

pub struct DuplicateWindow {
    bits: Box<[u64; WORDS]>,
}

impl Default for DuplicateWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateWindow {
    pub fn new() -> Self {
        Self {
            bits: Box::new([0u64; WORDS]),
        }
    }

    /// Record `seq` as seen. Returns `true` if it was already recorded.
    pub fn check_and_set(&mut self, seq: u16) -> bool {
        let word = seq as usize / 64;
        let mask = 1u64 << (seq as usize % 64);
        let dup = self.bits[word] & mask != 0;
        self.bits[word] |= mask;
        dup
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }
}

impl std::fmt::Debug for DuplicateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let seen: u32 = self.bits.iter().map(|w| w.count_ones()).sum();
        f.debug_struct("DuplicateWindow").field("seen", &seen).finish()
    }
}
