//! Pending-ack queue and resend policy.
//!
//! Every acknowledged-delivery command keeps its encoded frame here
//! until the matching reply arrives. A periodic scan retransmits
//! overdue entries and expels the ones that exhausted their resends.

use crate::channel::command::Command;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// One command awaiting its reply.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command: Command,
    pub seq: u16,
    /// The fully encoded frame, kept verbatim for retransmission.
    pub frame: Vec<u8>,
    pub sent_at: Instant,
    pub resend_count: u32,
}

/// A command that exhausted its resend budget.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub command: Command,
    pub seq: u16,
    pub resends: u32,
}

/// Frames due for retransmission plus commands given up on.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub resend: Vec<(u16, Vec<u8>)>,
    pub failed: Vec<DeliveryFailure>,
}

/// Commands in flight, keyed by sequence number.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: HashMap<u16, PendingCommand>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: PendingCommand) {
        // a wrapped-around seq colliding with a stuck entry replaces it
        self.entries.insert(entry.seq, entry);
    }

    /// Remove and return the entry a reply acknowledges.
    pub fn take(&mut self, seq: u16) -> Option<PendingCommand> {
        self.entries.remove(&seq)
    }

    pub fn contains(&self, seq: u16) -> bool {
        self.entries.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Walk the queue: entries older than `timeout` are either scheduled
    /// for retransmission or, past `max_resends`, removed and reported.
    pub fn scan(&mut self, now: Instant, timeout: Duration, max_resends: u32) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let overdue: Vec<u16> = self
            .entries
            .values()
            .filter(|e| now.duration_since(e.sent_at) >= timeout)
            .map(|e| e.seq)
            .collect();

        for seq in overdue {
            let entry = match self.entries.get_mut(&seq) {
                Some(e) => e,
                None => continue,
            };
            if entry.resend_count >= max_resends {
                let entry = self.entries.remove(&seq);
                if let Some(entry) = entry {
                    outcome.failed.push(DeliveryFailure {
                        command: entry.command,
                        seq: entry.seq,
                        resends: entry.resend_count,
                    });
                }
                continue;
            }
            entry.resend_count += 1;
            entry.sent_at = now;
            debug!(seq, cmd = ?entry.command, attempt = entry.resend_count, "retransmitting command");
            outcome.resend.push((seq, entry.frame.clone()));
        }
        outcome
    }
}
