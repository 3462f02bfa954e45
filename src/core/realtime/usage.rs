//! Usage normalization and deduplication.
//!
//! The backend may report usage for the same response more than once (on
//! `response.done` and again on late summary events), and different builds
//! spell the counters differently. The ledger admits each response id once
//! and suppresses empty reports so downstream metering sees one clean record
//! per response.

use std::collections::{HashSet, VecDeque};

use super::messages::WireUsage;
use crate::tools::TokenUsage;

/// Recorded response ids kept for dedup before the oldest age out.
const RECORDED_CAP: usize = 256;

/// Insertion-ordered id set holding the most recent `cap` entries; inserting
/// past the cap evicts the oldest id.
pub(crate) struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    cap: usize,
}

impl RecentIds {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            cap,
        }
    }

    /// Returns false when the id is already present.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > self.cap
            && let Some(evicted) = self.order.pop_front()
        {
            self.seen.remove(&evicted);
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

/// Per-session usage ledger. Survives reconnects so a replayed summary for
/// an already-counted response stays suppressed.
pub struct UsageLedger {
    recorded: RecentIds,
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageLedger {
    pub fn new() -> Self {
        Self {
            recorded: RecentIds::new(RECORDED_CAP),
        }
    }

    /// Normalize one wire usage block. Returns `None` for duplicates and for
    /// reports that carry no tokens at all.
    pub fn record(&mut self, response_id: Option<&str>, wire: &WireUsage) -> Option<TokenUsage> {
        if let Some(id) = response_id
            && !self.recorded.insert(id)
        {
            return None;
        }

        let input = wire.input_tokens.unwrap_or(0);
        let mut output = wire.output_tokens.unwrap_or(0);
        if input == 0 && output == 0 {
            // Some reports carry only a total; attribute it to output.
            output = wire.total_tokens.unwrap_or(0);
        }
        if input == 0 && output == 0 {
            return None;
        }
        Some(TokenUsage {
            input_tokens: input,
            output_tokens: output,
        })
    }

    /// Responses counted so far.
    pub fn recorded_count(&self) -> usize {
        self.recorded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(input: Option<u64>, output: Option<u64>, total: Option<u64>) -> WireUsage {
        WireUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: total,
        }
    }

    #[test]
    fn records_normalized_usage_once() {
        let mut ledger = UsageLedger::new();
        let usage = wire(Some(10), Some(20), Some(30));
        let first = ledger.record(Some("r1"), &usage).expect("first report");
        assert_eq!(first.input_tokens, 10);
        assert_eq!(first.output_tokens, 20);
        // Duplicate summary for the same response.
        assert!(ledger.record(Some("r1"), &usage).is_none());
        assert_eq!(ledger.recorded_count(), 1);
    }

    #[test]
    fn bare_total_is_attributed_to_output() {
        let mut ledger = UsageLedger::new();
        let usage = ledger
            .record(Some("r1"), &wire(None, None, Some(42)))
            .expect("report");
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 42);
    }

    #[test]
    fn empty_reports_are_suppressed() {
        let mut ledger = UsageLedger::new();
        assert!(ledger.record(Some("r1"), &wire(None, None, None)).is_none());
        assert!(
            ledger
                .record(Some("r2"), &wire(Some(0), Some(0), Some(0)))
                .is_none()
        );
    }

    #[test]
    fn old_response_ids_age_out_of_the_ledger() {
        let mut ledger = UsageLedger::new();
        let usage = wire(Some(1), Some(1), None);
        for i in 0..=RECORDED_CAP {
            assert!(ledger.record(Some(&format!("r{i}")), &usage).is_some());
        }
        assert_eq!(ledger.recorded_count(), RECORDED_CAP);

        // The oldest id was evicted and counts again; a recent one does not.
        assert!(ledger.record(Some("r0"), &usage).is_some());
        assert!(
            ledger
                .record(Some(&format!("r{RECORDED_CAP}")), &usage)
                .is_none()
        );
    }

    #[test]
    fn anonymous_reports_are_not_deduplicated() {
        let mut ledger = UsageLedger::new();
        let usage = wire(Some(1), Some(1), None);
        assert!(ledger.record(None, &usage).is_some());
        assert!(ledger.record(None, &usage).is_some());
    }
}
