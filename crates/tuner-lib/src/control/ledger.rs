//! Selection probabilities of allocations that were put in place
//!
//! An observation must carry the probability under which its allocation
//! was chosen. Records rarely carry it themselves, so the controller
//! remembers it when applying a recommendation and looks it up by memory
//! size when the resulting records come back.

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct ProbabilityLedger {
    /// Probability of the last applied recommendation that chose each size
    applied: HashMap<u32, f64>,
    /// Allocation set outside the policy, e.g. a sweep baseline
    forced: Option<u32>,
}

impl ProbabilityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deterministic allocation; its records count with probability 1
    pub fn force(&mut self, size_mb: u32) {
        self.applied.remove(&size_mb);
        self.forced = Some(size_mb);
    }

    /// Record an applied recommendation
    pub fn record(&mut self, size_mb: u32, probability: f64) {
        if self.forced == Some(size_mb) {
            self.forced = None;
        }
        self.applied.insert(size_mb, probability);
    }

    pub fn forced(&self) -> Option<u32> {
        self.forced
    }

    /// Probability for a record produced at `size_mb`
    pub fn probability_for(&self, size_mb: u32) -> Option<f64> {
        self.applied
            .get(&size_mb)
            .copied()
            .or_else(|| (self.forced == Some(size_mb)).then_some(1.0))
    }

    /// Resolve a record's probability: its own value wins over the ledger
    pub fn resolve(&self, size_mb: u32, recorded: Option<f64>) -> Option<f64> {
        recorded.or_else(|| self.probability_for(size_mb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ledger_resolves_nothing() {
        let ledger = ProbabilityLedger::new();
        assert_eq!(ledger.resolve(128, None), None);
        assert_eq!(ledger.resolve(128, Some(0.3)), Some(0.3));
    }

    #[test]
    fn test_forced_allocation_is_certain() {
        let mut ledger = ProbabilityLedger::new();
        ledger.force(256);
        assert_eq!(ledger.probability_for(256), Some(1.0));
        assert_eq!(ledger.probability_for(128), None);
    }

    #[test]
    fn test_recommendations_keep_per_size_probability() {
        let mut ledger = ProbabilityLedger::new();
        ledger.force(64);
        ledger.record(128, 0.95);
        ledger.record(64, 0.05);

        // in-flight records from each allocation keep their own probability
        assert_eq!(ledger.probability_for(128), Some(0.95));
        assert_eq!(ledger.probability_for(64), Some(0.05));
        assert_eq!(ledger.forced(), None);

        ledger.force(128);
        assert_eq!(ledger.probability_for(128), Some(1.0));
        assert_eq!(ledger.probability_for(64), Some(0.05));
    }
}
