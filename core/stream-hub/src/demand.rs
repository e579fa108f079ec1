//! Per-peer demand bookkeeping.
//!
//! Peers are not granted credit element by element. The hub counts consumed
//! elements per peer and hands out a whole `threshold` of new credit each time
//! the counter runs down, so control traffic is one message per `threshold`
//! elements instead of one per element.

/// Hub-side counter that decides when a peer is owed more credit.
#[derive(Debug, Clone)]
pub struct DemandTracker {
    threshold: usize,
    until_next_signal: usize,
}

impl DemandTracker {
    /// Creates a tracker seeded at a full `threshold`.
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self { threshold, until_next_signal: threshold }
    }

    /// Records one consumed element; returns the credit to grant when the batch is used up.
    pub fn on_element(&mut self) -> Option<usize> {
        self.until_next_signal -= 1;
        if self.until_next_signal == 0 {
            self.until_next_signal = self.threshold;
            Some(self.threshold)
        } else {
            None
        }
    }

    /// Batch size of each grant.
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

/// Peer-side credit: how many more elements may be sent without waiting.
#[derive(Debug, Clone, Default)]
pub struct Credit {
    remaining: usize,
}

impl Credit {
    /// Starts with `initial` elements of pre-charged credit.
    pub fn new(initial: usize) -> Self {
        Self { remaining: initial }
    }

    /// Takes one unit of credit if any is left.
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Adds credit granted by the hub.
    pub fn replenish(&mut self, amount: usize) {
        self.remaining = self.remaining.saturating_add(amount);
    }

    /// Credit left.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_signals_once_per_batch() {
        let mut tracker = DemandTracker::new(3);
        let signals: Vec<_> = (0..7).map(|_| tracker.on_element()).collect();

        assert_eq!(signals, vec![None, None, Some(3), None, None, Some(3), None]);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let mut tracker = DemandTracker::new(0);
        assert_eq!(tracker.threshold(), 1);
        assert_eq!(tracker.on_element(), Some(1));
    }

    #[test]
    fn test_credit_exhausts_and_replenishes() {
        let mut credit = Credit::new(2);
        assert!(credit.try_consume());
        assert!(credit.try_consume());
        assert!(!credit.try_consume());

        credit.replenish(1);
        assert_eq!(credit.remaining(), 1);
        assert!(credit.try_consume());
    }
}
