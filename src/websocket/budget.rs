use std::time::Duration;

use tokio::time::Instant;

/// A refilling allowance of bytes or frames.
///
/// Reads are paused while the budget is exhausted and resume once the
/// period elapses and the budget refills. A capacity of zero is unlimited.
#[derive(Debug, Clone)]
pub(crate) struct Budget {
    capacity: u64,
    available: u64,
    period: Duration,
    next_refill: Instant,
}

impl Budget {
    pub(crate) fn new(capacity: u64, period: Duration, now: Instant) -> Self {
        Self {
            capacity,
            available: capacity,
            period,
            next_refill: now + period,
        }
    }

    pub(crate) fn consume(&mut self, amount: u64) {
        if self.capacity != 0 {
            self.available = self.available.saturating_sub(amount);
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.capacity != 0 && self.available == 0
    }

    /// Refills once the period has elapsed.
    pub(crate) fn replenish(&mut self, now: Instant) {
        if now >= self.next_refill {
            self.available = self.capacity;
            self.next_refill = now + self.period;
        }
    }

    pub(crate) fn next_refill(&self) -> Instant {
        self.next_refill
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_and_refills() {
        let start = Instant::now();
        let mut budget = Budget::new(10, Duration::from_secs(1), start);
        budget.consume(4);
        assert!(!budget.is_exhausted());
        budget.consume(20);
        assert!(budget.is_exhausted());

        budget.replenish(start + Duration::from_millis(500));
        assert!(budget.is_exhausted());

        budget.replenish(start + Duration::from_secs(1));
        assert!(!budget.is_exhausted());
        assert_eq!(budget.next_refill(), start + Duration::from_secs(2));
    }

    #[test]
    fn zero_capacity_is_unlimited() {
        let mut budget = Budget::new(0, Duration::from_secs(1), Instant::now());
        budget.consume(u64::MAX);
        assert!(!budget.is_exhausted());
    }
}
