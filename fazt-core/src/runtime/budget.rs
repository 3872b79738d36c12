//! Execution budget
//!
//! A per-execution credit of wall-clock time. Created when the JS window
//! opens; storage and egress admission check the remaining slack before
//! starting work. Backed by `Instant`, so `remaining()` is non-increasing
//! by construction.

use std::time::{Duration, Instant};

/// Wall-clock budget for one JS execution.
#[derive(Debug, Clone)]
pub struct Budget {
    deadline: Instant,
    window: Duration,
}

impl Budget {
    /// Open a budget spanning `window` from now.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { deadline: Instant::now() + window, window }
    }

    /// Time left; zero once the window closes.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the window has closed.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.remaining() == Duration::ZERO
    }

    /// The full window this budget opened with.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_bounded_by_window() {
        let budget = Budget::new(Duration::from_secs(5));
        assert!(budget.remaining() <= Duration::from_secs(5));
        assert!(!budget.expired());
    }

    #[test]
    fn test_monotonic_non_increasing() {
        let budget = Budget::new(Duration::from_secs(5));
        let first = budget.remaining();
        std::thread::sleep(Duration::from_millis(10));
        let second = budget.remaining();
        assert!(second <= first);
    }

    #[test]
    fn test_expiry() {
        let budget = Budget::new(Duration::ZERO);
        assert!(budget.expired());
        assert_eq!(budget.remaining(), Duration::ZERO);
    }
}
