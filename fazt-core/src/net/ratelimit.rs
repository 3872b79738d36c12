//! Per-domain egress rate limiting
//!
//! Token buckets via `governor`, one direct limiter per domain, created
//! lazily from the system-wide rate or a per-domain override. A rate of 0
//! disables limiting for that domain.

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters keyed by canonical domain.
pub struct DomainRateLimits {
    limiters: DashMap<String, Arc<DirectLimiter>>,
    default_rate: u32,
    default_burst: u32,
}

impl DomainRateLimits {
    #[must_use]
    pub fn new(default_rate: u32, default_burst: u32) -> Self {
        Self {
            limiters: DashMap::new(),
            default_rate,
            default_burst,
        }
    }

    /// Check the bucket for `domain`. `override_rate`/`override_burst` come
    /// from the allowlist entry. Returns seconds to wait when limited.
    pub fn check(
        &self,
        domain: &str,
        override_rate: Option<u32>,
        override_burst: Option<u32>,
    ) -> Result<(), u64> {
        let rate = override_rate.unwrap_or(self.default_rate);
        if rate == 0 {
            return Ok(());
        }
        let burst = override_burst.unwrap_or(self.default_burst).max(1);

        let limiter = self
            .limiters
            .entry(domain.to_string())
            .or_insert_with(|| {
                let quota = Quota::per_second(NonZeroU32::new(rate).expect("rate nonzero"))
                    .allow_burst(NonZeroU32::new(burst).expect("burst nonzero"));
                Arc::new(RateLimiter::direct(quota))
            })
            .clone();

        match limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                Err(wait.as_secs().max(1))
            }
        }
    }

    /// Forget per-domain buckets (allowlist mutation changed overrides).
    pub fn reset(&self) {
        self.limiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default_zero() {
        let limits = DomainRateLimits::new(0, 10);
        for _ in 0..1000 {
            assert!(limits.check("x.com", None, None).is_ok());
        }
    }

    #[test]
    fn test_burst_then_limited() {
        let limits = DomainRateLimits::new(0, 1);
        // Override enables a 1 rps, burst 2 bucket for this domain.
        assert!(limits.check("x.com", Some(1), Some(2)).is_ok());
        assert!(limits.check("x.com", Some(1), Some(2)).is_ok());
        let wait = limits.check("x.com", Some(1), Some(2)).unwrap_err();
        assert!(wait >= 1);
    }

    #[test]
    fn test_domains_independent() {
        let limits = DomainRateLimits::new(0, 1);
        assert!(limits.check("a.com", Some(1), Some(1)).is_ok());
        assert!(limits.check("a.com", Some(1), Some(1)).is_err());
        assert!(limits.check("b.com", Some(1), Some(1)).is_ok());
    }
}
