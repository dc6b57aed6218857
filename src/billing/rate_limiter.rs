//! Rolling-window admission counter, one per tenant.
//!
//! The window only counts admitted requests. A denied request leaves it
//! untouched, so hammering a closed window never pushes the reset further
//! out.

use crate::error::RateLimitInfo;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Limit applied to every tenant window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    /// Admissions allowed per window. 0 disables the check.
    pub limit: u32,
    pub window_secs: u64,
}

impl RatePolicy {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    fn window(&self) -> Duration {
        Duration::seconds(i64::try_from(self.window_secs).unwrap_or(i64::MAX / 1000))
    }
}

/// Timestamps of recent admissions for a single tenant.
#[derive(Debug, Clone, Default)]
pub struct RateWindow {
    admissions: VecDeque<DateTime<Utc>>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Would one more admission fit? Returns the quota left after it, or the
    /// denial metadata. Never mutates.
    pub fn check(&self, policy: &RatePolicy, now: DateTime<Utc>) -> Result<u32, RateLimitInfo> {
        if !policy.is_enabled() {
            return Ok(u32::MAX);
        }

        let cutoff = now - policy.window();
        let live: Vec<&DateTime<Utc>> = self.admissions.iter().filter(|ts| **ts > cutoff).collect();
        let used = u32::try_from(live.len()).unwrap_or(u32::MAX);

        if used >= policy.limit {
            let oldest = live.first().map_or(now, |ts| **ts);
            let reset_at = oldest + policy.window();
            let wait_ms = (reset_at - now).num_milliseconds().max(0);
            let retry_after_secs = u64::try_from(wait_ms).unwrap_or(0).div_ceil(1000).max(1);
            return Err(RateLimitInfo {
                limit: policy.limit,
                remaining: 0,
                reset_at,
                retry_after_secs,
            });
        }

        Ok(policy.limit - used - 1)
    }

    /// Record an admission and drop timestamps that left the window.
    pub fn record(&mut self, policy: &RatePolicy, now: DateTime<Utc>) {
        if !policy.is_enabled() {
            return;
        }
        self.prune(policy, now);
        self.admissions.push_back(now);
    }

    /// True when no admission is inside the window any more.
    pub fn is_idle(&self, policy: &RatePolicy, now: DateTime<Utc>) -> bool {
        let cutoff = now - policy.window();
        self.admissions.iter().all(|ts| *ts <= cutoff)
    }

    pub fn len(&self) -> usize {
        self.admissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admissions.is_empty()
    }

    fn prune(&mut self, policy: &RatePolicy, now: DateTime<Utc>) {
        let cutoff = now - policy.window();
        while self.admissions.front().is_some_and(|ts| *ts <= cutoff) {
            self.admissions.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn allows_within_limit() {
        let policy = RatePolicy::new(3, 60);
        let mut window = RateWindow::new();
        for expected_remaining in [2, 1, 0] {
            assert_eq!(window.check(&policy, t0()), Ok(expected_remaining));
            window.record(&policy, t0());
        }
    }

    #[test]
    fn blocks_at_limit_with_reset_metadata() {
        let policy = RatePolicy::new(2, 60);
        let mut window = RateWindow::new();
        window.record(&policy, t0());
        window.record(&policy, t0() + Duration::seconds(10));

        let info = window
            .check(&policy, t0() + Duration::seconds(20))
            .unwrap_err();
        assert_eq!(info.limit, 2);
        assert_eq!(info.remaining, 0);
        assert_eq!(info.reset_at, t0() + Duration::seconds(60));
        assert_eq!(info.retry_after_secs, 40);
    }

    #[test]
    fn denial_does_not_extend_window() {
        let policy = RatePolicy::new(1, 60);
        let mut window = RateWindow::new();
        window.record(&policy, t0());
        for s in 1..30 {
            assert!(window.check(&policy, t0() + Duration::seconds(s)).is_err());
        }
        assert_eq!(window.len(), 1);
        assert!(window.check(&policy, t0() + Duration::seconds(60)).is_ok());
    }

    #[test]
    fn old_admissions_slide_out() {
        let policy = RatePolicy::new(2, 60);
        let mut window = RateWindow::new();
        window.record(&policy, t0());
        window.record(&policy, t0() + Duration::seconds(30));
        assert!(window.check(&policy, t0() + Duration::seconds(45)).is_err());
        assert_eq!(window.check(&policy, t0() + Duration::seconds(61)), Ok(0));

        window.record(&policy, t0() + Duration::seconds(61));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn zero_limit_always_allows() {
        let policy = RatePolicy::new(0, 60);
        let mut window = RateWindow::new();
        for _ in 0..500 {
            assert!(window.check(&policy, t0()).is_ok());
            window.record(&policy, t0());
        }
        assert!(window.is_empty());
    }

    #[test]
    fn idle_after_window_passes() {
        let policy = RatePolicy::new(5, 60);
        let mut window = RateWindow::new();
        window.record(&policy, t0());
        assert!(!window.is_idle(&policy, t0() + Duration::seconds(59)));
        assert!(window.is_idle(&policy, t0() + Duration::seconds(60)));
    }
}
