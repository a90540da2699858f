//! Trailing-window request counting.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::backend::{LimitStrategy, StrategyKind};
use super::key::ClientKey;
use super::tiers::TierLimits;
use crate::error::Result;

/// Default window size in minutes.
pub const DEFAULT_WINDOW_MINUTES: u32 = 1;

/// Sliding window limiter keyed per client.
///
/// Keeps the exact timestamp of every admitted request inside the window.
/// Unlike the token bucket there is no carry-over, so a client can never
/// exceed the window limit. Request weight is not considered: every admitted
/// request occupies one slot.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    windows: DashMap<ClientKey, VecDeque<Instant>>,
    window_minutes: u32,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_MINUTES)
    }
}

impl SlidingWindowLimiter {
    /// Create a limiter with the given window size. Zero is treated as one minute.
    pub fn new(window_minutes: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window_minutes: window_minutes.max(1),
        }
    }

    pub fn window_minutes(&self) -> u32 {
        self.window_minutes
    }

    fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_minutes) * 60)
    }

    fn evict_expired(&self, entries: &mut VecDeque<Instant>, now: Instant) {
        let window = self.window();
        while let Some(&oldest) = entries.front() {
            if now.saturating_duration_since(oldest) > window {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn live_count(&self, entries: &VecDeque<Instant>, now: Instant) -> usize {
        let window = self.window();
        entries
            .iter()
            .filter(|&&ts| now.saturating_duration_since(ts) <= window)
            .count()
    }
}

impl LimitStrategy for SlidingWindowLimiter {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SlidingWindow
    }

    fn check_limit(
        &self,
        key: &ClientKey,
        limits: &TierLimits,
        _weight: u32,
        now: Instant,
    ) -> Result<bool> {
        let limit = limits.window_limit(self.window_minutes) as usize;

        let mut entries = match self.windows.get_mut(key) {
            Some(entries) => entries,
            None => self.windows.entry(key.clone()).or_default(),
        };

        self.evict_expired(&mut entries, now);

        let count = entries.len();
        let allowed = count < limit;
        if allowed {
            // Keep timestamps ordered even if a concurrent caller sampled a later instant.
            let stamp = entries.back().map_or(now, |&last| last.max(now));
            entries.push_back(stamp);
        }

        trace!(
            key = %key,
            count = count,
            limit = limit,
            allowed = allowed,
            "Sliding window checked"
        );

        Ok(allowed)
    }

    fn retry_after(&self, key: &ClientKey, limits: &TierLimits, now: Instant) -> u64 {
        let window = self.window();
        let limit = limits.window_limit(self.window_minutes) as usize;

        let Some(entries) = self.windows.get(key) else {
            return 0;
        };
        if self.live_count(&entries, now) < limit {
            return 0;
        }

        // The first live entry is the next to leave the window.
        entries
            .iter()
            .find(|&&ts| now.saturating_duration_since(ts) <= window)
            .map(|&oldest| {
                let remaining = window.saturating_sub(now.saturating_duration_since(oldest));
                remaining.as_secs_f64().ceil().max(1.0) as u64
            })
            .unwrap_or_else(|| window.as_secs())
    }

    fn available(&self, key: &ClientKey, limits: &TierLimits, now: Instant) -> f64 {
        let limit = limits.window_limit(self.window_minutes) as usize;
        let used = self
            .windows
            .get(key)
            .map(|entries| self.live_count(&entries, now))
            .unwrap_or(0);
        limit.saturating_sub(used) as f64
    }

    fn prune_idle(&self, now: Instant, horizon: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, entries| match entries.back() {
            Some(&newest) => now.saturating_duration_since(newest) < horizon,
            None => false,
        });
        before.saturating_sub(self.windows.len())
    }

    fn remove(&self, key: &ClientKey) {
        self.windows.remove(key);
    }

    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(per_minute: u32, per_hour: u32) -> TierLimits {
        TierLimits::new(per_minute, per_hour, per_hour * 24, 1)
    }

    #[test]
    fn test_limit_then_deny_then_recover() {
        let limiter = SlidingWindowLimiter::default();
        let key = ClientKey::client("client");
        let limits = limits(3, 100);
        let now = Instant::now();

        for i in 0..3 {
            let at = now + Duration::from_secs(i);
            assert!(limiter.check_limit(&key, &limits, 1, at).unwrap());
        }
        assert!(!limiter.check_limit(&key, &limits, 1, now + Duration::from_secs(10)).unwrap());

        assert!(limiter.check_limit(&key, &limits, 1, now + Duration::from_secs(61)).unwrap());
    }

    #[test]
    fn test_denied_request_is_not_recorded() {
        let limiter = SlidingWindowLimiter::default();
        let key = ClientKey::client("client");
        let limits = limits(2, 100);
        let now = Instant::now();

        assert!(limiter.check_limit(&key, &limits, 1, now).unwrap());
        assert!(limiter.check_limit(&key, &limits, 1, now).unwrap());
        for _ in 0..5 {
            assert!(!limiter.check_limit(&key, &limits, 1, now).unwrap());
        }
        assert_eq!(limiter.available(&key, &limits, now), 0.0);

        // Only the two admitted requests need to expire.
        let after = now + Duration::from_secs(61);
        assert_eq!(limiter.available(&key, &limits, after), 2.0);
    }

    #[test]
    fn test_no_burst_carry_over() {
        let limiter = SlidingWindowLimiter::default();
        let key = ClientKey::client("client");
        let limits = limits(2, 100);
        let now = Instant::now();

        // Idle for a long time, then burst: still only the window limit.
        let later = now + Duration::from_secs(3600);
        assert!(limiter.check_limit(&key, &limits, 1, later).unwrap());
        assert!(limiter.check_limit(&key, &limits, 1, later).unwrap());
        assert!(!limiter.check_limit(&key, &limits, 1, later).unwrap());
    }

    #[test]
    fn test_longer_window_uses_hourly_limit() {
        let limiter = SlidingWindowLimiter::new(60);
        let key = ClientKey::client("client");
        let limits = limits(1, 3);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_limit(&key, &limits, 1, now).unwrap());
        }
        assert!(!limiter.check_limit(&key, &limits, 1, now + Duration::from_secs(120)).unwrap());
        assert!(limiter.check_limit(&key, &limits, 1, now + Duration::from_secs(3601)).unwrap());
    }

    #[test]
    fn test_entry_at_window_edge_still_counts() {
        let limiter = SlidingWindowLimiter::default();
        let key = ClientKey::client("client");
        let limits = limits(3, 100);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_limit(&key, &limits, 1, now).unwrap());
        }

        let edge = now + Duration::from_secs(60);
        assert_eq!(limiter.available(&key, &limits, edge), 0.0);
        assert!(!limiter.check_limit(&key, &limits, 1, edge).unwrap());
        assert_eq!(limiter.retry_after(&key, &limits, edge), 1);

        let past = edge + Duration::from_millis(1);
        assert_eq!(limiter.available(&key, &limits, past), 3.0);
        assert!(limiter.check_limit(&key, &limits, 1, past).unwrap());
    }

    #[test]
    fn test_retry_after_tracks_oldest_entry() {
        let limiter = SlidingWindowLimiter::default();
        let key = ClientKey::client("client");
        let limits = limits(2, 100);
        let now = Instant::now();

        assert_eq!(limiter.retry_after(&key, &limits, now), 0);
        limiter.check_limit(&key, &limits, 1, now).unwrap();
        limiter.check_limit(&key, &limits, 1, now + Duration::from_secs(20)).unwrap();

        let at = now + Duration::from_secs(30);
        assert!(!limiter.check_limit(&key, &limits, 1, at).unwrap());
        assert_eq!(limiter.retry_after(&key, &limits, at), 30);
    }

    #[test]
    fn test_prune_idle_windows() {
        let limiter = SlidingWindowLimiter::default();
        let limits = limits(5, 100);
        let now = Instant::now();

        limiter.check_limit(&ClientKey::client("a"), &limits, 1, now).unwrap();
        let later = now + Duration::from_secs(7200);
        limiter.check_limit(&ClientKey::client("b"), &limits, 1, later).unwrap();

        assert_eq!(limiter.prune_idle(later, Duration::from_secs(3600)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_zero_window_minutes_clamped() {
        let limiter = SlidingWindowLimiter::new(0);
        assert_eq!(limiter.window_minutes(), 1);
    }
}
