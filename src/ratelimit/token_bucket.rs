//! Continuous-refill token bucket.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::backend::{LimitStrategy, StrategyKind};
use super::key::ClientKey;
use super::tiers::TierLimits;
use crate::error::Result;

/// Retry hint used when a tier has no refill rate.
const ZERO_RATE_RETRY_AFTER_SECS: u64 = 60;

/// Bucket state for a single key.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Fractional tokens; always within `[0, burst_size]`
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(limits: &TierLimits, now: Instant) -> Self {
        Self {
            tokens: limits.burst_size as f64,
            last_refill: now,
        }
    }

    /// Tokens the bucket would hold at `now`.
    fn projected(&self, limits: &TierLimits, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * limits.tokens_per_second()).min(limits.burst_size as f64)
    }

    fn refill(&mut self, limits: &TierLimits, now: Instant) {
        self.tokens = self.projected(limits, now);
        // A caller that sampled `now` before a concurrent one must not rewind the clock.
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn try_consume(&mut self, weight: u32) -> bool {
        let weight = weight as f64;
        if self.tokens >= weight {
            self.tokens -= weight;
            true
        } else {
            false
        }
    }
}

/// Token bucket limiter keyed per client.
///
/// Each key starts with a full bucket of `burst_size` tokens, refilled
/// continuously at `requests_per_minute / 60` tokens per second. A request
/// consumes `weight` tokens. A weight above `burst_size` can never succeed.
#[derive(Debug, Default)]
pub struct TokenBucketLimiter {
    buckets: DashMap<ClientKey, Bucket>,
}

impl TokenBucketLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LimitStrategy for TokenBucketLimiter {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TokenBucket
    }

    fn check_limit(
        &self,
        key: &ClientKey,
        limits: &TierLimits,
        weight: u32,
        now: Instant,
    ) -> Result<bool> {
        let mut bucket = match self.buckets.get_mut(key) {
            Some(bucket) => bucket,
            None => self
                .buckets
                .entry(key.clone())
                .or_insert_with(|| Bucket::full(limits, now)),
        };

        bucket.refill(limits, now);
        let allowed = bucket.try_consume(weight);

        trace!(
            key = %key,
            weight = weight,
            tokens = bucket.tokens,
            allowed = allowed,
            "Token bucket checked"
        );

        Ok(allowed)
    }

    fn retry_after(&self, key: &ClientKey, limits: &TierLimits, now: Instant) -> u64 {
        if limits.requests_per_minute == 0 {
            return ZERO_RATE_RETRY_AFTER_SECS;
        }

        // (1 - tokens) / tokens_per_second, kept in per-minute form to avoid rounding drift.
        let tokens = self.available(key, limits, now);
        let missing = (1.0 - tokens).max(0.0);
        (missing * 60.0 / limits.requests_per_minute as f64).ceil() as u64
    }

    fn available(&self, key: &ClientKey, limits: &TierLimits, now: Instant) -> f64 {
        self.buckets
            .get(key)
            .map(|bucket| bucket.projected(limits, now))
            .unwrap_or(limits.burst_size as f64)
    }

    fn prune_idle(&self, now: Instant, horizon: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < horizon);
        before.saturating_sub(self.buckets.len())
    }

    fn remove(&self, key: &ClientKey) {
        self.buckets.remove(key);
    }

    fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}
