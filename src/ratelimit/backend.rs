//! Strategy trait for abstracting over the limiting algorithms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::key::ClientKey;
use super::tiers::TierLimits;
use crate::error::Result;

/// Configured limiting algorithm.
///
/// `fixed_window` and `leaky_bucket` are accepted in configuration but run
/// as a token bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
}

impl StrategyKind {
    /// The algorithm that actually runs for this setting.
    pub fn effective(self) -> StrategyKind {
        match self {
            StrategyKind::TokenBucket | StrategyKind::SlidingWindow => self,
            StrategyKind::FixedWindow | StrategyKind::LeakyBucket => {
                warn!(
                    configured = %self,
                    fallback = %StrategyKind::TokenBucket,
                    "Rate limit strategy not implemented, falling back"
                );
                StrategyKind::TokenBucket
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::TokenBucket => "token_bucket",
            StrategyKind::SlidingWindow => "sliding_window",
            StrategyKind::FixedWindow => "fixed_window",
            StrategyKind::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for per-client limiting algorithms.
///
/// Implementations own their per-key state and must make each call atomic
/// for a given key. `now` is supplied by the caller so a single decision
/// sees one consistent instant.
pub trait LimitStrategy: Send + Sync {
    /// Which algorithm this is.
    fn kind(&self) -> StrategyKind;

    /// Evaluate and, if allowed, record a request of the given weight.
    ///
    /// `weight` is at least 1; the facade rejects zero-weight requests.
    fn check_limit(
        &self,
        key: &ClientKey,
        limits: &TierLimits,
        weight: u32,
        now: Instant,
    ) -> Result<bool>;

    /// Whole seconds until the next request could be admitted.
    fn retry_after(&self, key: &ClientKey, limits: &TierLimits, now: Instant) -> u64;

    /// Capacity currently available to the key, without recording anything.
    fn available(&self, key: &ClientKey, limits: &TierLimits, now: Instant) -> f64;

    /// Drop state for keys idle for at least `horizon`. Returns how many were dropped.
    fn prune_idle(&self, now: Instant, horizon: Duration) -> usize;

    /// Forget all state for a key.
    fn remove(&self, key: &ClientKey);

    /// Number of keys with live state.
    fn tracked_keys(&self) -> usize;
}
