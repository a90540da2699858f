//! Violation history and escalating temporary blocks.
//!
//! Every denied check is recorded against the client key. Once the number of
//! violations inside the rolling window reaches the threshold, the key is
//! blocked for `min(max_block, violations * block_per_violation)`.
//!
//! Blocks expire passively: a block whose deadline has passed is simply no
//! longer reported as active. The maintenance pass clears it from memory.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::key::ClientKey;

/// Escalation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Violations inside `window` that trigger a block
    pub threshold: u32,
    /// Rolling window over which violations are counted
    pub window: Duration,
    /// Block length added per retained violation
    pub block_per_violation: Duration,
    /// Upper bound on a single block
    pub max_block: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold: 10,
            window: Duration::from_secs(3600),
            block_per_violation: Duration::from_secs(60),
            max_block: Duration::from_secs(3600),
        }
    }
}

impl EscalationPolicy {
    /// Linear backoff, capped at `max_block`.
    pub fn block_duration(&self, violations: usize) -> Duration {
        let violations = u32::try_from(violations).unwrap_or(u32::MAX);
        self.block_per_violation
            .checked_mul(violations)
            .map_or(self.max_block, |d| d.min(self.max_block))
    }
}

#[derive(Debug, Default)]
struct ViolationRecord {
    /// Ordered, oldest first
    timestamps: VecDeque<Instant>,
    block_until: Option<Instant>,
}

impl ViolationRecord {
    fn block_remaining(&self, now: Instant) -> Option<Duration> {
        self.block_until
            .filter(|&until| now < until)
            .map(|until| until - now)
    }

    fn prune_older_than(&mut self, now: Instant, age: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) > age {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Counts produced by a [`ViolationTracker::prune`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub expired_blocks: usize,
    pub removed_keys: usize,
}

/// Per-key violation history plus blocklist.
#[derive(Debug, Default)]
pub struct ViolationTracker {
    records: DashMap<ClientKey, ViolationRecord>,
    policy: EscalationPolicy,
}

impl ViolationTracker {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self {
            records: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Remaining block time if the key is currently blocked.
    pub fn blocked_for(&self, key: &ClientKey, now: Instant) -> Option<Duration> {
        self.records
            .get(key)
            .and_then(|record| record.block_remaining(now))
    }

    /// Record a denial. Returns the block length if this violation started a block.
    pub fn record_violation(&self, key: &ClientKey, now: Instant) -> Option<Duration> {
        let mut record = match self.records.get_mut(key) {
            Some(record) => record,
            None => self.records.entry(key.clone()).or_default(),
        };

        let stamp = record.timestamps.back().map_or(now, |&last| last.max(now));
        record.timestamps.push_back(stamp);
        record.prune_older_than(now, self.policy.window);

        let count = record.timestamps.len();
        debug!(key = %key, violations = count, "Recorded rate limit violation");

        if record.block_remaining(now).is_some() || count < self.policy.threshold as usize {
            return None;
        }

        let duration = self.policy.block_duration(count);
        record.block_until = Some(now + duration);

        warn!(
            key = %key,
            violations = count,
            block_secs = duration.as_secs(),
            "Client blocked after repeated rate limit violations"
        );

        Some(duration)
    }

    /// Violations retained inside the rolling window, without pruning.
    pub fn violation_count(&self, key: &ClientKey, now: Instant) -> usize {
        self.records
            .get(key)
            .map(|record| {
                record
                    .timestamps
                    .iter()
                    .filter(|&&ts| now.saturating_duration_since(ts) <= self.policy.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Block a key for a fixed duration, replacing any existing block.
    pub fn block(&self, key: &ClientKey, duration: Duration, now: Instant) {
        let mut record = self.records.entry(key.clone()).or_default();
        record.block_until = Some(now + duration);
        info!(key = %key, block_secs = duration.as_secs(), "Client blocked manually");
    }

    /// Lift a block. Returns whether a block was active.
    pub fn unblock(&self, key: &ClientKey, now: Instant) -> bool {
        match self.records.get_mut(key) {
            Some(mut record) => {
                let was_blocked = record.block_remaining(now).is_some();
                record.block_until = None;
                was_blocked
            }
            None => false,
        }
    }

    /// Forget all history for a key.
    pub fn remove(&self, key: &ClientKey) {
        self.records.remove(key);
    }

    /// Clear expired blocks and violations older than `retention`,
    /// dropping keys left with nothing to track.
    pub fn prune(&self, now: Instant, retention: Duration) -> PruneOutcome {
        let mut outcome = PruneOutcome::default();

        self.records.retain(|_, record| {
            if record.block_until.is_some() && record.block_remaining(now).is_none() {
                record.block_until = None;
                outcome.expired_blocks += 1;
            }
            record.prune_older_than(now, retention);

            let keep = !record.timestamps.is_empty() || record.block_until.is_some();
            if !keep {
                outcome.removed_keys += 1;
            }
            keep
        });

        outcome
    }

    /// Number of keys with history or an active block.
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }
}
