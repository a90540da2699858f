//! Core rate limiter implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::backend::{LimitStrategy, StrategyKind};
use super::key::ClientKey;
use super::sliding_window::SlidingWindowLimiter;
use super::tiers::{Tier, TierLimits, TierPolicy};
use super::token_bucket::TokenBucketLimiter;
use super::violations::ViolationTracker;
use crate::config::{FailureMode, TollgateConfig};
use crate::error::{Result, TollgateError};
use crate::maintenance::{MaintenanceLoop, MaintenanceReport, MaintenanceTask};

/// Retry hint returned when fail-closed denies a request after an internal error.
const FAIL_CLOSED_RETRY_AFTER_SECS: u64 = 1;

/// Outcome of a rate limit check.
///
/// A denial is a normal value, not an error. Call sites that want a hard
/// failure use [`Decision::into_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Seconds the caller should wait; always set on a denial
    pub retry_after: Option<u64>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    pub fn deny(retry_after: u64) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }

    pub fn as_tuple(&self) -> (bool, Option<u64>) {
        (self.allowed, self.retry_after)
    }

    /// Convert a denial into [`TollgateError::LimitExceeded`].
    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(TollgateError::LimitExceeded {
                retry_after: self.retry_after.unwrap_or(0),
            })
        }
    }
}

/// Read-only snapshot of a client's rate limit state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub client_id: String,
    pub tier: Tier,
    pub limits: TierLimits,
    /// Capacity available right now: refilled tokens, or free window slots
    pub current_tokens: f64,
    pub is_blocked: bool,
    /// Wall-clock estimate of when an active block ends
    pub blocked_until: Option<DateTime<Utc>>,
    pub violation_count: usize,
    pub strategy: StrategyKind,
}

/// State shared between the request path and the maintenance loop.
struct LimiterState {
    strategy: Box<dyn LimitStrategy>,
    violations: ViolationTracker,
    retention: Duration,
}

impl LimiterState {
    fn prune(&self, now: Instant) -> MaintenanceReport {
        let violations = self.violations.prune(now, self.retention);
        let pruned_idle_clients = self.strategy.prune_idle(now, self.retention);

        MaintenanceReport {
            expired_blocks: violations.expired_blocks,
            pruned_violation_clients: violations.removed_keys,
            pruned_idle_clients,
        }
    }
}

#[async_trait]
impl MaintenanceTask for LimiterState {
    async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        Ok(self.prune(Instant::now()))
    }
}

/// The rate limiter facade.
///
/// Sequences the blocklist check, the configured strategy and violation
/// recording. Construct one per process and share it behind an `Arc`.
/// All per-client state is owned here; callers only see [`Decision`] and
/// [`RateLimitStatus`] values.
pub struct RateLimiter {
    config: TollgateConfig,
    state: Arc<LimiterState>,
    maintenance: Mutex<Option<MaintenanceLoop>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("strategy", &self.state.strategy.kind())
            .field("tracked_clients", &self.tracked_clients())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter from validated configuration.
    pub fn new(config: TollgateConfig) -> Result<Self> {
        config.validate()?;

        let strategy: Box<dyn LimitStrategy> = match config.strategy.effective() {
            StrategyKind::SlidingWindow => Box::new(SlidingWindowLimiter::new(
                config.sliding_window.window_minutes,
            )),
            _ => Box::new(TokenBucketLimiter::new()),
        };

        info!(
            strategy = %strategy.kind(),
            violation_threshold = config.escalation.violation_threshold,
            failure_mode = ?config.failure_mode,
            "Rate limiter initialized"
        );

        let state = Arc::new(LimiterState {
            strategy,
            violations: ViolationTracker::new(config.escalation.policy()),
            retention: config.maintenance.retention(),
        });

        Ok(Self {
            config,
            state,
            maintenance: Mutex::new(None),
        })
    }

    /// Create a rate limiter with default settings.
    pub fn with_defaults() -> Self {
        Self {
            state: Arc::new(LimiterState {
                strategy: Box::new(TokenBucketLimiter::new()),
                violations: ViolationTracker::default(),
                retention: TollgateConfig::default().maintenance.retention(),
            }),
            config: TollgateConfig::default(),
            maintenance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TollgateConfig {
        &self.config
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.config.tiers
    }

    /// The algorithm actually in use.
    pub fn strategy(&self) -> StrategyKind {
        self.state.strategy.kind()
    }

    /// Check whether a request may proceed.
    ///
    /// Never fails: internal errors resolve according to the configured
    /// [`FailureMode`].
    pub fn check_rate_limit(
        &self,
        client_id: &str,
        tier: Tier,
        weight: u32,
        ip_address: Option<IpAddr>,
    ) -> Decision {
        match self.evaluate(client_id, tier, weight, ip_address) {
            Ok(decision) => decision,
            Err(e) => match self.config.failure_mode {
                FailureMode::Open => {
                    error!(client_id = %client_id, error = %e, "Rate limit evaluation failed, allowing request");
                    Decision::allow()
                }
                FailureMode::Closed => {
                    error!(client_id = %client_id, error = %e, "Rate limit evaluation failed, denying request");
                    Decision::deny(FAIL_CLOSED_RETRY_AFTER_SECS)
                }
            },
        }
    }

    /// Like [`check_rate_limit`](Self::check_rate_limit), resolving a tier name first.
    ///
    /// Unknown names fall back to the free tier.
    pub fn check_rate_limit_named(
        &self,
        client_id: &str,
        tier_name: &str,
        weight: u32,
        ip_address: Option<IpAddr>,
    ) -> Decision {
        let tier = self.policy().resolve(tier_name);
        self.check_rate_limit(client_id, tier, weight, ip_address)
    }

    fn evaluate(
        &self,
        client_id: &str,
        tier: Tier,
        weight: u32,
        ip_address: Option<IpAddr>,
    ) -> Result<Decision> {
        if weight == 0 {
            return Err(TollgateError::InvalidWeight(weight));
        }

        let now = Instant::now();
        let key = ClientKey::client(client_id);
        let violations = &self.state.violations;

        trace!(key = %key, tier = %tier, weight = weight, "Checking rate limit");

        if let Some(remaining) = violations.blocked_for(&key, now) {
            let retry_after = whole_seconds(remaining);
            debug!(key = %key, retry_after = retry_after, "Client is blocked");
            return Ok(Decision::deny(retry_after));
        }

        if let Some(ip_key) = ip_address.map(ClientKey::ip) {
            if violations.blocked_for(&ip_key, now).is_some() {
                debug!(key = %key, ip = %ip_key, "IP address is blocked");
                return Ok(Decision::deny(self.config.escalation.ip_block_retry_after_seconds));
            }
        }

        let limits = self.policy().limits(tier);
        let strategy = &self.state.strategy;
        if strategy.check_limit(&key, limits, weight, now)? {
            return Ok(Decision::allow());
        }

        let mut retry_after = strategy.retry_after(&key, limits, now).max(1);
        if let Some(block) = violations.record_violation(&key, now) {
            retry_after = retry_after.max(whole_seconds(block));
        }

        debug!(
            key = %key,
            tier = %tier,
            retry_after = retry_after,
            "Rate limit exceeded"
        );

        Ok(Decision::deny(retry_after))
    }

    /// Snapshot a client's state. Consumes nothing.
    pub fn get_rate_limit_status(&self, client_id: &str, tier: Tier) -> RateLimitStatus {
        let now = Instant::now();
        let key = ClientKey::client(client_id);
        let limits = *self.policy().limits(tier);
        let block_remaining = self.state.violations.blocked_for(&key, now);

        RateLimitStatus {
            client_id: client_id.to_string(),
            tier,
            limits,
            current_tokens: self.state.strategy.available(&key, &limits, now),
            is_blocked: block_remaining.is_some(),
            blocked_until: block_remaining
                .and_then(|remaining| chrono::Duration::from_std(remaining).ok())
                .map(|remaining| Utc::now() + remaining),
            violation_count: self.state.violations.violation_count(&key, now),
            strategy: self.strategy(),
        }
    }

    /// Block a client regardless of its quota.
    pub fn block_client(&self, client_id: &str, duration: Duration) {
        self.state
            .violations
            .block(&ClientKey::client(client_id), duration, Instant::now());
    }

    /// Block every request carrying this address.
    pub fn block_ip(&self, addr: IpAddr, duration: Duration) {
        self.state
            .violations
            .block(&ClientKey::ip(addr), duration, Instant::now());
    }

    /// Lift a client block. Returns whether one was active.
    pub fn unblock_client(&self, client_id: &str) -> bool {
        self.state
            .violations
            .unblock(&ClientKey::client(client_id), Instant::now())
    }

    /// Lift an IP block. Returns whether one was active.
    pub fn unblock_ip(&self, addr: IpAddr) -> bool {
        self.state
            .violations
            .unblock(&ClientKey::ip(addr), Instant::now())
    }

    /// Drop all quota, violation and block state for a client.
    pub fn reset_client(&self, client_id: &str) {
        let key = ClientKey::client(client_id);
        self.state.strategy.remove(&key);
        self.state.violations.remove(&key);
        info!(key = %key, "Rate limit state reset");
    }

    /// Number of keys holding quota or violation state.
    pub fn tracked_clients(&self) -> usize {
        self.state.strategy.tracked_keys() + self.state.violations.tracked_keys()
    }

    /// Run one maintenance pass immediately.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.state.run_maintenance().await
    }

    /// Start the background maintenance loop. Does nothing if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            warn!("Maintenance loop already running");
            return;
        }

        let task: Arc<dyn MaintenanceTask> = self.state.clone();
        *maintenance = Some(MaintenanceLoop::spawn(
            task,
            self.config.maintenance.interval(),
            self.config.maintenance.backoff(),
        ));
    }

    /// Stop the maintenance loop and wait for it to exit.
    pub async fn stop(&self) {
        let maintenance = self.maintenance.lock().take();
        if let Some(maintenance) = maintenance {
            maintenance.shutdown().await;
        }
    }

    /// Whether the maintenance loop is running.
    pub fn is_running(&self) -> bool {
        self.maintenance
            .lock()
            .as_ref()
            .is_some_and(|maintenance| !maintenance.is_finished())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Round a remaining duration up to whole seconds.
fn whole_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
