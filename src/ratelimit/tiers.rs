//! Subscription tiers and their quota parameters.
//!
//! Tiers form a closed set. Callers that only have a tier *name* go through
//! [`TierPolicy::resolve`], which maps unknown names to [`Tier::Free`] and
//! logs the miss so a misspelled tier is visible in the logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::{Result, TollgateError};

/// A named class of client with its own quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Premium,
    Enterprise,
}

impl Tier {
    /// Every known tier, in ascending order of quota.
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Premium, Tier::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "premium" => Ok(Tier::Premium),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(TollgateError::UnknownTier(s.to_string())),
        }
    }
}

/// Quota parameters for a single tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Sustained rate; also the token refill rate. Zero means the burst never refills.
    pub requests_per_minute: u32,
    /// Limit for sliding windows longer than one minute
    pub requests_per_hour: u32,
    /// Daily allowance, reported in status snapshots
    pub requests_per_day: u32,
    /// Token bucket capacity
    pub burst_size: u32,
}

impl TierLimits {
    pub const fn new(
        requests_per_minute: u32,
        requests_per_hour: u32,
        requests_per_day: u32,
        burst_size: u32,
    ) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
            requests_per_day,
            burst_size,
        }
    }

    /// Token refill rate.
    pub fn tokens_per_second(&self) -> f64 {
        self.requests_per_minute as f64 / 60.0
    }

    /// Request limit for a trailing window of the given size.
    ///
    /// One-minute windows use the per-minute limit, anything else the hourly one.
    pub fn window_limit(&self, window_minutes: u32) -> u32 {
        if window_minutes == 1 {
            self.requests_per_minute
        } else {
            self.requests_per_hour
        }
    }

    fn validate(&self, tier: Tier) -> Result<()> {
        if self.burst_size == 0 {
            return Err(TollgateError::Config(format!(
                "tier '{}' must have a non-zero burst_size",
                tier
            )));
        }
        Ok(())
    }
}

/// Static table mapping each tier to its limits.
///
/// Built once from configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    #[serde(default = "default_free")]
    pub free: TierLimits,
    #[serde(default = "default_premium")]
    pub premium: TierLimits,
    #[serde(default = "default_enterprise")]
    pub enterprise: TierLimits,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            free: default_free(),
            premium: default_premium(),
            enterprise: default_enterprise(),
        }
    }
}

fn default_free() -> TierLimits {
    TierLimits::new(60, 1_000, 10_000, 10)
}

fn default_premium() -> TierLimits {
    TierLimits::new(300, 10_000, 100_000, 50)
}

fn default_enterprise() -> TierLimits {
    TierLimits::new(1_000, 50_000, 1_000_000, 200)
}

impl TierPolicy {
    /// Get the limits for a tier.
    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Premium => &self.premium,
            Tier::Enterprise => &self.enterprise,
        }
    }

    /// Resolve a tier name, falling back to the free tier for unknown names.
    pub fn resolve(&self, name: &str) -> Tier {
        match name.parse() {
            Ok(tier) => tier,
            Err(_) => {
                warn!(tier = %name, fallback = %Tier::Free, "Unknown tier, using fallback limits");
                Tier::Free
            }
        }
    }

    /// Check every tier has usable limits.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            self.limits(tier).validate(tier)?;
        }
        Ok(())
    }
}
