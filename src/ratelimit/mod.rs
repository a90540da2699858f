//! Rate limiting logic and state management.

mod backend;
mod key;
mod limiter;
mod sliding_window;
mod tiers;
mod token_bucket;
mod violations;

pub use backend::{LimitStrategy, StrategyKind};
pub use key::{ClientKey, IP_KEY_PREFIX};
pub use limiter::{Decision, RateLimitStatus, RateLimiter};
pub use sliding_window::{SlidingWindowLimiter, DEFAULT_WINDOW_MINUTES};
pub use tiers::{Tier, TierLimits, TierPolicy};
pub use token_bucket::TokenBucketLimiter;
pub use violations::{EscalationPolicy, PruneOutcome, ViolationTracker};
