//! Tollgate - In-process Tiered Rate Limiting
//!
//! This crate implements an admission-control component that protects a
//! shared backend from overload and abuse. Requests are checked against
//! per-client, per-tier quotas using a token bucket or sliding window,
//! repeat offenders are temporarily blocked, and a background loop reclaims
//! state for clients that have gone quiet.

pub mod config;
pub mod error;
pub mod guard;
pub mod maintenance;
pub mod ratelimit;

pub use config::TollgateConfig;
pub use error::{Result, TollgateError};
pub use ratelimit::{Decision, RateLimitStatus, RateLimiter, Tier};
