//! Background maintenance for rate limit state.
//!
//! Per-client state is created lazily on the request path and never removed
//! there. The maintenance loop periodically reclaims memory held by idle
//! clients, lapsed blocks and aged-out violation history.

mod worker;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

pub use worker::MaintenanceLoop;

/// What a single maintenance pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Blocks whose deadline had passed
    pub expired_blocks: usize,
    /// Keys whose violation history aged out entirely
    pub pruned_violation_clients: usize,
    /// Keys whose limiter state had been idle past the retention horizon
    pub pruned_idle_clients: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == MaintenanceReport::default()
    }
}

/// Work performed on every maintenance tick.
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    /// Run one maintenance pass.
    async fn run_maintenance(&self) -> Result<MaintenanceReport>;
}
