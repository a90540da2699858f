//! Maintenance loop lifecycle.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::MaintenanceTask;

/// Handle to a running maintenance loop.
///
/// The loop runs until [`MaintenanceLoop::shutdown`] is called. Shutdown
/// waits for the task to finish, so no maintenance pass can run afterwards.
pub struct MaintenanceLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
    interval: Duration,
}

impl std::fmt::Debug for MaintenanceLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceLoop")
            .field("interval", &self.interval)
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

impl MaintenanceLoop {
    /// Spawn the loop on the current tokio runtime.
    ///
    /// `task` runs every `interval`. A failed or panicking pass is logged and
    /// followed by a `backoff` pause before the schedule resumes.
    pub fn spawn(task: Arc<dyn MaintenanceTask>, interval: Duration, backoff: Duration) -> Self {
        let token = CancellationToken::new();
        let shutdown = token.clone();

        let handle = tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                backoff_secs = backoff.as_secs(),
                "Maintenance loop started"
            );

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let outcome = AssertUnwindSafe(task.run_maintenance())
                    .catch_unwind()
                    .await;

                let failure = match outcome {
                    Ok(Ok(report)) => {
                        debug!(
                            expired_blocks = report.expired_blocks,
                            pruned_violation_clients = report.pruned_violation_clients,
                            pruned_idle_clients = report.pruned_idle_clients,
                            "Maintenance pass completed"
                        );
                        None
                    }
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(panic) => Some(panic_message(panic.as_ref())),
                };

                if let Some(reason) = failure {
                    error!(
                        error = %reason,
                        backoff_secs = backoff.as_secs(),
                        "Maintenance pass failed, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    ticker.reset();
                }
            }

            info!("Maintenance loop stopped");
        });

        Self {
            token,
            handle,
            interval,
        }
    }

    /// Whether the loop task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!(error = %e, "Maintenance loop panicked during shutdown");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic: <non-string payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TollgateError};
    use crate::maintenance::MaintenanceReport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTask {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl MaintenanceTask for CountingTask {
        async fn run_maintenance(&self) -> Result<MaintenanceReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(MaintenanceReport::default())
        }
    }

    /// Fails on the first pass, succeeds afterwards.
    #[derive(Default)]
    struct FlakyTask {
        runs: AtomicUsize,
        panic_first: bool,
    }

    #[async_trait]
    impl MaintenanceTask for FlakyTask {
        async fn run_maintenance(&self) -> Result<MaintenanceReport> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run == 0 {
                if self.panic_first {
                    panic!("state corrupted");
                }
                return Err(TollgateError::Maintenance("store unavailable".to_string()));
            }
            Ok(MaintenanceReport::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval() {
        let task = Arc::new(CountingTask::default());
        let worker = MaintenanceLoop::spawn(task.clone(), Duration::from_secs(300), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);

        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backs_off_after_error() {
        let task = Arc::new(FlakyTask::default());
        let worker = MaintenanceLoop::spawn(task.clone(), Duration::from_secs(10), Duration::from_secs(60));

        // First pass at t=10 fails; backoff until t=70, next pass at t=80.
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert!(!worker.is_finished());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);

        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_survives_panicking_pass() {
        let task = Arc::new(FlakyTask {
            panic_first: true,
            ..Default::default()
        });
        let worker = MaintenanceLoop::spawn(task.clone(), Duration::from_secs(10), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(85)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);
        assert!(!worker.is_finished());

        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_further_passes() {
        let task = Arc::new(CountingTask::default());
        let worker = MaintenanceLoop::spawn(task.clone(), Duration::from_secs(5), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(6)).await;
        worker.shutdown().await;
        let runs = task.runs.load(Ordering::SeqCst);
        assert_eq!(runs, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), runs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let task = Arc::new(FlakyTask::default());
        let worker = MaintenanceLoop::spawn(task.clone(), Duration::from_secs(1), Duration::from_secs(3600));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);

        // Must return promptly rather than waiting out the backoff.
        tokio::time::timeout(Duration::from_secs(1), worker.shutdown())
            .await
            .expect("shutdown should not wait for the backoff");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "panic: boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "panic: bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "panic: <non-string payload>");
    }
}
