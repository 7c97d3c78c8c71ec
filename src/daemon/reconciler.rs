use super::controller::{ProcessController, Reconciled};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default liveness check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically reconciles the tracked daemon against the OS.
pub struct Reconciler {
    controller: Arc<ProcessController>,
    check_interval: Duration,
}

impl Reconciler {
    pub fn new(controller: Arc<ProcessController>) -> Self {
        Self {
            controller,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Runs until `cancel` fires. Each check completes before the next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.check_interval, "Process reconciler started");

        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Reconciled::Exited { pid } = self.controller.reconcile().await {
                info!(pid, "Cleared handle of exited nebula daemon");
            }
        }

        info!("Process reconciler stopped");
    }
}
