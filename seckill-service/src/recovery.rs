//! Replays the consumer's pending set.
//!
//! Entries delivered but never acknowledged (worker crashed, lock busy, store
//! hiccup) sit in the group's pending set. A drain pass re-processes them from
//! the start of that set until it is empty, backing off whenever a whole batch
//! makes no progress.

use shared::{DEFAULT_CONSUMER, ORDER_GROUP};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use crate::error::SeckillError;
use crate::handlers::{Disposition, OrderProcessor};
use crate::queue::OrderQueue;

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub interval: Duration,
    pub backoff: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            group: ORDER_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            batch_size: 10,
            interval: Duration::from_secs(30),
            backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub persisted: usize,
    pub rejected: usize,
    pub retried: usize,
}

pub struct RecoveryLoop {
    queue: Arc<dyn OrderQueue>,
    processor: Arc<OrderProcessor>,
    settings: RecoverySettings,
    trigger: Arc<Notify>,
}

impl RecoveryLoop {
    pub fn new(queue: Arc<dyn OrderQueue>, processor: Arc<OrderProcessor>, settings: RecoverySettings) -> Self {
        Self {
            queue,
            processor,
            settings,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Handle the consumer uses to request an immediate pass.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Drains once at startup, then again on every trigger or interval tick.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(consumer = %self.settings.consumer, "Pending recovery started");

        loop {
            let report = self.drain(&shutdown).await;
            if report != DrainReport::default() {
                info!(
                    persisted = report.persisted,
                    rejected = report.rejected,
                    retried = report.retried,
                    "Pending recovery pass finished"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        info!(consumer = %self.settings.consumer, "Pending recovery stopped");
    }

    /// Processes pending entries until none are left or `shutdown` fires.
    pub async fn drain(&self, shutdown: &CancellationToken) -> DrainReport {
        let mut report = DrainReport::default();

        while !shutdown.is_cancelled() {
            let entries = match self
                .queue
                .read_pending(&self.settings.group, &self.settings.consumer, self.settings.batch_size)
                .await
            {
                Ok(entries) if entries.is_empty() => break,
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "Error reading pending orders");
                    self.pause(shutdown).await;
                    continue;
                }
            };

            let mut progressed = false;
            for entry in &entries {
                match self.processor.process(entry).await {
                    Ok(Disposition::Persisted { .. }) => {
                        report.persisted += 1;
                        progressed = true;
                    }
                    Ok(Disposition::Rejected(_)) => {
                        report.rejected += 1;
                        progressed = true;
                    }
                    Err(SeckillError::LockBusy(key)) => {
                        report.retried += 1;
                        warn!(entry_id = %entry.id, key = %key, "Pending order lock busy");
                    }
                    Err(e) => {
                        report.retried += 1;
                        error!(entry_id = %entry.id, error = %e, "Error processing pending order");
                    }
                }
            }

            if !progressed {
                self.pause(shutdown).await;
            }
        }

        report
    }

    async fn pause(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.settings.backoff) => {}
        }
    }
}
