use shared::{order_lock_key, OrderOutcome, DEFAULT_CONSUMER, ORDER_GROUP};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use crate::error::{Result, SeckillError};
use crate::lock::DistributedLock;
use crate::queue::{OrderQueue, QueueEntry};
use crate::repository::OrderRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Duplicate,
    StockExhausted,
    Malformed,
}

/// What happened to an entry that was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Persisted { order_id: i64 },
    Rejected(Rejection),
}

/// Turns one delivered entry into at most one order row.
///
/// Delivered → locked on `order-lock:{userId}` → persisted or rejected →
/// lock released → acknowledged. Errors leave the entry unacknowledged in the
/// pending set: `LockBusy` when another worker holds the user's lock,
/// `TransientStoreFailure` for lock, repository or ack failures.
pub struct OrderProcessor {
    queue: Arc<dyn OrderQueue>,
    locks: DistributedLock,
    repository: Arc<dyn OrderRepository>,
    group: String,
    lock_wait: Duration,
}

impl OrderProcessor {
    pub fn new(
        queue: Arc<dyn OrderQueue>,
        locks: DistributedLock,
        repository: Arc<dyn OrderRepository>,
        group: impl Into<String>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            queue,
            locks,
            repository,
            group: group.into(),
            lock_wait,
        }
    }

    pub async fn process(&self, entry: &QueueEntry) -> Result<Disposition> {
        let message = match entry.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Discarding malformed order entry");
                self.acknowledge(entry).await?;
                return Ok(Disposition::Rejected(Rejection::Malformed));
            }
        };

        let key = order_lock_key(message.user_id);
        let written = self
            .locks
            .with_lock(
                &key,
                self.lock_wait,
                self.repository
                    .create_order(message.voucher_id, message.user_id, message.id),
            )
            .await
            .map_err(SeckillError::transient)?;

        let outcome = match written {
            Some(result) => result.map_err(SeckillError::transient)?,
            None => return Err(SeckillError::LockBusy(key)),
        };

        let disposition = match outcome {
            OrderOutcome::Created => {
                info!(
                    order_id = message.id,
                    voucher_id = message.voucher_id,
                    user_id = message.user_id,
                    "Order persisted"
                );
                Disposition::Persisted { order_id: message.id }
            }
            OrderOutcome::DuplicateRejected => {
                warn!(
                    order_id = message.id,
                    voucher_id = message.voucher_id,
                    user_id = message.user_id,
                    "Duplicate order rejected at persistence"
                );
                Disposition::Rejected(Rejection::Duplicate)
            }
            OrderOutcome::StockExhaustedRejected => {
                warn!(
                    order_id = message.id,
                    voucher_id = message.voucher_id,
                    user_id = message.user_id,
                    "Stock exhausted at persistence"
                );
                Disposition::Rejected(Rejection::StockExhausted)
            }
        };

        self.acknowledge(entry).await?;
        Ok(disposition)
    }

    async fn acknowledge(&self, entry: &QueueEntry) -> Result<()> {
        self.queue
            .ack(&self.group, &entry.id)
            .await
            .map_err(SeckillError::transient)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub failure_backoff: Duration,
    /// Consecutive transient failures before a recovery pass is requested.
    pub failure_threshold: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group: ORDER_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER.to_string(),
            batch_size: 1,
            block: Duration::from_secs(2),
            failure_backoff: Duration::from_millis(500),
            failure_threshold: 3,
        }
    }
}

/// Long-lived reader of new entries on the order stream.
pub struct OrderConsumer {
    queue: Arc<dyn OrderQueue>,
    processor: Arc<OrderProcessor>,
    settings: ConsumerSettings,
    recovery: Arc<Notify>,
}

impl OrderConsumer {
    pub fn new(
        queue: Arc<dyn OrderQueue>,
        processor: Arc<OrderProcessor>,
        settings: ConsumerSettings,
        recovery: Arc<Notify>,
    ) -> Self {
        Self {
            queue,
            processor,
            settings,
            recovery,
        }
    }

    /// Polls until `shutdown` fires. An entry already being processed is
    /// finished before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            "Order consumer started"
        );
        let mut failures = 0u32;

        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = self.queue.read_group(
                    &self.settings.group,
                    &self.settings.consumer,
                    self.settings.batch_size,
                    self.settings.block,
                ) => read,
            };

            match read {
                Ok(entries) => {
                    for entry in entries {
                        match self.processor.process(&entry).await {
                            Ok(_) => failures = 0,
                            Err(SeckillError::LockBusy(key)) => {
                                warn!(entry_id = %entry.id, key = %key, "Order lock busy, leaving entry pending");
                                self.recovery.notify_one();
                            }
                            Err(e) => {
                                error!(entry_id = %entry.id, error = %e, "Error processing order entry");
                                failures += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error reading order stream");
                    failures += 1;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.failure_backoff) => {}
                    }
                }
            }

            if failures >= self.settings.failure_threshold.max(1) {
                warn!(failures, "Repeated failures, requesting pending recovery");
                self.recovery.notify_one();
                failures = 0;
            }
        }

        info!(consumer = %self.settings.consumer, "Order consumer stopped");
    }
}

/// Waits for every worker, logging the ones that panicked or were aborted.
/// Returns how many failed.
pub async fn join_workers(workers: Vec<(&'static str, JoinHandle<()>)>) -> usize {
    let mut failed = 0;
    for (worker, handle) in workers {
        if let Err(e) = handle.await {
            error!(worker, error = %e, "Worker task failed");
            failed += 1;
        }
    }
    failed
}
