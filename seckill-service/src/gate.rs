use chrono::{DateTime, Utc};
use shared::{OrderMessage, ReservationOutcome, ReserveCode, ORDER_BIZ_TAG};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use crate::error::{Result, SeckillError};
use crate::id_worker::IdWorker;
use crate::queue::OrderQueue;
use crate::repository::OrderRepository;
use crate::stock::StockStore;

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub enqueue_attempts: u32,
    pub enqueue_backoff: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            enqueue_attempts: 3,
            enqueue_backoff: Duration::from_millis(50),
        }
    }
}

/// Synchronous entry point of a flash sale.
///
/// All coordination between concurrent callers, including the sale window
/// check, happens inside [`StockStore::reserve`]; the gate itself keeps no
/// mutable state, so any number of instances can share one store.
/// A `Reserved` outcome means the order is accepted and queued, not yet
/// durable.
pub struct AdmissionGate {
    stock: Arc<dyn StockStore>,
    queue: Arc<dyn OrderQueue>,
    ids: Arc<IdWorker>,
    settings: GateSettings,
}

impl AdmissionGate {
    pub fn new(
        stock: Arc<dyn StockStore>,
        queue: Arc<dyn OrderQueue>,
        ids: Arc<IdWorker>,
        settings: GateSettings,
    ) -> Self {
        Self {
            stock,
            queue,
            ids,
            settings,
        }
    }

    /// Seeds stock counters and records sale windows for every voucher still
    /// on sale.
    /// Counters that already exist in the fast store are left untouched.
    pub async fn preload(&self, repository: &dyn OrderRepository) -> anyhow::Result<usize> {
        let vouchers = repository.open_vouchers(Utc::now()).await?;
        for voucher in &vouchers {
            let seeded = self.stock.seed(voucher.voucher_id, voucher.stock as i64).await?;
            self.stock.set_window(voucher.voucher_id, voucher.window()).await?;
            info!(voucher_id = voucher.voucher_id, stock = voucher.stock, seeded, "Voucher preloaded");
        }
        Ok(vouchers.len())
    }

    pub async fn reserve(&self, voucher_id: i64, user_id: i64) -> Result<ReservationOutcome> {
        self.reserve_at(voucher_id, user_id, Utc::now()).await
    }

    pub async fn reserve_at(
        &self,
        voucher_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome> {
        let order_id = self.ids.next_id(ORDER_BIZ_TAG);
        let code = self
            .stock
            .reserve(voucher_id, user_id, order_id, now)
            .await
            .map_err(SeckillError::transient)?;

        match code {
            ReserveCode::SoldOut => return Ok(ReservationOutcome::SoldOut),
            ReserveCode::Duplicate => return Ok(ReservationOutcome::AlreadyPurchased),
            ReserveCode::NotStarted => return Ok(ReservationOutcome::NotStarted),
            ReserveCode::Ended => return Ok(ReservationOutcome::Ended),
            ReserveCode::Reserved => {}
        }

        let message = OrderMessage::new(order_id, voucher_id, user_id);
        match self.enqueue(&message).await {
            Ok(entry_id) => {
                info!(order_id, voucher_id, user_id, entry_id = %entry_id, "Reservation accepted");
                Ok(ReservationOutcome::Reserved { order_id })
            }
            Err(e) => {
                self.compensate(&message).await;
                Err(SeckillError::transient(e))
            }
        }
    }

    async fn enqueue(&self, message: &OrderMessage) -> anyhow::Result<String> {
        let attempts = self.settings.enqueue_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.queue.append(message).await {
                Ok(entry_id) => return Ok(entry_id),
                Err(e) if attempt < attempts => {
                    warn!(order_id = message.id, attempt, error = %e, "Enqueue failed, retrying");
                    tokio::time::sleep(self.settings.enqueue_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(order_id = message.id, attempt, error = %e, "Enqueue failed, giving up");
                    return Err(e);
                }
            }
        }
    }

    async fn compensate(&self, message: &OrderMessage) {
        match self
            .stock
            .release(message.voucher_id, message.user_id, message.id)
            .await
        {
            Ok(true) => info!(order_id = message.id, "Reservation rolled back"),
            Ok(false) => warn!(order_id = message.id, "Reservation no longer held, nothing to roll back"),
            Err(e) => error!(
                order_id = message.id,
                voucher_id = message.voucher_id,
                user_id = message.user_id,
                error = %e,
                "Failed to roll back reservation"
            ),
        }
    }
}
