//! Authoritative vouchers and orders.
//!
//! `create_order` is the idempotent writer behind the consumer: it re-checks
//! one-order-per-user and decrements stock under a `stock > 0` guard inside a
//! single transaction, so replays and races never produce a second row or a
//! negative count.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use parking_lot::Mutex;
use shared::OrderOutcome;
use std::collections::HashMap;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create_order(&self, voucher_id: i64, user_id: i64, order_id: i64) -> Result<OrderOutcome>;

    async fn find_order(&self, voucher_id: i64, user_id: i64) -> Result<Option<VoucherOrder>>;

    async fn order_count(&self, voucher_id: i64) -> Result<i64>;

    /// Returns false when the voucher already exists.
    async fn add_voucher(&self, voucher: NewSeckillVoucher) -> Result<bool>;

    async fn find_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>>;

    /// Vouchers whose sale window has not ended at `now`.
    async fn open_vouchers(&self, now: DateTime<Utc>) -> Result<Vec<SeckillVoucher>>;
}

pub struct PgOrderRepository {
    pool: DbPool,
}

impl PgOrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn create_order(&self, voucher_id: i64, user_id: i64, order_id: i64) -> Result<OrderOutcome> {
        let mut conn = self.pool.get().await?;

        let outcome = conn
            .transaction::<_, DieselError, _>(|conn| {
                Box::pin(async move {
                    let existing: i64 = voucher_order::table
                        .filter(voucher_order::voucher_id.eq(voucher_id))
                        .filter(voucher_order::user_id.eq(user_id))
                        .count()
                        .get_result(conn)
                        .await?;
                    if existing > 0 {
                        return Ok(OrderOutcome::DuplicateRejected);
                    }

                    let updated = diesel::update(
                        seckill_voucher::table
                            .filter(seckill_voucher::voucher_id.eq(voucher_id))
                            .filter(seckill_voucher::stock.gt(0)),
                    )
                    .set((
                        seckill_voucher::stock.eq(seckill_voucher::stock - 1),
                        seckill_voucher::updated_at.eq(Some(Utc::now())),
                    ))
                    .execute(conn)
                    .await?;
                    if updated == 0 {
                        return Ok(OrderOutcome::StockExhaustedRejected);
                    }

                    diesel::insert_into(voucher_order::table)
                        .values(&NewVoucherOrder::persisted(order_id, voucher_id, user_id))
                        .execute(conn)
                        .await?;

                    Ok(OrderOutcome::Created)
                })
            })
            .await;

        match outcome {
            Ok(outcome) => Ok(outcome),
            // a concurrent writer won the (voucher_id, user_id) constraint
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                Ok(OrderOutcome::DuplicateRejected)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_order(&self, voucher_id: i64, user_id: i64) -> Result<Option<VoucherOrder>> {
        let mut conn = self.pool.get().await?;
        let order = voucher_order::table
            .filter(voucher_order::voucher_id.eq(voucher_id))
            .filter(voucher_order::user_id.eq(user_id))
            .first::<VoucherOrder>(&mut conn)
            .await
            .optional()?;
        Ok(order)
    }

    async fn order_count(&self, voucher_id: i64) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let count = voucher_order::table
            .filter(voucher_order::voucher_id.eq(voucher_id))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count)
    }

    async fn add_voucher(&self, voucher: NewSeckillVoucher) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let inserted = diesel::insert_into(seckill_voucher::table)
            .values(&voucher)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn find_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>> {
        let mut conn = self.pool.get().await?;
        let voucher = seckill_voucher::table
            .filter(seckill_voucher::voucher_id.eq(voucher_id))
            .first::<SeckillVoucher>(&mut conn)
            .await
            .optional()?;
        Ok(voucher)
    }

    async fn open_vouchers(&self, now: DateTime<Utc>) -> Result<Vec<SeckillVoucher>> {
        let mut conn = self.pool.get().await?;
        let vouchers = seckill_voucher::table
            .filter(seckill_voucher::end_time.gt(now))
            .order(seckill_voucher::voucher_id.asc())
            .load::<SeckillVoucher>(&mut conn)
            .await?;
        Ok(vouchers)
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    vouchers: HashMap<i64, SeckillVoucher>,
    orders: HashMap<(i64, i64), VoucherOrder>,
}

/// Same semantics as the Postgres repository, one mutex standing in for the
/// transaction.
#[derive(Debug, Default)]
pub struct MemoryOrderRepository {
    tables: Mutex<MemoryTables>,
}

impl MemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orders(&self) -> Vec<VoucherOrder> {
        let mut orders: Vec<VoucherOrder> = self.tables.lock().orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }
}

#[async_trait]
impl OrderRepository for MemoryOrderRepository {
    async fn create_order(&self, voucher_id: i64, user_id: i64, order_id: i64) -> Result<OrderOutcome> {
        let mut tables = self.tables.lock();
        if tables.orders.contains_key(&(voucher_id, user_id)) {
            return Ok(OrderOutcome::DuplicateRejected);
        }

        let Some(voucher) = tables
            .vouchers
            .get_mut(&voucher_id)
            .filter(|v| v.stock > 0)
        else {
            return Ok(OrderOutcome::StockExhaustedRejected);
        };
        voucher.stock -= 1;
        voucher.updated_at = Some(Utc::now());

        tables.orders.insert(
            (voucher_id, user_id),
            NewVoucherOrder::persisted(order_id, voucher_id, user_id).into(),
        );
        Ok(OrderOutcome::Created)
    }

    async fn find_order(&self, voucher_id: i64, user_id: i64) -> Result<Option<VoucherOrder>> {
        Ok(self.tables.lock().orders.get(&(voucher_id, user_id)).cloned())
    }

    async fn order_count(&self, voucher_id: i64) -> Result<i64> {
        let tables = self.tables.lock();
        Ok(tables.orders.keys().filter(|(v, _)| *v == voucher_id).count() as i64)
    }

    async fn add_voucher(&self, voucher: NewSeckillVoucher) -> Result<bool> {
        let mut tables = self.tables.lock();
        if tables.vouchers.contains_key(&voucher.voucher_id) {
            return Ok(false);
        }
        tables.vouchers.insert(voucher.voucher_id, voucher.into());
        Ok(true)
    }

    async fn find_voucher(&self, voucher_id: i64) -> Result<Option<SeckillVoucher>> {
        Ok(self.tables.lock().vouchers.get(&voucher_id).cloned())
    }

    async fn open_vouchers(&self, now: DateTime<Utc>) -> Result<Vec<SeckillVoucher>> {
        let mut vouchers: Vec<SeckillVoucher> = self
            .tables
            .lock()
            .vouchers
            .values()
            .filter(|v| v.end_time > now)
            .cloned()
            .collect();
        vouchers.sort_by_key(|v| v.voucher_id);
        Ok(vouchers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn voucher(voucher_id: i64, stock: i32) -> NewSeckillVoucher {
        let now = Utc::now();
        NewSeckillVoucher {
            voucher_id,
            stock,
            begin_time: now - Duration::hours(1),
            end_time: now + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn creates_one_order_and_decrements_stock() {
        let repo = MemoryOrderRepository::new();
        repo.add_voucher(voucher(1, 3)).await.unwrap();

        assert_eq!(repo.create_order(1, 10, 500).await.unwrap(), OrderOutcome::Created);

        let order = repo.find_order(1, 10).await.unwrap().unwrap();
        assert_eq!(order.id, 500);
        assert_eq!(order.status, "persisted");
        assert_eq!(repo.find_voucher(1).await.unwrap().unwrap().stock, 2);
    }

    #[tokio::test]
    async fn replayed_order_is_rejected_without_side_effects() {
        let repo = MemoryOrderRepository::new();
        repo.add_voucher(voucher(1, 3)).await.unwrap();

        repo.create_order(1, 10, 500).await.unwrap();
        assert_eq!(
            repo.create_order(1, 10, 500).await.unwrap(),
            OrderOutcome::DuplicateRejected
        );
        assert_eq!(
            repo.create_order(1, 10, 501).await.unwrap(),
            OrderOutcome::DuplicateRejected
        );
        assert_eq!(repo.order_count(1).await.unwrap(), 1);
        assert_eq!(repo.find_voucher(1).await.unwrap().unwrap().stock, 2);
    }

    #[tokio::test]
    async fn exhausted_stock_is_rejected() {
        let repo = MemoryOrderRepository::new();
        repo.add_voucher(voucher(1, 1)).await.unwrap();

        repo.create_order(1, 10, 500).await.unwrap();
        assert_eq!(
            repo.create_order(1, 11, 501).await.unwrap(),
            OrderOutcome::StockExhaustedRejected
        );
        assert_eq!(
            repo.create_order(99, 11, 502).await.unwrap(),
            OrderOutcome::StockExhaustedRejected
        );
        assert_eq!(repo.find_voucher(1).await.unwrap().unwrap().stock, 0);
        assert_eq!(repo.orders().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_voucher_is_not_overwritten() {
        let repo = MemoryOrderRepository::new();
        assert!(repo.add_voucher(voucher(1, 3)).await.unwrap());
        assert!(!repo.add_voucher(voucher(1, 100)).await.unwrap());
        assert_eq!(repo.find_voucher(1).await.unwrap().unwrap().stock, 3);
    }

    #[tokio::test]
    async fn ended_vouchers_are_not_open() {
        let repo = MemoryOrderRepository::new();
        let now = Utc::now();
        repo.add_voucher(voucher(1, 3)).await.unwrap();
        repo.add_voucher(NewSeckillVoucher {
            voucher_id: 2,
            stock: 3,
            begin_time: now - Duration::hours(3),
            end_time: now - Duration::hours(2),
        })
        .await
        .unwrap();

        let open: Vec<i64> = repo
            .open_vouchers(now)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.voucher_id)
            .collect();
        assert_eq!(open, vec![1]);
    }

    #[tokio::test]
    async fn concurrent_writers_never_exceed_stock() {
        let repo = Arc::new(MemoryOrderRepository::new());
        repo.add_voucher(voucher(1, 10)).await.unwrap();

        let tasks: Vec<_> = (0..40)
            .map(|user| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.create_order(1, user % 20, 1_000 + user).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(repo.order_count(1).await.unwrap(), 10);
        assert_eq!(repo.find_voucher(1).await.unwrap().unwrap().stock, 0);
    }
}
