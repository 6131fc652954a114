//! Fast-path stock counters and purchase records.
//!
//! The window-check-decrement-record sequence is a single primitive of the
//! backing store: a Lua script on Redis, one critical section in memory.
//! Nothing outside a `StockStore` ever reads a counter and writes it back.
//! Sale windows live next to the counters so every instance sharing the store
//! enforces the same window.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use shared::{purchase_key, stock_key, window_key, ReserveCode};
use std::collections::HashMap;
use crate::models::SaleWindow;

const SECKILL_SCRIPT: &str = include_str!("scripts/seckill.lua");
const RELEASE_SCRIPT: &str = include_str!("scripts/release.lua");

#[async_trait]
pub trait StockStore: Send + Sync {
    /// Sets the counter unless one already exists. Returns whether it was set.
    async fn seed(&self, voucher_id: i64, stock: i64) -> Result<bool>;

    /// Records the sale window checked by `reserve`. Overwrites any previous one.
    async fn set_window(&self, voucher_id: i64, window: SaleWindow) -> Result<()>;

    async fn reserve(
        &self,
        voucher_id: i64,
        user_id: i64,
        order_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ReserveCode>;

    /// Undoes a reservation that still belongs to `order_id`.
    async fn release(&self, voucher_id: i64, user_id: i64, order_id: i64) -> Result<bool>;

    async fn remaining(&self, voucher_id: i64) -> Result<Option<i64>>;

    /// Order id recorded for the user's reservation, if any.
    async fn purchase_of(&self, voucher_id: i64, user_id: i64) -> Result<Option<i64>>;
}

#[derive(Debug, Default)]
struct VoucherStock {
    remaining: i64,
    purchases: HashMap<i64, i64>,
}

#[derive(Debug, Default)]
pub struct MemoryStockStore {
    vouchers: Mutex<HashMap<i64, VoucherStock>>,
    windows: Mutex<HashMap<i64, SaleWindow>>,
}

impl MemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StockStore for MemoryStockStore {
    async fn seed(&self, voucher_id: i64, stock: i64) -> Result<bool> {
        let mut vouchers = self.vouchers.lock();
        if vouchers.contains_key(&voucher_id) {
            return Ok(false);
        }
        vouchers.insert(
            voucher_id,
            VoucherStock {
                remaining: stock,
                purchases: HashMap::new(),
            },
        );
        Ok(true)
    }

    async fn set_window(&self, voucher_id: i64, window: SaleWindow) -> Result<()> {
        self.windows.lock().insert(voucher_id, window);
        Ok(())
    }

    async fn reserve(
        &self,
        voucher_id: i64,
        user_id: i64,
        order_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ReserveCode> {
        if let Some(window) = self.windows.lock().get(&voucher_id).copied() {
            if now < window.begin {
                return Ok(ReserveCode::NotStarted);
            }
            if now >= window.end {
                return Ok(ReserveCode::Ended);
            }
        }

        let mut vouchers = self.vouchers.lock();
        let Some(voucher) = vouchers.get_mut(&voucher_id) else {
            return Ok(ReserveCode::SoldOut);
        };
        if voucher.remaining <= 0 {
            return Ok(ReserveCode::SoldOut);
        }
        if voucher.purchases.contains_key(&user_id) {
            return Ok(ReserveCode::Duplicate);
        }
        voucher.remaining -= 1;
        voucher.purchases.insert(user_id, order_id);
        Ok(ReserveCode::Reserved)
    }

    async fn release(&self, voucher_id: i64, user_id: i64, order_id: i64) -> Result<bool> {
        let mut vouchers = self.vouchers.lock();
        let Some(voucher) = vouchers.get_mut(&voucher_id) else {
            return Ok(false);
        };
        if voucher.purchases.get(&user_id) != Some(&order_id) {
            return Ok(false);
        }
        voucher.purchases.remove(&user_id);
        voucher.remaining += 1;
        Ok(true)
    }

    async fn remaining(&self, voucher_id: i64) -> Result<Option<i64>> {
        Ok(self.vouchers.lock().get(&voucher_id).map(|v| v.remaining))
    }

    async fn purchase_of(&self, voucher_id: i64, user_id: i64) -> Result<Option<i64>> {
        Ok(self
            .vouchers
            .lock()
            .get(&voucher_id)
            .and_then(|v| v.purchases.get(&user_id).copied()))
    }
}

pub struct RedisStockStore {
    conn: ConnectionManager,
    reserve_script: Script,
    release_script: Script,
}

impl RedisStockStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            reserve_script: Script::new(SECKILL_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl StockStore for RedisStockStore {
    async fn seed(&self, voucher_id: i64, stock: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: bool = conn.set_nx(stock_key(voucher_id), stock).await?;
        Ok(set)
    }

    async fn set_window(&self, voucher_id: i64, window: SaleWindow) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                window_key(voucher_id),
                &[
                    ("begin", window.begin.timestamp_millis()),
                    ("end", window.end.timestamp_millis()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn reserve(
        &self,
        voucher_id: i64,
        user_id: i64,
        order_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ReserveCode> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .reserve_script
            .key(stock_key(voucher_id))
            .key(purchase_key(voucher_id))
            .key(window_key(voucher_id))
            .arg(voucher_id.to_string())
            .arg(user_id.to_string())
            .arg(order_id.to_string())
            .arg(now.timestamp_millis().to_string())
            .invoke_async(&mut conn)
            .await?;
        ReserveCode::from_code(code)
    }

    async fn release(&self, voucher_id: i64, user_id: i64, order_id: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release_script
            .key(stock_key(voucher_id))
            .key(purchase_key(voucher_id))
            .arg(user_id.to_string())
            .arg(order_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn remaining(&self, voucher_id: i64) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let remaining: Option<i64> = conn.get(stock_key(voucher_id)).await?;
        Ok(remaining)
    }

    async fn purchase_of(&self, voucher_id: i64, user_id: i64) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let order_id: Option<i64> = conn.hget(purchase_key(voucher_id), user_id).await?;
        Ok(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn seed_does_not_overwrite_existing_counter() {
        let store = MemoryStockStore::new();
        assert!(store.seed(1, 10).await.unwrap());
        store.reserve(1, 100, 9001, Utc::now()).await.unwrap();
        assert!(!store.seed(1, 10).await.unwrap());
        assert_eq!(store.remaining(1).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn unknown_voucher_is_sold_out() {
        let store = MemoryStockStore::new();
        assert_eq!(store.reserve(404, 1, 1, Utc::now()).await.unwrap(), ReserveCode::SoldOut);
        assert_eq!(store.remaining(404).await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_reservation_by_same_user_is_duplicate() {
        let store = MemoryStockStore::new();
        store.seed(1, 5).await.unwrap();

        assert_eq!(store.reserve(1, 7, 100, Utc::now()).await.unwrap(), ReserveCode::Reserved);
        assert_eq!(store.reserve(1, 7, 101, Utc::now()).await.unwrap(), ReserveCode::Duplicate);
        assert_eq!(store.remaining(1).await.unwrap(), Some(4));
        assert_eq!(store.purchase_of(1, 7).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn sold_out_is_checked_before_duplicate() {
        let store = MemoryStockStore::new();
        store.seed(1, 1).await.unwrap();

        store.reserve(1, 7, 100, Utc::now()).await.unwrap();
        assert_eq!(store.reserve(1, 7, 101, Utc::now()).await.unwrap(), ReserveCode::SoldOut);
        assert_eq!(store.reserve(1, 8, 102, Utc::now()).await.unwrap(), ReserveCode::SoldOut);
        assert_eq!(store.remaining(1).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn release_only_undoes_matching_order() {
        let store = MemoryStockStore::new();
        store.seed(1, 2).await.unwrap();
        store.reserve(1, 7, 100, Utc::now()).await.unwrap();

        assert!(!store.release(1, 7, 999).await.unwrap());
        assert!(store.release(1, 7, 100).await.unwrap());
        assert!(!store.release(1, 7, 100).await.unwrap());
        assert_eq!(store.remaining(1).await.unwrap(), Some(2));
        assert_eq!(store.purchase_of(1, 7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn window_is_checked_before_stock() {
        let store = MemoryStockStore::new();
        store.seed(1, 5).await.unwrap();
        let begin = Utc::now();
        let window = SaleWindow {
            begin,
            end: begin + chrono::Duration::hours(1),
        };
        store.set_window(1, window).await.unwrap();

        let early = begin - chrono::Duration::seconds(1);
        assert_eq!(store.reserve(1, 7, 100, early).await.unwrap(), ReserveCode::NotStarted);
        assert_eq!(store.reserve(1, 7, 100, window.end).await.unwrap(), ReserveCode::Ended);
        assert_eq!(store.remaining(1).await.unwrap(), Some(5));
        assert_eq!(store.purchase_of(1, 7).await.unwrap(), None);
        assert_eq!(store.reserve(1, 7, 100, begin).await.unwrap(), ReserveCode::Reserved);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_oversell() {
        let store = Arc::new(MemoryStockStore::new());
        store.seed(1, 50).await.unwrap();

        let tasks: Vec<_> = (0..200)
            .map(|user| {
                let store = store.clone();
                tokio::spawn(async move { store.reserve(1, user, 10_000 + user, Utc::now()).await.unwrap() })
            })
            .collect();

        let mut reserved = 0;
        for task in tasks {
            if task.await.unwrap() == ReserveCode::Reserved {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 50);
        assert_eq!(store.remaining(1).await.unwrap(), Some(0));
    }
}
