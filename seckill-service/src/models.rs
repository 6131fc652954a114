use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::OrderStatus;

#[derive(Debug, Clone, PartialEq, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::seckill_voucher)]
#[serde(rename_all = "camelCase")]
pub struct SeckillVoucher {
    pub voucher_id: i64,
    pub stock: i32,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = crate::schema::seckill_voucher)]
#[serde(rename_all = "camelCase")]
pub struct NewSeckillVoucher {
    pub voucher_id: i64,
    pub stock: i32,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SeckillVoucher {
    pub fn window(&self) -> SaleWindow {
        SaleWindow {
            begin: self.begin_time,
            end: self.end_time,
        }
    }
}

impl NewSeckillVoucher {
    pub fn window(&self) -> SaleWindow {
        SaleWindow {
            begin: self.begin_time,
            end: self.end_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaleWindow {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::voucher_order)]
#[serde(rename_all = "camelCase")]
pub struct VoucherOrder {
    pub id: i64,
    pub user_id: i64,
    pub voucher_id: i64,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::voucher_order)]
pub struct NewVoucherOrder {
    pub id: i64,
    pub user_id: i64,
    pub voucher_id: i64,
    pub status: String,
}

impl NewVoucherOrder {
    pub fn persisted(id: i64, voucher_id: i64, user_id: i64) -> Self {
        Self {
            id,
            user_id,
            voucher_id,
            status: OrderStatus::Persisted.as_str().to_string(),
        }
    }
}

impl From<NewVoucherOrder> for VoucherOrder {
    fn from(order: NewVoucherOrder) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            voucher_id: order.voucher_id,
            status: order.status,
            created_at: Some(Utc::now()),
        }
    }
}

impl From<NewSeckillVoucher> for SeckillVoucher {
    fn from(voucher: NewSeckillVoucher) -> Self {
        let now = Utc::now();
        Self {
            voucher_id: voucher.voucher_id,
            stock: voucher.stock,
            begin_time: voucher.begin_time,
            end_time: voucher.end_time,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }
}
