use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const ORDER_STREAM: &str = "stream.orders";
pub const ORDER_GROUP: &str = "g1";
pub const DEFAULT_CONSUMER: &str = "c1";
pub const ORDER_LOCK_PREFIX: &str = "order-lock:";
pub const STOCK_KEY_PREFIX: &str = "seckill:stock:";
pub const PURCHASE_KEY_PREFIX: &str = "seckill:order:";
pub const WINDOW_KEY_PREFIX: &str = "seckill:window:";
pub const ORDER_BIZ_TAG: &str = "order";

pub const FIELD_ID: &str = "id";
pub const FIELD_VOUCHER_ID: &str = "voucherId";
pub const FIELD_USER_ID: &str = "userId";
pub const FIELD_ENQUEUE_TIME: &str = "enqueueTime";

pub fn order_lock_key(user_id: i64) -> String {
    format!("{}{}", ORDER_LOCK_PREFIX, user_id)
}

pub fn stock_key(voucher_id: i64) -> String {
    format!("{}{}", STOCK_KEY_PREFIX, voucher_id)
}

pub fn purchase_key(voucher_id: i64) -> String {
    format!("{}{}", PURCHASE_KEY_PREFIX, voucher_id)
}

pub fn window_key(voucher_id: i64) -> String {
    format!("{}{}", WINDOW_KEY_PREFIX, voucher_id)
}

/// Payload of one entry on the order stream.
///
/// On the wire it is a flat map of field name to string value, which is what
/// stream backends store natively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMessage {
    pub id: i64,
    pub voucher_id: i64,
    pub user_id: i64,
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl OrderMessage {
    pub fn new(id: i64, voucher_id: i64, user_id: i64) -> Self {
        Self {
            id,
            voucher_id,
            user_id,
            enqueued_at: Some(Utc::now()),
        }
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            (FIELD_VOUCHER_ID, self.voucher_id.to_string()),
            (FIELD_USER_ID, self.user_id.to_string()),
            (FIELD_ID, self.id.to_string()),
        ];
        if let Some(at) = self.enqueued_at {
            fields.push((FIELD_ENQUEUE_TIME, at.timestamp_millis().to_string()));
        }
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let id = parse_i64(fields, FIELD_ID)?;
        let voucher_id = parse_i64(fields, FIELD_VOUCHER_ID)?;
        let user_id = parse_i64(fields, FIELD_USER_ID)?;
        let enqueued_at = match fields.get(FIELD_ENQUEUE_TIME) {
            Some(raw) => {
                let millis: i64 = raw
                    .parse()
                    .with_context(|| format!("invalid {}: {:?}", FIELD_ENQUEUE_TIME, raw))?;
                Utc.timestamp_millis_opt(millis).single()
            }
            None => None,
        };

        Ok(Self {
            id,
            voucher_id,
            user_id,
            enqueued_at,
        })
    }
}

fn parse_i64(fields: &HashMap<String, String>, name: &str) -> Result<i64> {
    let raw = fields
        .get(name)
        .ok_or_else(|| anyhow!("missing field {}", name))?;
    raw.parse::<i64>()
        .with_context(|| format!("invalid {}: {:?}", name, raw))
}

/// Result codes returned by the atomic reservation script.
///
/// 0..=2 are the reservation outcomes proper; 3 and 4 come from the sale
/// window check that runs first inside the same script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReserveCode {
    Reserved,
    SoldOut,
    Duplicate,
    NotStarted,
    Ended,
}

impl ReserveCode {
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(ReserveCode::Reserved),
            1 => Ok(ReserveCode::SoldOut),
            2 => Ok(ReserveCode::Duplicate),
            3 => Ok(ReserveCode::NotStarted),
            4 => Ok(ReserveCode::Ended),
            other => Err(anyhow!("unknown reservation code {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationOutcome {
    Reserved { order_id: i64 },
    SoldOut,
    AlreadyPurchased,
    NotStarted,
    Ended,
}

impl ReservationOutcome {
    pub fn order_id(&self) -> Option<i64> {
        match self {
            ReservationOutcome::Reserved { order_id } => Some(*order_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderOutcome {
    Created,
    DuplicateRejected,
    StockExhaustedRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Persisted,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Persisted => "persisted",
        }
    }
}
