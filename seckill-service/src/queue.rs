//! Durable order stream read through consumer groups.
//!
//! Delivery is at-least-once: an entry stays in its group's pending set until
//! acknowledged and can be replayed from there after a crash. Duplicates are
//! absorbed by the order repository, not prevented here.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use shared::OrderMessage;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl QueueEntry {
    pub fn message(&self) -> Result<OrderMessage> {
        OrderMessage::from_fields(&self.fields)
    }
}

#[async_trait]
pub trait OrderQueue: Send + Sync {
    /// Creates the group at the start of the stream. Existing groups are kept.
    async fn create_group(&self, group: &str) -> Result<()>;

    async fn append(&self, message: &OrderMessage) -> Result<String>;

    /// New entries for `consumer`, waiting up to `block` when none are
    /// available. A zero `block` does not wait.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>>;

    /// Entries delivered to `consumer` but not yet acknowledged, oldest first.
    async fn read_pending(&self, group: &str, consumer: &str, max_count: usize) -> Result<Vec<QueueEntry>>;

    async fn ack(&self, group: &str, entry_id: &str) -> Result<()>;

    async fn pending_count(&self, group: &str) -> Result<usize>;
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    next: usize,
    pending: BTreeMap<usize, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<QueueEntry>,
    positions: HashMap<String, usize>,
    groups: HashMap<String, GroupState>,
    last_millis: i64,
}

impl StreamState {
    fn group_mut(&mut self, group: &str) -> Result<&mut GroupState> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| anyhow!("NOGROUP no such consumer group {}", group))
    }

    fn deliver_new(&mut self, group: &str, consumer: &str, max_count: usize) -> Result<Vec<QueueEntry>> {
        let total = self.entries.len();
        let state = self.groups
            .get_mut(group)
            .ok_or_else(|| anyhow!("NOGROUP no such consumer group {}", group))?;

        let end = total.min(state.next + max_count);
        let delivered: Vec<usize> = (state.next..end).collect();
        for position in &delivered {
            state.pending.insert(
                *position,
                PendingEntry {
                    consumer: consumer.to_string(),
                    deliveries: 1,
                },
            );
        }
        state.next = end;
        Ok(delivered.into_iter().map(|p| self.entries[p].clone()).collect())
    }
}

/// Stream kept in process memory. Used in single-node mode and in tests.
#[derive(Debug, Default)]
pub struct MemoryOrderQueue {
    state: Mutex<StreamState>,
    appended: Notify,
}

impl MemoryOrderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Times `entry_id` has been handed out to `group`, if still pending.
    pub fn delivery_count(&self, group: &str, entry_id: &str) -> Option<u32> {
        let state = self.state.lock();
        let position = *state.positions.get(entry_id)?;
        state.groups.get(group)?.pending.get(&position).map(|p| p.deliveries)
    }
}

#[async_trait]
impl OrderQueue for MemoryOrderQueue {
    async fn create_group(&self, group: &str) -> Result<()> {
        self.state.lock().groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn append(&self, message: &OrderMessage) -> Result<String> {
        let id = {
            let mut state = self.state.lock();
            let millis = Utc::now().timestamp_millis().max(state.last_millis);
            state.last_millis = millis;
            let position = state.entries.len();
            let id = format!("{}-{}", millis, position);
            let fields = message
                .to_fields()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            state.entries.push(QueueEntry { id: id.clone(), fields });
            state.positions.insert(id.clone(), position);
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.state.lock().deliver_new(group, consumer, max_count)?;
            if !delivered.is_empty() || block.is_zero() {
                return Ok(delivered);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_pending(&self, group: &str, consumer: &str, max_count: usize) -> Result<Vec<QueueEntry>> {
        let mut state = self.state.lock();
        let group_state = state.group_mut(group)?;
        let positions: Vec<usize> = group_state
            .pending
            .iter_mut()
            .filter(|(_, p)| p.consumer == consumer)
            .take(max_count)
            .map(|(position, p)| {
                p.deliveries += 1;
                *position
            })
            .collect();
        Ok(positions.into_iter().map(|p| state.entries[p].clone()).collect())
    }

    async fn ack(&self, group: &str, entry_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let Some(position) = state.positions.get(entry_id).copied() else {
            return Ok(());
        };
        state.group_mut(group)?.pending.remove(&position);
        Ok(())
    }

    async fn pending_count(&self, group: &str) -> Result<usize> {
        Ok(self.state.lock().group_mut(group)?.pending.len())
    }
}

/// Redis Streams backend: `XADD`, `XREADGROUP` and `XACK` on one stream key.
///
/// `XREADGROUP ... BLOCK` holds its connection until it returns, so blocking
/// reads go through `blocking_conn` and nothing else does. Appends, acks and
/// pending reads use `conn`, which may be shared with other stores.
pub struct RedisStreamQueue {
    conn: ConnectionManager,
    blocking_conn: ConnectionManager,
    stream: String,
}

impl RedisStreamQueue {
    pub fn new(conn: ConnectionManager, blocking_conn: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            conn,
            blocking_conn,
            stream: stream.into(),
        }
    }
}

fn into_entries(reply: Option<StreamReadReply>) -> Vec<QueueEntry> {
    reply
        .map(|r| r.keys)
        .unwrap_or_default()
        .into_iter()
        .flat_map(|key| key.ids)
        .map(|stream_id| {
            let fields = stream_id
                .map
                .iter()
                .filter_map(|(name, value)| {
                    redis::from_redis_value::<String>(value)
                        .ok()
                        .map(|value| (name.clone(), value))
                })
                .collect();
            QueueEntry {
                id: stream_id.id,
                fields,
            }
        })
        .collect()
}

#[async_trait]
impl OrderQueue for RedisStreamQueue {
    async fn create_group(&self, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(&self.stream, group, "0").await;
        match created {
            Ok(()) => {
                info!(stream = %self.stream, group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, message: &OrderMessage) -> Result<String> {
        let mut conn = self.conn.clone();
        let fields = message.to_fields();
        let id: String = conn.xadd(&self.stream, "*", fields.as_slice()).await?;
        Ok(id)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>> {
        let mut conn = self.blocking_conn.clone();
        let mut options = StreamReadOptions::default().group(group, consumer).count(max_count);
        // BLOCK 0 means forever on Redis
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.stream.as_str()], &[">"], &options)
            .await?;
        Ok(into_entries(reply))
    }

    async fn read_pending(&self, group: &str, consumer: &str, max_count: usize) -> Result<Vec<QueueEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default().group(group, consumer).count(max_count);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.stream.as_str()], &["0"], &options)
            .await?;
        Ok(into_entries(reply))
    }

    async fn ack(&self, group: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(&self.stream, group, &[entry_id]).await?;
        Ok(())
    }

    async fn pending_count(&self, group: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(&self.stream, group).await?;
        Ok(reply.count())
    }
}
