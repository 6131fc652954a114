//! Time-ordered 64-bit order ids.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! 0 | 31 bits seconds since EPOCH | 10 bits worker id | 22 bits sequence
//! ```
//!
//! Every biz tag draws from the same sequence, so ids from one process are
//! strictly increasing and unique across tags. Ids from different processes
//! never collide as long as each process runs with its own worker id, which is
//! why the worker id is a required part of construction.

use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// 2022-01-01T00:00:00Z
pub const EPOCH_SECONDS: i64 = 1_640_995_200;

pub const WORKER_ID_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 22;
pub const MAX_WORKER_ID: u16 = (1 << WORKER_ID_BITS) - 1;

const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_SHIFT: u32 = WORKER_ID_BITS + SEQUENCE_BITS;
const UNSET: u64 = u64::MAX;

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct IdWorker {
    worker_id: u16,
    clock: Clock,
    // (seconds << SEQUENCE_BITS) | sequence of the last issued id
    state: AtomicU64,
}

impl IdWorker {
    pub fn new(worker_id: u16) -> Result<Self> {
        Self::with_clock(worker_id, Arc::new(|| Utc::now().timestamp()))
    }

    /// `clock` returns unix seconds.
    pub fn with_clock(worker_id: u16, clock: Clock) -> Result<Self> {
        if worker_id > MAX_WORKER_ID {
            bail!("worker id {} out of range 0..={}", worker_id, MAX_WORKER_ID);
        }
        Ok(Self {
            worker_id,
            clock,
            state: AtomicU64::new(UNSET),
        })
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    pub fn next_id(&self, biz_tag: &str) -> i64 {
        let now = ((self.clock)() - EPOCH_SECONDS).max(0) as u64;

        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let last_seconds = current >> SEQUENCE_BITS;
            let last_sequence = current & MAX_SEQUENCE;

            // A clock that steps backwards keeps issuing in the last second;
            // an exhausted sequence borrows the next one.
            let (seconds, sequence) = if current == UNSET || now > last_seconds {
                (now, 0)
            } else if last_sequence < MAX_SEQUENCE {
                (last_seconds, last_sequence + 1)
            } else {
                (last_seconds + 1, 0)
            };

            let next = (seconds << SEQUENCE_BITS) | sequence;
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let id = self.compose(seconds, sequence);
                    trace!(biz_tag, id, "Id issued");
                    return id;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn compose(&self, seconds: u64, sequence: u64) -> i64 {
        ((seconds << TIMESTAMP_SHIFT) | ((self.worker_id as u64) << SEQUENCE_BITS) | sequence) as i64
    }
}

/// Splits an id back into (unix seconds, worker id, sequence).
pub fn decompose(id: i64) -> (i64, u16, u32) {
    let raw = id as u64;
    let seconds = (raw >> TIMESTAMP_SHIFT) as i64 + EPOCH_SECONDS;
    let worker_id = ((raw >> SEQUENCE_BITS) & MAX_WORKER_ID as u64) as u16;
    let sequence = (raw & MAX_SEQUENCE) as u32;
    (seconds, worker_id, sequence)
}
