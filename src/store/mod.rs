pub mod memory;
pub mod postgres;
pub mod redis_queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;

use crate::models::counter::Counter;
use crate::models::service::Service;
use crate::models::token::{NewToken, StatusChange, TokenFilter, TokenRecord, TokenSummary};

/// Read-only view of the service/counter catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_service(&self, service_id: &str) -> anyhow::Result<Option<Service>>;

    /// All services, active or not.
    async fn list_services(&self) -> anyhow::Result<Vec<Service>>;

    async fn get_counter(&self, counter_id: i32) -> anyhow::Result<Option<Counter>>;

    /// All counters in ascending `counter_id` order.
    async fn list_counters(&self) -> anyhow::Result<Vec<Counter>>;
}

/// Durable token history. Every method is atomic on its own.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a new `pending` record. Fails on a duplicate `token_id`.
    async fn insert_token(&self, token: &NewToken) -> anyhow::Result<TokenRecord>;

    /// Remove a record. Only used to undo an insert whose enqueue failed.
    async fn delete_token(&self, token_id: &str) -> anyhow::Result<bool>;

    async fn get_token(&self, token_id: &str) -> anyhow::Result<Option<TokenRecord>>;

    /// Apply `change` if the record's current status is in
    /// `change.allowed_from()`. Returns `None` when the record is missing or
    /// its status does not permit the change; nothing is written then.
    async fn apply(
        &self,
        token_id: &str,
        change: &StatusChange,
    ) -> anyhow::Result<Option<TokenRecord>>;

    /// Pending records ordered by `generation_timestamp`, then `token_id`.
    async fn list_pending(&self) -> anyhow::Result<Vec<TokenRecord>>;

    /// Most recently called token still `called` at this counter.
    async fn current_called(&self, counter_id: i32) -> anyhow::Result<Option<TokenRecord>>;

    /// History query, newest first.
    async fn list_tokens(&self, filter: &TokenFilter) -> anyhow::Result<Vec<TokenRecord>>;

    /// Highest sequence number among `date`'s token ids (`YYYYMMDD-<n>`), or 0.
    async fn max_daily_sequence(&self, date: NaiveDate) -> anyhow::Result<u64>;
}

/// Per-counter FIFO of token summaries plus the daily sequence counter.
///
/// Only positional list primitives and single-key atomics are assumed.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Append to the tail of the counter's queue.
    async fn push(&self, counter_id: i32, entry: &TokenSummary) -> anyhow::Result<()>;

    /// Put an entry back at the head of the counter's queue.
    async fn push_front(&self, counter_id: i32, entry: &TokenSummary) -> anyhow::Result<()>;

    /// Atomically remove and return the head entry.
    async fn pop(&self, counter_id: i32) -> anyhow::Result<Option<TokenSummary>>;

    /// Drop every entry with `token_id`, keeping the rest in order.
    /// Returns the number of entries removed.
    async fn remove(&self, counter_id: i32, token_id: &str) -> anyhow::Result<usize>;

    async fn entries(&self, counter_id: i32) -> anyhow::Result<Vec<TokenSummary>>;

    /// Atomically replace the whole queue for a counter.
    async fn replace(&self, counter_id: i32, entries: &[TokenSummary]) -> anyhow::Result<()>;

    /// Atomic increment; sets `ttl_secs` expiry when the key is created.
    async fn increment(&self, key: &str, ttl_secs: u64) -> anyhow::Result<u64>;

    /// Raise the counter at `key` to at least `floor`, never lowering it.
    /// A key without an expiry gets `ttl_secs`. Returns the resulting value.
    async fn raise_to(&self, key: &str, floor: u64, ttl_secs: u64) -> anyhow::Result<u64>;

    async fn ping(&self) -> anyhow::Result<()>;
}

/// A queue entry that could not be decoded. Raised after the entry has
/// already left the list, so callers treat it as a consistency failure.
#[derive(Debug, thiserror::Error)]
#[error("malformed queue entry on counter {counter_id}: {raw}")]
pub struct MalformedEntry {
    pub counter_id: i32,
    pub raw: String,
}

/// Fast-queue key for a counter.
pub fn queue_key(counter_id: i32) -> String {
    format!("counter:{}", counter_id)
}

/// Whether the fast store is believed reachable.
///
/// Shared between the Redis adapter (which marks failures), the watchdog job
/// (which marks recoveries) and the coordinator (which reads it).
#[derive(Clone, Debug)]
pub struct ConnectionState {
    connected: Arc<AtomicBool>,
}

impl ConnectionState {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(connected)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Returns `true` if this call flipped the state from disconnected.
    pub fn mark_connected(&self) -> bool {
        !self.connected.swap(true, Ordering::AcqRel)
    }

    /// Returns `true` if this call flipped the state from connected.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }
}

/// The stores the lifecycle engine works against.
///
/// `queue_gate` orders queue rebuilds against live traffic: create, call and
/// skip hold the read side, resync holds the write side.
#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn Catalog>,
    pub ledger: Arc<dyn Ledger>,
    pub fast: Arc<dyn FastStore>,
    pub connection: ConnectionState,
    pub queue_gate: Arc<RwLock<()>>,
}

impl Stores {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        ledger: Arc<dyn Ledger>,
        fast: Arc<dyn FastStore>,
        connection: ConnectionState,
    ) -> Self {
        Self {
            catalog,
            ledger,
            fast,
            connection,
            queue_gate: Arc::new(RwLock::new(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_reports_transitions_once() {
        let state = ConnectionState::new(false);
        assert!(!state.is_connected());
        assert!(state.mark_connected());
        assert!(!state.mark_connected());
        assert!(state.is_connected());
        assert!(state.mark_disconnected());
        assert!(!state.mark_disconnected());
    }

    #[test]
    fn test_connection_state_is_shared_between_clones() {
        let a = ConnectionState::new(true);
        let b = a.clone();
        b.mark_disconnected();
        assert!(!a.is_connected());
    }

    #[test]
    fn test_queue_key_format() {
        assert_eq!(queue_key(7), "counter:7");
    }
}
