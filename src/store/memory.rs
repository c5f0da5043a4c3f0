//! In-process implementations of the store traits.
//!
//! They keep the same atomicity per call as the real adapters (each method
//! holds a single DashMap shard lock) and support injected failures so the
//! saga paths can be exercised without Postgres or Redis.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;

use super::{queue_key, Catalog, FastStore, Ledger};
use crate::ids::sequence_of;
use crate::models::counter::Counter;
use crate::models::service::Service;
use crate::models::token::{NewToken, StatusChange, TokenFilter, TokenRecord, TokenStatus, TokenSummary};

/// Named operations that can be made to fail. `"*"` fails every operation.
#[derive(Default)]
struct Failures {
    ops: Mutex<HashSet<&'static str>>,
}

impl Failures {
    fn set(&self, op: &'static str) {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).insert(op);
    }

    fn clear(&self) {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn check(&self, store: &str, op: &'static str) -> anyhow::Result<()> {
        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        if ops.contains(op) || ops.contains("*") {
            anyhow::bail!("{} {} failed (injected)", store, op);
        }
        Ok(())
    }
}

// ── Catalog ───────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCatalog {
    services: DashMap<String, Service>,
    counters: DashMap<i32, Counter>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, service_id: &str, name: &str, is_active: bool) -> Self {
        self.services.insert(
            service_id.to_string(),
            Service {
                service_id: service_id.to_string(),
                name: name.to_string(),
                avg_duration_minutes: 5,
                is_active,
            },
        );
        self
    }

    pub fn with_counter(self, counter_id: i32, name: &str, services: &[&str], is_open: bool) -> Self {
        self.counters.insert(
            counter_id,
            Counter {
                counter_id,
                name: name.to_string(),
                supported_service_ids: services.iter().map(|s| s.to_string()).collect(),
                is_open,
                operator_name: None,
            },
        );
        self
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn get_service(&self, service_id: &str) -> anyhow::Result<Option<Service>> {
        Ok(self.services.get(service_id).map(|s| s.clone()))
    }

    async fn list_services(&self) -> anyhow::Result<Vec<Service>> {
        let mut all: Vec<Service> = self.services.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(all)
    }

    async fn get_counter(&self, counter_id: i32) -> anyhow::Result<Option<Counter>> {
        Ok(self.counters.get(&counter_id).map(|c| c.clone()))
    }

    async fn list_counters(&self) -> anyhow::Result<Vec<Counter>> {
        let mut all: Vec<Counter> = self.counters.iter().map(|c| c.clone()).collect();
        all.sort_by_key(|c| c.counter_id);
        Ok(all)
    }
}

// ── Ledger ────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryLedger {
    records: DashMap<String, TokenRecord>,
    failures: Failures,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` (`insert`, `delete`, `get`, `apply`, `list`, or `*`) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.failures.set(op);
    }

    pub fn heal(&self) {
        self.failures.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of every record, oldest first.
    pub fn snapshot(&self) -> Vec<TokenRecord> {
        let mut all: Vec<TokenRecord> = self.records.iter().map(|r| r.clone()).collect();
        sort_by_arrival(&mut all);
        all
    }
}

fn sort_by_arrival(records: &mut [TokenRecord]) {
    records.sort_by(|a, b| {
        a.generation_timestamp
            .cmp(&b.generation_timestamp)
            .then_with(|| a.token_id.cmp(&b.token_id))
    });
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_token(&self, token: &NewToken) -> anyhow::Result<TokenRecord> {
        self.failures.check("ledger", "insert")?;
        match self.records.entry(token.token_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                anyhow::bail!("duplicate key value violates unique constraint: token_id={}", token.token_id)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let record = token.clone().into_record();
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn delete_token(&self, token_id: &str) -> anyhow::Result<bool> {
        self.failures.check("ledger", "delete")?;
        Ok(self.records.remove(token_id).is_some())
    }

    async fn get_token(&self, token_id: &str) -> anyhow::Result<Option<TokenRecord>> {
        self.failures.check("ledger", "get")?;
        Ok(self.records.get(token_id).map(|r| r.clone()))
    }

    async fn apply(
        &self,
        token_id: &str,
        change: &StatusChange,
    ) -> anyhow::Result<Option<TokenRecord>> {
        self.failures.check("ledger", "apply")?;
        let Some(mut record) = self.records.get_mut(token_id) else {
            return Ok(None);
        };
        if !change.permits(record.status) {
            return Ok(None);
        }
        change.apply_to(&mut record);
        Ok(Some(record.clone()))
    }

    async fn list_pending(&self) -> anyhow::Result<Vec<TokenRecord>> {
        self.failures.check("ledger", "list")?;
        let mut pending: Vec<TokenRecord> = self
            .records
            .iter()
            .filter(|r| r.status == TokenStatus::Pending)
            .map(|r| r.clone())
            .collect();
        sort_by_arrival(&mut pending);
        Ok(pending)
    }

    async fn current_called(&self, counter_id: i32) -> anyhow::Result<Option<TokenRecord>> {
        self.failures.check("ledger", "list")?;
        Ok(self
            .records
            .iter()
            .filter(|r| r.status == TokenStatus::Called && r.assigned_counter_id == counter_id)
            .max_by_key(|r| r.called_timestamp)
            .map(|r| r.clone()))
    }

    async fn list_tokens(&self, filter: &TokenFilter) -> anyhow::Result<Vec<TokenRecord>> {
        self.failures.check("ledger", "list")?;
        let mut rows: Vec<TokenRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| r.clone())
            .collect();
        sort_by_arrival(&mut rows);
        rows.reverse();
        rows.truncate(filter.limit.max(0) as usize);
        Ok(rows)
    }

    async fn max_daily_sequence(&self, date: NaiveDate) -> anyhow::Result<u64> {
        self.failures.check("ledger", "list")?;
        Ok(self
            .records
            .iter()
            .filter_map(|r| sequence_of(&r.token_id, date))
            .max()
            .unwrap_or(0))
    }
}

// ── Fast store ────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryFastStore {
    lists: DashMap<String, VecDeque<TokenSummary>>,
    sequences: DashMap<String, (u64, Instant)>,
    failures: Failures,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` (`push`, `push_front`, `pop`, `remove`, `entries`,
    /// `replace`, `incr`, `raise`, `ping`, or `*`) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.failures.set(op);
    }

    pub fn heal(&self) {
        self.failures.clear();
    }

    /// Current queue for a counter, bypassing failure injection.
    pub fn queue(&self, counter_id: i32) -> Vec<TokenSummary> {
        self.lists
            .get(&queue_key(counter_id))
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn push(&self, counter_id: i32, entry: &TokenSummary) -> anyhow::Result<()> {
        self.failures.check("fast store", "push")?;
        self.lists
            .entry(queue_key(counter_id))
            .or_default()
            .push_back(entry.clone());
        Ok(())
    }

    async fn push_front(&self, counter_id: i32, entry: &TokenSummary) -> anyhow::Result<()> {
        self.failures.check("fast store", "push_front")?;
        self.lists
            .entry(queue_key(counter_id))
            .or_default()
            .push_front(entry.clone());
        Ok(())
    }

    async fn pop(&self, counter_id: i32) -> anyhow::Result<Option<TokenSummary>> {
        self.failures.check("fast store", "pop")?;
        Ok(self
            .lists
            .get_mut(&queue_key(counter_id))
            .and_then(|mut l| l.pop_front()))
    }

    async fn remove(&self, counter_id: i32, token_id: &str) -> anyhow::Result<usize> {
        self.failures.check("fast store", "remove")?;
        let Some(mut list) = self.lists.get_mut(&queue_key(counter_id)) else {
            return Ok(0);
        };
        let before = list.len();
        let kept: VecDeque<TokenSummary> = list.drain(..).filter(|e| e.token_id != token_id).collect();
        *list = kept;
        Ok(before - list.len())
    }

    async fn entries(&self, counter_id: i32) -> anyhow::Result<Vec<TokenSummary>> {
        self.failures.check("fast store", "entries")?;
        Ok(self.queue(counter_id))
    }

    async fn replace(&self, counter_id: i32, entries: &[TokenSummary]) -> anyhow::Result<()> {
        self.failures.check("fast store", "replace")?;
        let key = queue_key(counter_id);
        if entries.is_empty() {
            self.lists.remove(&key);
        } else {
            self.lists.insert(key, entries.iter().cloned().collect());
        }
        Ok(())
    }

    async fn increment(&self, key: &str, ttl_secs: u64) -> anyhow::Result<u64> {
        self.failures.check("fast store", "incr")?;
        let now = Instant::now();
        let mut slot = self
            .sequences
            .entry(key.to_string())
            .or_insert((0, now + Duration::from_secs(ttl_secs)));
        if now >= slot.1 {
            *slot = (0, now + Duration::from_secs(ttl_secs));
        }
        slot.0 += 1;
        Ok(slot.0)
    }

    async fn raise_to(&self, key: &str, floor: u64, ttl_secs: u64) -> anyhow::Result<u64> {
        self.failures.check("fast store", "raise")?;
        let now = Instant::now();
        let mut slot = self
            .sequences
            .entry(key.to_string())
            .or_insert((0, now + Duration::from_secs(ttl_secs)));
        if now >= slot.1 {
            *slot = (0, now + Duration::from_secs(ttl_secs));
        }
        slot.0 = slot.0.max(floor);
        Ok(slot.0)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.failures.check("fast store", "ping")
    }
}
