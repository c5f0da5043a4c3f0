//! Rebuilds the fast queues from the ledger.
//!
//! The ledger is the source of truth: after a fast-store restart (or whenever
//! an operator asks) every counter's queue is replaced by its pending tokens in
//! arrival order, and today's id sequence is lifted past the highest id the
//! ledger holds. Running it twice yields the same state.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Local;
use serde::Serialize;

use crate::errors::AppError;
use crate::ids;
use crate::models::token::{TokenRecord, TokenSummary};
use crate::store::Stores;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Queues rewritten, including ones left empty.
    pub counters: usize,
    /// Pending tokens placed back into queues.
    pub tokens: usize,
    /// Today's id sequence after reseeding.
    pub daily_sequence: u64,
}

#[derive(Clone)]
pub struct Resynchronizer {
    stores: Stores,
}

impl Resynchronizer {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn resync(&self) -> Result<ResyncReport, AppError> {
        // no create/call/skip may interleave with the rebuild
        let _gate = self.stores.queue_gate.write().await;

        let pending = self
            .stores
            .ledger
            .list_pending()
            .await
            .map_err(AppError::Ledger)?;
        let counters = self
            .stores
            .catalog
            .list_counters()
            .await
            .map_err(AppError::Catalog)?;
        let services = self
            .stores
            .catalog
            .list_services()
            .await
            .map_err(AppError::Catalog)?;

        let service_names: HashMap<&str, &str> = services
            .iter()
            .map(|s| (s.service_id.as_str(), s.name.as_str()))
            .collect();
        let counter_names: HashMap<i32, &str> = counters
            .iter()
            .map(|c| (c.counter_id, c.name.as_str()))
            .collect();

        let groups = group_pending(&pending);
        let catalog_ids: Vec<i32> = counters.iter().map(|c| c.counter_id).collect();

        let mut report = ResyncReport::default();
        for counter_id in counters_to_rewrite(&catalog_ids, &pending) {
            let records = groups.get(&counter_id).map(Vec::as_slice).unwrap_or(&[]);
            let counter_fallback = counter_id.to_string();
            let counter_name = counter_names
                .get(&counter_id)
                .copied()
                .unwrap_or(&counter_fallback);
            let entries: Vec<TokenSummary> = records
                .iter()
                .map(|r| {
                    let service_name = service_names
                        .get(r.service_id.as_str())
                        .copied()
                        .unwrap_or(&r.service_id);
                    TokenSummary::from_record(r, service_name, counter_name)
                })
                .collect();

            self.stores
                .fast
                .replace(counter_id, &entries)
                .await
                .map_err(AppError::QueueUnavailable)?;

            tracing::debug!(counter_id, tokens = entries.len(), "queue rebuilt");
            report.counters += 1;
            report.tokens += entries.len();
        }

        let now = Local::now();
        let issued_today = self
            .stores
            .ledger
            .max_daily_sequence(now.date_naive())
            .await
            .map_err(AppError::Ledger)?;
        report.daily_sequence = ids::reseed_daily_counter(self.stores.fast.as_ref(), now, issued_today)
            .await
            .map_err(AppError::QueueUnavailable)?;

        tracing::info!(
            counters = report.counters,
            tokens = report.tokens,
            daily_sequence = report.daily_sequence,
            "queues resynchronized from ledger"
        );
        Ok(report)
    }
}

/// Group pending records by assigned counter, keeping input order within each
/// group. Counters with no records are absent.
pub fn group_pending(records: &[TokenRecord]) -> BTreeMap<i32, Vec<&TokenRecord>> {
    let mut groups: BTreeMap<i32, Vec<&TokenRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.assigned_counter_id).or_default().push(record);
    }
    groups
}

/// Counters that will be rewritten: every catalog counter plus every counter
/// holding a pending token.
pub fn counters_to_rewrite(catalog: &[i32], records: &[TokenRecord]) -> BTreeSet<i32> {
    catalog
        .iter()
        .copied()
        .chain(records.iter().map(|r| r.assigned_counter_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::token::NewToken;
    use chrono::{Duration, Utc};

    fn record(id: &str, counter: i32, offset_secs: i64) -> TokenRecord {
        NewToken {
            token_id: id.into(),
            display_number: format!("DEP-{}", &id[id.len() - 3..]),
            service_id: "DEP".into(),
            assigned_counter_id: counter,
            generation_timestamp: Utc::now() + Duration::seconds(offset_secs),
        }
        .into_record()
    }

    #[test]
    fn test_group_keeps_arrival_order() {
        let records = vec![
            record("20251220-001", 1, 0),
            record("20251220-002", 2, 1),
            record("20251220-003", 1, 2),
        ];
        let groups = group_pending(&records);
        let one: Vec<_> = groups[&1].iter().map(|r| r.token_id.as_str()).collect();
        assert_eq!(one, vec!["20251220-001", "20251220-003"]);
        assert_eq!(groups[&2].len(), 1);
        assert!(!groups.contains_key(&3));
    }

    #[test]
    fn test_rewrite_includes_counters_outside_catalog() {
        let records = vec![record("20251220-001", 9, 0)];
        let ids: Vec<_> = counters_to_rewrite(&[1, 2], &records).into_iter().collect();
        assert_eq!(ids, vec![1, 2, 9]);
    }
}
