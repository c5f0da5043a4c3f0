//! Date-scoped token identifiers.
//!
//! The daily sequence lives in the fast store (`token:seq:<YYYYMMDD>`), bumped
//! with an atomic INCR and expiring at the next local midnight, so concurrent
//! issuers on the same day never share a value. When the fast store is down
//! the sequence is derived from the wall clock instead; such ids may collide
//! and are flagged as degraded.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Timelike};

use crate::store::{ConnectionState, FastStore};

/// A value of the per-day counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyCounter {
    pub value: u64,
    /// Derived from the clock because the fast store was unavailable.
    pub degraded: bool,
}

/// Identifier pair handed to a new token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedId {
    pub token_id: String,
    pub display_number: String,
    pub counter: DailyCounter,
}

#[derive(Clone)]
pub struct TokenIdGenerator {
    store: Arc<dyn FastStore>,
    connection: ConnectionState,
}

impl TokenIdGenerator {
    pub fn new(store: Arc<dyn FastStore>, connection: ConnectionState) -> Self {
        Self { store, connection }
    }

    /// Next value of the counter for `now`'s local day.
    pub async fn next_daily_counter(&self, now: DateTime<Local>) -> DailyCounter {
        let date = now.date_naive();
        if self.connection.is_connected() {
            let key = daily_key(date);
            match self.store.increment(&key, seconds_until_next_midnight(&now)).await {
                Ok(value) => return DailyCounter { value, degraded: false },
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "daily counter increment failed, using clock-derived value");
                }
            }
        } else {
            tracing::warn!("fast store disconnected, using clock-derived daily counter");
        }
        DailyCounter {
            value: degraded_counter(&now),
            degraded: true,
        }
    }

    pub async fn issue(&self, service_id: &str, now: DateTime<Local>) -> IssuedId {
        let counter = self.next_daily_counter(now).await;
        IssuedId {
            token_id: token_id(now.date_naive(), counter.value),
            display_number: display_number(&service_prefix(service_id), counter.value),
            counter,
        }
    }
}

/// `YYYYMMDD-NNN`, at least three digits.
pub fn token_id(date: NaiveDate, counter: u64) -> String {
    format!("{}-{:03}", date.format("%Y%m%d"), counter)
}

/// `<PREFIX>-NNN`, at least three digits.
pub fn display_number(service_prefix: &str, counter: u64) -> String {
    format!("{}-{:03}", service_prefix, counter)
}

/// First three characters of the service id, upper-cased.
pub fn service_prefix(service_id: &str) -> String {
    service_id.trim().chars().take(3).collect::<String>().to_uppercase()
}

pub fn daily_key(date: NaiveDate) -> String {
    format!("token:seq:{}", date.format("%Y%m%d"))
}

/// Sequence part of a token id issued on `date`; `None` for other days.
pub fn sequence_of(token_id: &str, date: NaiveDate) -> Option<u64> {
    token_id
        .strip_prefix(&format!("{}-", date.format("%Y%m%d")))?
        .parse()
        .ok()
}

/// Lift `now`'s daily sequence to at least `floor` so the next INCR lands
/// past every id the ledger already holds for the day.
pub async fn reseed_daily_counter(
    store: &dyn FastStore,
    now: DateTime<Local>,
    floor: u64,
) -> anyhow::Result<u64> {
    store
        .raise_to(&daily_key(now.date_naive()), floor, seconds_until_next_midnight(&now))
        .await
}

/// Whole seconds from `now` until the next midnight in `now`'s time zone.
/// Never returns 0 so the key always gets a live expiry.
pub fn seconds_until_next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> u64 {
    let tz = now.timezone();
    let next_midnight = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| tz.from_local_datetime(&naive).earliest());

    match next_midnight {
        Some(midnight) => (midnight.timestamp() - now.timestamp()).max(1) as u64,
        // Midnight skipped by a DST jump: fall back to a plain day.
        None => 86_400,
    }
}

/// Milliseconds since local midnight.
pub fn degraded_counter<Tz: TimeZone>(now: &DateTime<Tz>) -> u64 {
    let secs = now.num_seconds_from_midnight() as u64;
    let millis = (now.nanosecond() % 1_000_000_000) as u64 / 1_000_000;
    secs * 1_000 + millis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryFastStore;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn test_token_id_format() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
        assert_eq!(token_id(date, 1), "20251220-001");
        assert_eq!(token_id(date, 42), "20251220-042");
        assert_eq!(token_id(date, 1234), "20251220-1234");
    }

    #[test]
    fn test_display_number_uses_service_prefix() {
        assert_eq!(display_number(&service_prefix("dep"), 7), "DEP-007");
        assert_eq!(display_number(&service_prefix("WITHDRAW"), 12), "WIT-012");
        assert_eq!(service_prefix("ab"), "AB");
    }

    #[test]
    fn test_seconds_until_midnight_in_fixed_zone() {
        let tz = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let now = tz.with_ymd_and_hms(2025, 12, 20, 23, 59, 0).unwrap();
        assert_eq!(seconds_until_next_midnight(&now), 60);

        let morning = tz.with_ymd_and_hms(2025, 12, 20, 0, 0, 0).unwrap();
        assert_eq!(seconds_until_next_midnight(&morning), 86_400);
    }

    #[test]
    fn test_degraded_counter_is_millis_since_midnight() {
        let now = Utc.with_ymd_and_hms(2025, 12, 20, 1, 0, 2).unwrap();
        assert_eq!(degraded_counter(&now), 3_602_000);
    }

    #[tokio::test]
    async fn test_sequential_issue_increments() {
        let store = Arc::new(MemoryFastStore::new());
        let ids = TokenIdGenerator::new(store, ConnectionState::new(true));
        let now = Local::now();
        let a = ids.issue("DEP", now).await;
        let b = ids.issue("DEP", now).await;
        assert!(!a.counter.degraded);
        assert_eq!(a.counter.value + 1, b.counter.value);
        assert!(a.token_id.ends_with("-001"));
        assert_eq!(b.display_number, "DEP-002");
    }

    #[tokio::test]
    async fn test_falls_back_to_clock_when_increment_fails() {
        let store = Arc::new(MemoryFastStore::new());
        store.fail_on("incr");
        let ids = TokenIdGenerator::new(store, ConnectionState::new(true));
        let counter = ids.next_daily_counter(Local::now()).await;
        assert!(counter.degraded);
    }

    #[test]
    fn test_sequence_of_only_reads_that_day() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
        assert_eq!(sequence_of("20251220-042", date), Some(42));
        assert_eq!(sequence_of("20251220-3602000", date), Some(3_602_000));
        assert_eq!(sequence_of("20251219-900", date), None);
        assert_eq!(sequence_of("20251220-abc", date), None);
    }

    #[tokio::test]
    async fn test_reseed_moves_sequence_past_floor() {
        let store = Arc::new(MemoryFastStore::new());
        let ids = TokenIdGenerator::new(store.clone(), ConnectionState::new(true));
        let now = Local::now();

        assert_eq!(reseed_daily_counter(store.as_ref(), now, 300).await.unwrap(), 300);
        assert_eq!(ids.next_daily_counter(now).await.value, 301);

        // a lower floor never rewinds the sequence
        assert_eq!(reseed_daily_counter(store.as_ref(), now, 5).await.unwrap(), 301);
        assert_eq!(ids.next_daily_counter(now).await.value, 302);
    }

    #[tokio::test]
    async fn test_skips_store_when_disconnected() {
        let store = Arc::new(MemoryFastStore::new());
        let ids = TokenIdGenerator::new(store.clone(), ConnectionState::new(false));
        let now = Local::now();
        let counter = ids.next_daily_counter(now).await;
        assert!(counter.degraded);
        // the store sequence was never touched
        let key = daily_key(now.date_naive());
        assert_eq!(store.increment(&key, 60).await.unwrap(), 1);
    }
}
