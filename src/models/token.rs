use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a token.
///
/// `pending → called → {served | skipped}`. A skipped (or already called)
/// token can be recalled back to `called`; nothing leaves `served`.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum TokenStatus {
    Pending,
    Called,
    Served,
    Skipped,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Pending => "pending",
            TokenStatus::Called => "called",
            TokenStatus::Served => "served",
            TokenStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TokenStatus::Pending),
            "called" => Ok(TokenStatus::Called),
            "served" => Ok(TokenStatus::Served),
            "skipped" => Ok(TokenStatus::Skipped),
            other => Err(format!("unknown token status '{}'", other)),
        }
    }
}

/// A ledger row from `token_history`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct TokenRecord {
    pub token_id: String,
    pub display_number: String,
    pub service_id: String,
    pub assigned_counter_id: i32,
    pub status: TokenStatus,
    pub generation_timestamp: DateTime<Utc>,
    pub called_timestamp: Option<DateTime<Utc>>,
    pub served_timestamp: Option<DateTime<Utc>>,
    pub skip_count: i32,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a freshly issued token. Always lands as `pending`.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub token_id: String,
    pub display_number: String,
    pub service_id: String,
    pub assigned_counter_id: i32,
    pub generation_timestamp: DateTime<Utc>,
}

impl NewToken {
    pub fn into_record(self) -> TokenRecord {
        TokenRecord {
            token_id: self.token_id,
            display_number: self.display_number,
            service_id: self.service_id,
            assigned_counter_id: self.assigned_counter_id,
            status: TokenStatus::Pending,
            generation_timestamp: self.generation_timestamp,
            called_timestamp: None,
            served_timestamp: None,
            skip_count: 0,
            updated_at: self.generation_timestamp,
        }
    }
}

/// The summary stored in a counter's fast queue and returned by `create_token`.
///
/// Queue entries are summaries only; the ledger stays authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSummary {
    pub token_id: String,
    pub display_number: String,
    pub service_id: String,
    pub service_name: String,
    pub counter_id: i32,
    pub counter_name: String,
    pub timestamp: DateTime<Utc>,
}

impl TokenSummary {
    pub fn from_record(record: &TokenRecord, service_name: &str, counter_name: &str) -> Self {
        Self {
            token_id: record.token_id.clone(),
            display_number: record.display_number.clone(),
            service_id: record.service_id.clone(),
            service_name: service_name.to_string(),
            counter_id: record.assigned_counter_id,
            counter_name: counter_name.to_string(),
            timestamp: record.generation_timestamp,
        }
    }
}

/// A token as announced on the kiosk display after a call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalledToken {
    #[serde(flatten)]
    pub summary: TokenSummary,
    pub status: TokenStatus,
    pub called_timestamp: DateTime<Utc>,
}

/// A ledger mutation together with the statuses it may be applied from.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusChange {
    /// Dequeued by `call_next`; only a pending token may be called this way.
    Call { counter_id: i32, at: DateTime<Utc> },
    /// Operator re-announces a skipped or already-called token.
    Recall { counter_id: i32, at: DateTime<Utc> },
    Serve { at: DateTime<Utc> },
    Skip { at: DateTime<Utc> },
}

impl StatusChange {
    pub fn target(&self) -> TokenStatus {
        match self {
            StatusChange::Call { .. } | StatusChange::Recall { .. } => TokenStatus::Called,
            StatusChange::Serve { .. } => TokenStatus::Served,
            StatusChange::Skip { .. } => TokenStatus::Skipped,
        }
    }

    pub fn allowed_from(&self) -> &'static [TokenStatus] {
        match self {
            StatusChange::Call { .. } => &[TokenStatus::Pending],
            StatusChange::Recall { .. } => &[TokenStatus::Skipped, TokenStatus::Called],
            StatusChange::Serve { .. } => &[TokenStatus::Called],
            StatusChange::Skip { .. } => &[TokenStatus::Pending, TokenStatus::Called],
        }
    }

    pub fn permits(&self, from: TokenStatus) -> bool {
        self.allowed_from().contains(&from)
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            StatusChange::Call { at, .. }
            | StatusChange::Recall { at, .. }
            | StatusChange::Serve { at }
            | StatusChange::Skip { at } => *at,
        }
    }

    /// Apply the change to an in-memory record. Callers check `permits` first.
    pub fn apply_to(&self, record: &mut TokenRecord) {
        match self {
            StatusChange::Call { counter_id, at } | StatusChange::Recall { counter_id, at } => {
                record.called_timestamp = Some(*at);
                record.assigned_counter_id = *counter_id;
            }
            StatusChange::Serve { at } => {
                record.served_timestamp = Some(*at);
            }
            StatusChange::Skip { .. } => {
                record.skip_count += 1;
            }
        }
        record.status = self.target();
        record.updated_at = self.at();
    }
}

/// Filter for ledger history queries.
#[derive(Debug, Clone, Default)]
pub struct TokenFilter {
    pub status: Option<TokenStatus>,
    pub counter_id: Option<i32>,
    /// Local issue date; matched through the date-scoped `token_id` prefix.
    pub date: Option<NaiveDate>,
    pub limit: i64,
}

impl TokenFilter {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 500;

    pub fn id_prefix(&self) -> Option<String> {
        self.date.map(|d| format!("{}-", d.format("%Y%m%d")))
    }

    pub fn matches(&self, record: &TokenRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self.counter_id.map_or(true, |c| record.assigned_counter_id == c)
            && self
                .id_prefix()
                .map_or(true, |p| record.token_id.starts_with(&p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_record() -> TokenRecord {
        NewToken {
            token_id: "20251220-001".into(),
            display_number: "DEP-001".into(),
            service_id: "DEP".into(),
            assigned_counter_id: 1,
            generation_timestamp: Utc::now(),
        }
        .into_record()
    }

    #[test]
    fn test_call_only_from_pending() {
        let change = StatusChange::Call { counter_id: 1, at: Utc::now() };
        assert!(change.permits(TokenStatus::Pending));
        assert!(!change.permits(TokenStatus::Called));
        assert!(!change.permits(TokenStatus::Skipped));
        assert!(!change.permits(TokenStatus::Served));
    }

    #[test]
    fn test_nothing_leaves_served() {
        let now = Utc::now();
        let changes = [
            StatusChange::Call { counter_id: 1, at: now },
            StatusChange::Recall { counter_id: 1, at: now },
            StatusChange::Serve { at: now },
            StatusChange::Skip { at: now },
        ];
        for change in &changes {
            assert!(!change.permits(TokenStatus::Served), "{:?} must not apply to served", change);
        }
    }

    #[test]
    fn test_second_serve_or_skip_rejected() {
        let now = Utc::now();
        assert!(!StatusChange::Serve { at: now }.permits(TokenStatus::Served));
        assert!(!StatusChange::Skip { at: now }.permits(TokenStatus::Skipped));
    }

    #[test]
    fn test_call_stamps_and_reassigns() {
        let mut rec = pending_record();
        let at = Utc::now();
        StatusChange::Call { counter_id: 3, at }.apply_to(&mut rec);
        assert_eq!(rec.status, TokenStatus::Called);
        assert_eq!(rec.called_timestamp, Some(at));
        assert_eq!(rec.assigned_counter_id, 3);
        assert_eq!(rec.updated_at, at);
    }

    #[test]
    fn test_skip_increments_count_each_time() {
        let mut rec = pending_record();
        let now = Utc::now();
        StatusChange::Skip { at: now }.apply_to(&mut rec);
        StatusChange::Recall { counter_id: 1, at: now }.apply_to(&mut rec);
        StatusChange::Skip { at: now }.apply_to(&mut rec);
        assert_eq!(rec.status, TokenStatus::Skipped);
        assert_eq!(rec.skip_count, 2);
    }

    #[test]
    fn test_status_parses_case_insensitively() {
        assert_eq!("Called".parse::<TokenStatus>(), Ok(TokenStatus::Called));
        assert!("done".parse::<TokenStatus>().is_err());
    }

    #[test]
    fn test_filter_date_prefix() {
        let rec = pending_record();
        let filter = TokenFilter {
            date: NaiveDate::from_ymd_opt(2025, 12, 20),
            ..Default::default()
        };
        assert!(filter.matches(&rec));
        let other_day = TokenFilter {
            date: NaiveDate::from_ymd_opt(2025, 12, 21),
            ..Default::default()
        };
        assert!(!other_day.matches(&rec));
    }

    #[test]
    fn test_called_token_flattens_summary() {
        let rec = pending_record();
        let called = CalledToken {
            summary: TokenSummary::from_record(&rec, "Deposit", "Counter 1"),
            status: TokenStatus::Called,
            called_timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&called).unwrap();
        assert_eq!(json["token_id"], "20251220-001");
        assert_eq!(json["display_number"], "DEP-001");
        assert_eq!(json["status"], "called");
        assert!(json.get("summary").is_none());
    }
}
