use serde::{Deserialize, Serialize};

/// A service offered at the desk (e.g. "DEP" deposits, "WDL" withdrawals).
///
/// Owned by the catalog. The lifecycle engine only reads it; once a token
/// references a service, only `is_active` is expected to change.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub service_id: String,
    pub name: String,
    pub avg_duration_minutes: i32,
    pub is_active: bool,
}

impl Service {
    /// Case-insensitive match on the display name, ignoring surrounding whitespace.
    pub fn name_matches(&self, name: &str) -> bool {
        self.name.trim().eq_ignore_ascii_case(name.trim())
    }

    /// Lookup by a free-form key from a kiosk: the display name or the id.
    pub fn identified_by(&self, key: &str) -> bool {
        self.name_matches(key) || self.service_id.eq_ignore_ascii_case(key.trim())
    }
}
