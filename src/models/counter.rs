use serde::{Deserialize, Serialize};

/// A service point. Capability and open-state are read, never mutated, by
/// the lifecycle engine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Counter {
    pub counter_id: i32,
    pub name: String,
    pub supported_service_ids: Vec<String>,
    pub is_open: bool,
    pub operator_name: Option<String>,
}

impl Counter {
    pub fn supports(&self, service_id: &str) -> bool {
        self.supported_service_ids.iter().any(|s| s == service_id)
    }
}
