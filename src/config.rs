use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    /// Allowed CORS origin for the kiosk/admin frontend.
    pub frontend_url: String,
    /// Upper bound for a single Redis call and for Postgres pool acquisition.
    /// Set via QUEUEDESK_STORE_TIMEOUT_MS. Default: 2000.
    pub store_timeout_ms: u64,
    /// Fast-store ping interval. Set via QUEUEDESK_WATCHDOG_SECS. Default: 5.
    pub watchdog_secs: u64,
    /// Per-room buffer of the real-time channel. Slow clients beyond this
    /// many frames skip ahead. Set via QUEUEDESK_EVENT_CAPACITY. Default: 256.
    pub event_capacity: usize,
}

impl Config {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        from_lookup(|_| None)
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let config = from_lookup(|key| std::env::var(key).ok());
    if config.store_timeout_ms == 0 {
        anyhow::bail!("QUEUEDESK_STORE_TIMEOUT_MS must be greater than zero");
    }
    Ok(config)
}

/// Build a config from any key lookup. Unset or unparsable numbers fall back
/// to their defaults.
pub fn from_lookup<F>(lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    Config {
        port: lookup("QUEUEDESK_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(5000),
        database_url: lookup("DATABASE_URL")
            .unwrap_or_else(|| "postgres://localhost/queuedesk".into()),
        redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
        frontend_url: lookup("FRONTEND_URL").unwrap_or_else(|| "http://localhost:5173".into()),
        store_timeout_ms: lookup("QUEUEDESK_STORE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(2000),
        watchdog_secs: lookup("QUEUEDESK_WATCHDOG_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(5),
        event_capacity: lookup("QUEUEDESK_EVENT_CAPACITY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(256),
    }
}
