//! Background job: watch the fast store connection.
//!
//! Pings on a fixed interval. A failed ping flags the store disconnected so
//! lifecycle calls fail fast; the first successful ping afterwards rebuilds
//! every queue from the ledger before traffic is let through again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::recovery::{ResyncReport, Resynchronizer};
use crate::store::{ConnectionState, FastStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Healthy,
    Down,
    /// Came back from disconnected and the queues were rebuilt.
    Recovered(ResyncReport),
    /// Came back, but the rebuild failed; still flagged disconnected.
    ResyncFailed,
}

/// Spawn the watchdog task. Call this once at startup.
pub fn spawn(
    fast: Arc<dyn FastStore>,
    connection: ConnectionState,
    resync: Resynchronizer,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            check_once(fast.as_ref(), &connection, &resync).await;
        }
    })
}

pub async fn check_once(
    fast: &dyn FastStore,
    connection: &ConnectionState,
    resync: &Resynchronizer,
) -> Probe {
    if let Err(e) = fast.ping().await {
        if connection.mark_disconnected() {
            tracing::warn!(error = %e, "fast store unreachable, queue operations suspended");
        }
        return Probe::Down;
    }

    if !connection.mark_connected() {
        return Probe::Healthy;
    }

    tracing::info!("fast store reachable again, resynchronizing queues");
    match resync.resync().await {
        Ok(report) => Probe::Recovered(report),
        Err(e) => {
            tracing::error!(error = %e, "resync after reconnect failed, will retry");
            connection.mark_disconnected();
            Probe::ResyncFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryCatalog, MemoryFastStore, MemoryLedger};
    use crate::store::Stores;

    fn setup(connected: bool) -> (Arc<MemoryFastStore>, Arc<MemoryLedger>, ConnectionState, Resynchronizer) {
        let fast = Arc::new(MemoryFastStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let connection = ConnectionState::new(connected);
        let catalog = MemoryCatalog::new().with_counter(1, "Counter 1", &["DEP"], true);
        let stores = Stores::new(Arc::new(catalog), ledger.clone(), fast.clone(), connection.clone());
        (fast, ledger, connection, Resynchronizer::new(stores))
    }

    #[tokio::test]
    async fn test_healthy_store_stays_connected() {
        let (fast, _, connection, resync) = setup(true);
        assert_eq!(check_once(fast.as_ref(), &connection, &resync).await, Probe::Healthy);
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_failed_ping_flags_disconnected() {
        let (fast, _, connection, resync) = setup(true);
        fast.fail_on("ping");
        assert_eq!(check_once(fast.as_ref(), &connection, &resync).await, Probe::Down);
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_triggers_resync() {
        let (fast, _, connection, resync) = setup(false);
        let probe = check_once(fast.as_ref(), &connection, &resync).await;
        assert_eq!(
            probe,
            Probe::Recovered(ResyncReport {
                counters: 1,
                tokens: 0,
                daily_sequence: 0,
            })
        );
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_failed_resync_stays_disconnected() {
        let (fast, ledger, connection, resync) = setup(false);
        ledger.fail_on("list");
        assert_eq!(check_once(fast.as_ref(), &connection, &resync).await, Probe::ResyncFailed);
        assert!(!connection.is_connected());

        ledger.heal();
        assert!(matches!(
            check_once(fast.as_ref(), &connection, &resync).await,
            Probe::Recovered(_)
        ));
    }
}
