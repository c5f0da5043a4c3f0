//! QueueDesk: token lifecycle engine for walk-in service desks.
//!
//! The binary in `main.rs` wires these modules to Postgres and Redis;
//! integration tests in `tests/` run them against the in-memory stores.

pub mod api;
pub mod assignment;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod ids;
pub mod jobs;
pub mod models;
pub mod recovery;
pub mod saga;
pub mod store;

use std::sync::Arc;

use coordinator::Coordinator;
use events::RoomHub;
use recovery::Resynchronizer;
use store::Stores;

/// Shared application state passed to handlers.
pub struct AppState {
    pub coordinator: Coordinator,
    pub resync: Resynchronizer,
    pub hub: RoomHub,
    pub config: config::Config,
}

impl AppState {
    /// Wire the coordinator and resynchronizer to one set of stores, with
    /// events fanned out through `hub`.
    pub fn new(stores: Stores, hub: RoomHub, config: config::Config) -> Self {
        let coordinator = Coordinator::new(stores.clone(), Arc::new(hub.clone()));
        Self {
            coordinator,
            resync: Resynchronizer::new(stores),
            hub,
            config,
        }
    }
}
