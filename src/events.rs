//! Real-time notifications for kiosk displays and the admin dashboard.
//!
//! Delivery is at-most-once and fire-and-forget: events are published after
//! the ledger commit and a lost or unheard event never changes the outcome of
//! the lifecycle operation that produced it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::token::{CalledToken, TokenSummary};

/// A room a real-time client can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Kiosk,
    Admin,
}

impl Audience {
    pub const ALL: [Audience; 2] = [Audience::Kiosk, Audience::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Kiosk => "kiosk",
            Audience::Admin => "admin",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = String;

    /// Accepts `kiosk`, `admin`, or the client join messages `join:kiosk` /
    /// `join:admin`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let room = s.strip_prefix("join:").unwrap_or(&s);
        match room {
            "kiosk" => Ok(Audience::Kiosk),
            "admin" => Ok(Audience::Admin),
            _ => Err(format!("unknown room '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Called,
    Served,
    Skipped,
}

/// Wire shape: `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum QueueEvent {
    #[serde(rename = "token:generated")]
    TokenGenerated {
        token: TokenSummary,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "token:called")]
    TokenCalled {
        counter_id: i32,
        counter_name: String,
        token: CalledToken,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "queue:update")]
    QueueUpdate {
        counter_id: i32,
        token_id: String,
        action: QueueAction,
    },
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::TokenGenerated { .. } => "token:generated",
            QueueEvent::TokenCalled { .. } => "token:called",
            QueueEvent::QueueUpdate { .. } => "queue:update",
        }
    }
}

pub trait Broadcaster: Send + Sync {
    /// Deliver `event` to everyone in `audience`. Must not fail the caller.
    fn publish(&self, audience: Audience, event: &QueueEvent);
}

/// One `broadcast` channel per room; frames are serialized once per publish.
#[derive(Clone)]
pub struct RoomHub {
    rooms: Arc<HashMap<Audience, broadcast::Sender<Arc<str>>>>,
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        let rooms = Audience::ALL
            .iter()
            .map(|aud| {
                let (tx, _) = broadcast::channel(capacity.max(1));
                (*aud, tx)
            })
            .collect();
        Self {
            rooms: Arc::new(rooms),
        }
    }

    pub fn subscribe(&self, audience: Audience) -> broadcast::Receiver<Arc<str>> {
        self.sender(audience).subscribe()
    }

    pub fn subscriber_count(&self, audience: Audience) -> usize {
        self.sender(audience).receiver_count()
    }

    fn sender(&self, audience: Audience) -> &broadcast::Sender<Arc<str>> {
        // every audience gets a channel in `new`
        &self.rooms[&audience]
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Broadcaster for RoomHub {
    fn publish(&self, audience: Audience, event: &QueueEvent) {
        let frame: Arc<str> = match serde_json::to_string(event) {
            Ok(s) => s.into(),
            Err(e) => {
                tracing::error!(event = event.name(), error = %e, "failed to serialize event");
                return;
            }
        };

        // send() only errors when nobody is listening, which is fine
        match self.sender(audience).send(frame) {
            Ok(n) => tracing::debug!(event = event.name(), room = %audience, receivers = n, "event published"),
            Err(_) => tracing::trace!(event = event.name(), room = %audience, "no listeners"),
        }
    }
}
