//! Real-time channel for kiosk displays and the admin dashboard.
//!
//! A client joins a room by sending `join:kiosk` or `join:admin` (or by
//! connecting with `?room=kiosk|admin`) and then receives every event
//! published to that room as a JSON text frame. A client may join both rooms.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SelectAll;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::events::{Audience, RoomHub};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub room: Option<String>,
}

/// GET /ws — upgrade and stream room events.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
) -> Response {
    let initial = params.room.as_deref().and_then(|r| r.parse::<Audience>().ok());
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| session(socket, hub, initial))
}

async fn session(socket: WebSocket, hub: RoomHub, initial: Option<Audience>) {
    let (mut sink, mut incoming) = socket.split();
    let mut joined: HashSet<Audience> = HashSet::new();
    let mut frames: SelectAll<BroadcastStream<Arc<str>>> = SelectAll::new();

    if let Some(room) = initial {
        join(&hub, room, &mut joined, &mut frames);
    }

    loop {
        tokio::select! {
            msg = incoming.next() => match msg {
                Some(Ok(Message::Text(text))) => match text.parse::<Audience>() {
                    Ok(room) => join(&hub, room, &mut joined, &mut frames),
                    Err(e) => tracing::debug!(error = %e, "ignoring client message"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
            Some(frame) = frames.next() => match frame {
                Ok(text) => {
                    if sink.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "websocket client lagging, events dropped");
                }
            },
        }
    }

    tracing::debug!(rooms = joined.len(), "websocket session ended");
}

fn join(
    hub: &RoomHub,
    room: Audience,
    joined: &mut HashSet<Audience>,
    frames: &mut SelectAll<BroadcastStream<Arc<str>>>,
) {
    if joined.insert(room) {
        frames.push(BroadcastStream::new(hub.subscribe(room)));
        tracing::debug!(room = %room, "websocket client joined");
    }
}
