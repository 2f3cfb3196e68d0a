use crate::hub::BroadcastHub;

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};

use lazy_static::lazy_static;
use governor::{RateLimiter, Quota, state::{InMemoryState, NotKeyed}, clock::DefaultClock};

use log::{info, warn};

use super::api::AppState;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if CONNECTION_LIMITER.check().is_err() {
        warn!("Global connection rate limit exceeded. Rejecting push upgrade.");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

/// Write-mostly loop: hub events go out as JSON text frames; the only
/// inbound traffic we act on is ping and close.
async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (id, mut events) = hub.register().await;
    let (mut tx, mut rx) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode push event for {}: {}", id, e);
                        continue;
                    }
                };
                if tx.send(Message::Text(json.into())).await.is_err() {
                    info!("Push connection {} went away mid-send", id);
                    break;
                }
            }
            inbound = rx.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Received close frame from push connection {}", id);
                        break;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {/* nothing else is expected on this channel */}
                    Some(Err(e)) => {
                        info!("Push connection {} errored: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    hub.unregister(id).await;
    info!("Push connection closed: {}", id);
}
