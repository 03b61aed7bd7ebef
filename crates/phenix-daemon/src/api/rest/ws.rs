//! Live notifications over WebSocket
//!
//! Each connection registers one broker subscriber with the caller's role and
//! forwards every publication the role may see as a JSON text frame:
//!
//! ```json
//! {"resource": "experiment/vm", "id": "exp1/web", "action": "start", "payload": {...}}
//! ```
//!
//! Client frames other than close are ignored. Dropping the connection drops
//! the subscription, which deregisters it.

use super::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    Extension,
};
use futures_util::{SinkExt, StreamExt};
use phenix_control::{RequestContext, Subscription};
use tracing::{debug, warn};

/// Upgrade to a WebSocket streaming role-filtered publications
pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    let subscription = state.plane.subscribe(&ctx);
    let user = ctx.user;
    ws.on_upgrade(move |socket| forward(socket, subscription, user))
}

async fn forward(socket: WebSocket, mut subscription: Subscription, user: String) {
    debug!(user = %user, subscriber = subscription.id(), "WebSocket subscriber connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            publication = subscription.recv() => {
                let Some(publication) = publication else { break };

                let frame = match serde_json::to_string(publication.as_ref()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(user = %user, error = %e, "Failed to encode publication");
                        continue;
                    }
                };

                if sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(user = %user, subscriber = subscription.id(), "WebSocket subscriber disconnected");
}
