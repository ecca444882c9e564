//! WebSocket endpoint for event observers.
//!
//! Each connection starts with no subscriptions and accumulates them via
//! explicit subscribe calls. Nothing survives a disconnect: a reconnecting
//! client re-subscribes to every topic it cares about, and missed events
//! are reconciled by re-fetching, not replayed.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::IntoResponse,
    routing::get,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::events::hub::{EventHub, HubEvent, SubscriptionTicket, Topic};

/// Actions a client can send over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    /// Subscribe to a topic, e.g. `{"action":"subscribe","topic":"agent:42"}`.
    Subscribe { topic: String },
    /// Drop a subscription.
    Unsubscribe { topic: String },
}

/// Control frames sent back to the client (events are serialized
/// [`HubEvent`]s and share the same `type` tagging).
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    Error { message: String },
}

/// Shared state for the events WebSocket.
#[derive(Clone)]
pub struct EventWsState {
    pub hub: Arc<EventHub>,
}

/// Build the Axum router for `/ws/events`.
pub fn event_routes(hub: Arc<EventHub>) -> Router {
    Router::new()
        .route("/ws/events", get(ws_handler))
        .with_state(EventWsState { hub })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<EventWsState>) -> impl IntoResponse {
    info!("Event observer connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<EventHub>) {
    info!("Event observer connected");

    // One channel per connection: every topic registers the same sender, so
    // the client's event stream is FIFO across all of its subscriptions.
    let (tx, rx) = mpsc::unbounded_channel::<HubEvent>();
    let mut events = UnboundedReceiverStream::new(rx);
    let mut subscriptions: HashMap<Topic, SubscriptionTicket> = HashMap::new();

    loop {
        tokio::select! {
            // Forward hub events to this client.
            event = events.next() => {
                match event {
                    Some(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Event observer disconnected during send");
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }

            // Handle subscribe/unsubscribe from the client.
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_action(&text, &hub, &tx, &mut subscriptions);
                        if let Ok(json) = serde_json::to_string(&reply) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event observer disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Event WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Dropping the tickets unregisters everything this connection held.
    info!(subscriptions = subscriptions.len(), "Event observer connection closed");
}

fn handle_action(
    text: &str,
    hub: &Arc<EventHub>,
    tx: &mpsc::UnboundedSender<HubEvent>,
    subscriptions: &mut HashMap<Topic, SubscriptionTicket>,
) -> ControlFrame {
    let action: ClientAction = match serde_json::from_str(text) {
        Ok(action) => action,
        Err(e) => {
            debug!(error = %e, text, "Unrecognized event WS message");
            return ControlFrame::Error {
                message: format!("unrecognized message: {e}"),
            };
        }
    };

    match action {
        ClientAction::Subscribe { topic } => match topic.parse::<Topic>() {
            Ok(parsed) => {
                // Re-subscribing to the same topic is a no-op.
                subscriptions
                    .entry(parsed.clone())
                    .or_insert_with(|| hub.attach(parsed, tx.clone()));
                ControlFrame::Subscribed { topic }
            }
            Err(message) => ControlFrame::Error { message },
        },
        ClientAction::Unsubscribe { topic } => match topic.parse::<Topic>() {
            Ok(parsed) => {
                subscriptions.remove(&parsed);
                ControlFrame::Unsubscribed { topic }
            }
            Err(message) => ControlFrame::Error { message },
        },
    }
}
