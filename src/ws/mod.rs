use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Event types for WebSocket messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskPaused,
    TaskResumed,
    TaskDeleted,
    TaskRunCompleted,
    TaskRunFailed,
}

/// WebSocket event message
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

/// Payload for task lifecycle events
#[derive(Debug, Clone, Serialize)]
pub struct TaskEventPayload {
    pub name: String,
    pub status: String,
}

/// Payload for finished runs
#[derive(Debug, Clone, Serialize)]
pub struct RunEventPayload {
    pub task: String,
    pub run_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// WebSocket hub manages connections and broadcasts events
pub struct Hub {
    tx: broadcast::Sender<String>,
    client_count: Arc<RwLock<usize>>,
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            client_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Broadcast an event to all connected clients
    pub async fn broadcast_event(&self, event: Event) {
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Error serializing WebSocket event: {}", e);
                return;
            }
        };

        let count = *self.client_count.read().await;
        if count > 0 {
            if let Err(e) = self.tx.send(data) {
                tracing::warn!("Error broadcasting WebSocket event: {}", e);
            } else {
                tracing::debug!("Broadcasting {:?} to {} clients", event.event_type, count);
            }
        }
    }

    /// Broadcast a task lifecycle change
    pub async fn broadcast_task_update(&self, event_type: EventType, name: &str, status: &str) {
        self.broadcast_event(Event {
            event_type,
            payload: serde_json::to_value(TaskEventPayload {
                name: name.to_string(),
                status: status.to_string(),
            })
            .unwrap_or_default(),
        })
        .await;
    }

    /// Broadcast the outcome of a run
    pub async fn broadcast_run(&self, event_type: EventType, payload: RunEventPayload) {
        self.broadcast_event(Event {
            event_type,
            payload: serde_json::to_value(payload).unwrap_or_default(),
        })
        .await;
    }

    /// Get the number of connected clients
    pub async fn client_count(&self) -> usize {
        *self.client_count.read().await
    }

    /// Subscribe to events
    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Register a subscriber that counts as a connected client
    #[cfg(test)]
    pub async fn test_client(&self) -> broadcast::Receiver<String> {
        self.increment_clients().await;
        self.subscribe()
    }

    async fn increment_clients(&self) {
        let mut count = self.client_count.write().await;
        *count += 1;
        tracing::info!("WebSocket client connected. Total clients: {}", *count);
    }

    async fn decrement_clients(&self) {
        let mut count = self.client_count.write().await;
        *count = count.saturating_sub(1);
        tracing::info!("WebSocket client disconnected. Total clients: {}", *count);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket handler for axum
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();

    hub.increment_clients().await;

    // Subscribe to broadcast events
    let mut rx = hub.subscribe();

    // Task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Task to receive messages from client (just to keep connection alive)
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            if msg.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    hub.decrement_clients().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_serialization() {
        let event = Event {
            event_type: EventType::TaskRunFailed,
            payload: serde_json::to_value(RunEventPayload {
                task: "nightly".to_string(),
                run_time: "2024-06-01 10:00:00.000000".to_string(),
                results: None,
                error: Some("task not found: nightly".to_string()),
            })
            .unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_run_failed");
        assert_eq!(json["payload"]["task"], "nightly");
        assert!(json["payload"].get("results").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_without_clients_is_dropped() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();
        hub.broadcast_task_update(EventType::TaskPaused, "nightly", "suspended").await;
        assert_eq!(hub.client_count().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();
        hub.increment_clients().await;
        hub.broadcast_task_update(EventType::TaskResumed, "nightly", "active").await;

        let msg = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(json["type"], "task_resumed");
        assert_eq!(json["payload"]["status"], "active");
    }
}
