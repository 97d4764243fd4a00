//! ==============================================================================
//! websocket.rs - esp32 websocket transport
//! ==============================================================================
//!
//! purpose:
//!     esp32 boards dial in at ws://<host>:<port>/esp32 instead of sitting on
//!     a usb cable. each board registers with an id and then receives every
//!     scroll_data command the relay broadcasts.
//!
//! protocol:
//!     server -> device   {"type":"welcome","message":...}         on connect
//!     device -> server   {"type":"register","deviceId":"esp32_1"}
//!     server -> device   {"type":"registered","message":...}
//!     server -> device   latest scroll_data, if any
//!     server -> device   {"type":"scroll_data","angle":..,"direction":..,"speed":..,"interval":..}
//!     anything else the device sends (acks, telemetry) is logged and dropped.
//!
//! relationships:
//!     - used by: device.rs (DeviceChannel::WebSocket), server.rs (GET /esp32)
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::device::{SendOutcome, TransportError};
use crate::domain::DeviceCommand;

struct Registration {
    /// distinguishes a reconnecting board from its stale socket
    connection: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct HubState {
    devices: HashMap<String, Registration>,
    latest: Option<DeviceCommand>,
}

#[derive(Default)]
struct HubInner {
    state: RwLock<HubState>,
    next_connection: AtomicU64,
}

/// registry of connected boards, shared by every socket task
#[derive(Clone, Default)]
pub struct Esp32Hub {
    inner: Arc<HubInner>,
}

impl Esp32Hub {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_connection(&self) -> u64 {
        self.inner.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// add a board; it gets the confirmation and the latest command first
    pub async fn register(&self, device_id: &str, connection: u64, tx: mpsc::UnboundedSender<String>) {
        let mut state = self.inner.state.write().await;

        let confirmation = json!({
            "type": "registered",
            "message": format!("Hello {device_id}! You are connected."),
        });
        let _ = tx.send(confirmation.to_string());
        if let Some(latest) = state.latest {
            let _ = tx.send(latest.to_message().to_string());
        }

        if state
            .devices
            .insert(device_id.to_string(), Registration { connection, tx })
            .is_some()
        {
            info!("[ESP32] {} re-registered, replacing the old connection", device_id);
        } else {
            info!("[ESP32] ✓ registered: {}", device_id);
        }
    }

    /// remove a board unless a newer connection already took its id
    pub async fn unregister(&self, device_id: &str, connection: u64) {
        let mut state = self.inner.state.write().await;
        if state
            .devices
            .get(device_id)
            .is_some_and(|r| r.connection == connection)
        {
            state.devices.remove(device_id);
            info!("[ESP32] disconnected: {}", device_id);
        }
    }

    pub async fn devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.read().await.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// send to every registered board, pruning the ones whose socket is gone
    pub async fn broadcast(&self, command: &DeviceCommand) -> Result<SendOutcome, TransportError> {
        let text = command.to_message().to_string();
        let mut state = self.inner.state.write().await;
        state.latest = Some(*command);

        state.devices.retain(|id, registration| {
            let alive = registration.tx.send(text.clone()).is_ok();
            if !alive {
                warn!("[ESP32] dropping {}: socket closed", id);
            }
            alive
        });

        if state.devices.is_empty() {
            return Err(TransportError::NoDevices);
        }
        debug!("[ESP32] sent to {} device(s): {}", state.devices.len(), text);
        Ok(SendOutcome::Unacknowledged)
    }

    /// drop every registration; their sockets close and the boards dial back in
    pub async fn close(&self) {
        let mut state = self.inner.state.write().await;
        let count = state.devices.len();
        state.devices.clear();
        if count > 0 {
            info!("[ESP32] closed {} connection(s)", count);
        }
    }
}

/// drive one device socket until it closes
pub async fn serve_socket(socket: WebSocket, hub: Esp32Hub) {
    let connection = hub.next_connection();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let welcome = json!({
        "type": "welcome",
        "message": r#"Send {"type":"register","deviceId":"esp32_1"} to register"#,
    });
    let _ = tx.send(welcome.to_string());

    // the writer ends once every sender is gone (hub closed or device dropped)
    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut unregistered = Some(tx);
    let mut device_id: Option<String> = None;

    loop {
        tokio::select! {
            _ = &mut writer => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let who = device_id.as_deref().unwrap_or("unregistered");
                    let value: Value = match serde_json::from_str(text.as_str()) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("[ESP32] unparseable message from {}: {}", who, e);
                            continue;
                        }
                    };

                    match value.get("type").and_then(Value::as_str) {
                        Some("register") => {
                            let Some(id) = value.get("deviceId").and_then(Value::as_str) else {
                                warn!("[ESP32] register without deviceId");
                                continue;
                            };
                            let Some(tx) = unregistered.take() else {
                                warn!("[ESP32] {} is already registered", who);
                                continue;
                            };
                            hub.register(id, connection, tx).await;
                            device_id = Some(id.to_string());
                        }
                        kind => debug!("[ESP32] {} from {}: {}", kind.unwrap_or("message"), who, value),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    if let Some(id) = device_id {
        hub.unregister(&id, connection).await;
    }
    writer.abort();
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn command(angle: u8) -> DeviceCommand {
        DeviceCommand {
            angle_deg: angle,
            direction: 1,
            speed_byte: 40,
            interval_ms: 500,
        }
    }

    fn parse(text: String) -> Value {
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn broadcast_reaches_every_device() {
        let hub = Esp32Hub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        hub.register("esp32_a", 1, tx_a).await;
        hub.register("esp32_b", 2, tx_b).await;
        assert_eq!(parse(rx_a.recv().await.unwrap())["type"], "registered");
        assert_eq!(parse(rx_b.recv().await.unwrap())["type"], "registered");

        hub.broadcast(&command(90)).await.unwrap();
        for rx in [&mut rx_a, &mut rx_b] {
            let msg = parse(rx.recv().await.unwrap());
            assert_eq!(msg["type"], "scroll_data");
            assert_eq!(msg["angle"], 90);
            assert_eq!(msg["interval"], 500);
        }
        assert_eq!(hub.devices().await, vec!["esp32_a", "esp32_b"]);
    }

    #[tokio::test]
    async fn late_device_gets_latest_command() {
        let hub = Esp32Hub::new();
        assert!(matches!(hub.broadcast(&command(12)).await, Err(TransportError::NoDevices)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("esp32_1", 1, tx).await;
        assert_eq!(parse(rx.recv().await.unwrap())["type"], "registered");
        assert_eq!(parse(rx.recv().await.unwrap())["angle"], 12);
    }

    #[tokio::test]
    async fn stale_connection_does_not_evict_new_one() {
        let hub = Esp32Hub::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        hub.register("esp32_1", 1, old_tx).await;
        hub.register("esp32_1", 2, new_tx).await;

        hub.unregister("esp32_1", 1).await;
        assert_eq!(hub.devices().await, vec!["esp32_1"]);
        hub.unregister("esp32_1", 2).await;
        assert!(hub.devices().await.is_empty());
    }

    #[tokio::test]
    async fn dead_sockets_are_pruned_and_close_clears() {
        let hub = Esp32Hub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register("esp32_1", 1, tx).await;
        drop(rx);
        assert!(matches!(hub.broadcast(&command(1)).await, Err(TransportError::NoDevices)));
        assert!(hub.devices().await.is_empty());

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("esp32_2", 2, tx).await;
        hub.close().await;
        assert!(hub.devices().await.is_empty());
        // registered + latest, then the channel ends
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
