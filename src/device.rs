//! ==============================================================================
//! device.rs - device communication channel
//! ==============================================================================
//!
//! purpose:
//!     one handle for "the device", whichever transport the config selects.
//!     the relay and the http handlers only ever talk to DeviceChannel.
//!
//! transports:
//!     - serial:    SerialLink over serial2 (serial.rs)
//!     - mock:      SerialLink over an in-memory port (hal.rs)
//!     - websocket: Esp32Hub, devices dial in at /esp32 (websocket.rs)
//!     - disabled:  every send fails with TransportError::Disabled
//!
//! failure policy:
//!     every transport failure comes back as a TransportError value. nothing
//!     is queued for redelivery: the next scroll update supersedes it.
//!
//! ==============================================================================

use std::io;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::{DeviceConfig, TransportKind};
use crate::domain::DeviceCommand;
use crate::hal::{MockProvider, PortProvider, Serial2Provider};
use crate::serial::{LinkState, SerialLink};
use crate::websocket::Esp32Hub;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port {path} unavailable after {attempts} attempts: {reason}")]
    Unavailable {
        path: String,
        attempts: u32,
        reason: String,
    },
    #[error("transport not open")]
    NotOpen,
    #[error("no devices registered")]
    NoDevices,
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("device transport disabled")]
    Disabled,
    #[error("blocking i/o task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// what happened to a command that reached the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SendOutcome {
    /// the device answered with a reply line
    Acknowledged { reply: String },
    /// written, but no reply within the acknowledgement window
    Unacknowledged,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub transport: String,
    pub state: LinkState,
    pub devices: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub enum DeviceChannel {
    Serial(SerialLink),
    WebSocket(Esp32Hub),
    Disabled,
}

impl DeviceChannel {
    pub fn from_config(config: &DeviceConfig) -> Self {
        match config.transport {
            TransportKind::Serial => Self::serial(Arc::new(Serial2Provider), config),
            TransportKind::Mock => Self::serial(Arc::new(MockProvider::new()), config),
            TransportKind::Websocket => DeviceChannel::WebSocket(Esp32Hub::new()),
            TransportKind::Disabled => DeviceChannel::Disabled,
        }
    }

    /// serial link over the given port provider
    pub fn serial(provider: Arc<dyn PortProvider>, config: &DeviceConfig) -> Self {
        DeviceChannel::Serial(SerialLink::new(provider, config.serial.clone()))
    }

    /// acquire the transport (bounded retry for serial)
    pub async fn open(&self) -> Result<(), TransportError> {
        match self {
            DeviceChannel::Serial(link) => link.open().await,
            // devices connect to us
            DeviceChannel::WebSocket(_) => Ok(()),
            DeviceChannel::Disabled => Err(TransportError::Disabled),
        }
    }

    pub async fn send(&self, command: &DeviceCommand) -> Result<SendOutcome, TransportError> {
        match self {
            DeviceChannel::Serial(link) => link.send(command).await,
            DeviceChannel::WebSocket(hub) => hub.broadcast(command).await,
            DeviceChannel::Disabled => Err(TransportError::Disabled),
        }
    }

    /// release the transport; safe when never opened
    pub async fn close(&self) {
        match self {
            DeviceChannel::Serial(link) => link.close().await,
            DeviceChannel::WebSocket(hub) => hub.close().await,
            DeviceChannel::Disabled => {}
        }
    }

    pub async fn reconnect(&self) -> Result<(), TransportError> {
        match self {
            DeviceChannel::Serial(link) => link.reconnect().await,
            DeviceChannel::WebSocket(hub) => {
                // dropping the sockets makes the firmware dial back in
                hub.close().await;
                Ok(())
            }
            DeviceChannel::Disabled => Err(TransportError::Disabled),
        }
    }

    /// start background tasks owned by the transport (serial self-healing)
    pub fn spawn_supervisor(&self) -> Option<tokio::task::JoinHandle<()>> {
        match self {
            DeviceChannel::Serial(link) => Some(link.spawn_supervisor()),
            DeviceChannel::WebSocket(_) | DeviceChannel::Disabled => None,
        }
    }

    pub fn hub(&self) -> Option<&Esp32Hub> {
        match self {
            DeviceChannel::WebSocket(hub) => Some(hub),
            _ => None,
        }
    }

    pub fn transport_name(&self) -> String {
        match self {
            DeviceChannel::Serial(link) => link.provider_name().to_string(),
            DeviceChannel::WebSocket(_) => "websocket".to_string(),
            DeviceChannel::Disabled => "disabled".to_string(),
        }
    }

    pub async fn status(&self) -> ChannelStatus {
        let transport = self.transport_name();
        match self {
            DeviceChannel::Serial(link) => ChannelStatus {
                transport,
                state: link.state(),
                devices: vec![link.path().to_string()],
                last_error: link.last_error(),
            },
            DeviceChannel::WebSocket(hub) => {
                let devices = hub.devices().await;
                ChannelStatus {
                    transport,
                    state: if devices.is_empty() {
                        LinkState::Closed
                    } else {
                        LinkState::Open
                    },
                    devices,
                    last_error: None,
                }
            }
            DeviceChannel::Disabled => ChannelStatus {
                transport,
                state: LinkState::Closed,
                devices: Vec::new(),
                last_error: None,
            },
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_channel_refuses_quietly() {
        let channel = DeviceChannel::Disabled;
        channel.close().await;
        let cmd = DeviceCommand {
            angle_deg: 0,
            direction: 0,
            speed_byte: 0,
            interval_ms: 100,
        };
        assert!(matches!(channel.send(&cmd).await, Err(TransportError::Disabled)));
        assert_eq!(channel.status().await.state, LinkState::Closed);
    }

    #[tokio::test]
    async fn websocket_without_devices_reports_no_devices() {
        let config = DeviceConfig {
            transport: TransportKind::Websocket,
            ..Default::default()
        };
        let channel = DeviceChannel::from_config(&config);
        channel.open().await.unwrap();
        let cmd = DeviceCommand {
            angle_deg: 45,
            direction: 1,
            speed_byte: 10,
            interval_ms: 100,
        };
        assert!(matches!(channel.send(&cmd).await, Err(TransportError::NoDevices)));
        assert_eq!(channel.transport_name(), "websocket");
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let json = serde_json::to_value(SendOutcome::Acknowledged {
            reply: "ok".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "acknowledged");
        assert_eq!(json["reply"], "ok");
    }
}
