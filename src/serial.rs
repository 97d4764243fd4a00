//! ==============================================================================
//! serial.rs - self-healing serial link to the arduino / esp32
//! ==============================================================================
//!
//! purpose:
//!     owns the one open port handle. opens it with a bounded, fixed-delay
//!     retry, writes newline-terminated commands, waits briefly for a reply
//!     line, and re-opens the port when it drops out underneath us.
//!
//! state machine:
//!
//!     Closed ──open()──> Opening ──ok──> Open
//!        ^                  │              │
//!        └──retries spent───┘              │ write/read failure
//!        ^                                 v
//!        └────────── supervisor: wait reconnect_delay, re-run open ──┘
//!
//!     a "resource busy" open error (port held by another process) is an
//!     expected condition and simply consumes one retry.
//!     close() is user intent: the supervisor stays quiet until the next
//!     open() / reconnect().
//!
//! relationships:
//!     - used by: device.rs (DeviceChannel::Serial)
//!     - uses: hal.rs (PortProvider / PortHandle)
//!
//! ==============================================================================

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::SerialConfig;
use crate::device::{SendOutcome, TransportError};
use crate::domain::DeviceCommand;
use crate::hal::{is_busy, PortHandle, PortProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Closed,
    Opening,
    Open,
}

struct LinkInner {
    provider: Arc<dyn PortProvider>,
    config: SerialConfig,
    /// the open handle; holding the lock also serialises write + ack read
    port: Mutex<Option<Arc<dyn PortHandle>>>,
    /// one open sequence at a time
    open_lock: Mutex<()>,
    state: watch::Sender<LinkState>,
    lost: Notify,
    user_closed: AtomicBool,
    last_error: StdMutex<Option<String>>,
}

/// clone-able handle to the shared link
#[derive(Clone)]
pub struct SerialLink {
    inner: Arc<LinkInner>,
}

impl SerialLink {
    pub fn new(provider: Arc<dyn PortProvider>, config: SerialConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Closed);
        Self {
            inner: Arc::new(LinkInner {
                provider,
                config,
                port: Mutex::new(None),
                open_lock: Mutex::new(()),
                state,
                lost: Notify::new(),
                user_closed: AtomicBool::new(false),
                last_error: StdMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    pub fn path(&self) -> &str {
        &self.inner.config.path
    }

    pub fn provider_name(&self) -> &'static str {
        self.inner.provider.name()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: LinkState) {
        self.inner.state.send_replace(state);
    }

    fn set_error(&self, error: Option<String>) {
        *self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// acquire the port with the configured retry budget
    pub async fn open(&self) -> Result<(), TransportError> {
        self.inner.user_closed.store(false, Ordering::SeqCst);
        self.open_with_retry().await
    }

    async fn open_with_retry(&self) -> Result<(), TransportError> {
        let _opening = self.inner.open_lock.lock().await;
        if self.state() == LinkState::Open {
            return Ok(());
        }

        let config = &self.inner.config;
        let attempts = config.open_retries.saturating_add(1);
        let mut reason = String::new();

        self.set_state(LinkState::Opening);
        info!("[SERIAL] opening {} at {} baud", config.path, config.baud_rate);

        for attempt in 1..=attempts {
            let provider = self.inner.provider.clone();
            let path = config.path.clone();
            let baud_rate = config.baud_rate;
            let result = tokio::task::spawn_blocking(move || provider.open(&path, baud_rate))
                .await
                .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e.to_string())));

            match result {
                Ok(handle) => {
                    // close() raises user_closed before taking this lock
                    let mut port = self.inner.port.lock().await;
                    if self.inner.user_closed.load(Ordering::SeqCst) {
                        drop(port);
                        debug!("[SERIAL] closed while opening, releasing {}", config.path);
                        self.set_state(LinkState::Closed);
                        return Err(TransportError::NotOpen);
                    }
                    *port = Some(Arc::from(handle));
                    self.set_error(None);
                    self.set_state(LinkState::Open);
                    drop(port);
                    info!("[SERIAL] ✓ port open: {}", config.path);
                    return Ok(());
                }
                Err(e) => {
                    if is_busy(&e) {
                        warn!(
                            "[SERIAL] {} is busy (held by another process), attempt {}/{}",
                            config.path, attempt, attempts
                        );
                    } else {
                        warn!(
                            "[SERIAL] open {} failed: {} (attempt {}/{})",
                            config.path, e, attempt, attempts
                        );
                    }
                    reason = e.to_string();

                    if attempt < attempts {
                        debug!("[SERIAL] retrying in {}ms", config.retry_delay_ms);
                        tokio::time::sleep(config.retry_delay()).await;
                        if self.inner.user_closed.load(Ordering::SeqCst) {
                            debug!("[SERIAL] closed while retrying, giving up");
                            self.set_state(LinkState::Closed);
                            return Err(TransportError::NotOpen);
                        }
                    }
                }
            }
        }

        self.set_error(Some(reason.clone()));
        self.set_state(LinkState::Closed);
        Err(TransportError::Unavailable {
            path: config.path.clone(),
            attempts,
            reason,
        })
    }

    /// write one command and wait (bounded) for a reply line
    pub async fn send(&self, command: &DeviceCommand) -> Result<SendOutcome, TransportError> {
        let line = command.encode(self.inner.config.wire_format);
        let mut guard = self.inner.port.lock().await;
        let port = match guard.as_ref() {
            Some(port) => port.clone(),
            None => {
                debug!("[SERIAL] port not open, dropping command");
                return Err(TransportError::NotOpen);
            }
        };

        debug!("[SERIAL] -> {}", line.trim_end());
        let writer = port.clone();
        let written = tokio::task::spawn_blocking(move || writer.write_line(line.as_bytes())).await?;
        if let Err(e) = written {
            *guard = None;
            drop(guard);
            self.on_lost(format!("write failed: {e}"));
            return Err(TransportError::Write(e));
        }

        let ack_timeout = self.inner.config.ack_timeout();
        if ack_timeout.is_zero() {
            return Ok(SendOutcome::Unacknowledged);
        }

        let reply = tokio::task::spawn_blocking(move || port.read_reply(ack_timeout)).await?;
        match reply {
            Ok(Some(reply)) => {
                debug!("[SERIAL] <- {}", reply);
                Ok(SendOutcome::Acknowledged { reply })
            }
            Ok(None) => Ok(SendOutcome::Unacknowledged),
            Err(e) => {
                // the command went out; the port died while we listened
                *guard = None;
                drop(guard);
                self.on_lost(format!("read failed: {e}"));
                Ok(SendOutcome::Unacknowledged)
            }
        }
    }

    /// release the port; safe when never opened
    pub async fn close(&self) {
        self.inner.user_closed.store(true, Ordering::SeqCst);
        let mut port = self.inner.port.lock().await;
        let had_port = port.take().is_some();
        self.set_state(LinkState::Closed);
        drop(port);
        if had_port {
            info!("[SERIAL] port closed: {}", self.inner.config.path);
        }
    }

    pub async fn reconnect(&self) -> Result<(), TransportError> {
        info!("[SERIAL] reconnect requested");
        self.close().await;
        self.open().await
    }

    /// Open -> Closed without user intent: wake the supervisor
    fn on_lost(&self, reason: String) {
        warn!("[SERIAL] ⚠ link lost: {}", reason);
        self.set_error(Some(reason));
        self.set_state(LinkState::Closed);
        self.inner.lost.notify_one();
    }

    /// re-opens the port after every unexpected close, for the life of the process
    pub fn spawn_supervisor(&self) -> tokio::task::JoinHandle<()> {
        let link = self.clone();
        tokio::spawn(async move { link.supervise().await })
    }

    async fn supervise(&self) {
        loop {
            self.inner.lost.notified().await;

            loop {
                tokio::time::sleep(self.inner.config.reconnect_delay()).await;
                if self.inner.user_closed.load(Ordering::SeqCst) || self.state() == LinkState::Open {
                    break;
                }
                match self.open_with_retry().await {
                    Ok(()) => {
                        info!("[SERIAL] ✓ link restored");
                        break;
                    }
                    Err(e) => warn!("[SERIAL] re-open failed: {}; retrying", e),
                }
            }
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WireFormat;
    use crate::hal::MockProvider;
    use std::time::Duration;

    fn test_config() -> SerialConfig {
        SerialConfig {
            path: "/dev/ttyMOCK0".to_string(),
            baud_rate: 9600,
            open_retries: 3,
            retry_delay_ms: 5,
            reconnect_delay_ms: 5,
            ack_timeout_ms: 0,
            wire_format: WireFormat::Csv,
        }
    }

    fn command(angle: u8, direction: u8) -> DeviceCommand {
        DeviceCommand {
            angle_deg: angle,
            direction,
            speed_byte: 0,
            interval_ms: 100,
        }
    }

    async fn wait_for(link: &SerialLink, target: LinkState) {
        let mut rx = link.inner.state.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *rx.borrow_and_update() != target {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("link never reached target state");
    }

    #[tokio::test]
    async fn busy_port_is_retried_until_free() {
        let mock = MockProvider::new().busy_for(2);
        let link = SerialLink::new(Arc::new(mock.clone()), test_config());

        link.open().await.unwrap();
        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(mock.open_attempts(), 3);
        assert_eq!(link.last_error(), None);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let mock = MockProvider::new().always_busy();
        let link = SerialLink::new(Arc::new(mock.clone()), test_config());

        let err = link.open().await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable { attempts: 4, .. }));
        assert_eq!(mock.open_attempts(), 4);
        assert_eq!(link.state(), LinkState::Closed);
        assert!(link.last_error().is_some());
    }

    #[tokio::test]
    async fn send_and_close_without_open() {
        let link = SerialLink::new(Arc::new(MockProvider::new()), test_config());
        link.close().await;
        assert!(matches!(link.send(&command(10, 1)).await, Err(TransportError::NotOpen)));
    }

    #[tokio::test]
    async fn writes_csv_and_reads_acknowledgement() {
        let mock = MockProvider::new().with_reply("OK 90");
        let config = SerialConfig {
            ack_timeout_ms: 50,
            ..test_config()
        };
        let link = SerialLink::new(Arc::new(mock.clone()), config);
        link.open().await.unwrap();

        let outcome = link.send(&command(90, 1)).await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Acknowledged {
                reply: "OK 90".to_string()
            }
        );
        assert_eq!(mock.written(), vec!["90,1\n".to_string()]);
    }

    #[tokio::test]
    async fn write_failure_closes_and_supervisor_reopens() {
        let mock = MockProvider::new();
        let link = SerialLink::new(Arc::new(mock.clone()), test_config());
        let supervisor = link.spawn_supervisor();
        link.open().await.unwrap();

        mock.fail_writes(true);
        assert!(matches!(link.send(&command(1, 0)).await, Err(TransportError::Write(_))));
        mock.fail_writes(false);

        wait_for(&link, LinkState::Open).await;
        assert_eq!(mock.open_attempts(), 2);
        assert_eq!(link.send(&command(2, 0)).await.unwrap(), SendOutcome::Unacknowledged);
        assert_eq!(mock.written(), vec!["2,0\n".to_string()]);

        supervisor.abort();
    }

    #[tokio::test]
    async fn user_close_is_not_healed() {
        let mock = MockProvider::new();
        let link = SerialLink::new(Arc::new(mock.clone()), test_config());
        let supervisor = link.spawn_supervisor();
        link.open().await.unwrap();

        link.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(mock.open_attempts(), 1);

        link.reconnect().await.unwrap();
        assert_eq!(link.state(), LinkState::Open);
        assert_eq!(mock.open_attempts(), 2);

        supervisor.abort();
    }

    #[tokio::test]
    async fn close_during_open_wins() {
        let mock = MockProvider::new().always_busy();
        let config = SerialConfig {
            open_retries: 50,
            retry_delay_ms: 20,
            ..test_config()
        };
        let link = SerialLink::new(Arc::new(mock.clone()), config);

        let opener = link.clone();
        let opening = tokio::spawn(async move { opener.open().await });
        wait_for(&link, LinkState::Opening).await;
        link.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), opening)
            .await
            .expect("open kept retrying after close")
            .unwrap();
        assert!(matches!(result, Err(TransportError::NotOpen)));
        assert_eq!(link.state(), LinkState::Closed);
        assert!(mock.open_attempts() < 51);
        assert!(link.inner.port.lock().await.is_none());
    }
}
