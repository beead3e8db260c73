use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::utils::{retry_with_backoff, RetryConfig, RetryResult};

use super::{with_timeout, BrokerError, Channel, Connector};

// ============================================================================
// Broker Connection
// ============================================================================
//
// Owned by the process entry point and shared by reference with every
// publisher and consumer. Lifecycle:
//
//   Disconnected ──connect──▶ Opening ──ok──▶ Healthy
//        ▲                       │              │
//        └────────failed─────────┘◀─invalidate──┘
//
//   any ──close──▶ Closed (terminal)
//
// Reconnect policy: every `connect()` makes a bounded number of attempts
// with exponential backoff, each under `connect_timeout`. When they are
// exhausted the channel stays unset and the caller gets the error; the next
// `connect()` starts a fresh round.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Opening,
    Healthy,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Opening => "opening",
            ConnectionState::Healthy => "healthy",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn as_gauge(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Opening => 1,
            ConnectionState::Healthy => 2,
            ConnectionState::Closed => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub reconnect: RetryConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect: RetryConfig::aggressive(),
        }
    }
}

struct Slot {
    channel: Option<Arc<dyn Channel>>,
    closed: bool,
}

pub struct BrokerConnection {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    slot: Mutex<Slot>,
    state: watch::Sender<ConnectionState>,
}

impl BrokerConnection {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            config,
            slot: Mutex::new(Slot {
                channel: None,
                closed: false,
            }),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                tracing::debug!(from = current.as_str(), to = next.as_str(), "Broker connection state changed");
                *current = next;
                true
            }
        });
    }

    /// Return the open channel, opening one if needed.
    pub async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut slot = self.slot.lock().await;

        if slot.closed {
            return Err(BrokerError::Closed);
        }
        if let Some(channel) = slot.channel.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }
        slot.channel = None;

        self.set_state(ConnectionState::Opening);
        let target = self.connector.describe();
        tracing::info!(broker = %target, "Connecting to broker");

        let connector = self.connector.clone();
        let timeout = self.config.connect_timeout;
        let result = retry_with_backoff(self.config.reconnect.clone(), |attempt| {
            let connector = connector.clone();
            async move {
                tracing::debug!(attempt = attempt, "Opening broker channel");
                with_timeout("connect", timeout, connector.open()).await
            }
        })
        .await;

        match result {
            RetryResult::Success(channel) => {
                tracing::info!(broker = %target, "✅ Connected to broker");
                slot.channel = Some(channel.clone());
                self.set_state(ConnectionState::Healthy);
                Ok(channel)
            }
            RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => {
                tracing::error!(broker = %target, error = %e, "Failed to connect to broker");
                self.set_state(ConnectionState::Disconnected);
                Err(match e {
                    BrokerError::Timeout { .. } | BrokerError::Connection(_) => e,
                    other => BrokerError::Connection(other.to_string()),
                })
            }
        }
    }

    /// Forget `failed` so the next `connect()` reopens. A no-op when the slot
    /// already holds a newer channel opened by another caller.
    pub async fn invalidate(&self, failed: &Arc<dyn Channel>) {
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return;
        }
        let current = slot.channel.as_ref().is_some_and(|channel| Arc::ptr_eq(channel, failed));
        if !current {
            tracing::debug!("Ignoring invalidate for a channel that was already replaced");
            return;
        }
        slot.channel = None;
        tracing::warn!("Dropping broken broker channel");
        let _ = failed.close().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close the channel for good.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        slot.closed = true;
        if let Some(channel) = slot.channel.take() {
            if let Err(e) = channel.close().await {
                tracing::warn!(error = %e, "Error while closing broker channel");
            }
        }
        self.set_state(ConnectionState::Closed);
        tracing::info!("🛑 Broker connection closed");
    }
}
