//! Broker link lifecycle
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`, forever, until
//! the process-wide cancellation token fires. The current state is exposed
//! through a `watch` channel so requests can fail fast while the link is down.

use crate::error::{GatewayError, Result};
use crate::logger::BusLogger;
use crate::pubsub::{LinkEvent, LinkEvents, MessageHandler, PubSubClient};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Broker connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Check if state represents an active connection
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether `next` directly follows `self` in the lifecycle
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Disconnected)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Owner of the link state; hands out receivers to readers
#[derive(Debug)]
pub struct LinkState {
    tx: watch::Sender<ConnectionState>,
    logger: BusLogger,
}

impl LinkState {
    pub fn new(logger: BusLogger) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, logger }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn logger(&self) -> &BusLogger {
        &self.logger
    }

    /// Move to `next`; refuses transitions that would skip a state
    pub fn transition(&self, next: ConnectionState, reason: &str) -> bool {
        let old = self.current();
        if old == next {
            return true;
        }
        if !old.can_transition_to(next) {
            warn!(link = %self.logger.link(), "Refusing link transition {} -> {}", old, next);
            return false;
        }
        self.tx.send_replace(next);
        self.logger.log_status(old, next, reason);
        true
    }
}

/// Reconnection policy configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    /// Whether to add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms.max(initial_delay_ms)),
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let mut delay = self
            .initial_delay
            .mul_f64(self.backoff_multiplier.powi(exponent))
            .min(self.max_delay);

        if self.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }
        delay
    }
}

/// Link supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Human readable broker address for logs
    pub target: String,
    /// Upper bound on waiting for the broker's connection acknowledgement
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Topics (re)subscribed after every successful connect
    pub subscriptions: Vec<String>,
}

enum SessionEnd {
    Lost(String),
    Cancelled,
}

/// Drives the broker event loop and keeps the link alive
///
/// The [`LinkState`] is created by the caller so readers (the transport) can
/// subscribe before the supervisor, whose message handler they are, exists.
pub struct LinkSupervisor {
    config: SupervisorConfig,
    client: Arc<dyn PubSubClient>,
    handler: Arc<dyn MessageHandler>,
    state: LinkState,
    logger: BusLogger,
}

impl LinkSupervisor {
    pub fn new(
        config: SupervisorConfig,
        client: Arc<dyn PubSubClient>,
        handler: Arc<dyn MessageHandler>,
        state: LinkState,
    ) -> Self {
        let logger = state.logger().clone();
        Self {
            config,
            client,
            handler,
            state,
            logger,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run until `cancel` fires; never gives up on the broker
    pub async fn run<E: LinkEvents>(&self, mut events: E, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            attempt += 1;
            self.state.transition(ConnectionState::Connecting, "connect");
            self.logger.log_connect(&self.config.target, attempt);

            let reason = match self.await_connected(&mut events, &cancel).await {
                Ok(()) => match self.start_session().await {
                    Ok(()) => {
                        attempt = 0;
                        match self.pump(&mut events, &cancel).await {
                            SessionEnd::Lost(reason) => reason,
                            SessionEnd::Cancelled => {
                                self.state
                                    .transition(ConnectionState::Disconnected, "cancelled");
                                break;
                            },
                        }
                    },
                    Err(e) => e.to_string(),
                },
                Err(GatewayError::Cancelled) => {
                    self.state
                        .transition(ConnectionState::Disconnected, "cancelled");
                    break;
                },
                Err(e) => e.to_string(),
            };

            self.state.transition(ConnectionState::Disconnected, &reason);

            let delay = self.config.reconnect.delay_for(attempt.max(1));
            self.logger.log_retry(attempt.max(1), delay, &reason);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = cancel.cancelled() => break,
            }
        }

        debug!(link = %self.logger.link(), "Link supervisor stopped");
    }

    /// Bounded wait for the connection acknowledgement
    async fn await_connected<E: LinkEvents>(
        &self,
        events: &mut E,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let wait = async {
            loop {
                match events.next_event().await? {
                    LinkEvent::Connected => return Ok::<(), GatewayError>(()),
                    LinkEvent::Message { topic, .. } => {
                        trace!("Ignoring message on {} before connack", topic)
                    },
                    LinkEvent::Other => {},
                }
            }
        };

        tokio::select! {
            result = tokio::time::timeout(self.config.connect_timeout, wait) => match result {
                Ok(inner) => inner,
                Err(_) => Err(GatewayError::connection(format!(
                    "no connack within {:?}",
                    self.config.connect_timeout
                ))),
            },
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }

    async fn start_session(&self) -> Result<()> {
        self.state
            .transition(ConnectionState::Connected, "connack received");
        for topic in &self.config.subscriptions {
            self.client.subscribe(topic).await?;
            debug!(link = %self.logger.link(), "Subscribed: {}", topic);
        }
        Ok(())
    }

    /// Route messages until the connection drops or cancellation fires
    async fn pump<E: LinkEvents>(&self, events: &mut E, cancel: &CancellationToken) -> SessionEnd {
        loop {
            tokio::select! {
                event = events.next_event() => match event {
                    Ok(LinkEvent::Message { topic, payload }) => {
                        self.handler.on_message(&topic, &payload);
                    },
                    Ok(LinkEvent::Connected) => {
                        debug!(link = %self.logger.link(), "Duplicate connack");
                    },
                    Ok(LinkEvent::Other) => {},
                    Err(e) => return SessionEnd::Lost(e.to_string()),
                },
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
            }
        }
    }
}
