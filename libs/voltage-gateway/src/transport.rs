//! Request/reply correlation over the gateway tunnel
//!
//! The gateway is half-duplex and replies carry no transaction id, so the
//! transport keeps a single reply slot: drained before every send, filled by
//! the first valid payload on the data topic.

use crate::connection::ConnectionState;
use crate::error::{GatewayError, Result};
use crate::frame::{build_read_frame, FC_READ_HOLDING_REGISTERS};
use crate::logger::BusLogger;
use crate::pubsub::{MessageHandler, PubSubClient};
use async_trait::async_trait;
use common::hex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Register reads as seen by the meter logic
#[async_trait]
pub trait RegisterBus: Send + Sync {
    /// Read `count` holding registers starting at `address`; returns the raw register bytes
    async fn read_holding_registers(&self, slave_id: u8, address: u16, count: u16)
        -> Result<Vec<u8>>;
}

/// Topics and timing of one gateway
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub command_topic: String,
    pub data_topic: String,
    pub request_timeout: Duration,
}

/// Gateway transport
pub struct GatewayTransport {
    config: TransportConfig,
    client: Arc<dyn PubSubClient>,
    link_state: watch::Receiver<ConnectionState>,
    reply_tx: mpsc::Sender<Vec<u8>>,
    /// Held for a whole send/await exchange, so only one request is ever in flight
    reply_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    cancel: CancellationToken,
    logger: BusLogger,
}

impl GatewayTransport {
    pub fn new(
        config: TransportConfig,
        client: Arc<dyn PubSubClient>,
        link_state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
        logger: BusLogger,
    ) -> Self {
        let (reply_tx, reply_rx) = mpsc::channel(1);
        Self {
            config,
            client,
            link_state,
            reply_tx,
            reply_rx: Mutex::new(reply_rx),
            cancel,
            logger,
        }
    }

    pub fn data_topic(&self) -> &str {
        &self.config.data_topic
    }

    /// Validate an inbound payload and offer it to the reply slot
    ///
    /// Malformed payloads and payloads arriving while the slot is full are dropped.
    pub fn accept_reply(&self, payload: &[u8]) {
        let bytes = match Self::decode_reply(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.logger.log_dropped(&e.to_string(), payload.len());
                return;
            },
        };

        self.logger.log_frame("RX", None, None, &bytes);
        if let Err(mpsc::error::TrySendError::Full(_)) = self.reply_tx.try_send(bytes) {
            self.logger.log_dropped("reply slot occupied", payload.len());
        }
    }

    fn decode_reply(payload: &[u8]) -> Result<Vec<u8>> {
        let text =
            std::str::from_utf8(payload).map_err(|_| GatewayError::malformed("not UTF-8"))?;
        hex::validate_reply(text)
            .and_then(hex::decode)
            .map_err(|reason| GatewayError::malformed(reason.to_string()))
    }

    /// Send one request and wait for the next valid reply
    pub async fn send_and_await(
        &self,
        slave_id: u8,
        function: u8,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if !self.link_state.borrow().is_connected() {
            return Err(GatewayError::NotConnected);
        }

        let mut rx = tokio::select! {
            guard = self.reply_rx.lock() => guard,
            _ = self.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        // A late reply to an earlier, timed-out request must not be taken for this one
        while let Ok(stale) = rx.try_recv() {
            debug!(link = %self.logger.link(), "Discarding stale reply ({}B)", stale.len());
        }

        let frame = build_read_frame(slave_id, function, address, count);
        self.logger
            .log_frame("TX", Some(slave_id), Some(function), &frame);

        // One deadline covers the publish and the reply wait
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let publish = self.client.publish(
            &self.config.command_topic,
            hex::encode_upper(&frame).into_bytes(),
            false,
        );
        tokio::select! {
            published = publish => published?,
            _ = &mut deadline => return Err(GatewayError::Timeout(timeout)),
            _ = self.cancel.cancelled() => return Err(GatewayError::Cancelled),
        }

        tokio::select! {
            reply = rx.recv() => reply.ok_or(GatewayError::Cancelled),
            _ = &mut deadline => Err(GatewayError::Timeout(timeout)),
            _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }
}

impl MessageHandler for GatewayTransport {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic == self.config.data_topic {
            self.accept_reply(payload);
        }
    }
}

#[async_trait]
impl RegisterBus for GatewayTransport {
    async fn read_holding_registers(
        &self,
        slave_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u8>> {
        self.send_and_await(
            slave_id,
            FC_READ_HOLDING_REGISTERS,
            address,
            count,
            self.config.request_timeout,
        )
        .await
    }
}
