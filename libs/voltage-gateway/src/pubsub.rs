//! Publish/subscribe seam and its MQTT implementation

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outbound half of a broker connection
#[async_trait]
pub trait PubSubClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Queue a clean disconnect behind any pending publishes
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Inbound message sink fed by the link supervisor
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// What the supervisor needs to know about one broker event
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Broker acknowledged the connection
    Connected,
    /// Message on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
    /// Anything else (pings, acks, outgoing notifications)
    Other,
}

/// Inbound half of a broker connection
#[async_trait]
pub trait LinkEvents: Send {
    /// Wait for the next event; an error means the connection is gone
    async fn next_event(&mut self) -> Result<LinkEvent>;
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// 0, 1 or 2; anything else falls back to 0
    #[serde(default)]
    pub qos: u8,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "metersrv".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            qos: 0,
        }
    }
}

pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// rumqttc-backed client
#[derive(Clone)]
pub struct MqttPubSub {
    client: AsyncClient,
    qos: QoS,
}

impl MqttPubSub {
    /// Create the client and the event loop that must be driven by a supervisor
    ///
    /// `last_will` is a retained `(topic, payload)` the broker publishes if the
    /// connection drops without a clean disconnect.
    pub fn connect(
        settings: &MqttSettings,
        last_will: Option<(String, String)>,
    ) -> (Self, MqttEventLoop) {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        let qos = qos_from_u8(settings.qos);

        if let Some((topic, payload)) = last_will {
            options.set_last_will(LastWill::new(topic, payload, qos, true));
        }

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username, password);
        }
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 10);
        (
            Self { client, qos },
            MqttEventLoop { eventloop },
        )
    }
}

#[async_trait]
impl PubSubClient for MqttPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .publish(topic, self.qos, retain, payload)
            .await
            .map_err(|e| GatewayError::publish(format!("{}: {}", topic, e)))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, self.qos)
            .await
            .map_err(|e| GatewayError::subscribe(format!("{}: {}", topic, e)))
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| GatewayError::connection(format!("disconnect: {}", e)))
    }
}

/// rumqttc event loop mapped onto [`LinkEvent`]
///
/// Polling again after an error makes rumqttc reconnect.
pub struct MqttEventLoop {
    eventloop: EventLoop,
}

#[async_trait]
impl LinkEvents for MqttEventLoop {
    async fn next_event(&mut self) -> Result<LinkEvent> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(LinkEvent::Connected),
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(LinkEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(_) => Ok(LinkEvent::Other),
            Err(e) => Err(GatewayError::connection(e.to_string())),
        }
    }
}
