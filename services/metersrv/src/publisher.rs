//! Home Assistant publisher
//!
//! Discovery configs and availability are retained; states are plain
//! numeric strings on each register's topic.

use crate::config::{DeviceSettings, HomeAssistantSettings};
use crate::error::Result;
use crate::register::CommandResult;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use voltage_gateway::{ConnectionState, GatewayError, PubSubClient};

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Upper bound on handing one message to the broker client
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound side of the bridge
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_sensor_state(&self, result: &CommandResult) -> Result<()>;

    async fn publish_sensor_discovery(&self, result: &CommandResult) -> Result<()>;

    async fn publish_status_online(&self) -> Result<()>;

    async fn publish_status_offline(&self) -> Result<()>;

    async fn publish_diagnostic(&self, code: &str, message: &str) -> Result<()>;
}

pub struct MqttPublisher {
    client: Arc<dyn PubSubClient>,
    link_state: watch::Receiver<ConnectionState>,
    homeassistant: HomeAssistantSettings,
    device: DeviceSettings,
    publish_timeout: Duration,
}

impl MqttPublisher {
    pub fn new(
        client: Arc<dyn PubSubClient>,
        link_state: watch::Receiver<ConnectionState>,
        homeassistant: HomeAssistantSettings,
        device: DeviceSettings,
    ) -> Self {
        Self {
            client,
            link_state,
            homeassistant,
            device,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Discovery document for one sensor
    pub fn discovery_payload(&self, result: &CommandResult) -> Value {
        let mut payload = Map::new();
        payload.insert("name".into(), json!(result.name));
        payload.insert(
            "unique_id".into(),
            json!(format!("{}_{}", self.homeassistant.node_id, result.strategy_id)),
        );
        payload.insert("object_id".into(), json!(result.strategy_id));
        payload.insert("state_topic".into(), json!(result.topic));
        payload.insert(
            "availability_topic".into(),
            json!(self.homeassistant.status_topic()),
        );
        payload.insert("payload_available".into(), json!(STATUS_ONLINE));
        payload.insert("payload_not_available".into(), json!(STATUS_OFFLINE));

        if !result.unit.is_empty() {
            payload.insert("unit_of_measurement".into(), json!(result.unit));
        }
        // "calculated" is ours, not a Home Assistant device class
        if !result.device_class.is_empty() && result.device_class != "calculated" {
            payload.insert("device_class".into(), json!(result.device_class));
        }
        if !result.state_class.is_empty() {
            payload.insert("state_class".into(), json!(result.state_class));
        }

        let mut device = Map::new();
        device.insert("identifiers".into(), json!([self.homeassistant.node_id]));
        device.insert("name".into(), json!(self.device.name));
        if let Some(manufacturer) = &self.device.manufacturer {
            device.insert("manufacturer".into(), json!(manufacturer));
        }
        if let Some(model) = &self.device.model {
            device.insert("model".into(), json!(model));
        }
        payload.insert("device".into(), Value::Object(device));

        Value::Object(payload)
    }

    async fn send(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        if !self.link_state.borrow().is_connected() {
            return Err(GatewayError::NotConnected.into());
        }
        debug!("publish {} ({}B, retain={})", topic, payload.len(), retain);
        tokio::time::timeout(
            self.publish_timeout,
            self.client.publish(topic, payload, retain),
        )
        .await
        .map_err(|_| GatewayError::Timeout(self.publish_timeout))??;
        Ok(())
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish_sensor_state(&self, result: &CommandResult) -> Result<()> {
        self.send(&result.topic, format_state(result.value).into_bytes(), false)
            .await
    }

    async fn publish_sensor_discovery(&self, result: &CommandResult) -> Result<()> {
        let topic = self.homeassistant.discovery_topic(&result.strategy_id);
        let payload = self.discovery_payload(result).to_string();
        self.send(&topic, payload.into_bytes(), true).await
    }

    async fn publish_status_online(&self) -> Result<()> {
        self.send(
            &self.homeassistant.status_topic(),
            STATUS_ONLINE.as_bytes().to_vec(),
            true,
        )
        .await
    }

    async fn publish_status_offline(&self) -> Result<()> {
        self.send(
            &self.homeassistant.status_topic(),
            STATUS_OFFLINE.as_bytes().to_vec(),
            true,
        )
        .await
    }

    async fn publish_diagnostic(&self, code: &str, message: &str) -> Result<()> {
        let payload = json!({
            "code": code,
            "message": message,
            "device": self.device.name,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.send(
            &self.homeassistant.diagnostic_topic(),
            payload.to_string().into_bytes(),
            false,
        )
        .await
    }
}

/// Register values come from 32-bit floats; print them at that precision
fn format_state(value: f64) -> String {
    (value as f32).to_string()
}
