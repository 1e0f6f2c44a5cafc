//! metersrv configuration
//!
//! Loaded from a YAML file with `METERSRV_` environment overrides
//! (`METERSRV_MQTT__HOST=broker` sets `mqtt.host`). Validation runs once at
//! load time; the core only ever sees the resulting immutable descriptors.

use crate::error::{MeterError, Result};
use crate::grouping::{GroupConfig, RegisterGroup, MAX_READ_REGISTERS};
use crate::register::{RegisterDescriptor, REGISTERS_PER_VALUE};
use crate::strategy::{Strategy, StrategyKind};
use common::logging::LogConfig;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use voltage_gateway::{MqttSettings, ReconnectPolicy};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "METERSRV_";

/// Gateway tunnel topics and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Topic the gateway reads request frames from
    pub command_topic: String,
    /// Topic the gateway publishes replies on
    pub data_topic: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_initial_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

impl GatewaySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_config(self.reconnect_initial_delay_ms, self.reconnect_max_delay_ms)
    }
}

/// Home Assistant discovery and availability topics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeAssistantSettings {
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_base_topic() -> String {
    "metersrv".to_string()
}

fn default_node_id() -> String {
    "metersrv".to_string()
}

impl Default for HomeAssistantSettings {
    fn default() -> Self {
        Self {
            discovery_prefix: default_discovery_prefix(),
            base_topic: default_base_topic(),
            node_id: default_node_id(),
        }
    }
}

impl HomeAssistantSettings {
    /// Retained availability topic
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.base_topic)
    }

    pub fn diagnostic_topic(&self) -> String {
        format!("{}/diagnostic", self.base_topic)
    }

    pub fn discovery_topic(&self, key: &str) -> String {
        format!(
            "{}/sensor/{}/{}/config",
            self.discovery_prefix, self.node_id, key
        )
    }

    /// State topic for registers that do not name one
    pub fn state_topic(&self, key: &str) -> String {
        format!("{}/{}/state", self.base_topic, key)
    }
}

/// The metered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Prepended to every register key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_device_name() -> String {
    "Energy Meter".to_string()
}

fn default_key_prefix() -> String {
    "meter_".to_string()
}

fn default_slave_id() -> u8 {
    1
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            key_prefix: default_key_prefix(),
            slave_id: default_slave_id(),
            manufacturer: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_grace_period_secs() -> u64 {
    60
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    #[serde(default)]
    pub mqtt: MqttSettings,
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub homeassistant: HomeAssistantSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub logging: LogConfig,
    pub registers: Vec<RegisterDescriptor>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

impl MeterConfig {
    /// Load from `path`, apply environment overrides, validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(MeterError::config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Parse and validate an in-memory YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Yaml::string(yaml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| MeterError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        debug!(
            "{} registers in {} groups",
            config.registers.len(),
            config.groups.len()
        );
        Ok(config)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.health.grace_period_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.device.key_prefix, key)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.command_topic.is_empty() || self.gateway.data_topic.is_empty() {
            return Err(MeterError::config("gateway topics must not be empty"));
        }
        if self.gateway.command_topic == self.gateway.data_topic {
            return Err(MeterError::config(
                "gateway command and data topics must differ",
            ));
        }
        if self.gateway.request_timeout_ms == 0 {
            return Err(MeterError::config("gateway.request_timeout_ms must be positive"));
        }
        if self.cache_ttl_secs == 0 {
            return Err(MeterError::config("cache_ttl_secs must be positive"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(MeterError::config("heartbeat_interval_secs must be positive"));
        }
        if self.registers.is_empty() {
            return Err(MeterError::config("no registers configured"));
        }

        let mut kinds = HashMap::with_capacity(self.registers.len());
        for register in &self.registers {
            if register.key.is_empty() {
                return Err(MeterError::config(format!(
                    "register '{}' has an empty key",
                    register.name
                )));
            }
            let kind = StrategyKind::from_device_class(&register.device_class);
            if kinds.insert(register.key.as_str(), kind).is_some() {
                return Err(MeterError::config(format!(
                    "duplicate register key '{}'",
                    register.key
                )));
            }
        }

        for register in &self.registers {
            self.validate_dependencies(register, &kinds)?;
        }

        self.validate_groups(&kinds)
    }

    fn validate_dependencies(
        &self,
        register: &RegisterDescriptor,
        kinds: &HashMap<&str, StrategyKind>,
    ) -> Result<()> {
        match StrategyKind::from_device_class(&register.device_class) {
            StrategyKind::Calculated => {
                let formula = register
                    .formula
                    .as_deref()
                    .filter(|f| !f.trim().is_empty())
                    .ok_or_else(|| {
                        MeterError::config(format!(
                            "calculated register '{}' needs a formula",
                            register.key
                        ))
                    })?;
                for variable in voltage_calc::extract_variables(formula)? {
                    if variable == register.key || !kinds.contains_key(variable.as_str()) {
                        return Err(MeterError::config(format!(
                            "formula of '{}' references unknown register '{}'",
                            register.key, variable
                        )));
                    }
                }
            },
            StrategyKind::ReactivePower => {
                for dependency in [register.active_power_key(), register.apparent_power_key()] {
                    match kinds.get(dependency) {
                        Some(kind) if !kind.is_self_computing() => {},
                        Some(_) => {
                            return Err(MeterError::config(format!(
                                "reactive register '{}' must depend on measured register, '{}' is derived",
                                register.key, dependency
                            )))
                        },
                        None => {
                            return Err(MeterError::config(format!(
                                "reactive register '{}' references unknown register '{}'",
                                register.key, dependency
                            )))
                        },
                    }
                }
            },
            _ => {},
        }
        Ok(())
    }

    fn validate_groups(&self, kinds: &HashMap<&str, StrategyKind>) -> Result<()> {
        let addresses: HashMap<&str, u16> = self
            .registers
            .iter()
            .map(|r| (r.key.as_str(), r.address))
            .collect();
        let mut names = HashSet::new();
        let mut grouped = HashSet::new();

        for group in &self.groups {
            if !names.insert(group.name.as_str()) {
                return Err(MeterError::config(format!(
                    "duplicate group name '{}'",
                    group.name
                )));
            }
            if group.interval_ms == 0 {
                return Err(MeterError::config(format!(
                    "group '{}' needs a positive interval_ms",
                    group.name
                )));
            }
            if group.registers.is_empty() {
                return Err(MeterError::config(format!(
                    "group '{}' has no registers",
                    group.name
                )));
            }

            let mut bounds: Option<(u16, u16)> = None;
            for key in &group.registers {
                let kind = kinds.get(key.as_str()).ok_or_else(|| {
                    MeterError::config(format!(
                        "group '{}' references unknown register '{}'",
                        group.name, key
                    ))
                })?;
                if !grouped.insert(key.as_str()) {
                    return Err(MeterError::config(format!(
                        "register '{}' is in more than one group",
                        key
                    )));
                }
                if kind.is_self_computing() {
                    continue;
                }
                let address = addresses.get(key.as_str()).copied().unwrap_or_default();
                bounds = Some(match bounds {
                    Some((min, max)) => (min.min(address), max.max(address)),
                    None => (address, address),
                });
            }

            if let Some((min, max)) = bounds {
                let count = u32::from(max - min) + u32::from(REGISTERS_PER_VALUE);
                if count > MAX_READ_REGISTERS {
                    return Err(MeterError::config(format!(
                        "group '{}' spans {} registers (max {})",
                        group.name, count, MAX_READ_REGISTERS
                    )));
                }
            }
        }
        Ok(())
    }

    /// Descriptors with default state topics filled in
    pub fn resolved_registers(&self) -> Vec<RegisterDescriptor> {
        self.registers
            .iter()
            .map(|register| {
                let mut register = register.clone();
                if register.topic.is_empty() {
                    register.topic = self
                        .homeassistant
                        .state_topic(&self.full_key(&register.key));
                }
                register
            })
            .collect()
    }

    /// Slave id of a register: its group's, else the device's
    fn slave_for(&self, key: &str) -> u8 {
        self.groups
            .iter()
            .find(|g| g.registers.iter().any(|r| r == key))
            .and_then(|g| g.slave_id)
            .unwrap_or(self.device.slave_id)
    }

    pub fn build_strategies(&self) -> Result<Vec<Strategy>> {
        self.resolved_registers()
            .into_iter()
            .map(|register| {
                let slave_id = self.slave_for(&register.key);
                Strategy::new(register, &self.device.key_prefix, slave_id)
            })
            .collect()
    }

    pub fn build_groups(&self) -> Vec<RegisterGroup> {
        self.groups
            .iter()
            .map(|group| {
                RegisterGroup::new(
                    group.name.clone(),
                    group.slave_id.unwrap_or(self.device.slave_id),
                    Duration::from_millis(group.interval_ms),
                    group.registers.iter().map(|key| self.full_key(key)).collect(),
                )
            })
            .collect()
    }
}
