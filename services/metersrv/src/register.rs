//! Register descriptors and decoded results

use serde::{Deserialize, Serialize};

/// Dependency of a reactive-power register when none is configured
pub const DEFAULT_ACTIVE_POWER_KEY: &str = "power_active";
/// Dependency of a reactive-power register when none is configured
pub const DEFAULT_APPARENT_POWER_KEY: &str = "power_apparent";

/// Number of 16-bit registers holding one 32-bit float
pub const REGISTERS_PER_VALUE: u16 = 2;

/// One meter register as supplied by configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// Register key, unique within the device (without device prefix)
    pub key: String,
    /// Display name
    pub name: String,
    /// Holding register address; unused by self-computing registers
    #[serde(default)]
    pub address: u16,
    #[serde(default)]
    pub unit: String,
    /// Home-automation device class, also selects the decode strategy
    #[serde(default)]
    pub device_class: String,
    #[serde(default)]
    pub state_class: String,
    /// State topic; derived from the base topic when empty
    #[serde(default)]
    pub topic: String,
    /// Formula for calculated registers
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Active power source of a reactive-power register
    #[serde(default)]
    pub active_power_key: Option<String>,
    /// Apparent power source of a reactive-power register
    #[serde(default)]
    pub apparent_power_key: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterDescriptor {
    pub fn new(key: impl Into<String>, name: impl Into<String>, address: u16) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            address,
            unit: String::new(),
            device_class: String::new(),
            state_class: String::new(),
            topic: String::new(),
            formula: None,
            scale: default_scale(),
            active_power_key: None,
            apparent_power_key: None,
        }
    }

    pub fn with_class(mut self, device_class: impl Into<String>, unit: impl Into<String>) -> Self {
        self.device_class = device_class.into();
        self.unit = unit.into();
        self
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    pub fn active_power_key(&self) -> &str {
        self.active_power_key
            .as_deref()
            .unwrap_or(DEFAULT_ACTIVE_POWER_KEY)
    }

    pub fn apparent_power_key(&self) -> &str {
        self.apparent_power_key
            .as_deref()
            .unwrap_or(DEFAULT_APPARENT_POWER_KEY)
    }
}

/// Decoded register value ready for publishing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    /// Full (device-prefixed) register key
    pub strategy_id: String,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub topic: String,
    pub device_class: String,
    pub state_class: String,
    /// Register bytes the value was decoded from; never cached
    #[serde(skip)]
    pub raw: Option<Vec<u8>>,
}

impl CommandResult {
    /// Copy without the raw bytes
    pub fn without_raw(&self) -> Self {
        Self {
            raw: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let descriptor: RegisterDescriptor = serde_json::from_value(
            serde_json::json!({"key": "voltage", "name": "Voltage", "address": 0}),
        )
        .unwrap();
        assert_eq!(descriptor.scale, 1.0);
        assert!(descriptor.formula.is_none());
        assert_eq!(descriptor.active_power_key(), DEFAULT_ACTIVE_POWER_KEY);
        assert_eq!(descriptor.apparent_power_key(), DEFAULT_APPARENT_POWER_KEY);
    }

    #[test]
    fn test_reactive_dependency_override() {
        let mut descriptor = RegisterDescriptor::new("q", "Reactive", 0);
        descriptor.active_power_key = Some("p_total".to_string());
        assert_eq!(descriptor.active_power_key(), "p_total");
        assert_eq!(descriptor.apparent_power_key(), DEFAULT_APPARENT_POWER_KEY);
    }

    #[test]
    fn test_without_raw_strips_bytes() {
        let result = CommandResult {
            strategy_id: "meter_voltage".to_string(),
            name: "Voltage".to_string(),
            value: 230.0,
            unit: "V".to_string(),
            topic: "meter/voltage/state".to_string(),
            device_class: "voltage".to_string(),
            state_class: "measurement".to_string(),
            raw: Some(vec![0x43, 0x66, 0x00, 0x00]),
        };
        let stripped = result.without_raw();
        assert!(stripped.raw.is_none());
        assert_eq!(stripped.value, 230.0);
    }
}
