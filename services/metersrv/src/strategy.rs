//! Register decode strategies
//!
//! A strategy is bound to one register. `Standard` strategies turn register
//! bytes into a value, `SelfComputing` ones derive their value from other
//! registers. Selection is a pure lookup on the device class.

use crate::error::{MeterError, Result};
use crate::register::{CommandResult, RegisterDescriptor, REGISTERS_PER_VALUE};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Register family, keyed by device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Voltage,
    Current,
    Frequency,
    Power,
    ApparentPower,
    PowerFactor,
    Energy,
    ReactivePower,
    Calculated,
    Generic,
}

impl StrategyKind {
    /// Unknown device classes decode as [`StrategyKind::Generic`]
    pub fn from_device_class(device_class: &str) -> Self {
        match device_class.trim().to_ascii_lowercase().as_str() {
            "voltage" => StrategyKind::Voltage,
            "current" => StrategyKind::Current,
            "frequency" => StrategyKind::Frequency,
            "power" => StrategyKind::Power,
            "apparent_power" => StrategyKind::ApparentPower,
            "power_factor" => StrategyKind::PowerFactor,
            "energy" => StrategyKind::Energy,
            "reactive_power" => StrategyKind::ReactivePower,
            "calculated" => StrategyKind::Calculated,
            _ => StrategyKind::Generic,
        }
    }

    pub fn is_self_computing(&self) -> bool {
        matches!(self, StrategyKind::ReactivePower | StrategyKind::Calculated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Voltage => "voltage",
            StrategyKind::Current => "current",
            StrategyKind::Frequency => "frequency",
            StrategyKind::Power => "power",
            StrategyKind::ApparentPower => "apparent_power",
            StrategyKind::PowerFactor => "power_factor",
            StrategyKind::Energy => "energy",
            StrategyKind::ReactivePower => "reactive_power",
            StrategyKind::Calculated => "calculated",
            StrategyKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode a big-endian IEEE-754 f32 from the first 4 bytes
///
/// # Arguments
/// * `bytes` - Register bytes, high word first
///
/// # Returns
/// * `Ok(f32)` - Decoded value (may be NaN/Inf, filters decide)
/// * `Err(InsufficientData)` - Fewer than 4 bytes
pub fn decode_f32_be(bytes: &[u8]) -> Result<f32> {
    match bytes {
        [a, b, c, d, ..] => Ok(f32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(MeterError::InsufficientData {
            needed: 4,
            actual: bytes.len(),
        }),
    }
}

/// Reactive power from active and apparent power, clamped at zero
pub fn reactive_power(active: f64, apparent: f64) -> f64 {
    (apparent * apparent - active * active).max(0.0).sqrt()
}

/// Plausibility filter for cumulative energy counters
///
/// Meters occasionally return garbage words for a totalizer. A reading is
/// rejected when it is not finite, jumps by more than 1000% against the last
/// accepted value, or drops by more than one unit and more than 50%.
#[derive(Debug, Default)]
pub struct EnergyFilter {
    last_accepted: Mutex<Option<f64>>,
}

impl EnergyFilter {
    pub const MAX_RELATIVE_CHANGE: f64 = 10.0;
    pub const MAX_RELATIVE_DROP: f64 = 0.5;
    pub const DROP_TOLERANCE: f64 = 1.0;

    pub fn last_accepted(&self) -> Option<f64> {
        *self.last_accepted.lock()
    }

    /// Accept `value` as the new baseline, or reject it
    pub fn check(&self, key: &str, value: f64) -> Result<f64> {
        let mut last = self.last_accepted.lock();
        let previous = *last;

        let reject = || MeterError::AnomalyRejected {
            key: key.to_string(),
            value,
            previous,
        };

        if !value.is_finite() {
            return Err(reject());
        }

        if let Some(prev) = previous {
            // A zero baseline has no meaningful relative change
            if prev.abs() > f64::EPSILON {
                let relative_change = (value - prev).abs() / prev.abs();
                let drop = prev - value;

                if relative_change > Self::MAX_RELATIVE_CHANGE {
                    warn!(
                        "{}: energy jump {} -> {} ({:.0}%) rejected",
                        key,
                        prev,
                        value,
                        relative_change * 100.0
                    );
                    return Err(reject());
                }
                if drop > Self::DROP_TOLERANCE && relative_change > Self::MAX_RELATIVE_DROP {
                    warn!("{}: energy drop {} -> {} rejected", key, prev, value);
                    return Err(reject());
                }
            }
        }

        *last = Some(value);
        Ok(value)
    }
}

/// Value transform of a standard strategy
#[derive(Debug)]
pub enum Transform {
    Identity,
    Absolute,
    /// kW to W
    Kilo,
    Energy(EnergyFilter),
}

impl Transform {
    fn for_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::PowerFactor => Transform::Absolute,
            StrategyKind::Power | StrategyKind::ApparentPower => Transform::Kilo,
            StrategyKind::Energy => Transform::Energy(EnergyFilter::default()),
            _ => Transform::Identity,
        }
    }

    fn apply(&self, key: &str, value: f64) -> Result<f64> {
        match self {
            Transform::Identity => Ok(value),
            Transform::Absolute => Ok(value.abs()),
            Transform::Kilo => Ok(value * 1000.0),
            Transform::Energy(filter) => filter.check(key, value),
        }
    }
}

/// Formula variable with the cache key it resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaVariable {
    /// Name as written in the formula
    pub name: String,
    /// Device-prefixed key used for the cache lookup
    pub cache_key: String,
}

/// Derivation of a self-computing strategy
#[derive(Debug, Clone)]
pub enum Computation {
    ReactivePower {
        active_key: String,
        apparent_key: String,
    },
    Calculated {
        formula: String,
        variables: Vec<FormulaVariable>,
    },
}

#[derive(Debug)]
pub enum StrategyVariant {
    Standard(Transform),
    SelfComputing(Computation),
}

/// Decode strategy bound to one register
#[derive(Debug)]
pub struct Strategy {
    key: String,
    slave_id: u8,
    kind: StrategyKind,
    descriptor: RegisterDescriptor,
    variant: StrategyVariant,
}

impl Strategy {
    /// Bind a strategy to `descriptor`; the full key is `key_prefix + descriptor.key`
    pub fn new(descriptor: RegisterDescriptor, key_prefix: &str, slave_id: u8) -> Result<Self> {
        let key = format!("{}{}", key_prefix, descriptor.key);
        let kind = StrategyKind::from_device_class(&descriptor.device_class);

        let variant = match kind {
            StrategyKind::ReactivePower => StrategyVariant::SelfComputing(Computation::ReactivePower {
                active_key: format!("{}{}", key_prefix, descriptor.active_power_key()),
                apparent_key: format!("{}{}", key_prefix, descriptor.apparent_power_key()),
            }),
            StrategyKind::Calculated => {
                let formula = descriptor
                    .formula
                    .clone()
                    .filter(|f| !f.trim().is_empty())
                    .ok_or_else(|| {
                        MeterError::config(format!("{}: calculated register without formula", key))
                    })?;
                let variables = voltage_calc::extract_variables(&formula)?
                    .into_iter()
                    .map(|name| FormulaVariable {
                        cache_key: format!("{}{}", key_prefix, name),
                        name,
                    })
                    .collect::<Vec<_>>();
                debug!("{}: formula '{}' depends on {:?}", key, formula, variables);
                StrategyVariant::SelfComputing(Computation::Calculated { formula, variables })
            },
            _ => StrategyVariant::Standard(Transform::for_kind(kind)),
        };

        Ok(Self {
            key,
            slave_id,
            kind,
            descriptor,
            variant,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub fn descriptor(&self) -> &RegisterDescriptor {
        &self.descriptor
    }

    pub fn variant(&self) -> &StrategyVariant {
        &self.variant
    }

    pub fn is_standard(&self) -> bool {
        matches!(self.variant, StrategyVariant::Standard(_))
    }

    /// Registers this strategy reads from the bus
    pub fn register_count(&self) -> u16 {
        if self.is_standard() {
            REGISTERS_PER_VALUE
        } else {
            0
        }
    }

    /// Decode register bytes: f32 BE, the variant transform, then descriptor scale
    ///
    /// The energy filter therefore judges readings in register units.
    pub fn decode(&self, bytes: &[u8]) -> Result<f64> {
        let StrategyVariant::Standard(transform) = &self.variant else {
            return Err(MeterError::config(format!(
                "{}: {} register has no register bytes to decode",
                self.key, self.kind
            )));
        };
        let raw = f64::from(decode_f32_be(bytes)?);
        Ok(transform.apply(&self.key, raw)? * self.descriptor.scale)
    }

    pub fn build_result(&self, value: f64, raw: Option<Vec<u8>>) -> CommandResult {
        CommandResult {
            strategy_id: self.key.clone(),
            name: self.descriptor.name.clone(),
            value,
            unit: self.descriptor.unit.clone(),
            topic: self.descriptor.topic.clone(),
            device_class: self.descriptor.device_class.clone(),
            state_class: self.descriptor.state_class.clone(),
            raw,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn strategy(device_class: &str) -> Strategy {
        let descriptor = RegisterDescriptor::new("reg", "Register", 0).with_class(device_class, "");
        Strategy::new(descriptor, "meter_", 1).unwrap()
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    #[test]
    fn test_decode_f32_be() {
        assert_eq!(decode_f32_be(&[0x43, 0x48, 0x00, 0x00]).unwrap(), 200.0);
        assert_eq!(decode_f32_be(&[0x3F, 0x80, 0x00, 0x00, 0xFF]).unwrap(), 1.0);
    }

    #[test]
    fn test_decode_insufficient_data() {
        let err = decode_f32_be(&[0x43, 0x48, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            MeterError::InsufficientData {
                needed: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_kind_selection_by_device_class() {
        assert_eq!(StrategyKind::from_device_class("voltage"), StrategyKind::Voltage);
        assert_eq!(StrategyKind::from_device_class("Power"), StrategyKind::Power);
        assert_eq!(
            StrategyKind::from_device_class("reactive_power"),
            StrategyKind::ReactivePower
        );
        assert_eq!(StrategyKind::from_device_class("temperature"), StrategyKind::Generic);
        assert_eq!(StrategyKind::from_device_class(""), StrategyKind::Generic);
        assert!(StrategyKind::Calculated.is_self_computing());
        assert!(!StrategyKind::Energy.is_self_computing());
    }

    #[test]
    fn test_variant_transforms() {
        let bytes = [0x43, 0x48, 0x00, 0x00]; // 200.0
        let negative = (-0.5f32).to_be_bytes();

        assert_eq!(strategy("voltage").decode(&bytes).unwrap(), 200.0);
        assert_eq!(strategy("current").decode(&bytes).unwrap(), 200.0);
        assert_eq!(strategy("frequency").decode(&bytes).unwrap(), 200.0);
        assert_eq!(strategy("power").decode(&bytes).unwrap(), 200000.0);
        assert_eq!(strategy("apparent_power").decode(&bytes).unwrap(), 200000.0);
        assert_eq!(strategy("power_factor").decode(&negative).unwrap(), 0.5);
        assert_eq!(strategy("whatever").decode(&bytes).unwrap(), 200.0);
    }

    #[test]
    fn test_scale_applied() {
        let mut descriptor = RegisterDescriptor::new("v", "Voltage", 0).with_class("voltage", "V");
        descriptor.scale = 0.1;
        let strategy = Strategy::new(descriptor, "", 1).unwrap();
        let value = strategy.decode(&[0x43, 0x48, 0x00, 0x00]).unwrap();
        assert!((value - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_energy_filter_runs_before_scale() {
        let mut descriptor =
            RegisterDescriptor::new("e", "Energy", 0).with_class("energy", "Wh");
        descriptor.scale = 100.0;
        let strategy = Strategy::new(descriptor, "", 1).unwrap();

        // 1.0 in register units, 100 after scaling
        let first = strategy.decode(&[0x3F, 0x80, 0x00, 0x00]).unwrap();
        assert!((first - 100.0).abs() < 1e-9);

        // 1.0 -> 0.4 is within the one-unit drop tolerance of the register value
        let second = strategy.decode(&[0x3E, 0xCC, 0xCC, 0xCD]).unwrap();
        assert!((second - 40.0).abs() < 1e-4);
    }

    #[test]
    fn test_self_computing_cannot_decode_bytes() {
        let reactive = strategy("reactive_power");
        assert!(!reactive.is_standard());
        assert_eq!(reactive.register_count(), 0);
        assert!(reactive.decode(&[0x43, 0x48, 0x00, 0x00]).is_err());
    }

    // ========================================================================
    // Energy filter
    // ========================================================================

    #[test]
    fn test_energy_anomaly_filter() {
        let filter = EnergyFilter::default();
        assert_eq!(filter.check("e", 100.0).unwrap(), 100.0);

        // 4900% jump
        let err = filter.check("e", 5000.0).unwrap_err();
        assert!(matches!(
            err,
            MeterError::AnomalyRejected { previous: Some(p), .. } if p == 100.0
        ));
        assert_eq!(filter.last_accepted(), Some(100.0));

        // Small decrease is fine and becomes the baseline
        assert_eq!(filter.check("e", 99.5).unwrap(), 99.5);
        assert_eq!(filter.last_accepted(), Some(99.5));
    }

    #[test]
    fn test_energy_large_drop_rejected() {
        let filter = EnergyFilter::default();
        filter.check("e", 100.0).unwrap();
        assert!(filter.check("e", 40.0).is_err());
        // Drop of 60% but under one unit in absolute terms
        let small = EnergyFilter::default();
        small.check("e", 1.0).unwrap();
        assert_eq!(small.check("e", 0.4).unwrap(), 0.4);
    }

    #[test]
    fn test_energy_rejects_non_finite() {
        let filter = EnergyFilter::default();
        assert!(filter.check("e", f64::NAN).is_err());
        assert!(filter.check("e", f64::INFINITY).is_err());
        assert_eq!(filter.last_accepted(), None);
    }

    #[test]
    fn test_energy_zero_baseline_accepts_growth() {
        let filter = EnergyFilter::default();
        filter.check("e", 0.0).unwrap();
        assert_eq!(filter.check("e", 12.5).unwrap(), 12.5);
    }

    #[test]
    fn test_energy_strategy_keeps_state() {
        let energy = strategy("energy");
        let first = 100.0f32.to_be_bytes();
        let spike = 5000.0f32.to_be_bytes();
        assert_eq!(energy.decode(&first).unwrap(), 100.0);
        assert!(energy.decode(&spike).is_err());
    }

    // ========================================================================
    // Self-computing
    // ========================================================================

    #[test]
    fn test_reactive_power() {
        assert_eq!(reactive_power(4.0, 5.0), 3.0);
        // Measurement noise where P > S clamps to zero
        assert_eq!(reactive_power(5.0, 4.0), 0.0);
    }

    #[test]
    fn test_reactive_dependency_keys_are_prefixed() {
        let reactive = strategy("reactive_power");
        match reactive.variant() {
            StrategyVariant::SelfComputing(Computation::ReactivePower {
                active_key,
                apparent_key,
            }) => {
                assert_eq!(active_key, "meter_power_active");
                assert_eq!(apparent_key, "meter_power_apparent");
            },
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_calculated_requires_formula() {
        let descriptor = RegisterDescriptor::new("calc", "Calc", 0).with_class("calculated", "");
        assert!(matches!(
            Strategy::new(descriptor, "", 1),
            Err(MeterError::Config(_))
        ));
    }

    #[test]
    fn test_calculated_variables_namespaced() {
        let descriptor = RegisterDescriptor::new("apparent", "Apparent", 0)
            .with_class("calculated", "VA")
            .with_formula("voltage * current * 1e0");
        let strategy = Strategy::new(descriptor, "m1_", 1).unwrap();
        match strategy.variant() {
            StrategyVariant::SelfComputing(Computation::Calculated { variables, .. }) => {
                let keys: Vec<_> = variables.iter().map(|v| v.cache_key.as_str()).collect();
                assert_eq!(keys, vec!["m1_voltage", "m1_current"]);
            },
            other => panic!("unexpected variant {:?}", other),
        }
    }
}
