//! Error handling for metersrv

use crate::register::CommandResult;
use std::time::Duration;
use thiserror::Error;
use voltage_calc::CalcError;
use voltage_gateway::GatewayError;

/// Meter bridge error type
#[derive(Error, Debug, Clone)]
pub enum MeterError {
    /// Transport failures (not connected, reply timeout, cancellation, publish)
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Fewer bytes than a 32-bit float needs
    #[error("Insufficient data: need {needed} bytes, got {actual}")]
    InsufficientData { needed: usize, actual: usize },

    /// Reading refused by a domain filter; the previous baseline stays
    #[error("Anomalous reading for {key}: {value} (last accepted {previous:?})")]
    AnomalyRejected {
        key: String,
        value: f64,
        previous: Option<f64>,
    },

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    /// A formula variable has no fresh cache entry
    #[error("Missing dependency '{variable}' for {key}")]
    MissingDependency { key: String, variable: String },

    /// The read failed but a fresh cached value is available
    #[error("Serving cached {key} ({age:?} old) after: {source}")]
    StaleCacheFallback {
        key: String,
        age: Duration,
        cached: Box<CommandResult>,
        source: Box<MeterError>,
    },

    /// A group member's slot lies outside the reply
    #[error("Short reply for group {group}: {key} needs 4 bytes at offset {offset}, reply has {len}")]
    ShortReply {
        group: String,
        key: String,
        offset: usize,
        len: usize,
    },

    #[error("Calculation error: {0}")]
    Calculation(#[from] CalcError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MeterError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Usable value carried by a soft failure
    pub fn fallback_value(&self) -> Option<&CommandResult> {
        match self {
            MeterError::StaleCacheFallback { cached, .. } => Some(cached),
            _ => None,
        }
    }

    /// Whether the failure says the meter or its gateway did not answer properly
    pub fn is_device_fault(&self) -> bool {
        match self {
            MeterError::Gateway(_)
            | MeterError::ShortReply { .. }
            | MeterError::InsufficientData { .. } => true,
            MeterError::StaleCacheFallback { source, .. } => source.is_device_fault(),
            _ => false,
        }
    }

    /// Whether the executor may answer this failure from the cache
    pub fn allows_cache_fallback(&self) -> bool {
        !matches!(
            self,
            MeterError::MissingDependency { .. }
                | MeterError::UnknownStrategy(_)
                | MeterError::Config(_)
                | MeterError::StaleCacheFallback { .. }
        )
    }
}

/// Result type alias for metersrv
pub type Result<T> = std::result::Result<T, MeterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_eligibility() {
        assert!(MeterError::from(GatewayError::NotConnected).allows_cache_fallback());
        assert!(MeterError::InsufficientData { needed: 4, actual: 2 }.allows_cache_fallback());
        assert!(!MeterError::UnknownStrategy("x".into()).allows_cache_fallback());
        assert!(!MeterError::MissingDependency {
            key: "a".into(),
            variable: "b".into()
        }
        .allows_cache_fallback());
    }

    #[test]
    fn test_device_fault_classification() {
        let timeout = MeterError::from(GatewayError::Timeout(Duration::from_secs(2)));
        assert!(timeout.is_device_fault());
        assert!(!MeterError::config("bad").is_device_fault());
        assert!(!MeterError::AnomalyRejected {
            key: "e".into(),
            value: 5000.0,
            previous: Some(100.0)
        }
        .is_device_fault());
    }
}
