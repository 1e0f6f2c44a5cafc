//! Error types for the gateway tunnel

use std::time::Duration;
use thiserror::Error;

/// Gateway error type
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Broker link is not in the Connected state
    #[error("Not connected to broker")]
    NotConnected,

    /// No valid reply arrived before the deadline
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// Process-wide cancellation fired while waiting
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Payload on the data topic was not usable; logged and dropped, never returned by requests
    #[error("Malformed reply: {0}")]
    MalformedResponse(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl GatewayError {
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    pub fn subscribe(msg: impl Into<String>) -> Self {
        Self::Subscribe(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
