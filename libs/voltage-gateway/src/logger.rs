//! Link-scoped logging injected into the transport and supervisor

use crate::connection::ConnectionState;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Logger bound to one gateway link
///
/// Every line carries the link name so several gateways can share one log.
#[derive(Debug, Clone)]
pub struct BusLogger {
    link: String,
}

impl BusLogger {
    pub fn new(link: impl Into<String>) -> Self {
        Self { link: link.into() }
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    /// Log connection attempt
    pub fn log_connect(&self, target: &str, attempt: u32) {
        info!(link = %self.link, "[CONNECT] {} (#{})", target, attempt);
    }

    /// Log connection status change
    pub fn log_status(&self, old: ConnectionState, new: ConnectionState, reason: &str) {
        info!(link = %self.link, "[STATUS] {} -> {} - {}", old, new, reason);
    }

    pub fn log_retry(&self, attempt: u32, delay: Duration, reason: &str) {
        warn!(
            link = %self.link,
            "[RETRY] Attempt {}, delay {}ms - {}",
            attempt,
            delay.as_millis(),
            reason
        );
    }

    /// Log a raw frame, `direction` is "TX" or "RX"
    pub fn log_frame(&self, direction: &str, slave_id: Option<u8>, function_code: Option<u8>, frame: &[u8]) {
        let hex_str = frame
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");

        match (slave_id, function_code) {
            (Some(slave), Some(fc)) => debug!(
                link = %self.link,
                "[{}] slave={} FC={:02X} {}B: [{}]",
                direction,
                slave,
                fc,
                frame.len(),
                hex_str
            ),
            _ => debug!(
                link = %self.link,
                "[{}] {}B: [{}]",
                direction,
                frame.len(),
                hex_str
            ),
        }
    }

    /// Log a payload that never reached the reply slot
    pub fn log_dropped(&self, reason: &str, payload_len: usize) {
        debug!(link = %self.link, "[DROP] {}B reply: {}", payload_len, reason);
    }
}
