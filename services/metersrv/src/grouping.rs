//! Register grouping and batched reads
//!
//! A group covers registers of one slave that are polled together. All
//! standard members are fetched in a single read spanning
//! `[min_address, max_address + 1]`, then each member decodes its own
//! 4-byte slice. Self-computing members are evaluated after the batch, so
//! they see the values it just cached.

use crate::error::{MeterError, Result};
use crate::executor::CommandExecutor;
use crate::register::{CommandResult, REGISTERS_PER_VALUE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Modbus limit for one read holding registers request
pub const MAX_READ_REGISTERS: u32 = 125;

/// Bytes per decoded value
const VALUE_BYTES: usize = 4;

/// Group definition as supplied by configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Defaults to the device slave id
    #[serde(default)]
    pub slave_id: Option<u8>,
    pub interval_ms: u64,
    /// Register keys (without device prefix)
    pub registers: Vec<String>,
}

/// Contiguous read covering the standard members of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    pub address: u16,
    pub count: u16,
}

/// Results of one group execution, by full register key
pub type GroupResults = HashMap<String, CommandResult>;

#[derive(Debug, Clone)]
pub struct RegisterGroup {
    name: String,
    slave_id: u8,
    interval: Duration,
    /// Full register keys in configuration order
    members: Vec<String>,
}

impl RegisterGroup {
    pub fn new(name: impl Into<String>, slave_id: u8, interval: Duration, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            slave_id,
            interval,
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Read window over the standard members; `None` when there are none
    pub fn window(&self, executor: &CommandExecutor) -> Result<Option<ReadWindow>> {
        let mut bounds: Option<(u16, u16)> = None;
        for key in &self.members {
            let strategy = executor
                .strategy(key)
                .ok_or_else(|| MeterError::UnknownStrategy(key.clone()))?;
            if !strategy.is_standard() {
                continue;
            }
            let address = strategy.descriptor().address;
            bounds = Some(match bounds {
                Some((min, max)) => (min.min(address), max.max(address)),
                None => (address, address),
            });
        }

        let Some((min, max)) = bounds else {
            return Ok(None);
        };

        let count = u32::from(max - min) + u32::from(REGISTERS_PER_VALUE);
        if count > MAX_READ_REGISTERS {
            return Err(MeterError::config(format!(
                "group {} spans {} registers (max {})",
                self.name, count, MAX_READ_REGISTERS
            )));
        }

        Ok(Some(ReadWindow {
            address: min,
            count: count as u16,
        }))
    }

    /// Run one batched read and evaluate every member
    pub async fn execute(&self, executor: &CommandExecutor) -> Result<GroupResults> {
        let window = self.window(executor)?;
        let mut results = match window {
            Some(window) => {
                debug!(
                    "group {}: reading {} registers at {} (slave {})",
                    self.name, window.count, window.address, self.slave_id
                );
                let reply = executor
                    .bus()
                    .read_holding_registers(self.slave_id, window.address, window.count)
                    .await?;
                self.parse_results(executor, window.address, &reply)?
            },
            None => GroupResults::new(),
        };

        let mut last_error = None;
        for key in &self.members {
            let is_standard = executor.strategy(key).is_some_and(|s| s.is_standard());
            if is_standard {
                continue;
            }
            match executor.execute_command(key).await {
                Ok(result) => {
                    results.insert(key.clone(), result);
                },
                Err(e) => {
                    warn!("group {}: {} skipped: {}", self.name, key, e);
                    last_error = Some(e);
                },
            }
        }

        // A derived-only group where nothing could be computed has failed
        match last_error {
            Some(e) if window.is_none() && results.is_empty() => Err(e),
            _ => Ok(results),
        }
    }

    /// Split a batched reply into member results and cache them
    ///
    /// A member slot beyond the reply aborts the whole group. A member whose
    /// own filter rejects its value is left out.
    pub fn parse_results(
        &self,
        executor: &CommandExecutor,
        base_address: u16,
        reply: &[u8],
    ) -> Result<GroupResults> {
        let mut slots = Vec::with_capacity(self.members.len());
        for key in &self.members {
            let strategy = executor
                .strategy(key)
                .ok_or_else(|| MeterError::UnknownStrategy(key.clone()))?;
            if !strategy.is_standard() {
                continue;
            }

            let address = strategy.descriptor().address;
            let offset = usize::from(address.saturating_sub(base_address)) * 2;
            if address < base_address || offset + VALUE_BYTES > reply.len() {
                return Err(MeterError::ShortReply {
                    group: self.name.clone(),
                    key: key.clone(),
                    offset,
                    len: reply.len(),
                });
            }
            slots.push((strategy, offset));
        }

        let mut results = GroupResults::with_capacity(slots.len());
        for (strategy, offset) in slots {
            let bytes = &reply[offset..offset + VALUE_BYTES];
            match strategy.decode(bytes) {
                Ok(value) => {
                    let result = strategy.build_result(value, Some(bytes.to_vec()));
                    executor.record(&result);
                    results.insert(strategy.key().to_string(), result);
                },
                Err(e) => warn!("group {}: {} rejected: {}", self.name, strategy.key(), e),
            }
        }
        Ok(results)
    }
}
