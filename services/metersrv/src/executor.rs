//! Command executor
//!
//! Dispatches a register key to its strategy, records successes in the
//! cache, and answers transient failures from a fresh cache entry.

use crate::cache::ResultCache;
use crate::calculated::CalculatedEvaluator;
use crate::error::{MeterError, Result};
use crate::register::{CommandResult, REGISTERS_PER_VALUE};
use crate::strategy::{reactive_power, Computation, Strategy, StrategyVariant};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use voltage_gateway::RegisterBus;

pub struct CommandExecutor {
    strategies: HashMap<String, Arc<Strategy>>,
    bus: Arc<dyn RegisterBus>,
    cache: Arc<ResultCache>,
    calculator: CalculatedEvaluator,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("strategies", &self.strategies.len())
            .field("cache", &self.cache)
            .finish()
    }
}

impl CommandExecutor {
    /// Build an executor; strategy keys must be unique
    pub fn new(
        strategies: Vec<Strategy>,
        bus: Arc<dyn RegisterBus>,
        cache: Arc<ResultCache>,
    ) -> Result<Self> {
        let mut by_key = HashMap::with_capacity(strategies.len());
        for strategy in strategies {
            let key = strategy.key().to_string();
            if by_key.insert(key.clone(), Arc::new(strategy)).is_some() {
                return Err(MeterError::config(format!("duplicate register key '{}'", key)));
            }
        }

        Ok(Self {
            strategies: by_key,
            bus,
            cache,
            calculator: CalculatedEvaluator::new(),
        })
    }

    pub fn strategy(&self, key: &str) -> Option<&Arc<Strategy>> {
        self.strategies.get(key)
    }

    pub fn bus(&self) -> &Arc<dyn RegisterBus> {
        &self.bus
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Store a successful result under its key
    pub fn record(&self, result: &CommandResult) {
        self.cache.store(&result.strategy_id, result);
    }

    /// Execute the strategy registered under `key`
    ///
    /// Self-computing strategies may execute their dependencies recursively.
    /// On a transient failure a fresh cache entry is returned wrapped in
    /// [`MeterError::StaleCacheFallback`].
    pub fn execute_command<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<CommandResult>> {
        async move {
            let strategy = self
                .strategy(key)
                .ok_or_else(|| MeterError::UnknownStrategy(key.to_string()))?;

            let outcome = match strategy.variant() {
                StrategyVariant::Standard(_) => self.read_standard(strategy).await,
                StrategyVariant::SelfComputing(computation) => {
                    self.compute(strategy, computation).await
                },
            };

            match outcome {
                Ok(result) => {
                    self.record(&result);
                    Ok(result)
                },
                Err(e) => Err(self.fallback(key, e)),
            }
        }
        .boxed()
    }

    async fn read_standard(&self, strategy: &Strategy) -> Result<CommandResult> {
        let bytes = self
            .bus
            .read_holding_registers(
                strategy.slave_id(),
                strategy.descriptor().address,
                REGISTERS_PER_VALUE,
            )
            .await?;
        let value = strategy.decode(&bytes)?;
        Ok(strategy.build_result(value, Some(bytes)))
    }

    async fn compute(&self, strategy: &Strategy, computation: &Computation) -> Result<CommandResult> {
        match computation {
            Computation::ReactivePower {
                active_key,
                apparent_key,
            } => {
                let active = self.dependency_value(active_key).await?;
                let apparent = self.dependency_value(apparent_key).await?;
                let value = reactive_power(active, apparent) * strategy.descriptor().scale;
                debug!(
                    "{}: P={} S={} -> Q={}",
                    strategy.key(),
                    active,
                    apparent,
                    value
                );
                Ok(strategy.build_result(value, None))
            },
            Computation::Calculated { formula, variables } => {
                self.calculator
                    .evaluate(strategy, formula, variables, &self.cache)
            },
        }
    }

    /// Current value of a dependency: fresh cache first, else executed now
    ///
    /// A cache miss here also rules out a cache fallback, so a failed read
    /// is final.
    async fn dependency_value(&self, key: &str) -> Result<f64> {
        if let Some(entry) = self.cache.get_fresh(key) {
            return Ok(entry.result.value);
        }
        Ok(self.execute_command(key).await?.value)
    }

    fn fallback(&self, key: &str, error: MeterError) -> MeterError {
        if !error.allows_cache_fallback() {
            return error;
        }

        let now = Instant::now();
        match self.cache.get_fresh_at(key, now) {
            Some(entry) => {
                let age = entry.age(now);
                warn!("{}: {} - serving cached value ({:?} old)", key, error, age);
                MeterError::StaleCacheFallback {
                    key: key.to_string(),
                    age,
                    cached: Box::new(entry.result),
                    source: Box::new(error),
                }
            },
            None => error,
        }
    }
}
