//! Calculated register evaluation
//!
//! Formula variables are resolved strictly from fresh cache entries. A
//! missing or expired input fails the register instead of substituting a
//! default, so a derived sensor never reports a value built from stale data.

use crate::cache::ResultCache;
use crate::error::{MeterError, Result};
use crate::register::CommandResult;
use crate::strategy::{FormulaVariable, Strategy};
use std::collections::HashMap;
use tracing::debug;
use voltage_calc::CalcEngine;

#[derive(Debug, Default, Clone, Copy)]
pub struct CalculatedEvaluator {
    engine: CalcEngine,
}

impl CalculatedEvaluator {
    pub fn new() -> Self {
        Self {
            engine: CalcEngine::new(),
        }
    }

    /// Evaluate `formula` for `strategy` against the cache
    ///
    /// # Returns
    /// * `Ok(CommandResult)` - Scaled value, no raw bytes
    /// * `Err(MissingDependency)` - A variable has no fresh cache entry
    /// * `Err(Calculation)` - The expression failed or was not finite
    pub fn evaluate(
        &self,
        strategy: &Strategy,
        formula: &str,
        variables: &[FormulaVariable],
        cache: &ResultCache,
    ) -> Result<CommandResult> {
        let mut values = HashMap::with_capacity(variables.len());
        for variable in variables {
            let entry = cache.get_fresh(&variable.cache_key).ok_or_else(|| {
                MeterError::MissingDependency {
                    key: strategy.key().to_string(),
                    variable: variable.cache_key.clone(),
                }
            })?;
            values.insert(variable.name.clone(), entry.result.value);
        }

        debug!(
            "{}: evaluating '{}' with {:?}",
            strategy.key(),
            formula,
            values
        );

        let value = self.engine.evaluate(formula, &values)? * strategy.descriptor().scale;
        Ok(strategy.build_result(value, None))
    }
}
