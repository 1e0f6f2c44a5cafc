//! CalcEngine - formula evaluator for derived registers
//!
//! Supports:
//! - Arithmetic: +, -, *, /, ^
//! - Parentheses and numeric literals
//! - Functions: sqrt, abs

use crate::error::{CalcError, Result};
use evalexpr::{ContextWithMutableFunctions, ContextWithMutableVariables, Value};
use std::collections::HashMap;
use tracing::trace;

/// Stateless formula evaluation engine
///
/// # Example
/// ```ignore
/// let engine = CalcEngine::new();
/// let mut vars = HashMap::new();
/// vars.insert("voltage".to_string(), 230.0);
/// vars.insert("current".to_string(), 2.0);
///
/// let apparent = engine.evaluate("voltage * current", &vars)?;
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct CalcEngine;

impl CalcEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `formula` with the given variable bindings
    ///
    /// Variables and integer literals are both evaluated as floats, so
    /// division never truncates. A NaN or infinite result is reported as
    /// [`CalcError::NonFinite`].
    pub fn evaluate(&self, formula: &str, variables: &HashMap<String, f64>) -> Result<f64> {
        let mut context = evalexpr::HashMapContext::new();

        for (name, value) in variables {
            context
                .set_value(name.to_string(), Value::from(*value))
                .map_err(|e| {
                    CalcError::expression(format!("Failed to set variable {}: {}", name, e))
                })?;
        }

        Self::register_functions(&mut context)?;

        let expression = float_literals(formula)?;
        let result = evalexpr::eval_with_context(&expression, &context).map_err(|e| {
            CalcError::expression(format!("Failed to evaluate '{}': {}", formula, e))
        })?;

        let value = Self::value_to_f64(result, formula)?;
        trace!("calc '{}' = {}", formula, value);

        if !value.is_finite() {
            return Err(CalcError::NonFinite {
                formula: formula.to_string(),
                value,
            });
        }
        Ok(value)
    }

    /// Register sqrt/abs with the evalexpr context
    fn register_functions(context: &mut evalexpr::HashMapContext) -> Result<()> {
        use evalexpr::{EvalexprError, Function};

        // Helper to convert Value to f64 (handles both Int and Float)
        fn to_f64(value: &Value) -> std::result::Result<f64, EvalexprError> {
            match value {
                Value::Float(f) => Ok(*f),
                Value::Int(i) => Ok(*i as f64),
                _ => Err(EvalexprError::expected_number(value.clone())),
            }
        }

        context
            .set_function(
                "sqrt".to_string(),
                Function::new(|args| {
                    let value = to_f64(args)?;
                    Ok(Value::Float(value.sqrt()))
                }),
            )
            .map_err(|e| CalcError::function(format!("Failed to register sqrt: {}", e)))?;

        context
            .set_function(
                "abs".to_string(),
                Function::new(|args| {
                    let value = to_f64(args)?;
                    Ok(Value::Float(value.abs()))
                }),
            )
            .map_err(|e| CalcError::function(format!("Failed to register abs: {}", e)))?;

        Ok(())
    }

    /// Convert evalexpr Value to f64
    fn value_to_f64(value: Value, formula: &str) -> Result<f64> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(i) => Ok(i as f64),
            _ => Err(CalcError::expression(format!(
                "Expression did not evaluate to a number: {}",
                formula
            ))),
        }
    }
}

/// Rewrite integer literals as float literals (`2` -> `2.0`)
///
/// evalexpr keeps `1 / 2` in integer arithmetic otherwise. Digits inside
/// identifiers and literals that already carry a fraction or exponent are
/// left alone.
fn float_literals(formula: &str) -> Result<String> {
    let re = regex::Regex::new(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?")
        .map_err(|e| CalcError::expression(format!("Regex error: {}", e)))?;

    let mut out = String::with_capacity(formula.len() + 8);
    let mut last = 0;
    for m in re.find_iter(formula) {
        out.push_str(&formula[last..m.end()]);
        last = m.end();

        let attached = formula[..m.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !attached && !m.as_str().contains(['.', 'e', 'E']) {
            out.push_str(".0");
        }
    }
    out.push_str(&formula[last..]);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_basic_arithmetic() {
        let engine = CalcEngine::new();
        let vars = vars(&[("a", 10.0), ("b", 4.0)]);

        assert_eq!(engine.evaluate("a + b", &vars).unwrap(), 14.0);
        assert_eq!(engine.evaluate("a * b", &vars).unwrap(), 40.0);
        assert_eq!(engine.evaluate("a - b", &vars).unwrap(), 6.0);
        assert_eq!(engine.evaluate("a / b", &vars).unwrap(), 2.5);
    }

    #[test]
    fn test_integer_literals_divide_as_floats() {
        let engine = CalcEngine::new();
        let vars = vars(&[("power_active", 1000.0)]);

        assert_eq!(
            engine.evaluate("power_active * (1 / 2)", &vars).unwrap(),
            500.0
        );
        assert_eq!(engine.evaluate("7 / 2", &HashMap::new()).unwrap(), 3.5);
    }

    #[test]
    fn test_float_literals_rewrite() {
        assert_eq!(
            float_literals("p1 * 2 + 1.5 / 3e2 - voltage_l2").unwrap(),
            "p1 * 2.0 + 1.5 / 3e2 - voltage_l2"
        );
        assert_eq!(float_literals("(1 + 20) ^ 3").unwrap(), "(1.0 + 20.0) ^ 3.0");
    }

    #[test]
    fn test_operator_precedence() {
        let engine = CalcEngine::new();
        let vars = HashMap::new();

        assert_eq!(engine.evaluate("2 + 3 * 4", &vars).unwrap(), 14.0);
        assert_eq!(engine.evaluate("(2 + 3) * 4", &vars).unwrap(), 20.0);
        assert_eq!(engine.evaluate("2 ^ 3", &vars).unwrap(), 8.0);
    }

    #[test]
    fn test_sqrt_and_abs() {
        let engine = CalcEngine::new();
        let vars = vars(&[("s", 5.0), ("p", -4.0)]);

        assert_eq!(engine.evaluate("sqrt(16)", &vars).unwrap(), 4.0);
        assert_eq!(engine.evaluate("abs(p)", &vars).unwrap(), 4.0);
        assert_eq!(engine.evaluate("sqrt(s^2 - p^2)", &vars).unwrap(), 3.0);
    }

    #[test]
    fn test_missing_variable_is_error() {
        let engine = CalcEngine::new();
        let err = engine.evaluate("missing * 2", &HashMap::new()).unwrap_err();
        assert!(matches!(err, CalcError::Expression(_)));
    }

    #[test]
    fn test_non_finite_result_rejected() {
        let engine = CalcEngine::new();
        let vars = vars(&[("x", 1.0), ("zero", 0.0)]);

        let err = engine.evaluate("x / zero", &vars).unwrap_err();
        assert!(matches!(err, CalcError::NonFinite { .. }));

        let err = engine.evaluate("sqrt(0 - x)", &vars).unwrap_err();
        assert!(matches!(err, CalcError::NonFinite { .. }));
    }
}
