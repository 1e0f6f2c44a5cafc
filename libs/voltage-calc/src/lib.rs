//! voltage-calc - formula evaluation for derived meter registers
//!
//! Formulas reference other registers by name and support `+ - * / ^`,
//! parentheses, numeric literals, and the two functions `sqrt()` and `abs()`.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use voltage_calc::{extract_variables, CalcEngine};
//!
//! let formula = "sqrt(power_apparent^2 - power_active^2)";
//! assert_eq!(
//!     extract_variables(formula).unwrap(),
//!     vec!["power_apparent".to_string(), "power_active".to_string()]
//! );
//!
//! let mut vars = HashMap::new();
//! vars.insert("power_apparent".to_string(), 5.0);
//! vars.insert("power_active".to_string(), 4.0);
//!
//! let engine = CalcEngine::new();
//! assert_eq!(engine.evaluate(formula, &vars).unwrap(), 3.0);
//! ```

pub mod error;
pub mod evaluator;
pub mod variables;

pub use error::{CalcError, Result};
pub use evaluator::CalcEngine;
pub use variables::{extract_variables, BUILTIN_FUNCTIONS};
