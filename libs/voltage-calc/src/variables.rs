//! Variable discovery in register formulas

use crate::error::{CalcError, Result};

/// Function names the evaluator provides; never treated as variables
pub const BUILTIN_FUNCTIONS: &[&str] = &["sqrt", "abs"];

/// Extract the register names a formula depends on
///
/// Returns identifiers in first-seen order without duplicates. Function
/// names and exponent suffixes of numeric literals (`1e3`) are skipped.
pub fn extract_variables(formula: &str) -> Result<Vec<String>> {
    let re = regex::Regex::new(r"[A-Za-z_][A-Za-z0-9_]*")
        .map_err(|e| CalcError::expression(format!("Regex error: {}", e)))?;
    let mut variables: Vec<String> = Vec::new();

    for m in re.find_iter(formula) {
        let preceded_by_number = formula[..m.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_digit() || c == '.');
        if preceded_by_number {
            continue;
        }

        let name = m.as_str();
        if BUILTIN_FUNCTIONS.contains(&name) {
            continue;
        }
        if !variables.iter().any(|v| v == name) {
            variables.push(name.to_string());
        }
    }

    Ok(variables)
}
