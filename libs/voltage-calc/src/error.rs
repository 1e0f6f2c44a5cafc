//! Error types for voltage-calc

use thiserror::Error;

/// Calculation errors
#[derive(Debug, Clone, Error)]
pub enum CalcError {
    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Function error: {0}")]
    Function(String),

    #[error("Non-finite result {value} from '{formula}'")]
    NonFinite { formula: String, value: f64 },
}

impl CalcError {
    pub fn expression(msg: impl Into<String>) -> Self {
        Self::Expression(msg.into())
    }

    pub fn function(msg: impl Into<String>) -> Self {
        Self::Function(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CalcError>;
