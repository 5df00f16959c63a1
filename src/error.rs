use serde::{Deserialize, Serialize};

/// Error returned when configuration cannot be applied.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot reconfigure while {0} log record(s) are open")]
    Busy(usize),
}

/// Error raised by the emergency store. Callers treat these as
/// diagnostics only; the affected records are lost.
#[derive(thiserror::Error, Debug)]
pub enum EmergencyError {
    #[error("emergency store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("emergency store serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Description of an error that escaped a scope's body. Recorded on the
/// scope's record as `fault=1` plus `error_class` / `error_message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeError {
    pub class: String,
    pub message: String,
}

impl ScopeError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        ScopeError {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Build from any error value, using its type path as the class.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        ScopeError {
            class: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for ScopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}
