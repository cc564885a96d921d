//! Error types for the anomaly detection engine.

use thiserror::Error;

/// Errors raised while building or managing detectors.
///
/// Detection itself never fails; these only surface from construction,
/// configuration and rule management.
#[derive(Debug, Error)]
pub enum SiftError {
    /// A rule definition could not be parsed or compiled.
    #[error("invalid rule '{key}': {reason}")]
    InvalidRule {
        /// The rule id or config key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// No rule exists with the given id.
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// A configuration value was present but unusable.
    #[error("invalid config value for '{key}': {reason}")]
    InvalidConfig {
        /// The offending key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A value-extraction pattern failed to compile.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The background engine worker is no longer running.
    #[error("engine worker stopped")]
    EngineStopped,
}

impl SiftError {
    /// Creates an [`SiftError::InvalidConfig`] error.
    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an [`SiftError::InvalidRule`] error.
    pub fn invalid_rule(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, SiftError>;
