use common::ErrorLocation;

use std::env::VarError;

use thiserror::Error;

/// Local validation failures, raised before any transport call is made.
///
/// Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config Validation Error: {reason} {location}")]
    ValidationError {
        location: ErrorLocation,
        reason: String,
    },

    #[error("Config Environment Error: {variable}: {reason} {location}")]
    EnvironmentError {
        location: ErrorLocation,
        variable: String,
        reason: String,
    },
}

impl ConfigError {
    #[track_caller]
    pub fn validation(reason: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            location: ErrorLocation::caller(),
            reason: reason.into(),
        }
    }

    #[track_caller]
    pub fn environment(variable: impl Into<String>, error: &VarError) -> Self {
        ConfigError::EnvironmentError {
            location: ErrorLocation::caller(),
            variable: variable.into(),
            reason: error.to_string(),
        }
    }

    /// Human readable reason without the location suffix.
    pub fn reason(&self) -> &str {
        match self {
            ConfigError::ValidationError { reason, .. } => reason,
            ConfigError::EnvironmentError { reason, .. } => reason,
        }
    }
}
