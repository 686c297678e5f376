//! Error taxonomy for everything at or below the Engine Handle boundary.
//!
//! Key design decisions:
//! - Backends translate their native failures (wasmtime traps, FFI status codes,
//!   socket errors) into these variants before returning
//! - Classification (`is_session_expired`, `is_invalid_session`) uses variants, never
//!   message content
//! - All errors include ErrorLocation for debugging

use crate::SessionId;

use common::ErrorLocation;

use std::io::Error as IoError;

use serde::Deserialize;
use thiserror::Error as ThisError;

pub(crate) const SUPPORT_HINT: &str =
    "please contact 1Password at support@1password.com or https://developer.1password.com/joinslack if you need help";

pub(crate) const INTERNAL_ERROR_PREFIX: &str =
    "an internal error occurred. Please contact 1Password support and mention the return code: ";

/// Engine error name that marks an expired companion-app session.
const SESSION_EXPIRED_ERROR_NAME: &str = "DesktopSessionExpired";

#[derive(Debug, ThisError)]
pub enum EngineError {
    /// Local configuration was rejected before reaching any transport.
    #[error("Configuration Error: {message} {location}")]
    Configuration {
        message: String,
        location: ErrorLocation,
    },

    /// The backend cannot be reached at all (library missing, module failed to load,
    /// socket refused). Fatal for this backend selection.
    #[error("Engine Unavailable Error: {message} {location}")]
    Unavailable {
        message: String,
        location: ErrorLocation,
    },

    /// A call was attempted but the transport failed mid-flight.
    #[error("Transport Error: {message} {location}")]
    Transport {
        message: String,
        location: ErrorLocation,
    },

    #[error("Invalid Session Error: session {session_id}: {message} {location}")]
    InvalidSession {
        session_id: SessionId,
        message: String,
        location: ErrorLocation,
    },

    /// Companion-app session expired; recoverable by one re-initialize-and-retry cycle.
    #[error("Session Expired Error: {message} {location}")]
    SessionExpired {
        message: String,
        location: ErrorLocation,
    },

    #[error("Message Too Large Error: {size} bytes exceeds the limit of {limit} bytes, {hint} {location}", hint = SUPPORT_HINT)]
    MessageTooLarge {
        size: usize,
        limit: usize,
        location: ErrorLocation,
    },

    /// Business error reported by the engine itself, passed through verbatim.
    #[error("Engine Error: {message} {location}")]
    Engine {
        name: Option<String>,
        message: String,
        location: ErrorLocation,
    },

    #[error("Cancelled Error: {message} {location}")]
    Cancelled {
        message: String,
        location: ErrorLocation,
    },

    #[error("Serialization Error: {message} {location}")]
    Serialization {
        message: String,
        location: ErrorLocation,
    },

    /// A marshaling invariant was broken (e.g. out-of-bounds guest memory access).
    #[error("Invariant Violation: {message} {location}")]
    InvariantViolation {
        message: String,
        location: ErrorLocation,
    },
}

/// Structured error body some engines return instead of plain text.
#[derive(Debug, Deserialize)]
struct EngineErrorBody {
    name: String,
    message: String,
}

impl EngineError {
    #[track_caller]
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration {
            message: message.into(),
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn unavailable(message: impl Into<String>) -> Self {
        EngineError::Unavailable {
            message: message.into(),
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn transport(message: impl Into<String>) -> Self {
        EngineError::Transport {
            message: message.into(),
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn invalid_session(session_id: SessionId) -> Self {
        EngineError::InvalidSession {
            session_id,
            message: String::from("session is unknown or was already released"),
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn session_expired(message: impl Into<String>) -> Self {
        EngineError::SessionExpired {
            message: message.into(),
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn message_too_large(size: usize, limit: usize) -> Self {
        EngineError::MessageTooLarge {
            size,
            limit,
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn cancelled(operation: &str) -> Self {
        EngineError::Cancelled {
            message: format!("{operation} was cancelled before the engine responded"),
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn serialization(message: impl Into<String>) -> Self {
        EngineError::Serialization {
            message: message.into(),
            location: ErrorLocation::caller(),
        }
    }

    #[track_caller]
    pub fn invariant(message: impl Into<String>) -> Self {
        EngineError::InvariantViolation {
            message: message.into(),
            location: ErrorLocation::caller(),
        }
    }

    /// Classify an error payload produced by the engine.
    ///
    /// JSON bodies of the form `{"name": .., "message": ..}` keep their name; the
    /// expired-session name maps to [`EngineError::SessionExpired`]. Anything else is
    /// passed through verbatim.
    #[track_caller]
    pub fn from_engine_payload(payload: &[u8]) -> Self {
        let location = ErrorLocation::caller();

        match serde_json::from_slice::<EngineErrorBody>(payload) {
            Ok(body) if body.name == SESSION_EXPIRED_ERROR_NAME => EngineError::SessionExpired {
                message: body.message,
                location,
            },
            Ok(body) => EngineError::Engine {
                name: Some(body.name),
                message: body.message,
                location,
            },
            Err(_) => EngineError::Engine {
                name: None,
                message: String::from_utf8_lossy(payload).into_owned(),
                location,
            },
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, EngineError::SessionExpired { .. })
    }

    pub fn is_invalid_session(&self) -> bool {
        matches!(self, EngineError::InvalidSession { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled { .. })
    }

    /// Get error category for logging.
    pub fn error_category(&self) -> &'static str {
        match self {
            EngineError::Configuration { .. } => "configuration",
            EngineError::Unavailable { .. } => "unavailable",
            EngineError::Transport { .. } => "transport",
            EngineError::InvalidSession { .. } => "invalid_session",
            EngineError::SessionExpired { .. } => "session_expired",
            EngineError::MessageTooLarge { .. } => "message_too_large",
            EngineError::Engine { .. } => "engine",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::Serialization { .. } => "serialization",
            EngineError::InvariantViolation { .. } => "invariant_violation",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    #[track_caller]
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization {
            message: error.to_string(),
            location: ErrorLocation::caller(),
        }
    }
}

impl From<IoError> for EngineError {
    #[track_caller]
    fn from(error: IoError) -> Self {
        EngineError::Transport {
            message: error.to_string(),
            location: ErrorLocation::caller(),
        }
    }
}

impl From<crate::error::ConfigError> for EngineError {
    #[track_caller]
    fn from(error: crate::error::ConfigError) -> Self {
        EngineError::Configuration {
            message: error.reason().to_string(),
            location: ErrorLocation::caller(),
        }
    }
}
