use common::ErrorLocation;

use engine_client::ClientError;

use thiserror::Error;

/// Errors surfaced by the `resolve` binary.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Error from this binary (logging, filesystem)
    #[error("Resolve Error: {message} {location}")]
    Resolve {
        message: String,
        location: ErrorLocation,
    },

    /// Error from the engine client (configuration, transport, engine)
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl ResolveError {
    #[track_caller]
    pub fn resolve(message: impl Into<String>) -> Self {
        ResolveError::Resolve {
            message: message.into(),
            location: ErrorLocation::caller(),
        }
    }
}
