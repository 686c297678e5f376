use crate::ErrorLocation;

use thiserror::Error as ThisError;

/// Refusal to write a redacted credential through an implicit path.
#[derive(Debug, ThisError)]
pub enum RedactError {
    #[error("Redaction Error: {type_name} refuses implicit serialization, call expose() explicitly {location}")]
    ImplicitSerialization {
        type_name: &'static str,
        location: ErrorLocation,
    },
}

impl RedactError {
    #[track_caller]
    pub fn implicit_serialization(type_name: &'static str) -> Self {
        RedactError::ImplicitSerialization {
            type_name,
            location: ErrorLocation::caller(),
        }
    }
}
