//! Shared primitives for the engine client workspace.
//!
//! - [`ErrorLocation`]: call-site capture attached to every error variant
//! - [`RedactedToken`]: credential wrapper that never leaks through logs
//!
//! ## Architecture
//!
//! - **common** (this crate): located errors and secret-safe value types
//! - **engine-client**: engine transports, sessions and the client facade
//! - **resolve**: command-line binary wiring logging and the client together

pub mod error;
pub mod redacted_token;

pub use error::error_location::ErrorLocation;
pub use error::redact_error::RedactError;
pub use redacted_token::RedactedToken;

#[cfg(test)]
mod tests;
