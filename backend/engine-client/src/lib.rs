//! Engine transport and client-session lifecycle.
//!
//! The engine implements all business logic; this crate only gets requests to it and
//! responses back. Layers, leaf first:
//!
//! - [`backend`]: bytecode VM, native companion library, delegated IPC socket
//! - [`engine`]: the [`Engine`] handle over those backends, the instance pool and the
//!   invocation router
//! - [`client`]: the [`Client`] facade applications hold
//!
//! ```no_run
//! use engine_client::{ClientBuilder, DEFAULT_INTEGRATION_NAME, DEFAULT_INTEGRATION_VERSION};
//!
//! # async fn run() -> Result<(), engine_client::ClientError> {
//! let client = ClientBuilder::default()
//!     .with_service_account_token("ops_...")
//!     .with_integration_info(DEFAULT_INTEGRATION_NAME, DEFAULT_INTEGRATION_VERSION)
//!     .build()
//!     .await?;
//!
//! let password = client.secrets().resolve("op://vault/item/password").await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod wire;

#[cfg(test)]
mod tests;

pub use client::{Client, ClientBuilder, Secrets};
pub use config::{
    ClientConfig, Credential, DEFAULT_INTEGRATION_NAME, DEFAULT_INTEGRATION_VERSION,
    EngineSettings, Isolation,
};
pub use engine::Engine;
pub use engine::pool::SessionState;
pub use error::{ClientError, ConfigError, EngineError};
pub use wire::{Invocation, MESSAGE_LIMIT};

pub use tokio_util::sync::CancellationToken;

/// Opaque numeric session identifier.
pub type SessionId = u64;
