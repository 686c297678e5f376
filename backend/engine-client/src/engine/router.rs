//! Routes a client's invocations to its session.
//!
//! The router owns the session ID and the config it was created with. When the engine
//! supports recovery and reports the session expired, the router re-creates the session
//! once and retries; a second failure is returned as-is.

use crate::SessionId;
use crate::config::ClientConfig;
use crate::engine::Engine;
use crate::error::engine::EngineError;
use crate::wire::{self, Invocation};

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub struct InvocationRouter {
    engine: Arc<Engine>,
    config: ClientConfig,
    session: RwLock<SessionId>,
}

impl InvocationRouter {
    /// Create a session on `engine` for `config`.
    pub async fn open(
        engine: Arc<Engine>,
        config: ClientConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, EngineError> {
        let session_id = engine.init_client(&config, cancel).await?;

        Ok(Self {
            engine,
            config,
            session: RwLock::new(session_id),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn session_id(&self) -> SessionId {
        *self.session.read().await
    }

    pub(crate) fn try_session_id(&self) -> Option<SessionId> {
        self.session.try_read().ok().map(|session| *session)
    }

    /// # Errors
    ///
    /// Oversized requests fail with [`EngineError::MessageTooLarge`] before reaching the
    /// transport. After one recovery cycle the retry's error is returned, never the
    /// original expiry.
    pub async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let session_id = self.session_id().await;
        let request = wire::encode_invocation(Some(session_id), invocation)?;

        match self.engine.invoke_encoded(Some(session_id), request, cancel).await {
            Err(e) if e.is_session_expired() && self.engine.supports_session_recovery() => {
                info!(
                    "Session {session_id} expired during {}, re-initializing and retrying once",
                    invocation.name
                );
                let renewed = self.renew_session(session_id, cancel).await?;
                let request = wire::encode_invocation(Some(renewed), invocation)?;
                self.engine.invoke_encoded(Some(renewed), request, cancel).await
            }
            result => result,
        }
    }

    /// Replace `expired` with a fresh session, unless a concurrent caller already did.
    async fn renew_session(
        &self,
        expired: SessionId,
        cancel: &CancellationToken,
    ) -> Result<SessionId, EngineError> {
        let mut session = self.session.write().await;
        if *session != expired {
            debug!("Session {expired} already replaced by {}", *session);
            return Ok(*session);
        }

        let renewed = self.engine.init_client(&self.config, cancel).await?;
        self.engine.release_client(expired).await;
        *session = renewed;

        info!("Session {expired} replaced by {renewed}");
        Ok(renewed)
    }

    /// Release the current session. Safe to call more than once.
    pub async fn release(&self) {
        let session_id = self.session_id().await;
        self.engine.release_client(session_id).await;
    }
}
