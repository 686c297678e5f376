//! Engine running inside the companion desktop app, reached through its shared library.
//!
//! Each call is wrapped in an envelope naming the operation and the desktop account,
//! then handed to the library's `send_message`. The engine keeps session state on its
//! side; the pool here only tracks which IDs are live.

pub mod library;
pub mod status;

use crate::SessionId;
use crate::backend::{TransportCounter, run_blocking};
use crate::engine::pool::{InstancePool, SessionState};
use crate::error::engine::EngineError;
use crate::wire::{self, base64_bytes};

use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Synchronous request/response exchange with the companion app.
pub(crate) trait MessageChannel: Send + Sync {
    fn send_message(&self, message: &[u8]) -> Result<Vec<u8>, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    InitClient,
    Invoke,
    ReleaseClient,
}

impl MessageKind {
    const fn as_str(self) -> &'static str {
        match self {
            MessageKind::InitClient => "init_client",
            MessageKind::Invoke => "invoke",
            MessageKind::ReleaseClient => "release_client",
        }
    }
}

#[derive(Serialize)]
struct NativeRequest<'a> {
    kind: &'static str,
    account_name: &'a str,
    #[serde(with = "base64_bytes")]
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct NativeResponse {
    success: bool,
    #[serde(default, with = "base64_bytes")]
    payload: Vec<u8>,
}

/// Engine running inside the companion desktop app.
///
/// Each request is wrapped in an envelope naming the account and sent synchronously over
/// the desktop library's `send_message`. Session IDs are issued by the app; the pool only
/// tracks which of them are still open.
pub struct NativeBackend {
    account: String,
    channel: Arc<dyn MessageChannel>,
    pool: InstancePool<()>,
    calls: TransportCounter,
}

impl NativeBackend {
    /// Bind to the companion library for `account`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unavailable`] when the library is not installed or lacks
    /// the expected symbols.
    pub fn connect(account: impl Into<String>, library_path: Option<&Path>) -> Result<Self, EngineError> {
        let library = library::shared_library(library_path)?;
        Ok(Self::with_channel(account, library))
    }

    pub(crate) fn with_channel(account: impl Into<String>, channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            account: account.into(),
            channel,
            pool: InstancePool::new(),
            calls: TransportCounter::default(),
        }
    }

    /// Desktop app account this backend is scoped to.
    pub fn account(&self) -> &str {
        &self.account
    }

    pub(crate) fn transport_calls(&self) -> u64 {
        self.calls.get()
    }

    pub(crate) fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.pool.state(session_id)
    }

    async fn call(
        &self,
        kind: MessageKind,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        if payload.is_empty() {
            return Err(EngineError::transport("internal: empty input"));
        }

        let envelope = serde_json::to_vec(&NativeRequest {
            kind: kind.as_str(),
            account_name: &self.account,
            payload,
        })?;
        wire::ensure_within_limit(envelope.len())?;

        if cancel.is_cancelled() {
            return Err(EngineError::cancelled(kind.as_str()));
        }

        let channel = Arc::clone(&self.channel);
        self.calls.record();
        let reply = run_blocking(
            cancel,
            kind.as_str(),
            move || channel.send_message(&envelope),
            || {},
        )
        .await?;

        let response: NativeResponse = serde_json::from_slice(&reply)?;
        if response.success {
            Ok(response.payload)
        } else {
            Err(EngineError::from_engine_payload(&response.payload))
        }
    }

    pub(crate) async fn init_client(
        &self,
        config: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<SessionId, EngineError> {
        let reply = self.call(MessageKind::InitClient, &config, cancel).await?;
        let session_id = wire::decode_session_id(&reply)?;

        self.pool.reserve(session_id)?;
        self.pool.activate(session_id, ())?;
        debug!("Desktop app session {session_id} registered");
        Ok(session_id)
    }

    pub(crate) async fn invoke(
        &self,
        session_id: Option<SessionId>,
        request: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        if let Some(session_id) = session_id {
            self.pool.checkout(session_id)?;
        }

        let result = self.call(MessageKind::Invoke, &request, cancel).await;

        if let (Some(session_id), Err(e)) = (session_id, &result)
            && e.is_session_expired()
        {
            warn!("Desktop app session {session_id} expired");
            self.pool.release(session_id)?;
        }
        result
    }

    pub(crate) async fn release_client(&self, session_id: SessionId) -> Result<(), EngineError> {
        if self.pool.release(session_id)?.is_none() {
            debug!("Desktop app session {session_id} already released");
            return Ok(());
        }

        let payload = wire::encode_session_id(session_id)?;
        self.call(MessageKind::ReleaseClient, &payload, &CancellationToken::new())
            .await
            .map(|_| ())
    }
}
