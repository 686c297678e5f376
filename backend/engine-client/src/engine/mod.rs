//! The engine handle every caller programs against.
//!
//! [`Engine`] is a closed set of backends selected once when a client is built. The
//! process-wide handle ([`shared_engine`]) is created lazily on first use and can be
//! reset for test isolation.

pub mod pool;
pub mod router;

use crate::SessionId;
use crate::backend::{BytecodeBackend, DelegatedBackend, NativeBackend};
use crate::config::{ClientConfig, EngineSettings};
use crate::error::engine::EngineError;
use crate::wire::{self, Invocation};

use pool::SessionState;

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

static SHARED_ENGINE: Mutex<Option<Arc<Engine>>> = Mutex::new(None);

/// Transport to a password-manager engine, one variant per backend.
///
/// All variants expose the same session lifecycle: [`Engine::init_client`] opens a
/// session, [`Engine::invoke`] routes calls to it and [`Engine::release_client`] closes it.
pub enum Engine {
    /// Module executed in-process by wasmtime.
    Bytecode(BytecodeBackend),
    /// Companion desktop app reached through its shared library.
    Native(NativeBackend),
    /// Engine hosted by another process behind a Unix socket.
    Delegated(DelegatedBackend),
}

impl Engine {
    /// Engine described by `settings`: the delegated socket when one is configured,
    /// otherwise the bytecode module.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unavailable`] when neither is configured or the module
    /// cannot be loaded.
    pub fn from_settings(settings: &EngineSettings) -> Result<Self, EngineError> {
        if let Some(socket) = &settings.delegated_socket {
            info!("Using delegated engine at {}", socket.display());
            return Ok(Engine::Delegated(DelegatedBackend::new(socket)));
        }

        let module_path = settings.module_path.as_deref().ok_or_else(|| {
            EngineError::unavailable(format!(
                "no engine module configured, set {}",
                crate::config::settings::ENV_ENGINE_MODULE
            ))
        })?;

        Ok(Engine::Bytecode(BytecodeBackend::load_file(
            module_path,
            settings.isolation,
            &settings.allowed_hosts,
        )?))
    }

    /// Engine running inside the companion desktop app, scoped to `account`.
    pub fn desktop(account: &str, settings: &EngineSettings) -> Result<Self, EngineError> {
        Ok(Engine::Native(NativeBackend::connect(
            account,
            settings.desktop_library.as_deref(),
        )?))
    }

    /// Short backend name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Engine::Bytecode(_) => "bytecode",
            Engine::Native(_) => "native",
            Engine::Delegated(_) => "delegated",
        }
    }

    /// Whether an expired session may be re-created and the call retried once.
    pub fn supports_session_recovery(&self) -> bool {
        matches!(self, Engine::Native(_))
    }

    /// Calls that crossed the transport boundary so far.
    pub fn transport_calls(&self) -> u64 {
        match self {
            Engine::Bytecode(backend) => backend.transport_calls(),
            Engine::Native(backend) => backend.transport_calls(),
            Engine::Delegated(backend) => backend.transport_calls(),
        }
    }

    /// Lifecycle state of `session_id`, `None` once released or never issued.
    pub fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        match self {
            Engine::Bytecode(backend) => backend.session_state(session_id),
            Engine::Native(backend) => backend.session_state(session_id),
            Engine::Delegated(backend) => backend.session_state(session_id),
        }
    }

    /// Register a new session and return its ID.
    ///
    /// # Errors
    ///
    /// Engine rejections (e.g. a malformed credential) surface as
    /// [`EngineError::Engine`]; transport failures keep their own variants.
    pub async fn init_client(
        &self,
        config: &ClientConfig,
        cancel: &CancellationToken,
    ) -> Result<SessionId, EngineError> {
        let session_id = match self {
            Engine::Bytecode(backend) => backend.init_client(config.to_wire_bytes()?, cancel).await?,
            Engine::Native(backend) => backend.init_client(config.to_wire_bytes()?, cancel).await?,
            Engine::Delegated(backend) => backend.init_client(config.to_wire_value()?, cancel).await?,
        };

        info!(
            "Session {session_id} created on {} engine for {} {}",
            self.kind(),
            config.integration_name(),
            config.integration_version()
        );
        Ok(session_id)
    }

    /// Run one operation. `session_id` may be omitted for session-less calls.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MessageTooLarge`] without touching the transport when the
    /// encoded request exceeds [`crate::MESSAGE_LIMIT`].
    pub async fn invoke(
        &self,
        session_id: Option<SessionId>,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let request = wire::encode_invocation(session_id, invocation)?;
        self.invoke_encoded(session_id, request, cancel).await
    }

    pub(crate) async fn invoke_encoded(
        &self,
        session_id: Option<SessionId>,
        request: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let response = match self {
            Engine::Bytecode(backend) => backend.invoke(session_id, request, cancel).await?,
            Engine::Native(backend) => backend.invoke(session_id, request, cancel).await?,
            Engine::Delegated(backend) => backend.invoke(session_id, request, cancel).await?,
        };

        String::from_utf8(response)
            .map_err(|e| EngineError::serialization(format!("engine response is not UTF-8: {e}")))
    }

    /// Release a session. Never fails: errors are logged and swallowed, and releasing an
    /// already released ID is a no-op.
    pub async fn release_client(&self, session_id: SessionId) {
        let result = match self {
            Engine::Bytecode(backend) => backend.release_client(session_id).await,
            Engine::Native(backend) => backend.release_client(session_id).await,
            Engine::Delegated(backend) => backend.release_client(session_id).await,
        };

        match result {
            Ok(()) => debug!("Session {session_id} released"),
            Err(e) => warn!(
                "Failed to release session {session_id} ({}): {e}",
                e.error_category()
            ),
        }
    }
}

/// Process-wide engine, created from `settings` on first use.
///
/// Later calls return the same handle regardless of `settings` until
/// [`reset_shared_engine`] is called.
pub fn shared_engine(settings: &EngineSettings) -> Result<Arc<Engine>, EngineError> {
    let mut shared = SHARED_ENGINE
        .lock()
        .map_err(|_| EngineError::invariant("shared engine lock poisoned"))?;

    if let Some(engine) = shared.as_ref() {
        return Ok(Arc::clone(engine));
    }

    let engine = Arc::new(Engine::from_settings(settings)?);
    *shared = Some(Arc::clone(&engine));
    Ok(engine)
}

/// Install `engine` as the process-wide handle, replacing any existing one.
pub fn set_shared_engine(engine: Arc<Engine>) {
    if let Ok(mut shared) = SHARED_ENGINE.lock() {
        *shared = Some(engine);
    }
}

/// Drop the process-wide handle so the next [`shared_engine`] call starts fresh.
///
/// Sessions already holding the old handle keep it alive until they are released.
pub fn reset_shared_engine() -> Option<Arc<Engine>> {
    SHARED_ENGINE.lock().ok().and_then(|mut shared| shared.take())
}
