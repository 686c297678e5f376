//! Engine embedded in a peer process, reached over a local socket.
//!
//! One connection per request. Frames are a little-endian `u32` length followed by a JSON
//! envelope: `{ "ffiMethod", "payload" }` outbound and `{ "success", "payload" }` back.

use crate::SessionId;
use crate::backend::TransportCounter;
use crate::engine::pool::{InstancePool, SessionState};
use crate::error::engine::EngineError;
use crate::wire::{self, MESSAGE_LIMIT};

use std::path::{Path, PathBuf};

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use std::io::ErrorKind;
#[cfg(unix)]
use tokio::net::UnixStream;

const FRAME_HEADER_LEN: usize = 4;

/// Engine entry point a delegated request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FfiMethod {
    #[serde(rename = "initClient")]
    InitClient,
    #[serde(rename = "invoke")]
    Invoke,
    #[serde(rename = "releaseClient")]
    ReleaseClient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedRequest {
    pub ffi_method: FfiMethod,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatedReply {
    pub success: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), EngineError>
where
    W: AsyncWrite + Unpin,
{
    wire::ensure_within_limit(body.len())?;
    let len = u32::try_from(body.len()).map_err(|_| EngineError::message_too_large(body.len(), MESSAGE_LIMIT))?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, refusing bodies above [`MESSAGE_LIMIT`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let len = u32::from_le_bytes(header) as usize;
    wire::ensure_within_limit(len)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Engine hosted by another process and reached over a Unix domain socket.
///
/// Every call opens a fresh connection, writes one length-prefixed JSON request and reads
/// one reply frame. Sessions live in the remote process; this side only records which IDs
/// it opened.
pub struct DelegatedBackend {
    socket_path: PathBuf,
    pool: InstancePool<()>,
    calls: TransportCounter,
}

impl DelegatedBackend {
    /// Backend for the socket at `socket_path`. Nothing is connected until the first call.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            pool: InstancePool::new(),
            calls: TransportCounter::default(),
        }
    }

    /// Socket the remote engine listens on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub(crate) fn transport_calls(&self) -> u64 {
        self.calls.get()
    }

    pub(crate) fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.pool.state(session_id)
    }

    async fn call(
        &self,
        ffi_method: FfiMethod,
        payload: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, EngineError> {
        let request = serde_json::to_vec(&DelegatedRequest { ffi_method, payload })?;
        wire::ensure_within_limit(request.len())?;

        if cancel.is_cancelled() {
            return Err(EngineError::cancelled("delegated call"));
        }

        self.calls.record();
        let reply = tokio::select! {
            reply = self.exchange(&request) => reply?,
            _ = cancel.cancelled() => return Err(EngineError::cancelled("delegated call")),
        };

        let reply: DelegatedReply = serde_json::from_slice(&reply)?;
        if reply.success {
            Ok(reply.payload)
        } else {
            Err(match reply.payload {
                serde_json::Value::String(message) => EngineError::from_engine_payload(message.as_bytes()),
                other => EngineError::from_engine_payload(&serde_json::to_vec(&other)?),
            })
        }
    }

    #[cfg(unix)]
    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            match e.kind() {
                ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::PermissionDenied => {
                    EngineError::unavailable(format!(
                        "cannot connect to engine socket {}: {e}",
                        self.socket_path.display()
                    ))
                }
                _ => EngineError::transport(format!(
                    "engine socket {} failed: {e}",
                    self.socket_path.display()
                )),
            }
        })?;
        trace!("Connected to {}", self.socket_path.display());

        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    }

    #[cfg(not(unix))]
    async fn exchange(&self, _request: &[u8]) -> Result<Vec<u8>, EngineError> {
        Err(EngineError::unavailable(format!(
            "delegated engine sockets are not supported on this platform ({})",
            self.socket_path.display()
        )))
    }

    pub(crate) async fn init_client(
        &self,
        config: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<SessionId, EngineError> {
        let payload = self.call(FfiMethod::InitClient, config, cancel).await?;
        let session_id = wire::decode_session_id(&serde_json::to_vec(&payload)?)?;

        self.pool.reserve(session_id)?;
        self.pool.activate(session_id, ())?;
        debug!("Delegated session {session_id} registered");
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

        let request: serde_json::Value = serde_json::from_slice(&request)?;
        match self.call(FfiMethod::Invoke, request, cancel).await? {
            serde_json::Value::String(response) => Ok(response.into_bytes()),
            other => Ok(serde_json::to_vec(&other)?),
        }
    }

    pub(crate) async fn release_client(&self, session_id: SessionId) -> Result<(), EngineError> {
        if self.pool.release(session_id)?.is_none() {
            debug!("Delegated session {session_id} already released");
            return Ok(());
        }

        self.call(
            FfiMethod::ReleaseClient,
            serde_json::Value::from(session_id),
            &CancellationToken::new(),
        )
        .await
        .map(|_| ())
    }
}
