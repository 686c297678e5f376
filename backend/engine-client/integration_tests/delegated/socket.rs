#![cfg(unix)]

use crate::engine_tests::helpers::service_account_config;

use engine_client::backend::DelegatedBackend;
use engine_client::backend::delegated::{
    DelegatedReply, DelegatedRequest, FfiMethod, read_frame, write_frame,
};
use engine_client::{CancellationToken, Engine, EngineError, Invocation, MESSAGE_LIMIT};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;

const PEER_SESSION_ID: u64 = 12;

/// Peer process stand-in: answers each request from `respond` and records it.
struct FakePeer {
    socket_path: PathBuf,
    received: Arc<Mutex<Vec<DelegatedRequest>>>,
    _dir: TempDir,
}

impl FakePeer {
    fn start<F>(respond: F) -> Self
    where
        F: Fn(&DelegatedRequest) -> DelegatedReply + Send + Sync + 'static,
    {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let socket_path = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&socket_path).expect("Failed to bind test socket");
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let Ok(frame) = read_frame(&mut stream).await else {
                    continue;
                };
                let request: DelegatedRequest =
                    serde_json::from_slice(&frame).expect("peer received invalid request");
                let reply = respond(&request);
                log.lock().expect("log lock").push(request);

                let body = serde_json::to_vec(&reply).expect("reply serializes");
                write_frame(&mut stream, &body).await.expect("peer failed to reply");
            }
        });

        Self {
            socket_path,
            received,
            _dir: dir,
        }
    }

    fn methods(&self) -> Vec<FfiMethod> {
        self.received
            .lock()
            .expect("log lock")
            .iter()
            .map(|request| request.ffi_method)
            .collect()
    }

    fn request(&self, index: usize) -> DelegatedRequest {
        self.received.lock().expect("log lock")[index].clone()
    }
}

fn ok(payload: serde_json::Value) -> DelegatedReply {
    DelegatedReply {
        success: true,
        payload,
    }
}

fn secret_peer(request: &DelegatedRequest) -> DelegatedReply {
    match request.ffi_method {
        FfiMethod::InitClient => ok(json!(PEER_SESSION_ID)),
        FfiMethod::Invoke => ok(json!(r#""secret""#)),
        FfiMethod::ReleaseClient => ok(serde_json::Value::Null),
    }
}

/// **VALUE**: Verifies the full session lifecycle over the delegated socket.
///
/// **WHY THIS MATTERS**: Hosts that already embed the engine (e.g. a browser extension
/// runtime) expose it only through this socket.
///
/// **BUG THIS CATCHES**: Would catch wrong `ffiMethod` names, an unwrapped string
/// response, or the session ID not being sent on release.
#[tokio::test]
async fn given_delegated_peer_when_running_session_then_each_call_reaches_peer() {
    // GIVEN: A peer that issues session 12 and resolves every invocation
    let peer = FakePeer::start(secret_peer);
    let engine = Engine::Delegated(DelegatedBackend::new(&peer.socket_path));
    let cancel = CancellationToken::new();

    // WHEN: Opening, invoking and releasing twice
    let id = engine.init_client(&service_account_config(), &cancel).await.expect("init");
    let response = engine
        .invoke(
            Some(id),
            &Invocation::new("SecretsResolve", json!({"secret_reference": "op://v/i/f"})),
            &cancel,
        )
        .await
        .expect("invoke");
    engine.release_client(id).await;
    engine.release_client(id).await;

    // THEN: The peer saw one of each call with the expected payloads
    assert_eq!(id, PEER_SESSION_ID);
    assert_eq!(response, r#""secret""#);
    assert_eq!(
        peer.methods(),
        vec![FfiMethod::InitClient, FfiMethod::Invoke, FfiMethod::ReleaseClient]
    );
    assert_eq!(peer.request(0).payload["serviceAccountToken"], "ops_integration_test_token");
    assert_eq!(peer.request(1).payload["clientId"], PEER_SESSION_ID);
    assert_eq!(peer.request(2).payload, json!(PEER_SESSION_ID));
    assert_eq!(engine.transport_calls(), 3);
}

/// **VALUE**: Verifies peer-reported errors are classified like any other engine error.
///
/// **WHY THIS MATTERS**: Callers handle errors uniformly regardless of backend.
///
/// **BUG THIS CATCHES**: Would catch a failed reply being parsed as a successful payload.
#[tokio::test]
async fn given_peer_error_when_invoking_then_returns_engine_error() {
    // GIVEN: A peer that rejects invocations
    let peer = FakePeer::start(|request| match request.ffi_method {
        FfiMethod::Invoke => DelegatedReply {
            success: false,
            payload: json!(r#"{"name":"NotFound","message":"no item matched"}"#),
        },
        _ => secret_peer(request),
    });
    let engine = Engine::Delegated(DelegatedBackend::new(&peer.socket_path));
    let cancel = CancellationToken::new();
    let id = engine.init_client(&service_account_config(), &cancel).await.expect("init");

    // WHEN: Invoking
    let result = engine.invoke(Some(id), &Invocation::new("SecretsResolve", json!({})), &cancel).await;

    // THEN: The peer's error surfaces by name
    match result {
        Err(EngineError::Engine { name, message, .. }) => {
            assert_eq!(name.as_deref(), Some("NotFound"));
            assert_eq!(message, "no item matched");
        }
        other => panic!("expected the peer's error, got {other:?}"),
    }
}

/// **VALUE**: Verifies a missing socket is reported as an unavailable engine.
///
/// **WHY THIS MATTERS**: The common failure is the peer not running; the caller should
/// see that, not an I/O error.
///
/// **BUG THIS CATCHES**: Would catch connection failures being mapped to Transport.
#[tokio::test]
async fn given_missing_socket_when_initializing_then_returns_unavailable() {
    // GIVEN: A socket path nobody listens on
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let engine = Engine::Delegated(DelegatedBackend::new(dir.path().join("absent.sock")));

    // WHEN: Initializing
    let result = engine.init_client(&service_account_config(), &CancellationToken::new()).await;

    // THEN: The engine is unavailable
    match result {
        Err(EngineError::Unavailable { message, .. }) => {
            assert!(message.starts_with("cannot connect to engine socket"));
        }
        other => panic!("expected Unavailable, got {other:?}"),
    }
}

/// **VALUE**: Verifies frames announcing more than the limit are refused before reading.
///
/// **WHY THIS MATTERS**: A hostile or confused peer must not make the client allocate
/// gigabytes from a four-byte header.
///
/// **BUG THIS CATCHES**: Would catch the allocation happening before the limit check.
#[tokio::test]
async fn given_oversized_frame_header_when_reading_then_returns_message_too_large() {
    // GIVEN: A stream whose header claims one byte over the limit
    let (mut client, mut server) = tokio::io::duplex(64);
    let announced = u32::try_from(MESSAGE_LIMIT + 1).expect("limit fits in u32");
    server
        .write_all(&announced.to_le_bytes())
        .await
        .expect("header written");

    // WHEN: Reading a frame
    let result = read_frame(&mut client).await;

    // THEN: It is rejected by size
    assert!(matches!(result, Err(EngineError::MessageTooLarge { .. })));
}
