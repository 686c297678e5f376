use crate::backend::NativeBackend;
use crate::backend::native::MessageChannel;
use crate::backend::native::library::{DESKTOP_APP_NOT_FOUND, NativeLibrary, find_library};
use crate::backend::native::status::{
    CHANNEL_CLOSED_MESSAGE, CONNECTION_DROPPED_MESSAGE, DEFAULT_STATUS_TABLE, MACOS_STATUS_TABLE,
    StatusCondition,
};
use crate::engine::pool::SessionState;
use crate::error::engine::INTERNAL_ERROR_PREFIX;
use crate::{CancellationToken, EngineError, SessionId};

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;

pub(super) const ACCOUNT: &str = "my.1password.com";

/// Companion-app stand-in that replays scripted replies and records every envelope.
#[derive(Default)]
pub(super) struct ScriptedChannel {
    replies: Mutex<VecDeque<Result<Vec<u8>, EngineError>>>,
    sent: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedChannel {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(super) fn reply_ok(&self, payload: &[u8]) -> &Self {
        let body = json!({"success": true, "payload": STANDARD.encode(payload)});
        self.push(Ok(serde_json::to_vec(&body).expect("reply serializes")));
        self
    }

    pub(super) fn reply_error(&self, name: &str, message: &str) -> &Self {
        let error = json!({"name": name, "message": message}).to_string();
        let body = json!({"success": false, "payload": STANDARD.encode(error)});
        self.push(Ok(serde_json::to_vec(&body).expect("reply serializes")));
        self
    }

    pub(super) fn reply_status(&self, error: EngineError) -> &Self {
        self.push(Err(error));
        self
    }

    fn push(&self, reply: Result<Vec<u8>, EngineError>) {
        self.replies.lock().expect("replies lock").push_back(reply);
    }

    pub(super) fn sent(&self) -> Vec<serde_json::Value> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub(super) fn sent_kinds(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|envelope| envelope["kind"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub(super) fn sent_payload(&self, index: usize) -> Vec<u8> {
        let envelope = &self.sent()[index];
        STANDARD
            .decode(envelope["payload"].as_str().expect("payload is a string"))
            .expect("payload is base64")
    }
}

impl MessageChannel for ScriptedChannel {
    fn send_message(&self, message: &[u8]) -> Result<Vec<u8>, EngineError> {
        let envelope = serde_json::from_slice(message).expect("envelope is JSON");
        self.sent.lock().expect("sent lock").push(envelope);
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::transport("no scripted reply left")))
    }
}

pub(super) fn native_backend(channel: &Arc<ScriptedChannel>) -> NativeBackend {
    NativeBackend::with_channel(ACCOUNT, Arc::clone(channel) as Arc<dyn MessageChannel>)
}

fn invoke_request(session_id: SessionId) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "clientId": session_id,
        "invocation": {"name": "SecretsResolve", "parameters": {"secret_reference": "op://v/i/f"}}
    }))
    .expect("request serializes")
}

// ============================================================================
// Envelope
// ============================================================================

/// **VALUE**: Verifies the envelope handed to the companion library.
///
/// **WHY THIS MATTERS**: The desktop app routes by `kind` and `account_name` and decodes
/// `payload` from base64. A mismatch is reported by the app as a generic failure.
///
/// **BUG THIS CATCHES**: Would catch a renamed envelope key or a payload sent as raw JSON.
#[tokio::test]
async fn given_native_backend_when_initializing_then_envelope_names_kind_and_account() {
    // GIVEN: A channel that accepts the session
    let channel = ScriptedChannel::new();
    channel.reply_ok(b"7");
    let backend = native_backend(&channel);

    // WHEN: Initializing a client
    let session_id = backend
        .init_client(br#"{"accountId":"my.1password.com"}"#.to_vec(), &CancellationToken::new())
        .await
        .expect("init succeeds");

    // THEN: The engine's ID is used and the envelope is well-formed
    assert_eq!(session_id, 7);
    assert_eq!(backend.session_state(7), Some(SessionState::Active));
    let sent = channel.sent();
    assert_eq!(sent[0]["kind"], "init_client");
    assert_eq!(sent[0]["account_name"], ACCOUNT);
    assert_eq!(channel.sent_payload(0), br#"{"accountId":"my.1password.com"}"#);
}

/// **VALUE**: Verifies the empty-input guard fires before the library is called.
///
/// **WHY THIS MATTERS**: The library dereferences the input pointer unconditionally.
///
/// **BUG THIS CATCHES**: Would catch the guard being moved after the transport call.
#[tokio::test]
async fn given_empty_request_when_invoking_then_fails_without_calling_library() {
    // GIVEN: A backend with no scripted replies
    let channel = ScriptedChannel::new();
    let backend = native_backend(&channel);

    // WHEN: Invoking with an empty payload
    let result = backend.invoke(None, Vec::new(), &CancellationToken::new()).await;

    // THEN: It fails locally and nothing was sent
    match result {
        Err(EngineError::Transport { message, .. }) => assert_eq!(message, "internal: empty input"),
        other => panic!("expected a transport error, got {other:?}"),
    }
    assert_eq!(backend.transport_calls(), 0);
    assert!(channel.sent().is_empty());
}

/// **VALUE**: Verifies release sends the session ID once and is idempotent.
///
/// **WHY THIS MATTERS**: The companion app frees server-side state on release; double
/// releases produce noisy errors in the app's logs.
///
/// **BUG THIS CATCHES**: Would catch a second `release_client` crossing the transport.
#[tokio::test]
async fn given_active_session_when_released_twice_then_only_one_release_is_sent() {
    // GIVEN: An active session 3
    let channel = ScriptedChannel::new();
    channel.reply_ok(b"3").reply_ok(b"");
    let backend = native_backend(&channel);
    let cancel = CancellationToken::new();
    backend.init_client(b"{}".to_vec(), &cancel).await.expect("init");

    // WHEN: Releasing it twice
    backend.release_client(3).await.expect("first release");
    backend.release_client(3).await.expect("second release");

    // THEN: Exactly one release was sent, carrying the ID
    assert_eq!(channel.sent_kinds(), vec!["init_client", "release_client"]);
    assert_eq!(channel.sent_payload(1), b"3");
    assert_eq!(backend.session_state(3), None);
}

/// **VALUE**: Verifies an expired session is evicted from the pool.
///
/// **WHY THIS MATTERS**: The engine has already dropped the session; sending it a release
/// or reusing the ID would fail.
///
/// **BUG THIS CATCHES**: Would catch expired sessions staying Active.
#[tokio::test]
async fn given_expired_reply_when_invoking_then_session_is_evicted() {
    // GIVEN: An active session whose next call reports expiry
    let channel = ScriptedChannel::new();
    channel
        .reply_ok(b"4")
        .reply_error("DesktopSessionExpired", "session expired");
    let backend = native_backend(&channel);
    let cancel = CancellationToken::new();
    backend.init_client(b"{}".to_vec(), &cancel).await.expect("init");

    // WHEN: Invoking on it
    let result = backend.invoke(Some(4), invoke_request(4), &cancel).await;

    // THEN: The expiry is surfaced and the session is released locally
    assert!(result.expect_err("expiry is an error").is_session_expired());
    assert_eq!(backend.session_state(4), None);
    assert!(matches!(
        backend.invoke(Some(4), invoke_request(4), &cancel).await,
        Err(EngineError::InvalidSession { .. })
    ));
}

/// **VALUE**: Verifies a library status error reaches the caller with its message.
///
/// **WHY THIS MATTERS**: "Integrate with other apps" being off is the most common setup
/// mistake; the message tells the user how to fix it.
///
/// **BUG THIS CATCHES**: Would catch status errors being re-wrapped as serialization errors.
#[tokio::test]
async fn given_channel_closed_status_when_initializing_then_returns_unavailable() {
    // GIVEN: The library reports a closed channel
    let channel = ScriptedChannel::new();
    channel.reply_status(DEFAULT_STATUS_TABLE.to_error(-2).expect("-2 is an error"));
    let backend = native_backend(&channel);

    // WHEN: Initializing
    let result = backend.init_client(b"{}".to_vec(), &CancellationToken::new()).await;

    // THEN: The caller sees Unavailable with guidance
    match result {
        Err(EngineError::Unavailable { message, .. }) => assert_eq!(message, CHANNEL_CLOSED_MESSAGE),
        other => panic!("expected Unavailable, got {other:?}"),
    }
    assert_eq!(backend.transport_calls(), 1);
}

// ============================================================================
// Status tables
// ============================================================================

/// **VALUE**: Verifies both per-OS status tables classify their own codes.
///
/// **WHY THIS MATTERS**: The companion library uses different negative codes on macOS and
/// elsewhere. Using the wrong table reports a closed channel as an internal error.
///
/// **BUG THIS CATCHES**: Would catch the tables being swapped or sharing codes.
#[test]
fn given_status_tables_when_classifying_then_codes_map_per_platform() {
    // GIVEN / WHEN / THEN: macOS codes
    assert_eq!(MACOS_STATUS_TABLE.classify(0), StatusCondition::Ok);
    assert_eq!(MACOS_STATUS_TABLE.classify(-3), StatusCondition::ChannelClosed);
    assert_eq!(MACOS_STATUS_TABLE.classify(-7), StatusCondition::ConnectionDropped);
    assert_eq!(MACOS_STATUS_TABLE.classify(-2), StatusCondition::Internal(-2));

    // GIVEN / WHEN / THEN: Linux and Windows codes
    assert_eq!(DEFAULT_STATUS_TABLE.classify(-2), StatusCondition::ChannelClosed);
    assert_eq!(DEFAULT_STATUS_TABLE.classify(-5), StatusCondition::ConnectionDropped);
    assert_eq!(DEFAULT_STATUS_TABLE.classify(-3), StatusCondition::Internal(-3));
}

/// **VALUE**: Verifies the error produced for each status condition.
///
/// **WHY THIS MATTERS**: Unknown codes must carry the raw code so support can diagnose them.
///
/// **BUG THIS CATCHES**: Would catch the code being dropped from internal errors.
#[test]
fn given_status_codes_when_converted_then_errors_carry_guidance_or_code() {
    // GIVEN: The non-macOS table
    let table = DEFAULT_STATUS_TABLE;

    // WHEN: Converting each kind of status
    let ok = table.to_error(0);
    let dropped = table.to_error(-5);
    let internal = table.to_error(-42);

    // THEN: Success yields nothing, the others carry their text
    assert!(ok.is_none());
    match dropped {
        Some(EngineError::Transport { message, .. }) => assert_eq!(message, CONNECTION_DROPPED_MESSAGE),
        other => panic!("expected a transport error, got {other:?}"),
    }
    match internal {
        Some(EngineError::Transport { message, .. }) => {
            assert_eq!(message, format!("{INTERNAL_ERROR_PREFIX}-42"));
        }
        other => panic!("expected a transport error, got {other:?}"),
    }
}

/// **VALUE**: Verifies library discovery reports a missing desktop app clearly.
///
/// **WHY THIS MATTERS**: Users without the desktop app installed need a recognisable error,
/// not a dlopen failure.
///
/// **BUG THIS CATCHES**: Would catch a missing explicit path being treated as found.
#[test]
fn given_missing_explicit_library_when_searching_then_falls_through_to_defaults() {
    // GIVEN: An explicit path that does not exist
    let explicit = Path::new("/nonexistent/op_sdk_ipc_client.so");

    // WHEN: Searching
    let result = find_library(Some(explicit));

    // THEN: The explicit path is never returned
    match result {
        Ok(found) => assert_ne!(found, explicit),
        Err(EngineError::Unavailable { message, .. }) => assert_eq!(message, DESKTOP_APP_NOT_FOUND),
        Err(other) => panic!("expected Unavailable, got {other:?}"),
    }
}

// ============================================================================
// Response buffer ownership
// ============================================================================

static REPLY: [u8; 5] = *b"reply";
const REPLY_CAPACITY: usize = 8;

/// Fill the out-parameters the way the companion library does.
///
/// # Safety
///
/// All three pointers must be valid for writes.
unsafe fn hand_out_reply(out_ptr: *mut *mut u8, out_len: *mut usize, out_cap: *mut usize) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        *out_ptr = REPLY.as_ptr().cast_mut();
        *out_len = REPLY.len();
        *out_cap = REPLY_CAPACITY;
    }
}

static SUCCESS_FREES: Mutex<Vec<(usize, usize, usize)>> = Mutex::new(Vec::new());

unsafe extern "C" fn reply_ok(
    _msg_ptr: *const u8,
    _msg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
    out_cap: *mut usize,
) -> i32 {
    // SAFETY: NativeLibrary passes pointers to live locals.
    unsafe { hand_out_reply(out_ptr, out_len, out_cap) };
    0
}

unsafe extern "C" fn record_success_free(ptr: *mut u8, len: usize, cap: usize) {
    if let Ok(mut frees) = SUCCESS_FREES.lock() {
        frees.push((ptr as usize, len, cap));
    }
}

/// **VALUE**: Verifies a successful reply is copied out and handed back to the library once.
///
/// **WHY THIS MATTERS**: The buffer belongs to the library's allocator. Never freeing it
/// leaks on every call; freeing it twice corrupts the desktop app's heap.
///
/// **BUG THIS CATCHES**: Would catch the buffer being freed before the copy, with the
/// wrong length or capacity, or not at all.
#[test]
fn given_successful_reply_when_sending_then_copies_bytes_and_frees_once() {
    // GIVEN: A library whose send_message hands out a 5-byte reply
    let library = NativeLibrary::from_symbols(reply_ok, record_success_free, DEFAULT_STATUS_TABLE);

    // WHEN: Sending a message
    let reply = library.send_message(b"request").expect("status 0 succeeds");

    // THEN: The bytes are copied and the exact buffer is freed once
    assert_eq!(reply, b"reply");
    let frees = SUCCESS_FREES.lock().expect("frees lock").clone();
    assert_eq!(frees, vec![(REPLY.as_ptr() as usize, REPLY.len(), REPLY_CAPACITY)]);
}

static FAILURE_FREES: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn reply_then_drop_connection(
    _msg_ptr: *const u8,
    _msg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
    out_cap: *mut usize,
) -> i32 {
    // SAFETY: NativeLibrary passes pointers to live locals.
    unsafe { hand_out_reply(out_ptr, out_len, out_cap) };
    DEFAULT_STATUS_TABLE.connection_dropped
}

unsafe extern "C" fn count_failure_free(_ptr: *mut u8, _len: usize, _cap: usize) {
    FAILURE_FREES.fetch_add(1, Ordering::SeqCst);
}

/// **VALUE**: Verifies a buffer handed out alongside an error status is still freed.
///
/// **WHY THIS MATTERS**: The library may fill the out-parameters before reporting failure.
/// Dropping them on the error path leaks a buffer per failed call.
///
/// **BUG THIS CATCHES**: Would catch an early return on non-zero status that skips the free.
#[test]
fn given_error_status_with_buffer_when_sending_then_returns_error_and_frees_once() {
    // GIVEN: A library that hands out a buffer and then reports a dropped connection
    let library = NativeLibrary::from_symbols(
        reply_then_drop_connection,
        count_failure_free,
        DEFAULT_STATUS_TABLE,
    );

    // WHEN: Sending a message
    let result = library.send_message(b"request");

    // THEN: The status error is returned and the buffer was freed exactly once
    match result {
        Err(EngineError::Transport { message, .. }) => assert_eq!(message, CONNECTION_DROPPED_MESSAGE),
        other => panic!("expected a transport error, got {other:?}"),
    }
    assert_eq!(FAILURE_FREES.load(Ordering::SeqCst), 1);
}

static NULL_FREES: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn reply_nothing(
    _msg_ptr: *const u8,
    _msg_len: usize,
    _out_ptr: *mut *mut u8,
    _out_len: *mut usize,
    _out_cap: *mut usize,
) -> i32 {
    0
}

unsafe extern "C" fn count_null_free(_ptr: *mut u8, _len: usize, _cap: usize) {
    NULL_FREES.fetch_add(1, Ordering::SeqCst);
}

/// **VALUE**: Verifies a null reply pointer is never passed to `free_response`.
///
/// **WHY THIS MATTERS**: The library does not promise to accept null; freeing nothing can
/// crash the host process.
///
/// **BUG THIS CATCHES**: Would catch the null check in the drop path being removed.
#[test]
fn given_null_reply_when_sending_then_returns_empty_and_never_frees() {
    // GIVEN: A library that succeeds without handing out a buffer
    let library = NativeLibrary::from_symbols(reply_nothing, count_null_free, DEFAULT_STATUS_TABLE);

    // WHEN: Sending a message
    let reply = library.send_message(b"request").expect("status 0 succeeds");

    // THEN: The reply is empty and free_response was not called
    assert!(reply.is_empty());
    assert_eq!(NULL_FREES.load(Ordering::SeqCst), 0);
}
