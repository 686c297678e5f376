use crate::engine_tests::helpers::{
    echo_engine, failing_engine, fixed_response_engine, incomplete_engine, load_engine,
    oversized_output_engine, rejected_config, selective_init_engine, service_account_config,
};

use engine_client::backend::BytecodeBackend;
use engine_client::engine::router::InvocationRouter;
use engine_client::{
    CancellationToken, EngineError, Invocation, Isolation, MESSAGE_LIMIT, SessionState,
};

use serde_json::json;

fn parse(response: &str) -> serde_json::Value {
    serde_json::from_str(response).expect("engine response is JSON")
}

// ============================================================================
// Session IDs
// ============================================================================

/// **VALUE**: Verifies the first N sessions get IDs 0..N-1 in both isolation modes.
///
/// **WHY THIS MATTERS**: Session IDs are part of the public contract; callers and logs
/// rely on them being small, dense and predictable.
///
/// **BUG THIS CATCHES**: Would catch spawned mode leaking each instance's local ID (always
/// 0) as the public ID.
#[tokio::test]
async fn given_fresh_engine_when_opening_sessions_then_ids_count_from_zero() {
    for isolation in [Isolation::Spawned, Isolation::Shared] {
        // GIVEN: A freshly loaded engine
        let engine = load_engine(&echo_engine(), isolation);
        let cancel = CancellationToken::new();

        // WHEN: Opening five sessions
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                engine
                    .init_client(&service_account_config(), &cancel)
                    .await
                    .expect("Failed to open session"),
            );
        }

        // THEN: IDs are 0..4 and all active
        assert_eq!(ids, vec![0, 1, 2, 3, 4], "isolation {isolation:?}");
        assert!(ids.iter().all(|id| engine.session_state(*id) == Some(SessionState::Active)));
    }
}

/// **VALUE**: Verifies a failed spawned-mode init does not use up a session ID.
///
/// **WHY THIS MATTERS**: IDs are promised to count up without gaps. A rejected config is an
/// ordinary user error and must not shift every later ID.
///
/// **BUG THIS CATCHES**: Would catch the ID being reserved before the instance is spawned
/// and initialized, then dropped on failure.
#[tokio::test]
async fn given_rejected_init_in_spawned_mode_when_opening_next_session_then_ids_stay_dense() {
    // GIVEN: A spawned-mode engine with one open session
    let engine = load_engine(&selective_init_engine(), Isolation::Spawned);
    let cancel = CancellationToken::new();
    let first = engine.init_client(&service_account_config(), &cancel).await.expect("init");

    // WHEN: One init is rejected by the engine and the next succeeds
    let rejected = engine.init_client(&rejected_config(), &cancel).await;
    let second = engine.init_client(&service_account_config(), &cancel).await.expect("init");

    // THEN: The rejection is reported and the IDs are 0 then 1
    match rejected {
        Err(EngineError::Engine { name, message, .. }) => {
            assert_eq!(name, None);
            assert_eq!(message, "config rejected");
        }
        other => panic!("expected an engine error, got {other:?}"),
    }
    assert_eq!((first, second), (0, 1));
    assert_eq!(engine.session_state(second), Some(SessionState::Active));
}

/// **VALUE**: Verifies public IDs are mapped onto each instance's own client ID.
///
/// **WHY THIS MATTERS**: In spawned mode every instance numbers its clients from 0. The
/// engine must receive its own ID, not the public one, or it rejects the call.
///
/// **BUG THIS CATCHES**: Would catch `clientId` being forwarded without rewriting.
#[tokio::test]
async fn given_spawned_sessions_when_invoking_then_engine_sees_its_local_client_id() {
    // GIVEN: Three spawned sessions on an echo engine
    let engine = load_engine(&echo_engine(), Isolation::Spawned);
    let cancel = CancellationToken::new();
    for _ in 0..3 {
        engine.init_client(&service_account_config(), &cancel).await.expect("init");
    }

    // WHEN: Invoking on public session 2
    let response = engine
        .invoke(Some(2), &Invocation::new("Echo", json!({"marker": "two"})), &cancel)
        .await
        .expect("invoke");

    // THEN: The instance saw client 0 and the unchanged invocation
    let echoed = parse(&response);
    assert_eq!(echoed["clientId"], 0);
    assert_eq!(echoed["invocation"]["name"], "Echo");
    assert_eq!(echoed["invocation"]["parameters"]["marker"], "two");
}

/// **VALUE**: Verifies session-less invocations reach the engine without a client ID.
///
/// **WHY THIS MATTERS**: Some engine operations (e.g. reference validation) need no session.
///
/// **BUG THIS CATCHES**: Would catch a session being required for every call.
#[tokio::test]
async fn given_no_session_when_invoking_then_request_has_no_client_id() {
    for isolation in [Isolation::Spawned, Isolation::Shared] {
        // GIVEN: An engine with no sessions
        let engine = load_engine(&echo_engine(), isolation);

        // WHEN: Invoking without a session
        let response = engine
            .invoke(None, &Invocation::new("Ping", json!({})), &CancellationToken::new())
            .await
            .expect("invoke");

        // THEN: No clientId reached the engine
        assert!(parse(&response).get("clientId").is_none(), "isolation {isolation:?}");
    }
}

// ============================================================================
// Release
// ============================================================================

/// **VALUE**: Verifies a released session can no longer be invoked.
///
/// **WHY THIS MATTERS**: After release the instance is gone (spawned) or the engine has
/// forgotten the client (shared). Calls must fail locally and clearly.
///
/// **BUG THIS CATCHES**: Would catch released IDs still routing to an instance.
#[tokio::test]
async fn given_released_session_when_invoking_then_returns_invalid_session() {
    for isolation in [Isolation::Spawned, Isolation::Shared] {
        // GIVEN: An open, then released, session
        let engine = load_engine(&echo_engine(), isolation);
        let cancel = CancellationToken::new();
        let id = engine.init_client(&service_account_config(), &cancel).await.expect("init");
        engine.release_client(id).await;

        // WHEN: Invoking on it
        let result = engine
            .invoke(Some(id), &Invocation::new("Echo", json!({})), &cancel)
            .await;

        // THEN: It is reported invalid
        match result {
            Err(EngineError::InvalidSession { session_id, .. }) => assert_eq!(session_id, id),
            other => panic!("expected InvalidSession for {isolation:?}, got {other:?}"),
        }
        assert_eq!(engine.session_state(id), None);
    }
}

/// **VALUE**: Verifies releasing twice reaches the engine once.
///
/// **WHY THIS MATTERS**: Explicit close followed by drop-time cleanup is normal usage.
///
/// **BUG THIS CATCHES**: Would catch the second release calling into a dead instance.
#[tokio::test]
async fn given_session_when_released_twice_then_engine_sees_one_release() {
    // GIVEN: One open session
    let engine = load_engine(&echo_engine(), Isolation::Spawned);
    let id = engine
        .init_client(&service_account_config(), &CancellationToken::new())
        .await
        .expect("init");
    let after_init = engine.transport_calls();

    // WHEN: Releasing it twice
    engine.release_client(id).await;
    engine.release_client(id).await;

    // THEN: Exactly one release crossed the transport
    assert_eq!(engine.transport_calls(), after_init + 1);
}

/// **VALUE**: Verifies releasing one session leaves the others usable.
///
/// **WHY THIS MATTERS**: In shared mode all sessions live in one instance; releasing a
/// client must not tear that instance down.
///
/// **BUG THIS CATCHES**: Would catch release dropping the shared instance.
#[tokio::test]
async fn given_shared_sessions_when_one_is_released_then_others_still_work() {
    // GIVEN: Two shared sessions
    let engine = load_engine(&echo_engine(), Isolation::Shared);
    let cancel = CancellationToken::new();
    let first = engine.init_client(&service_account_config(), &cancel).await.expect("init");
    let second = engine.init_client(&service_account_config(), &cancel).await.expect("init");

    // WHEN: Releasing the first
    engine.release_client(first).await;

    // THEN: The second still reaches its own engine-side client
    let response = engine
        .invoke(Some(second), &Invocation::new("Echo", json!({})), &cancel)
        .await
        .expect("invoke");
    assert_eq!(parse(&response)["clientId"], 1);
}

// ============================================================================
// Concurrency
// ============================================================================

/// **VALUE**: Verifies concurrent sessions never see each other's requests.
///
/// **WHY THIS MATTERS**: A multi-tenant service holds many clients at once; a response
/// routed to the wrong session would leak secrets across tenants.
///
/// **BUG THIS CATCHES**: Would catch a shared output buffer or a pool lookup by position.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_concurrent_sessions_when_invoking_then_each_gets_its_own_response() {
    for isolation in [Isolation::Spawned, Isolation::Shared] {
        // GIVEN: Eight open sessions
        let engine = load_engine(&echo_engine(), isolation);
        let cancel = CancellationToken::new();
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(engine.init_client(&service_account_config(), &cancel).await.expect("init"));
        }

        // WHEN: Each session invokes repeatedly in parallel
        let mut tasks = Vec::new();
        for id in ids {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                for round in 0..5 {
                    let marker = format!("session-{id}-round-{round}");
                    let response = engine
                        .invoke(Some(id), &Invocation::new("Echo", json!({"marker": marker})), &cancel)
                        .await
                        .expect("invoke");
                    let echoed: serde_json::Value =
                        serde_json::from_str(&response).expect("response is JSON");

                    // THEN: Every response carries this session's marker
                    assert_eq!(echoed["invocation"]["parameters"]["marker"], marker.as_str());
                }
            }));
        }

        for task in tasks {
            task.await.expect("session task panicked");
        }
    }
}

// ============================================================================
// Limits and failures
// ============================================================================

/// **VALUE**: Verifies oversized requests are rejected before reaching the engine.
///
/// **WHY THIS MATTERS**: Guest memory is bounded; a 50 MiB request would exhaust it.
///
/// **BUG THIS CATCHES**: Would catch the check being skipped on the bytecode path.
#[tokio::test]
async fn given_oversized_request_when_invoking_then_rejected_without_transport_call() {
    // GIVEN: An open session
    let engine = load_engine(&echo_engine(), Isolation::Spawned);
    let cancel = CancellationToken::new();
    let id = engine.init_client(&service_account_config(), &cancel).await.expect("init");
    let before = engine.transport_calls();

    // WHEN: Invoking with parameters over the limit
    let invocation = Invocation::new("Big", json!("x".repeat(MESSAGE_LIMIT)));
    let result = engine.invoke(Some(id), &invocation, &cancel).await;

    // THEN: It is rejected and the counter did not move
    assert!(matches!(result, Err(EngineError::MessageTooLarge { .. })));
    assert_eq!(engine.transport_calls(), before);
    assert_eq!(engine.session_state(id), Some(SessionState::Active));
}

/// **VALUE**: Verifies an engine business error is surfaced and the session survives.
///
/// **WHY THIS MATTERS**: "Item not found" is an answer, not a failure of the instance.
/// Tearing the session down would force callers to reconnect after every bad reference.
///
/// **BUG THIS CATCHES**: Would catch business errors being treated as instance failures.
#[tokio::test]
async fn given_engine_error_when_invoking_then_error_is_returned_and_session_survives() {
    // GIVEN: An engine that rejects every invocation
    let payload = r#"{"name":"InvalidUserInput","message":"bad secret reference"}"#;
    let engine = load_engine(&failing_engine(payload), Isolation::Spawned);
    let cancel = CancellationToken::new();
    let id = engine.init_client(&service_account_config(), &cancel).await.expect("init");

    // WHEN: Invoking twice
    let first = engine.invoke(Some(id), &Invocation::new("Resolve", json!({})), &cancel).await;
    let second = engine.invoke(Some(id), &Invocation::new("Resolve", json!({})), &cancel).await;

    // THEN: Both return the engine's error
    for result in [first, second] {
        match result {
            Err(EngineError::Engine { name, message, .. }) => {
                assert_eq!(name.as_deref(), Some("InvalidUserInput"));
                assert_eq!(message, "bad secret reference");
            }
            other => panic!("expected the engine error, got {other:?}"),
        }
    }
    assert_eq!(engine.session_state(id), Some(SessionState::Active));
}

/// **VALUE**: Verifies an output length past the end of guest memory is rejected up front.
///
/// **WHY THIS MATTERS**: The length cell is written by the engine. Trusting it would size a
/// host buffer of up to 4 GiB before the read fails.
///
/// **BUG THIS CATCHES**: Would catch the output buffer being allocated before the bounds
/// check.
#[tokio::test]
async fn given_output_length_past_memory_when_invoking_then_returns_invariant_violation() {
    // GIVEN: An engine reporting almost 4 GiB of output from a small memory
    let engine = load_engine(&oversized_output_engine(), Isolation::Spawned);
    let cancel = CancellationToken::new();
    let id = engine.init_client(&service_account_config(), &cancel).await.expect("init");

    // WHEN: Invoking
    let result = engine.invoke(Some(id), &Invocation::new("Echo", json!({})), &cancel).await;

    // THEN: The guest is reported as breaking the buffer contract
    match result {
        Err(EngineError::InvariantViolation { message, .. }) => {
            assert!(message.contains("bytes of engine memory"), "{message}");
        }
        other => panic!("expected an invariant violation, got {other:?}"),
    }
}

/// **VALUE**: Verifies expiry is not retried on engines that cannot recover sessions.
///
/// **WHY THIS MATTERS**: Only the desktop app re-issues sessions; retrying elsewhere
/// doubles traffic for a guaranteed second failure.
///
/// **BUG THIS CATCHES**: Would catch the router retrying regardless of backend.
#[tokio::test]
async fn given_bytecode_engine_reporting_expiry_when_routing_then_no_retry() {
    // GIVEN: A router over an engine that reports expiry
    let payload = r#"{"name":"DesktopSessionExpired","message":"session expired"}"#;
    let engine = load_engine(&failing_engine(payload), Isolation::Spawned);
    let cancel = CancellationToken::new();
    let router = InvocationRouter::open(engine.clone(), service_account_config(), &cancel)
        .await
        .expect("router opens");
    let before = engine.transport_calls();

    // WHEN: Invoking
    let result = router.invoke(&Invocation::new("Resolve", json!({})), &cancel).await;

    // THEN: The expiry surfaces after a single call
    assert!(result.expect_err("expiry surfaces").is_session_expired());
    assert_eq!(engine.transport_calls(), before + 1);
    assert_eq!(router.session_id().await, 0);
}

/// **VALUE**: Verifies a fixed engine response is passed through verbatim.
///
/// **WHY THIS MATTERS**: Responses are opaque JSON documents; the transport must not
/// reshape them.
///
/// **BUG THIS CATCHES**: Would catch the response being re-serialized or trimmed.
#[tokio::test]
async fn given_engine_response_when_invoking_then_returned_verbatim() {
    // GIVEN: An engine that answers with a JSON string
    let engine = load_engine(&fixed_response_engine(r#""secret""#), Isolation::Shared);
    let cancel = CancellationToken::new();
    let id = engine.init_client(&service_account_config(), &cancel).await.expect("init");

    // WHEN: Invoking
    let response = engine
        .invoke(Some(id), &Invocation::new("SecretsResolve", json!({})), &cancel)
        .await
        .expect("invoke");

    // THEN: The exact bytes come back
    assert_eq!(response, r#""secret""#);
}

/// **VALUE**: Verifies a module lacking entry points is refused at load time.
///
/// **WHY THIS MATTERS**: Failing at load gives one clear error instead of a trap on the
/// first call in production.
///
/// **BUG THIS CATCHES**: Would catch export verification being skipped.
#[tokio::test]
async fn given_module_without_entry_points_when_loading_then_returns_unavailable() {
    // GIVEN: A module with memory and an allocator only
    let wat = incomplete_engine();

    // WHEN: Loading it
    let result = BytecodeBackend::load(wat.as_bytes(), Isolation::Spawned, &[]);

    // THEN: The missing export is named
    match result {
        Err(EngineError::Unavailable { message, .. }) => {
            assert_eq!(message, "engine module does not export function 'init_client'");
        }
        Err(other) => panic!("expected Unavailable, got {other:?}"),
        Ok(_) => panic!("expected the load to fail"),
    }
}

/// **VALUE**: Verifies garbage bytes are refused at load time.
///
/// **WHY THIS MATTERS**: A truncated download of the engine module must fail cleanly.
///
/// **BUG THIS CATCHES**: Would catch a panic inside compilation escaping.
#[tokio::test]
async fn given_invalid_module_bytes_when_loading_then_returns_unavailable() {
    // GIVEN: Bytes that are neither binary nor text format
    let bytes = b"\0asm-not-really";

    // WHEN: Loading them
    let result = BytecodeBackend::load(bytes, Isolation::Shared, &[]);

    // THEN: Loading fails as Unavailable
    assert!(matches!(result, Err(EngineError::Unavailable { .. })));
}
