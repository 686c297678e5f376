use crate::engine_tests::helpers::{
    echo_engine, load_engine, service_account_config, spinning_engine,
};

use engine_client::{CancellationToken, EngineError, Invocation, Isolation, SessionState};

use std::time::Duration;

use serde_json::json;

const CANCEL_AFTER: Duration = Duration::from_millis(100);
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn cancel_later(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(CANCEL_AFTER).await;
        token.cancel();
    });
}

/// **VALUE**: Verifies a runaway engine call can be cancelled.
///
/// **WHY THIS MATTERS**: Engine calls can block on slow networks or bugs. Without
/// interruption the caller's task and a blocking-pool thread are stuck forever.
///
/// **BUG THIS CATCHES**: Would catch the interrupt flag never reaching the guest, which
/// makes this test hit its timeout.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_spinning_engine_when_cancelled_then_returns_cancelled_and_tears_down_session() {
    // GIVEN: A session on an engine that never returns from invoke
    let engine = load_engine(&spinning_engine(), Isolation::Spawned);
    let id = engine
        .init_client(&service_account_config(), &CancellationToken::new())
        .await
        .expect("init");
    let cancel = CancellationToken::new();
    cancel_later(&cancel);

    // WHEN: Invoking, with cancellation shortly after
    let result = tokio::time::timeout(
        TEST_TIMEOUT,
        engine.invoke(Some(id), &Invocation::new("Spin", json!({})), &cancel),
    )
    .await
    .expect("cancellation did not interrupt the engine");

    // THEN: The call is cancelled and the instance is gone
    assert!(result.expect_err("call was cancelled").is_cancelled());
    assert_eq!(engine.session_state(id), None);

    let retry = engine
        .invoke(Some(id), &Invocation::new("Spin", json!({})), &CancellationToken::new())
        .await;
    assert!(matches!(retry, Err(EngineError::InvalidSession { .. })));
}

/// **VALUE**: Verifies cancelling on a shared instance invalidates every session on it.
///
/// **WHY THIS MATTERS**: An interrupted instance may hold half-updated state for all of
/// its clients. Reusing them silently could return another client's data.
///
/// **BUG THIS CATCHES**: Would catch the shared instance being reused after a trap.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_shared_instance_when_call_is_cancelled_then_other_sessions_become_invalid() {
    // GIVEN: Two sessions on one shared spinning instance
    let engine = load_engine(&spinning_engine(), Isolation::Shared);
    let setup = CancellationToken::new();
    let first = engine.init_client(&service_account_config(), &setup).await.expect("init");
    let second = engine.init_client(&service_account_config(), &setup).await.expect("init");
    let cancel = CancellationToken::new();
    cancel_later(&cancel);

    // WHEN: The first session's call is cancelled
    let result = tokio::time::timeout(
        TEST_TIMEOUT,
        engine.invoke(Some(first), &Invocation::new("Spin", json!({})), &cancel),
    )
    .await
    .expect("cancellation did not interrupt the engine");
    assert!(result.expect_err("call was cancelled").is_cancelled());

    // THEN: The second session no longer resolves to the torn-down instance
    let retry = tokio::time::timeout(
        TEST_TIMEOUT,
        engine.invoke(Some(second), &Invocation::new("Spin", json!({})), &CancellationToken::new()),
    )
    .await
    .expect("invalid session check blocked");
    assert!(matches!(retry, Err(EngineError::InvalidSession { .. })));

    // AND: New sessions start on a fresh instance
    let fresh = engine.init_client(&service_account_config(), &setup).await.expect("init");
    assert_eq!(engine.session_state(fresh), Some(SessionState::Active));
}

/// **VALUE**: Verifies a token cancelled after its call returned leaves the shared
/// instance alone.
///
/// **WHY THIS MATTERS**: Callers often cancel a scope right after their last call. That
/// must not interrupt the next caller's call on the same instance.
///
/// **BUG THIS CATCHES**: Would catch an interrupt flag shared by the instance staying set
/// and trapping whichever call runs next.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_shared_instance_when_token_cancelled_after_call_then_other_session_still_works() {
    // GIVEN: Two sessions on one shared instance, and a call on the first that completed
    let engine = load_engine(&echo_engine(), Isolation::Shared);
    let setup = CancellationToken::new();
    let first = engine.init_client(&service_account_config(), &setup).await.expect("init");
    let second = engine.init_client(&service_account_config(), &setup).await.expect("init");
    let cancel = CancellationToken::new();
    engine
        .invoke(Some(first), &Invocation::new("Echo", json!({})), &cancel)
        .await
        .expect("first call completes");

    // WHEN: The first caller's token fires afterwards and the second session invokes
    cancel.cancel();
    let result = tokio::time::timeout(
        TEST_TIMEOUT,
        engine.invoke(Some(second), &Invocation::new("Echo", json!({})), &CancellationToken::new()),
    )
    .await
    .expect("second call blocked");

    // THEN: The second call succeeds and both sessions stay active
    result.expect("bystander call is not interrupted");
    assert_eq!(engine.session_state(first), Some(SessionState::Active));
    assert_eq!(engine.session_state(second), Some(SessionState::Active));
}

/// **VALUE**: Verifies an already-cancelled token never starts the call.
///
/// **WHY THIS MATTERS**: Callers that gave up should not cost an engine call.
///
/// **BUG THIS CATCHES**: Would catch cancellation only being observed mid-flight.
#[tokio::test]
async fn given_cancelled_token_when_initializing_then_no_session_is_created() {
    // GIVEN: A cancelled token
    let engine = load_engine(&spinning_engine(), Isolation::Spawned);
    let cancel = CancellationToken::new();
    cancel.cancel();

    // WHEN: Initializing
    let result = engine.init_client(&service_account_config(), &cancel).await;

    // THEN: It is cancelled and the reservation is dropped
    assert!(result.expect_err("init was cancelled").is_cancelled());
    assert_eq!(engine.session_state(0), None);
}
