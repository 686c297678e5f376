use crate::EngineError;
use crate::engine::pool::{InstancePool, SessionState};

/// **VALUE**: Verifies pool-assigned IDs count up from zero.
///
/// **WHY THIS MATTERS**: Engines and callers rely on the first N sessions being 0..N-1.
///
/// **BUG THIS CATCHES**: Would catch IDs starting at 1 or being reused.
#[test]
fn given_empty_pool_when_reserving_then_ids_are_sequential_from_zero() {
    // GIVEN: A fresh pool
    let pool: InstancePool<()> = InstancePool::new();

    // WHEN: Reserving three IDs
    let ids: Vec<_> = (0..3).map(|_| pool.reserve_next().expect("reserve")).collect();

    // THEN: They are 0, 1, 2 and still Created
    assert_eq!(ids, vec![0, 1, 2]);
    assert!(ids.iter().all(|id| pool.state(*id) == Some(SessionState::Created)));
    assert_eq!(pool.active_count(), 0);
}

/// **VALUE**: Verifies a session is only usable between activation and release.
///
/// **WHY THIS MATTERS**: Invoking a half-initialised or released session must fail locally
/// with a clear error rather than reaching the engine.
///
/// **BUG THIS CATCHES**: Would catch checkout succeeding in the Created or Released state.
#[test]
fn given_session_lifecycle_when_checking_out_then_only_active_succeeds() {
    // GIVEN: A reserved session
    let pool = InstancePool::new();
    let id = pool.reserve_next().expect("reserve");

    // WHEN / THEN: Checkout fails before activation
    assert!(matches!(pool.checkout(id), Err(EngineError::InvalidSession { .. })));

    // WHEN / THEN: Checkout returns the resource once active
    pool.activate(id, "instance").expect("activate");
    assert_eq!(pool.checkout(id).expect("checkout"), "instance");
    assert_eq!(pool.active_count(), 1);

    // WHEN / THEN: Checkout fails again after release
    assert_eq!(pool.release(id).expect("release"), Some("instance"));
    match pool.checkout(id) {
        Err(EngineError::InvalidSession { session_id, .. }) => assert_eq!(session_id, id),
        other => panic!("expected InvalidSession, got {other:?}"),
    }
}

/// **VALUE**: Verifies release is idempotent.
///
/// **WHY THIS MATTERS**: Explicit close and drop-time cleanup can both release the same
/// session; the backend resource must be torn down exactly once.
///
/// **BUG THIS CATCHES**: Would catch the resource being handed out twice.
#[test]
fn given_released_session_when_released_again_then_returns_nothing() {
    // GIVEN: An active, then released, session
    let pool = InstancePool::new();
    let id = pool.reserve_next().expect("reserve");
    pool.activate(id, 42u32).expect("activate");
    let first = pool.release(id).expect("release");

    // WHEN: Releasing again, and releasing an unknown ID
    let second = pool.release(id).expect("release again");
    let unknown = pool.release(999).expect("release unknown");

    // THEN: Only the first release yields the resource
    assert_eq!(first, Some(42));
    assert_eq!(second, None);
    assert_eq!(unknown, None);
    assert_eq!(pool.state(id), None);
}

/// **VALUE**: Verifies engine-assigned IDs may be reused after release but never while live.
///
/// **WHY THIS MATTERS**: Engines may recycle numbers after release. Reissuing a live ID
/// would let two clients share one engine session.
///
/// **BUG THIS CATCHES**: Would catch silent overwrites of a live entry.
#[test]
fn given_engine_assigned_ids_when_reserving_then_only_released_ids_are_reused() {
    // GIVEN: A live session 7
    let pool = InstancePool::new();
    pool.reserve(7).expect("reserve");
    pool.activate(7, ()).expect("activate");

    // WHEN: The engine reissues 7 while it is live
    let reissued = pool.reserve(7);

    // THEN: It is an invariant violation
    assert!(matches!(reissued, Err(EngineError::InvariantViolation { .. })));

    // WHEN: 7 is released and then reissued
    pool.release(7).expect("release");
    pool.reserve(7).expect("released ID is reusable");

    // THEN: It starts over in Created
    assert_eq!(pool.state(7), Some(SessionState::Created));
}

/// **VALUE**: Verifies released sessions leave nothing behind in the pool.
///
/// **WHY THIS MATTERS**: A long-running process opens and closes clients for its whole
/// lifetime; the pool must stay bounded by the number of live sessions.
///
/// **BUG THIS CATCHES**: Would catch released entries being kept as tombstones.
#[test]
fn given_many_init_release_cycles_when_done_then_pool_is_empty() {
    // GIVEN: A pool
    let pool = InstancePool::new();

    // WHEN: Cycling through many sessions
    let mut last = 0;
    for _ in 0..10_000 {
        last = pool.reserve_next().expect("reserve");
        pool.activate(last, ()).expect("activate");
        pool.release(last).expect("release");
    }

    // THEN: Nothing is retained and IDs kept counting up
    assert!(pool.is_empty());
    assert_eq!(pool.active_count(), 0);
    assert_eq!(last, 9_999);
    assert!(matches!(pool.checkout(last), Err(EngineError::InvalidSession { .. })));
}
