use crate::backend::run_blocking;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

const SETTLE: Duration = Duration::from_millis(100);

/// **VALUE**: Verifies a result that is already in hand beats a late cancellation.
///
/// **WHY THIS MATTERS**: On a shared instance `on_cancel` interrupts every session on it.
/// Firing it after the engine already returned would tear down bystanders for nothing and
/// throw away a good result.
///
/// **BUG THIS CATCHES**: Would catch an unbiased race between the worker and the token,
/// which picks the cancel branch about half the time.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_finished_work_when_cancelled_before_polled_then_keeps_result() {
    // GIVEN: Work parked on a channel, already spawned on the blocking pool
    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    let (release, gate) = mpsc::channel::<()>();
    let flag = Arc::clone(&interrupted);
    let call = run_blocking(
        &cancel,
        "invoke",
        move || {
            gate.recv().ok();
            Ok(7)
        },
        move || flag.store(true, Ordering::SeqCst),
    );
    tokio::pin!(call);
    assert!(tokio::time::timeout(SETTLE, &mut call).await.is_err(), "work should still be parked");

    // WHEN: The work finishes and only then the token fires
    release.send(()).expect("worker is waiting");
    tokio::time::sleep(SETTLE).await;
    cancel.cancel();

    // THEN: The finished result is returned and nothing is interrupted
    assert_eq!(call.await.expect("finished work wins"), 7);
    assert!(!interrupted.load(Ordering::SeqCst));
}

/// **VALUE**: Verifies cancelling in-flight work returns at once and interrupts it.
///
/// **WHY THIS MATTERS**: The caller must not wait on a call that may never return.
///
/// **BUG THIS CATCHES**: Would catch `on_cancel` being skipped when the work is still running.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_running_work_when_cancelled_then_returns_cancelled_and_interrupts() {
    // GIVEN: Work that runs until it is interrupted
    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&interrupted);
    let flag = Arc::clone(&interrupted);
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SETTLE).await;
        trigger.cancel();
    });

    // WHEN: Running it
    let result = run_blocking(
        &cancel,
        "invoke",
        move || {
            while !seen.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        },
        move || flag.store(true, Ordering::SeqCst),
    )
    .await;

    // THEN: It is cancelled and the interrupt was raised
    assert!(result.expect_err("call was cancelled").is_cancelled());
    assert!(interrupted.load(Ordering::SeqCst));
}
