//! Transport backends.
//!
//! Each backend offers the same three operations (`init_client`, `invoke`,
//! `release_client`) and translates its native failures into [`EngineError`].

pub mod bytecode;
pub mod delegated;
pub mod native;

pub use bytecode::BytecodeBackend;
pub use delegated::DelegatedBackend;
pub use native::NativeBackend;

use crate::error::engine::EngineError;

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Counts calls that actually crossed the transport boundary.
#[derive(Debug, Default)]
pub(crate) struct TransportCounter(AtomicU64);

impl TransportCounter {
    pub(crate) fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Run blocking transport work on the blocking pool, racing it against `cancel`.
///
/// Work that has already finished wins over a cancellation that fires at the same time.
/// Otherwise the call returns [`EngineError::Cancelled`] right away and the work keeps
/// running; callers that can interrupt it pass `on_cancel`.
pub(crate) async fn run_blocking<T, F, C>(
    cancel: &CancellationToken,
    operation: &'static str,
    work: F,
    on_cancel: C,
) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    C: FnOnce(),
{
    if cancel.is_cancelled() {
        return Err(EngineError::cancelled(operation));
    }

    let mut handle = tokio::task::spawn_blocking(work);

    tokio::select! {
        biased;
        joined = &mut handle => joined_result(joined, operation),
        _ = cancel.cancelled() => {
            if handle.is_finished() {
                debug!("{operation} finished as it was cancelled, keeping its result");
                return joined_result(handle.await, operation);
            }
            debug!("{operation} cancelled while the transport call was in flight");
            on_cancel();
            Err(EngineError::cancelled(operation))
        }
    }
}

fn joined_result<T>(
    joined: Result<Result<T, EngineError>, JoinError>,
    operation: &'static str,
) -> Result<T, EngineError> {
    joined.map_err(|e| EngineError::transport(format!("{operation} worker failed: {e}")))?
}
