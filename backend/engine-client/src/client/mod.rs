//! Application-facing client.
//!
//! A [`Client`] owns one engine session. Release is deterministic: call
//! [`Client::close`], or drop the client inside a tokio runtime and the release is
//! scheduled on it.

pub mod builder;
pub mod secrets;

pub use builder::ClientBuilder;
pub use secrets::Secrets;

use crate::SessionId;
use crate::engine::Engine;
use crate::engine::router::InvocationRouter;
use crate::error::ClientError;
use crate::wire::Invocation;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub struct Client {
    router: Arc<InvocationRouter>,
    released: AtomicBool,
}

impl Client {
    pub(crate) fn from_router(router: InvocationRouter) -> Self {
        Self {
            router: Arc::new(router),
            released: AtomicBool::new(false),
        }
    }

    pub async fn session_id(&self) -> SessionId {
        self.router.session_id().await
    }

    pub fn engine(&self) -> &Arc<Engine> {
        self.router.engine()
    }

    /// Run an engine method by name. Parameters and response are opaque to the client.
    pub async fn invoke(
        &self,
        method: &str,
        parameters: serde_json::Value,
    ) -> Result<String, ClientError> {
        self.invoke_with_cancel(method, parameters, &CancellationToken::new())
            .await
    }

    pub async fn invoke_with_cancel(
        &self,
        method: &str,
        parameters: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<String, ClientError> {
        let invocation = Invocation::new(method, parameters);
        Ok(self.router.invoke(&invocation, cancel).await?)
    }

    pub fn secrets(&self) -> Secrets<'_> {
        Secrets::new(self)
    }

    /// Release the session now and wait for it.
    pub async fn close(self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.router.release().await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        match Handle::try_current() {
            Ok(runtime) => {
                let router = Arc::clone(&self.router);
                runtime.spawn(async move { router.release().await });
            }
            Err(_) => warn!(
                "Client for session {:?} dropped outside a tokio runtime, session not released",
                self.router.try_session_id()
            ),
        }
    }
}
