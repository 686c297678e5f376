use super::Client;
use crate::error::{ClientError, EngineError};

use serde_json::json;
use tokio_util::sync::CancellationToken;

const RESOLVE_METHOD: &str = "SecretsResolve";

/// Secret lookups by reference (`op://vault/item/field`).
pub struct Secrets<'a> {
    client: &'a Client,
}

impl<'a> Secrets<'a> {
    pub(super) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn resolve(&self, secret_reference: &str) -> Result<String, ClientError> {
        self.resolve_with_cancel(secret_reference, &CancellationToken::new())
            .await
    }

    pub async fn resolve_with_cancel(
        &self,
        secret_reference: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ClientError> {
        let response = self
            .client
            .invoke_with_cancel(
                RESOLVE_METHOD,
                json!({ "secret_reference": secret_reference }),
                cancel,
            )
            .await?;

        serde_json::from_str::<String>(&response)
            .map_err(|e| ClientError::from(EngineError::from(e)))
    }
}
