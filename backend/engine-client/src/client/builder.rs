use super::Client;
use crate::config::{ClientConfig, Credential, EngineSettings};
use crate::engine::router::InvocationRouter;
use crate::engine::{self, Engine};
use crate::error::{ClientError, ConfigError};

use common::RedactedToken;

use std::sync::Arc;

use log::debug;
use tokio_util::sync::CancellationToken;

/// Builder for [`Client`].
///
/// Engine selection, first match wins: an engine passed to [`ClientBuilder::with_engine`],
/// the companion desktop app when a desktop account is set, otherwise the process-wide
/// engine described by the settings (delegated socket, then bytecode module).
#[derive(Default)]
pub struct ClientBuilder {
    token: Option<RedactedToken>,
    desktop_account: Option<String>,
    integration_name: Option<String>,
    integration_version: Option<String>,
    engine: Option<Arc<Engine>>,
    settings: Option<EngineSettings>,
}

impl ClientBuilder {
    pub fn with_service_account_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(RedactedToken::new(token));
        self
    }

    /// Name and version of the integration using the client. Use
    /// [`crate::DEFAULT_INTEGRATION_NAME`] and [`crate::DEFAULT_INTEGRATION_VERSION`] if
    /// there is nothing better.
    pub fn with_integration_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.integration_name = Some(name.into());
        self.integration_version = Some(version.into());
        self
    }

    /// Authenticate through the desktop app signed in to `account` (name or ID).
    pub fn with_desktop_app_integration(mut self, account: impl Into<String>) -> Self {
        self.desktop_account = Some(account.into());
        self
    }

    pub fn with_engine(mut self, engine: Arc<Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Validate and produce the session config without touching any engine.
    #[track_caller]
    pub fn build_config(&self) -> Result<ClientConfig, ConfigError> {
        let credential = match (&self.token, &self.desktop_account) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::validation(
                    "cannot create a client with both a Service Account Token and a desktop app integration",
                ));
            }
            (Some(token), None) => Credential::ServiceAccount(token.clone()),
            (None, Some(account)) => Credential::DesktopApp {
                account: account.clone(),
            },
            (None, None) => {
                return Err(ConfigError::validation(
                    "cannot create a client without specifying a Service Account Token",
                ));
            }
        };

        ClientConfig::new(
            credential,
            self.integration_name.clone().unwrap_or_default(),
            self.integration_version.clone().unwrap_or_default(),
        )
    }

    pub async fn build(self) -> Result<Client, ClientError> {
        self.build_with_cancel(&CancellationToken::new()).await
    }

    /// # Errors
    ///
    /// [`ClientError::Config`] for local validation failures; [`ClientError::Engine`] when
    /// the engine is unreachable or rejects the session.
    pub async fn build_with_cancel(self, cancel: &CancellationToken) -> Result<Client, ClientError> {
        let config = self.build_config()?;
        let engine = self.select_engine(&config)?;
        debug!("Building client on {} engine", engine.kind());

        let router = InvocationRouter::open(engine, config, cancel).await?;
        Ok(Client::from_router(router))
    }

    fn select_engine(&self, config: &ClientConfig) -> Result<Arc<Engine>, ClientError> {
        if let Some(engine) = &self.engine {
            return Ok(Arc::clone(engine));
        }

        let settings = match &self.settings {
            Some(settings) => settings.clone(),
            None => EngineSettings::from_env()?,
        };

        let engine = match config.account_id() {
            Some(account) => Arc::new(Engine::desktop(account, &settings)?),
            None => engine::shared_engine(&settings)?,
        };
        Ok(engine)
    }
}
