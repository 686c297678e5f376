//! Command line and credential handling.

use engine_client::ClientBuilder;

use std::path::PathBuf;

use clap::Parser;

pub const ENV_SERVICE_ACCOUNT_TOKEN: &str = "OP_SERVICE_ACCOUNT_TOKEN";
pub const ENV_DESKTOP_ACCOUNT: &str = "OP_DESKTOP_ACCOUNT";

pub const INTEGRATION_NAME: &str = "op-sdk-resolve";
pub const INTEGRATION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Resolve 1Password secret references and print one value per line.
#[derive(Parser, Clone, PartialEq, Eq)]
#[command(name = "resolve", version, about)]
pub struct Arguments {
    #[arg(long, value_name = "DIR", help = "Directory for resolve.log (defaults to the user cache directory)")]
    pub log_dir: Option<PathBuf>,

    #[arg(
        long,
        env = ENV_SERVICE_ACCOUNT_TOKEN,
        hide_env_values = true,
        help = "Service account token used to authenticate"
    )]
    pub service_account_token: Option<String>,

    #[arg(
        long,
        env = ENV_DESKTOP_ACCOUNT,
        help = "Desktop app account to use instead of a service account token"
    )]
    pub desktop_account: Option<String>,

    #[arg(required = true, value_name = "REFERENCE", help = "Secret references, e.g. op://vault/item/field")]
    pub references: Vec<String>,
}

impl Arguments {
    /// Client builder for the credentials on the command line or in the environment.
    ///
    /// A desktop account selects the desktop app integration; otherwise the service account
    /// token is used. Missing credentials are left for the builder to report.
    pub fn client_builder(&self) -> ClientBuilder {
        let present = |value: &Option<String>| value.clone().filter(|value| !value.is_empty());
        let builder = ClientBuilder::default().with_integration_info(INTEGRATION_NAME, INTEGRATION_VERSION);

        match (present(&self.desktop_account), present(&self.service_account_token)) {
            (Some(account), _) => builder.with_desktop_app_integration(account),
            (None, Some(token)) => builder.with_service_account_token(token),
            (None, None) => builder,
        }
    }
}

/// Default log directory: the user cache directory, falling back to the temp directory.
pub fn default_log_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(INTEGRATION_NAME)
}
