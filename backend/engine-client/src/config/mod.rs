//! Client identity sent to the engine once per session.
//!
//! [`ClientConfig`] is immutable once built and is kept by the invocation router so a
//! session can be re-created after the companion app reports it expired.

pub mod settings;
pub mod system;

pub use settings::{EngineSettings, Isolation};

use crate::error::config::ConfigError;
use crate::error::engine::EngineError;

use common::RedactedToken;

use std::sync::OnceLock;

use regex::Regex;
use serde::{Serialize, Serializer};

pub const DEFAULT_INTEGRATION_NAME: &str = "Unknown";
pub const DEFAULT_INTEGRATION_VERSION: &str = "Unknown";

pub const SDK_LANGUAGE: &str = "Rust";
/// Encoded as `MMmmmpp` (major, minor, patch).
pub const SDK_VERSION: &str = "0010001";
pub const REQUEST_LIBRARY_NAME: &str = "reqwest";
pub const REQUEST_LIBRARY_VERSION: &str = "0.13.1";

const MAX_INTEGRATION_NAME_LENGTH: usize = 40;
const MAX_INTEGRATION_VERSION_LENGTH: usize = 20;
const INTEGRATION_INFO_PATTERN: &str = r"^[A-Za-z0-9_\-. ,]*$";

static INTEGRATION_INFO_REGEX: OnceLock<Regex> = OnceLock::new();

fn integration_info_regex() -> Result<&'static Regex, ConfigError> {
    if let Some(regex) = INTEGRATION_INFO_REGEX.get() {
        return Ok(regex);
    }
    let compiled = Regex::new(INTEGRATION_INFO_PATTERN)
        .map_err(|e| ConfigError::validation(format!("invalid integration pattern: {e}")))?;
    Ok(INTEGRATION_INFO_REGEX.get_or_init(|| compiled))
}

/// How a session authenticates against the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Service account token, used by the bytecode and delegated backends.
    ServiceAccount(RedactedToken),
    /// Account name or ID of a signed-in companion desktop app.
    DesktopApp { account: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(serialize_with = "serialize_exposed_token")]
    service_account_token: Option<RedactedToken>,
    programming_language: String,
    sdk_version: String,
    integration_name: String,
    integration_version: String,
    request_library_name: String,
    request_library_version: String,
    os: String,
    os_version: String,
    architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    account_id: Option<String>,
}

impl ClientConfig {
    /// Validate integration info and fill in SDK and system defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when the credential is empty, or the
    /// integration name/version is missing, too long, or uses characters outside
    /// letters, digits and `_- .,`.
    #[track_caller]
    pub fn new(
        credential: Credential,
        integration_name: impl Into<String>,
        integration_version: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let integration_name = integration_name.into();
        let integration_version = integration_version.into();

        let (service_account_token, account_id) = match credential {
            Credential::ServiceAccount(token) => {
                if token.is_empty() {
                    return Err(ConfigError::validation(
                        "cannot create a client without specifying a Service Account Token",
                    ));
                }
                (Some(token), None)
            }
            Credential::DesktopApp { account } => {
                if account.trim().is_empty() {
                    return Err(ConfigError::validation(
                        "cannot create a client without specifying a desktop app account name",
                    ));
                }
                (None, Some(account))
            }
        };

        validate_integration_info(&integration_name, &integration_version)?;

        Ok(Self {
            service_account_token,
            programming_language: String::from(SDK_LANGUAGE),
            sdk_version: String::from(SDK_VERSION),
            integration_name,
            integration_version,
            request_library_name: String::from(REQUEST_LIBRARY_NAME),
            request_library_version: String::from(REQUEST_LIBRARY_VERSION),
            os: String::from(system::OS),
            os_version: system::os_version(),
            architecture: String::from(system::ARCHITECTURE),
            account_id,
        })
    }

    pub fn integration_name(&self) -> &str {
        &self.integration_name
    }

    pub fn integration_version(&self) -> &str {
        &self.integration_version
    }

    /// Companion-app account, present only for desktop-app sessions.
    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    pub fn has_service_account_token(&self) -> bool {
        self.service_account_token.is_some()
    }

    /// Wire encoding handed to the engine's `init_client` entry point.
    ///
    /// This is the only place the credential leaves its redacted wrapper.
    pub(crate) fn to_wire_bytes(&self) -> Result<Vec<u8>, EngineError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn to_wire_value(&self) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[track_caller]
fn validate_integration_info(name: &str, version: &str) -> Result<(), ConfigError> {
    if name.is_empty() || version.is_empty() {
        return Err(ConfigError::validation(
            "cannot create a client without defining an app name and version. If you don't want to specify any, use the provided constants: 'DEFAULT_INTEGRATION_NAME', 'DEFAULT_INTEGRATION_VERSION'",
        ));
    }

    let regex = integration_info_regex()?;

    if name.chars().count() > MAX_INTEGRATION_NAME_LENGTH {
        return Err(ConfigError::validation(format!(
            "integration name can't be longer than {MAX_INTEGRATION_NAME_LENGTH} characters"
        )));
    }
    if !regex.is_match(name) {
        return Err(ConfigError::validation(
            "integration name can only contain digits, letters and allowed symbols",
        ));
    }

    if version.chars().count() > MAX_INTEGRATION_VERSION_LENGTH {
        return Err(ConfigError::validation(format!(
            "integration version can't be longer than {MAX_INTEGRATION_VERSION_LENGTH} characters"
        )));
    }
    if !regex.is_match(version) {
        return Err(ConfigError::validation(
            "integration version can only contain digits, letters and allowed symbols",
        ));
    }

    Ok(())
}

fn serialize_exposed_token<S>(token: &Option<RedactedToken>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(token.as_ref().map(RedactedToken::expose).unwrap_or_default())
}
