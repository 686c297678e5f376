//! Request envelopes that cross the transport boundary.

use crate::SessionId;
use crate::error::engine::EngineError;

use serde::{Deserialize, Serialize};

/// Per-invocation ceiling. Some backends corrupt or crash on larger messages.
pub const MESSAGE_LIMIT: usize = 50 * 1024 * 1024;

/// One opaque operation: an engine method name plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub name: String,
    pub parameters: serde_json::Value,
}

impl Invocation {
    pub fn new(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvocationRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<SessionId>,
    invocation: &'a Invocation,
}

/// Owned form of the envelope, used by backends that rewrite `clientId`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RoutedRequest {
    #[serde(default)]
    pub client_id: Option<SessionId>,
    pub invocation: serde_json::Value,
}

impl RoutedRequest {
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Re-encode with `client_id` in place of whatever the caller sent.
    pub(crate) fn encode_for(&self, client_id: Option<SessionId>) -> Result<Vec<u8>, EngineError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Rewritten<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            client_id: Option<SessionId>,
            invocation: &'a serde_json::Value,
        }

        Ok(serde_json::to_vec(&Rewritten {
            client_id,
            invocation: &self.invocation,
        })?)
    }
}

/// Serialize an invocation, rejecting it locally when it exceeds [`MESSAGE_LIMIT`].
///
/// # Errors
///
/// Returns [`EngineError::MessageTooLarge`] before anything is handed to a transport.
#[track_caller]
pub fn encode_invocation(
    client_id: Option<SessionId>,
    invocation: &Invocation,
) -> Result<Vec<u8>, EngineError> {
    let bytes = serde_json::to_vec(&InvocationRequest {
        client_id,
        invocation,
    })?;

    ensure_within_limit(bytes.len())?;
    Ok(bytes)
}

#[track_caller]
pub(crate) fn ensure_within_limit(size: usize) -> Result<(), EngineError> {
    if size > MESSAGE_LIMIT {
        return Err(EngineError::message_too_large(size, MESSAGE_LIMIT));
    }
    Ok(())
}

pub(crate) fn encode_session_id(session_id: SessionId) -> Result<Vec<u8>, EngineError> {
    Ok(serde_json::to_vec(&session_id)?)
}

/// Session IDs come back as JSON numbers, sometimes wrapped in a JSON string.
pub(crate) fn decode_session_id(bytes: &[u8]) -> Result<SessionId, EngineError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    match &value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| EngineError::serialization(format!("engine returned an invalid session id: {value}")))
}

/// Base64 encoding for byte payloads embedded in JSON envelopes.
pub(crate) mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
