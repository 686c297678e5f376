//! Host callbacks the engine imports from the `engine-host` namespace.
//!
//! All three write their results into guest memory obtained through the guest's own
//! `allocate` export; the guest owns and frees those buffers.

use crate::error::engine::EngineError;
use crate::wire::base64_bytes;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use rand::RngCore;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use url::Url;
use wasmtime::{Caller, Extern, Linker, Memory};

pub(crate) const HOST_MODULE: &str = "engine-host";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-store state visible to host callbacks.
pub(crate) struct HostState {
    pub(crate) http: HttpBridge,
    /// Context of the call currently running in this store.
    pub(crate) call: CallScope,
}

/// Context for one guest call: its own interrupt flag and the runtime of the caller.
///
/// A fresh scope is created for every call, so an interrupt raised for one call can
/// never trap a later one.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallScope {
    interrupt: Arc<AtomicBool>,
    runtime: Option<Handle>,
}

impl CallScope {
    /// Scope bound to the runtime the caller is running on, if any.
    pub(crate) fn current() -> Self {
        Self {
            interrupt: Arc::new(AtomicBool::new(false)),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Ask the guest running under this scope to stop at the next epoch tick.
    pub(crate) fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub(crate) fn runtime(&self) -> Option<&Handle> {
        self.runtime.as_ref()
    }
}

#[derive(Debug, Deserialize)]
struct HttpRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default, with = "base64_bytes")]
    body: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    #[serde(with = "base64_bytes")]
    body: Vec<u8>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum HttpOutcome {
    Response(HttpResponse),
    Error(String),
}

/// Outbound HTTP on behalf of the engine, restricted to an allow-list of hosts.
///
/// Requests are driven on the runtime of the call that issued them; callers must be on
/// a blocking thread, never inside an async task.
#[derive(Debug, Clone)]
pub(crate) struct HttpBridge {
    client: reqwest::Client,
    allowed_hosts: Arc<[String]>,
}

impl HttpBridge {
    pub(crate) fn new(allowed_hosts: &[String]) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| EngineError::unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allowed_hosts: allowed_hosts.iter().cloned().collect(),
        })
    }

    /// Execute a serialized request and return the serialized outcome.
    ///
    /// Failures, including denied hosts and a missing runtime, become an
    /// `{"error": ..}` outcome.
    pub(crate) fn execute(&self, request: &[u8], runtime: Option<&Handle>) -> Vec<u8> {
        let outcome = match self.perform(request, runtime) {
            Ok(response) => HttpOutcome::Response(response),
            Err(message) => {
                debug!("Engine HTTP request failed: {message}");
                HttpOutcome::Error(message)
            }
        };

        serde_json::to_vec(&outcome).unwrap_or_default()
    }

    fn perform(&self, request: &[u8], runtime: Option<&Handle>) -> Result<HttpResponse, String> {
        let request: HttpRequest =
            serde_json::from_slice(request).map_err(|e| format!("invalid HTTP request: {e}"))?;

        let url = Url::parse(&request.url).map_err(|e| format!("invalid URL: {e}"))?;
        let host = url.host_str().ok_or_else(|| String::from("URL has no host"))?;
        if !is_host_allowed(host, &self.allowed_hosts) {
            return Err(format!("host '{host}' is not in the list of allowed hosts"));
        }

        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| format!("invalid HTTP method '{}': {e}", request.method))?;

        let runtime = runtime.ok_or_else(|| String::from("no async runtime available for outbound HTTP"))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        runtime.block_on(async move {
            let response = builder.send().await.map_err(|e| e.to_string())?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            let body = response.bytes().await.map_err(|e| e.to_string())?.to_vec();

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

/// Exact host match, or `*.suffix` matching any subdomain of `suffix`.
pub fn is_host_allowed(host: &str, allowed_hosts: &[String]) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    allowed_hosts.iter().any(|pattern| {
        let pattern = pattern.to_ascii_lowercase();
        match pattern.strip_prefix("*.") {
            Some(suffix) => host
                .strip_suffix(suffix)
                .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.')),
            None => host == pattern,
        }
    })
}

pub(crate) fn link_host_functions(linker: &mut Linker<HostState>) -> Result<(), EngineError> {
    let link_error =
        |name: &str, e: wasmtime::Error| EngineError::unavailable(format!("failed to link host function {name}: {e}"));

    linker
        .func_wrap(
            HOST_MODULE,
            "random_fill",
            |mut caller: Caller<'_, HostState>, length: i32| -> wasmtime::Result<i32> {
                let mut bytes = vec![0u8; usize::try_from(length)?];
                rand::rng().fill_bytes(&mut bytes);
                write_to_guest(&mut caller, &bytes)
            },
        )
        .map_err(|e| link_error("random_fill", e))?;

    linker
        .func_wrap(HOST_MODULE, "unix_time_milliseconds", || -> i64 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
                .unwrap_or(0)
        })
        .map_err(|e| link_error("unix_time_milliseconds", e))?;

    linker
        .func_wrap(
            HOST_MODULE,
            "http_get",
            |mut caller: Caller<'_, HostState>,
             request_ptr: i32,
             request_len: i32,
             out_len_ptr: i32|
             -> wasmtime::Result<i32> {
                let memory = guest_memory(&mut caller)?;

                let mut request = vec![0u8; usize::try_from(request_len)?];
                memory.read(&caller, request_ptr as u32 as usize, &mut request)?;

                let bridge = caller.data().http.clone();
                let runtime = caller.data().call.runtime().cloned();
                let outcome = bridge.execute(&request, runtime.as_ref());

                let outcome_ptr = write_to_guest(&mut caller, &outcome)?;
                let outcome_len = u32::try_from(outcome.len())?;
                memory.write(&mut caller, out_len_ptr as u32 as usize, &outcome_len.to_le_bytes())?;

                Ok(outcome_ptr)
            },
        )
        .map_err(|e| link_error("http_get", e))?;

    Ok(())
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(wasmtime::Error::msg("engine module does not export its memory")),
    }
}

/// Copy `bytes` into a fresh guest allocation and return its offset.
fn write_to_guest(caller: &mut Caller<'_, HostState>, bytes: &[u8]) -> wasmtime::Result<i32> {
    let allocate = match caller.get_export("allocate") {
        Some(Extern::Func(func)) => func.typed::<i32, i32>(&*caller)?,
        _ => return Err(wasmtime::Error::msg("engine module does not export allocate")),
    };

    let ptr = allocate.call(&mut *caller, i32::try_from(bytes.len())?)?;
    if ptr == 0 && !bytes.is_empty() {
        return Err(wasmtime::Error::msg(format!(
            "engine failed to allocate {} bytes for a host callback",
            bytes.len()
        )));
    }

    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, ptr as u32 as usize, bytes)?;
    Ok(ptr)
}
