use crate::backend::bytecode::host::{HttpBridge, is_host_allowed};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use tokio::runtime::{Handle, Runtime};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn hosts(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}

// ============================================================================
// Allow-list matching
// ============================================================================

/// **VALUE**: Verifies wildcard entries match subdomains only.
///
/// **WHY THIS MATTERS**: The engine may only talk to 1Password servers. `*.1password.com`
/// must not admit `evil1password.com` or the bare apex.
///
/// **BUG THIS CATCHES**: Would catch a plain `ends_with` suffix check.
#[test]
fn given_wildcard_pattern_when_matching_then_only_true_subdomains_pass() {
    // GIVEN: A wildcard allow-list
    let allowed = hosts(&["*.1password.com"]);

    // WHEN / THEN: Subdomains pass, look-alikes and the apex do not
    assert!(is_host_allowed("my.1password.com", &allowed));
    assert!(is_host_allowed("a.b.1password.com", &allowed));
    assert!(!is_host_allowed("evil1password.com", &allowed));
    assert!(!is_host_allowed("1password.com", &allowed));
    assert!(!is_host_allowed("1password.com.evil.net", &allowed));
}

/// **VALUE**: Verifies exact entries, case-insensitivity and trailing dots.
///
/// **WHY THIS MATTERS**: Hosts arrive in whatever form the engine built the URL.
///
/// **BUG THIS CATCHES**: Would catch case-sensitive comparison or FQDN dots breaking matches.
#[test]
fn given_exact_pattern_when_matching_then_case_and_trailing_dot_are_ignored() {
    // GIVEN: An exact allow-list entry
    let allowed = hosts(&["127.0.0.1", "Events.1Password.com"]);

    // WHEN / THEN: Equivalent forms match, others do not
    assert!(is_host_allowed("127.0.0.1", &allowed));
    assert!(is_host_allowed("events.1password.com.", &allowed));
    assert!(!is_host_allowed("127.0.0.2", &allowed));
    assert!(!is_host_allowed("x.events.1password.com", &allowed));
}

// ============================================================================
// HTTP bridge
// ============================================================================

/// **VALUE**: Verifies the bridge performs allowed requests and returns the full response.
///
/// **WHY THIS MATTERS**: The engine has no network access of its own; every API call goes
/// through this bridge.
///
/// **BUG THIS CATCHES**: Would catch dropped request headers or a body not base64-encoded.
#[tokio::test(flavor = "multi_thread")]
async fn given_allowed_host_when_executing_request_then_returns_response() {
    // GIVEN: A local server expecting a header
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/ping"))
        .and(header("x-engine-test", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let bridge = HttpBridge::new(&hosts(&["127.0.0.1"])).expect("bridge builds");
    let request = serde_json::to_vec(&json!({
        "method": "get",
        "url": format!("{}/api/v1/ping", server.uri()),
        "headers": {"x-engine-test": "1"},
        "body": ""
    }))
    .expect("request serializes");

    // WHEN: Executing it from a blocking thread, as the guest would
    let runtime = Handle::current();
    let outcome = tokio::task::spawn_blocking(move || bridge.execute(&request, Some(&runtime)))
        .await
        .expect("worker completes");

    // THEN: The response round-trips to the guest
    let outcome: serde_json::Value = serde_json::from_slice(&outcome).expect("outcome is JSON");
    assert_eq!(outcome["response"]["status"], 200);
    let body = STANDARD
        .decode(outcome["response"]["body"].as_str().expect("body is a string"))
        .expect("body is base64");
    assert_eq!(body, b"pong");
}

/// **VALUE**: Verifies requests to hosts outside the allow-list are refused locally.
///
/// **WHY THIS MATTERS**: A compromised or buggy engine must not be able to exfiltrate
/// secrets to arbitrary hosts.
///
/// **BUG THIS CATCHES**: Would catch the allow-list check being skipped for some methods.
#[tokio::test(flavor = "multi_thread")]
async fn given_disallowed_host_when_executing_request_then_returns_error_outcome() {
    // GIVEN: A bridge that only allows 1Password hosts
    let bridge = HttpBridge::new(&hosts(&["*.1password.com"])).expect("bridge builds");
    let request = serde_json::to_vec(&json!({
        "method": "POST",
        "url": "https://example.com/collect",
        "body": STANDARD.encode("secret")
    }))
    .expect("request serializes");

    // WHEN: Executing it
    let runtime = Handle::current();
    let outcome = tokio::task::spawn_blocking(move || bridge.execute(&request, Some(&runtime)))
        .await
        .expect("worker completes");

    // THEN: The guest receives an error outcome naming the host
    let outcome: serde_json::Value = serde_json::from_slice(&outcome).expect("outcome is JSON");
    assert_eq!(
        outcome["error"],
        "host 'example.com' is not in the list of allowed hosts"
    );
    assert!(outcome.get("response").is_none());
}

/// **VALUE**: Verifies malformed requests become error outcomes instead of panics.
///
/// **WHY THIS MATTERS**: The request bytes come from guest memory and cannot be trusted.
///
/// **BUG THIS CATCHES**: Would catch an `unwrap` on the guest's JSON.
#[tokio::test(flavor = "multi_thread")]
async fn given_malformed_request_when_executing_then_returns_error_outcome() {
    // GIVEN: Garbage bytes
    let bridge = HttpBridge::new(&hosts(&["127.0.0.1"])).expect("bridge builds");

    // WHEN: Executing them
    let runtime = Handle::current();
    let outcome = tokio::task::spawn_blocking(move || bridge.execute(b"not json", Some(&runtime)))
        .await
        .expect("worker completes");

    // THEN: An error outcome comes back
    let outcome: serde_json::Value = serde_json::from_slice(&outcome).expect("outcome is JSON");
    assert!(outcome["error"]
        .as_str()
        .is_some_and(|message| message.starts_with("invalid HTTP request")));
}

/// **VALUE**: Verifies requests run on the runtime of the call, not the one the engine
/// was loaded on.
///
/// **WHY THIS MATTERS**: The process-wide engine outlives the runtime that first loaded
/// it; later callers bring their own runtime.
///
/// **BUG THIS CATCHES**: Would catch the bridge holding on to a runtime handle captured at
/// load time, which fails once that runtime has shut down.
#[test]
fn given_bridge_from_shut_down_runtime_when_executing_on_new_runtime_then_succeeds() {
    // GIVEN: A bridge built on a runtime that has since shut down
    let loading_runtime = Runtime::new().expect("runtime starts");
    let bridge = loading_runtime
        .block_on(async { HttpBridge::new(&hosts(&["127.0.0.1"])) })
        .expect("bridge builds");
    drop(loading_runtime);

    // GIVEN: A second runtime with a local server
    let calling_runtime = Runtime::new().expect("runtime starts");
    let server = calling_runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/later"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        server
    });
    let request = serde_json::to_vec(&json!({
        "method": "GET",
        "url": format!("{}/later", server.uri())
    }))
    .expect("request serializes");

    // WHEN: Executing from a blocking thread of the second runtime
    let handle = calling_runtime.handle().clone();
    let outcome = calling_runtime
        .block_on(async move {
            tokio::task::spawn_blocking(move || bridge.execute(&request, Some(&handle))).await
        })
        .expect("worker completes");

    // THEN: The request is served
    let outcome: serde_json::Value = serde_json::from_slice(&outcome).expect("outcome is JSON");
    assert_eq!(outcome["response"]["status"], 204);
    calling_runtime.block_on(async move { drop(server) });
}

/// **VALUE**: Verifies a call without a runtime gets an error outcome.
///
/// **WHY THIS MATTERS**: An engine driven from plain threads must see a readable error,
/// not a panic from inside reqwest.
///
/// **BUG THIS CATCHES**: Would catch the request being attempted without an executor.
#[test]
fn given_no_runtime_when_executing_request_then_returns_error_outcome() {
    // GIVEN: An allowed request
    let bridge = HttpBridge::new(&hosts(&["127.0.0.1"])).expect("bridge builds");
    let request = serde_json::to_vec(&json!({"method": "GET", "url": "http://127.0.0.1:9/"}))
        .expect("request serializes");

    // WHEN: Executing it with no runtime
    let outcome = bridge.execute(&request, None);

    // THEN: The guest is told why
    let outcome: serde_json::Value = serde_json::from_slice(&outcome).expect("outcome is JSON");
    assert_eq!(outcome["error"], "no async runtime available for outbound HTTP");
}
