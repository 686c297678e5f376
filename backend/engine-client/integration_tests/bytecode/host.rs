use crate::engine_tests::helpers::{
    host_callback_engine, http_fetch_engine, load_engine, load_engine_with_hosts,
};

use engine_client::{CancellationToken, Invocation, Isolation};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// **VALUE**: Verifies the engine can draw randomness and read the clock from the host.
///
/// **WHY THIS MATTERS**: The engine's crypto needs secure randomness and its token
/// handling needs wall-clock time; neither exists inside the sandbox.
///
/// **BUG THIS CATCHES**: Would catch a host function being unlinked or returning a
/// buffer the guest cannot read.
#[tokio::test]
async fn given_host_callback_engine_when_invoking_then_randomness_and_clock_are_available() {
    // GIVEN: An engine that calls random_fill and unix_time_milliseconds
    let engine = load_engine(&host_callback_engine(), Isolation::Shared);
    let cancel = CancellationToken::new();

    // WHEN: Invoking twice
    let first = engine
        .invoke(None, &Invocation::new("Sample", json!({})), &cancel)
        .await
        .expect("call succeeds");
    let second = engine
        .invoke(None, &Invocation::new("Sample", json!({})), &cancel)
        .await
        .expect("call succeeds");

    // THEN: Each output is 32 mapped random bytes and they differ
    for output in [&first, &second] {
        assert_eq!(output.len(), 32);
        assert!(output.bytes().all(|b| (b'a'..=b'p').contains(&b)));
    }
    assert_ne!(first, second);
}

/// **VALUE**: Verifies engine HTTP requests reach allowed hosts through the bridge.
///
/// **WHY THIS MATTERS**: Every server round trip the engine makes goes through this path.
///
/// **BUG THIS CATCHES**: Would catch the bridge deadlocking when driven from inside a
/// guest call.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_allowed_host_when_engine_makes_request_then_response_reaches_engine() {
    // GIVEN: A local server and an engine allowed to reach it
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/account"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .expect(1)
        .mount(&server)
        .await;

    let request = json!({
        "method": "GET",
        "url": format!("{}/api/v2/account", server.uri()),
    })
    .to_string();
    let engine = load_engine_with_hosts(&http_fetch_engine(&request), Isolation::Spawned, &["127.0.0.1"]);

    // WHEN: The engine issues the request
    let outcome = engine
        .invoke(None, &Invocation::new("Fetch", json!({})), &CancellationToken::new())
        .await
        .expect("call succeeds");

    // THEN: The engine received the server's response
    let outcome: serde_json::Value = serde_json::from_str(&outcome).expect("outcome is JSON");
    assert_eq!(outcome["response"]["status"], 200);
    let body = STANDARD
        .decode(outcome["response"]["body"].as_str().expect("body is a string"))
        .expect("body is base64");
    assert_eq!(body, br#"{"ok":true}"#);
}

/// **VALUE**: Verifies engine HTTP requests to other hosts are refused.
///
/// **WHY THIS MATTERS**: The allow-list is the only thing stopping a compromised engine
/// module from sending secrets elsewhere.
///
/// **BUG THIS CATCHES**: Would catch the allow-list not applying to guest-initiated calls.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn given_disallowed_host_when_engine_makes_request_then_engine_receives_error() {
    // GIVEN: An engine restricted to 1Password hosts
    let request = json!({"method": "GET", "url": "https://example.com/exfiltrate"}).to_string();
    let engine = load_engine(&http_fetch_engine(&request), Isolation::Spawned);

    // WHEN: The engine issues the request
    let outcome = engine
        .invoke(None, &Invocation::new("Fetch", json!({})), &CancellationToken::new())
        .await
        .expect("call succeeds");

    // THEN: The engine is told why
    let outcome: serde_json::Value = serde_json::from_str(&outcome).expect("outcome is JSON");
    assert_eq!(outcome["error"], "host 'example.com' is not in the list of allowed hosts");
}
