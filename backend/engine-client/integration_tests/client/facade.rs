use crate::engine_tests::helpers::{
    TEST_TOKEN, echo_engine, fixed_response_engine, load_engine, service_account_config,
};

use engine_client::engine::{reset_shared_engine, shared_engine};
use engine_client::{
    ClientBuilder, ClientError, ConfigError, EngineError, EngineSettings, Isolation,
};

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

fn builder() -> ClientBuilder {
    ClientBuilder::default()
        .with_service_account_token(TEST_TOKEN)
        .with_integration_info("Facade Tests", "1.0.0")
}

// ============================================================================
// Building
// ============================================================================

/// **VALUE**: Verifies invalid builder input fails before any engine is touched.
///
/// **WHY THIS MATTERS**: Configuration mistakes should be reported as such, not as an
/// engine that cannot be found.
///
/// **BUG THIS CATCHES**: Would catch engine selection running before validation.
#[tokio::test]
async fn given_both_credentials_when_building_then_returns_config_error() {
    // GIVEN: A builder with a token and a desktop account, and no engine configured
    let builder = builder().with_desktop_app_integration("my.1password.com");

    // WHEN: Building
    let result = builder.build().await;

    // THEN: The config error is reported
    assert!(matches!(
        result,
        Err(ClientError::Config(ConfigError::ValidationError { .. }))
    ));
}

/// **VALUE**: Verifies a missing engine module is reported as an engine error.
///
/// **WHY THIS MATTERS**: The user must learn which variable to set.
///
/// **BUG THIS CATCHES**: Would catch a panic when no module path is configured.
#[tokio::test]
#[serial]
async fn given_no_engine_configured_when_building_then_returns_unavailable() {
    // GIVEN: Empty settings and no shared engine
    reset_shared_engine();
    let builder = builder().with_settings(EngineSettings::default());

    // WHEN: Building
    let result = builder.build().await;

    // THEN: The engine is unavailable and the variable is named
    match result {
        Err(ClientError::Engine(EngineError::Unavailable { message, .. })) => {
            assert!(message.contains("OP_SDK_ENGINE_MODULE"));
        }
        Err(other) => panic!("expected Unavailable, got {other:?}"),
        Ok(_) => panic!("expected the build to fail"),
    }
}

/// **VALUE**: Verifies clients built from settings share one process-wide engine.
///
/// **WHY THIS MATTERS**: Compiling the engine module is expensive; it must happen once per
/// process, not once per client.
///
/// **BUG THIS CATCHES**: Would catch each build loading its own engine.
#[tokio::test]
#[serial]
async fn given_module_setting_when_building_two_clients_then_engine_is_shared() {
    // GIVEN: A module file on disk and a clean process-wide slot
    reset_shared_engine();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let module_path = dir.path().join("engine.wat");
    std::fs::write(&module_path, echo_engine()).expect("Failed to write engine module");
    let settings = EngineSettings {
        module_path: Some(module_path),
        isolation: Isolation::Shared,
        ..EngineSettings::default()
    };

    // WHEN: Building two clients
    let first = builder().with_settings(settings.clone()).build().await.expect("first client");
    let second = builder().with_settings(settings.clone()).build().await.expect("second client");

    // THEN: Both use the same engine and got distinct sessions
    assert!(Arc::ptr_eq(first.engine(), second.engine()));
    assert!(Arc::ptr_eq(
        first.engine(),
        &shared_engine(&settings).expect("shared engine exists")
    ));
    assert_ne!(first.session_id().await, second.session_id().await);

    first.close().await;
    second.close().await;
    reset_shared_engine();
}

// ============================================================================
// Using
// ============================================================================

/// **VALUE**: Verifies secret resolution end to end through the facade.
///
/// **WHY THIS MATTERS**: This is the call nearly every integration makes.
///
/// **BUG THIS CATCHES**: Would catch the JSON string response being returned with quotes.
#[tokio::test]
async fn given_client_when_resolving_secret_then_returns_plain_value() {
    // GIVEN: A client on an engine that answers "secret"
    let engine = load_engine(&fixed_response_engine(r#""secret""#), Isolation::Spawned);
    let client = builder().with_engine(engine).build().await.expect("client");

    // WHEN: Resolving a reference
    let value = client
        .secrets()
        .resolve("op://vault/item/field")
        .await
        .expect("resolve");

    // THEN: The unquoted value comes back
    assert_eq!(value, "secret");
    client.close().await;
}

/// **VALUE**: Verifies a non-string resolve response is an error.
///
/// **WHY THIS MATTERS**: Returning the raw JSON of an unexpected shape would hand callers
/// a "secret" that is really an error document.
///
/// **BUG THIS CATCHES**: Would catch a lenient fallback to the raw response.
#[tokio::test]
async fn given_non_string_response_when_resolving_then_returns_serialization_error() {
    // GIVEN: A client on an echo engine, which answers with an object
    let engine = load_engine(&echo_engine(), Isolation::Spawned);
    let client = builder().with_engine(engine).build().await.expect("client");

    // WHEN: Resolving
    let result = client.secrets().resolve("op://vault/item/field").await;

    // THEN: It fails to parse
    assert!(matches!(
        result,
        Err(ClientError::Engine(EngineError::Serialization { .. }))
    ));
    client.close().await;
}

/// **VALUE**: Verifies the generic invoke passes method and parameters through.
///
/// **WHY THIS MATTERS**: Every other API surface is built on this call.
///
/// **BUG THIS CATCHES**: Would catch the method name being dropped from the invocation.
#[tokio::test]
async fn given_client_when_invoking_by_name_then_engine_receives_method_and_parameters() {
    // GIVEN: A client on an echo engine
    let engine = load_engine(&echo_engine(), Isolation::Shared);
    let client = builder().with_engine(engine).build().await.expect("client");

    // WHEN: Invoking a method
    let response = client
        .invoke("ItemsList", serde_json::json!({"vault_id": "abc"}))
        .await
        .expect("invoke");

    // THEN: The engine saw both
    let echoed: serde_json::Value = serde_json::from_str(&response).expect("response is JSON");
    assert_eq!(echoed["invocation"]["name"], "ItemsList");
    assert_eq!(echoed["invocation"]["parameters"]["vault_id"], "abc");
    client.close().await;
}

// ============================================================================
// Releasing
// ============================================================================

/// **VALUE**: Verifies close releases the session deterministically.
///
/// **WHY THIS MATTERS**: Long-running services create and discard clients; leaked
/// sessions are leaked engine instances.
///
/// **BUG THIS CATCHES**: Would catch close returning before the release completed.
#[tokio::test]
async fn given_client_when_closed_then_session_is_released() {
    // GIVEN: An open client
    let engine = load_engine(&echo_engine(), Isolation::Spawned);
    let client = builder().with_engine(engine.clone()).build().await.expect("client");
    let id = client.session_id().await;

    // WHEN: Closing it
    client.close().await;

    // THEN: The session is released
    assert_eq!(engine.session_state(id), None);
}

/// **VALUE**: Verifies dropping a client inside a runtime releases its session.
///
/// **WHY THIS MATTERS**: Not every caller remembers to close; early returns and `?` drop
/// clients implicitly.
///
/// **BUG THIS CATCHES**: Would catch `Drop` doing nothing.
#[tokio::test]
async fn given_client_when_dropped_then_session_is_released_soon_after() {
    // GIVEN: An open client
    let engine = load_engine(&echo_engine(), Isolation::Spawned);
    let client = builder().with_engine(engine.clone()).build().await.expect("client");
    let id = client.session_id().await;

    // WHEN: Dropping it
    drop(client);

    // THEN: The scheduled release runs
    let released = tokio::time::timeout(Duration::from_secs(5), async {
        while engine.session_state(id).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "session {id} was not released after drop");
}

/// **VALUE**: Verifies a session's explicit release plus drop reach the engine once.
///
/// **WHY THIS MATTERS**: `close` consumes the client, which then drops; the two paths
/// must not both release.
///
/// **BUG THIS CATCHES**: Would catch the released flag not being checked in `Drop`.
#[tokio::test]
async fn given_closed_client_when_dropped_then_no_second_release() {
    // GIVEN: An open client and the engine's call count after opening
    let engine = load_engine(&echo_engine(), Isolation::Spawned);
    let client = builder().with_engine(engine.clone()).build().await.expect("client");
    let after_open = engine.transport_calls();

    // WHEN: Closing it (which also drops it) and letting the runtime run
    client.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // THEN: Exactly one release was issued
    assert_eq!(engine.transport_calls(), after_open + 1);
}

/// **VALUE**: Verifies a config built by the builder matches one built directly.
///
/// **WHY THIS MATTERS**: The builder is a thin layer; it must not alter defaults.
///
/// **BUG THIS CATCHES**: Would catch the builder passing integration info in swapped order.
#[test]
fn given_builder_when_building_config_then_matches_direct_construction() {
    // GIVEN / WHEN: Configs from both paths
    let from_builder = ClientBuilder::default()
        .with_service_account_token(TEST_TOKEN)
        .with_integration_info("Engine Integration Tests", "1.0.0")
        .build_config()
        .expect("valid builder config");

    // THEN: They are equal
    assert_eq!(from_builder, service_account_config());
}
