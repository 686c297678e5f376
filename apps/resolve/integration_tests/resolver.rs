use resolve::arguments::Arguments;
use resolve::error::ResolveError;
use resolve::resolver::resolve_all;

use engine_client::backend::BytecodeBackend;
use engine_client::{ClientError, Engine, EngineError, Isolation};

use std::sync::Arc;

/// Engine that numbers clients from 0 and answers every invocation with `body`.
fn fixed_engine(body: &str, failing: bool) -> Arc<Engine> {
    let wat = format!(
        r#"(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (data (i32.const 16) "{data}")
  (func $allocate (export "allocate") (param $len i32) (result i32)
    global.get $heap
    global.get $heap
    local.get $len
    i32.add
    i32.const 7
    i32.add
    i32.const -8
    i32.and
    global.set $heap)
  (func (export "deallocate") (param i32 i32))
  (func (export "init_client") (param i32 i32 i32) (param $out i32) (param $out_len i32)
    (local $buf i32)
    i32.const 1
    call $allocate
    local.tee $buf
    i32.const 48
    i32.store8
    local.get $out
    local.get $buf
    i32.store
    local.get $out_len
    i32.const 1
    i32.store)
  (func (export "invoke") (param i32 i32) (param $err i32) (param $out i32) (param $out_len i32)
    local.get $err
    i32.const {flag}
    i32.store
    local.get $out
    i32.const 16
    i32.store
    local.get $out_len
    i32.const {len}
    i32.store)
  (func (export "release_client") (param i32 i32 i32 i32 i32)))"#,
        data = body.replace('"', "\\\""),
        len = body.len(),
        flag = i32::from(failing),
    );

    let backend = BytecodeBackend::load(wat.as_bytes(), Isolation::Spawned, &[])
        .expect("Failed to load test engine");
    Arc::new(Engine::Bytecode(backend))
}

fn token_arguments(references: &[&str]) -> Arguments {
    Arguments {
        log_dir: None,
        service_account_token: Some(String::from("ops_resolve_test")),
        desktop_account: None,
        references: references.iter().map(|r| r.to_string()).collect(),
    }
}

/// **VALUE**: Verifies every reference is resolved, in order.
///
/// **WHY THIS MATTERS**: Scripts read the output line by line and rely on its order.
///
/// **BUG THIS CATCHES**: Would catch references being resolved concurrently and reordered.
#[tokio::test]
async fn given_references_when_resolving_all_then_returns_value_per_reference() {
    // GIVEN: A client on an engine that answers "secret"
    let arguments = token_arguments(&["op://v/a/f", "op://v/b/f"]);
    let client = arguments
        .client_builder()
        .with_engine(fixed_engine(r#""secret""#, false))
        .build()
        .await
        .expect("client");

    // WHEN: Resolving both
    let values = resolve_all(&client, &arguments.references).await.expect("resolve");

    // THEN: One value per reference
    assert_eq!(values, vec!["secret", "secret"]);
    client.close().await;
}

/// **VALUE**: Verifies an engine failure stops resolution and surfaces the engine's error.
///
/// **WHY THIS MATTERS**: Printing partial output would silently drop a secret a script
/// depends on.
///
/// **BUG THIS CATCHES**: Would catch the failure being skipped over.
#[tokio::test]
async fn given_engine_error_when_resolving_all_then_returns_engine_error() {
    // GIVEN: A client on an engine that rejects every reference
    let engine = fixed_engine(r#"{"name":"InvalidUserInput","message":"bad reference"}"#, true);
    let client = token_arguments(&["vault/item"])
        .client_builder()
        .with_engine(engine)
        .build()
        .await
        .expect("client");

    // WHEN: Resolving
    let result = resolve_all(&client, &[String::from("vault/item")]).await;

    // THEN: The engine's error is returned
    match result {
        Err(ResolveError::Client(ClientError::Engine(EngineError::Engine { name, message, .. }))) => {
            assert_eq!(name.as_deref(), Some("InvalidUserInput"));
            assert_eq!(message, "bad reference");
        }
        other => panic!("expected the engine error, got {other:?}"),
    }
    client.close().await;
}
