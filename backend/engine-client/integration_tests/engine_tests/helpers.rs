//! Test helpers for engine integration tests.
//!
//! This module provides:
//! - Small engine modules in WebAssembly text format exercising the guest ABI
//! - Config and engine constructors shared across test files

use engine_client::backend::BytecodeBackend;
use engine_client::{ClientConfig, Credential, Engine, Isolation};

use common::RedactedToken;

use std::sync::Arc;

pub const TEST_TOKEN: &str = "ops_integration_test_token";

/// Bump allocator shared by every fixture. Memory below 1024 holds data segments;
/// `deallocate` is a no-op.
const ALLOCATOR: &str = r#"
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 1024))

  (func $allocate (export "allocate") (param $len i32) (result i32)
    (local $ptr i32) (local $end i32) (local $capacity i32)
    global.get $heap
    local.set $ptr
    local.get $ptr
    local.get $len
    i32.add
    i32.const 7
    i32.add
    i32.const -8
    i32.and
    local.set $end
    memory.size
    i32.const 16
    i32.shl
    local.set $capacity
    local.get $end
    local.get $capacity
    i32.gt_u
    if
      local.get $end
      local.get $capacity
      i32.sub
      i32.const 16
      i32.shr_u
      i32.const 1
      i32.add
      memory.grow
      i32.const -1
      i32.eq
      if
        i32.const 0
        return
      end
    end
    local.get $end
    global.set $heap
    local.get $ptr)

  (func (export "deallocate") (param i32 i32))

  (func $write_number (param $n i32) (param $out i32) (param $out_len i32)
    (local $buf i32) (local $len i32) (local $tmp i32) (local $i i32)
    local.get $n
    local.set $tmp
    i32.const 1
    local.set $len
    (block $counted
      (loop $count
        local.get $tmp
        i32.const 10
        i32.lt_u
        br_if $counted
        local.get $tmp
        i32.const 10
        i32.div_u
        local.set $tmp
        local.get $len
        i32.const 1
        i32.add
        local.set $len
        br $count))
    local.get $len
    call $allocate
    local.set $buf
    local.get $len
    local.set $i
    (loop $fill
      local.get $i
      i32.const 1
      i32.sub
      local.set $i
      local.get $buf
      local.get $i
      i32.add
      local.get $n
      i32.const 10
      i32.rem_u
      i32.const 48
      i32.add
      i32.store8
      local.get $n
      i32.const 10
      i32.div_u
      local.set $n
      local.get $i
      br_if $fill)
    local.get $out
    local.get $buf
    i32.store
    local.get $out_len
    local.get $len
    i32.store)

  (global $next_client (mut i32) (i32.const 0))

  (func $next_client_id (param $out i32) (param $out_len i32)
    global.get $next_client
    local.get $out
    local.get $out_len
    call $write_number
    global.get $next_client
    i32.const 1
    i32.add
    global.set $next_client)

  (func (export "release_client") (param i32 i32 i32 i32 i32))
"#;

/// `init_client` numbering clients from 0 within one instance.
const COUNTING_INIT: &str = r#"
  (func (export "init_client") (param $in i32) (param $len i32) (param $err i32) (param $out i32) (param $out_len i32)
    local.get $out
    local.get $out_len
    call $next_client_id)
"#;

/// `invoke` returning the routed request unchanged.
const ECHO_INVOKE: &str = r#"
  (func (export "invoke") (param $in i32) (param $len i32) (param $err i32) (param $out i32) (param $out_len i32)
    (local $buf i32)
    local.get $len
    call $allocate
    local.set $buf
    local.get $buf
    local.get $in
    local.get $len
    memory.copy
    local.get $out
    local.get $buf
    i32.store
    local.get $out_len
    local.get $len
    i32.store)
"#;

/// Token character that [`selective_init_engine`] refuses.
pub const REJECTED_TOKEN_MARKER: char = '!';

fn module_with(body: &str) -> String {
    format!("(module\n{body}\n{ALLOCATOR}\n{COUNTING_INIT}\n)")
}

/// Escape `text` for a WebAssembly text-format string literal.
fn wat_string(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Engine whose `invoke` returns the routed request unchanged.
pub fn echo_engine() -> String {
    module_with(ECHO_INVOKE)
}

/// Echo engine whose `init_client` fails for any config containing
/// [`REJECTED_TOKEN_MARKER`].
pub fn selective_init_engine() -> String {
    format!(
        r#"(module
{ALLOCATOR}
  (data (i32.const 16) "config rejected")
  (func (export "init_client") (param $in i32) (param $len i32) (param $err i32) (param $out i32) (param $out_len i32)
    (local $i i32)
    (block $clean
      (loop $scan
        local.get $i
        local.get $len
        i32.ge_u
        br_if $clean
        local.get $in
        local.get $i
        i32.add
        i32.load8_u
        i32.const {marker}
        i32.eq
        if
          local.get $err
          i32.const 1
          i32.store
          local.get $out
          i32.const 16
          i32.store
          local.get $out_len
          i32.const 15
          i32.store
          return
        end
        local.get $i
        i32.const 1
        i32.add
        local.set $i
        br $scan))
    local.get $out
    local.get $out_len
    call $next_client_id)
{ECHO_INVOKE}
)"#,
        marker = u32::from(REJECTED_TOKEN_MARKER),
    )
}

/// Engine whose `invoke` always succeeds with `response` (a JSON document).
pub fn fixed_response_engine(response: &str) -> String {
    module_with(&format!(
        r#"
  (data (i32.const 16) "{data}")
  (func (export "invoke") (param $in i32) (param $len i32) (param $err i32) (param $out i32) (param $out_len i32)
    local.get $out
    i32.const 16
    i32.store
    local.get $out_len
    i32.const {len}
    i32.store)
"#,
        data = wat_string(response),
        len = response.len(),
    ))
}

/// Engine whose `invoke` reports an output length far past the end of its memory.
pub fn oversized_output_engine() -> String {
    module_with(
        r#"
  (func (export "invoke") (param $in i32) (param $len i32) (param $err i32) (param $out i32) (param $out_len i32)
    local.get $out
    i32.const 16
    i32.store
    local.get $out_len
    i32.const -16
    i32.store)
"#,
    )
}

/// Service account config whose token [`selective_init_engine`] refuses.
pub fn rejected_config() -> ClientConfig {
    let token = format!("{TEST_TOKEN}{REJECTED_TOKEN_MARKER}");
    ClientConfig::new(
        Credential::ServiceAccount(RedactedToken::new(token)),
        "Engine Integration Tests",
        "1.0.0",
    )
    .expect("Failed to build rejected config")
}

/// Engine whose `invoke` always sets the error flag with `payload`.
pub fn failing_engine(payload: &str) -> String {
    module_with(&format!(
        r#"
  (data (i32.const 16) "{data}")
  (func (export "invoke") (param $in i32) (param $len i32) (param $err i32) (param $out i32) (param $out_len i32)
    local.get $err
    i32.const 1
    i32.store
    local.get $out
    i32.const 16
    i32.store
    local.get $out_len
    i32.const {len}
    i32.store)
"#,
        data = wat_string(payload),
        len = payload.len(),
    ))
}

/// Engine whose `invoke` never returns on its own.
pub fn spinning_engine() -> String {
    module_with(
        r#"
  (func (export "invoke") (param $in i32) (param $len i32) (param $err i32) (param $out i32) (param $out_len i32)
    (loop $spin
      br $spin))
"#,
    )
}

/// Engine whose `invoke` draws 32 random bytes and checks the clock.
///
/// Output is the random bytes mapped onto `a..=p`. If the host clock reads before
/// 2020 the error flag is set instead.
pub fn host_callback_engine() -> String {
    module_with(
        r#"
  (import "engine-host" "random_fill" (func $random_fill (param i32) (result i32)))
  (import "engine-host" "unix_time_milliseconds" (func $now (result i64)))

  (data (i32.const 16) "clock")

  (func (export "invoke") (param $in i32) (param $len i32) (param $err i32) (param $out i32) (param $out_len i32)
    (local $buf i32) (local $i i32)
    call $now
    i64.const 1577836800000
    i64.lt_s
    if
      local.get $err
      i32.const 1
      i32.store
      local.get $out
      i32.const 16
      i32.store
      local.get $out_len
      i32.const 5
      i32.store
      return
    end
    i32.const 32
    call $random_fill
    local.set $buf
    (loop $map
      local.get $buf
      local.get $i
      i32.add
      local.get $buf
      local.get $i
      i32.add
      i32.load8_u
      i32.const 15
      i32.and
      i32.const 97
      i32.add
      i32.store8
      local.get $i
      i32.const 1
      i32.add
      local.tee $i
      i32.const 32
      i32.lt_u
      br_if $map)
    local.get $out
    local.get $buf
    i32.store
    local.get $out_len
    i32.const 32
    i32.store)
"#,
    )
}

/// Engine whose `invoke` issues the HTTP request `request` through the host bridge and
/// returns the bridge's outcome.
pub fn http_fetch_engine(request: &str) -> String {
    module_with(&format!(
        r#"
  (import "engine-host" "http_get" (func $http_get (param i32 i32 i32) (result i32)))

  (data (i32.const 16) "{data}")

  (func (export "invoke") (param $in i32) (param $len i32) (param $err i32) (param $out i32) (param $out_len i32)
    local.get $out
    i32.const 16
    i32.const {len}
    local.get $out_len
    call $http_get
    i32.store)
"#,
        data = wat_string(request),
        len = request.len(),
    ))
}

/// Module exporting memory and an allocator but no entry points.
pub fn incomplete_engine() -> String {
    String::from(
        r#"(module
  (memory (export "memory") 1)
  (func (export "allocate") (param i32) (result i32) i32.const 1024)
  (func (export "deallocate") (param i32 i32)))"#,
    )
}

pub fn load_engine(wat: &str, isolation: Isolation) -> Arc<Engine> {
    load_engine_with_hosts(wat, isolation, &["*.1password.com"])
}

pub fn load_engine_with_hosts(wat: &str, isolation: Isolation, hosts: &[&str]) -> Arc<Engine> {
    let hosts: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let backend = BytecodeBackend::load(wat.as_bytes(), isolation, &hosts)
        .expect("Failed to load test engine");
    Arc::new(Engine::Bytecode(backend))
}

pub fn service_account_config() -> ClientConfig {
    ClientConfig::new(
        Credential::ServiceAccount(RedactedToken::new(TEST_TOKEN)),
        "Engine Integration Tests",
        "1.0.0",
    )
    .expect("Failed to build test config")
}
