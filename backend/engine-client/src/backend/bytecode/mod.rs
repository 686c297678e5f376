//! Engine compiled to WebAssembly, hosted in-process by wasmtime.
//!
//! The module is compiled and linked once ([`BytecodeBackend::load`]). Sessions then run
//! against either a dedicated instance each ([`Isolation::Spawned`]) or one instance
//! serving everyone ([`Isolation::Shared`]). In both modes the pool hands out the public
//! session ID and remembers the instance-local client ID the engine returned, rewriting
//! `clientId` on every routed call.
//!
//! Calls run on the blocking pool, each under its own [`CallScope`]. Cancellation sets
//! that call's interrupt flag; the next epoch tick traps the guest and the instance is
//! torn down.

pub mod host;
pub mod memory;

use crate::SessionId;
use crate::backend::{TransportCounter, run_blocking};
use crate::config::Isolation;
use crate::engine::pool::{InstancePool, SessionState};
use crate::error::engine::EngineError;
use crate::wire::{self, RoutedRequest};

use host::{CallScope, HostState, HttpBridge};
use memory::{CallOutcome, EntryPoint, GuestExports};

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use wasmtime::{Config, ExternType, InstancePre, Linker, Module, Store, Trap, UpdateDeadline};

const EPOCH_TICK: Duration = Duration::from_millis(10);

const REQUIRED_FUNCTION_EXPORTS: &[&str] = &[
    "allocate",
    "deallocate",
    "init_client",
    "invoke",
    "release_client",
];

/// Advances the engine epoch so interrupted guests trap promptly.
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: &wasmtime::Engine) -> Result<Self, EngineError> {
        let stop = Arc::new(AtomicBool::new(false));
        let engine = engine.clone();
        let stopped = Arc::clone(&stop);

        thread::Builder::new()
            .name(String::from("engine-epoch"))
            .spawn(move || {
                while !stopped.load(Ordering::Relaxed) {
                    thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| EngineError::unavailable(format!("failed to start epoch ticker: {e}")))?;

        Ok(Self { stop })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Compiled and linked module, shared by every instance.
struct LoadedModule {
    engine: wasmtime::Engine,
    pre: InstancePre<HostState>,
    http: HttpBridge,
    _ticker: EpochTicker,
}

/// One running copy of the engine.
pub(crate) struct GuestInstance {
    store: Store<HostState>,
    exports: GuestExports,
    /// Instance-local client ID, set for dedicated instances once `init_client` ran.
    local_id: Option<SessionId>,
    poisoned: bool,
}

impl GuestInstance {
    fn spawn(module: &LoadedModule, scope: &CallScope) -> Result<Self, EngineError> {
        let mut store = Store::new(
            &module.engine,
            HostState {
                http: module.http.clone(),
                call: scope.clone(),
            },
        );

        store.epoch_deadline_callback(|context| {
            if context.data().call.is_interrupted() {
                Err(Trap::Interrupt.into())
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });
        store.set_epoch_deadline(1);

        let instance = module
            .pre
            .instantiate(&mut store)
            .map_err(|e| EngineError::unavailable(format!("failed to instantiate engine: {e:#}")))?;
        let exports = GuestExports::resolve(&instance, &mut store)?;

        store.data_mut().call = CallScope::default();

        Ok(Self {
            store,
            exports,
            local_id: None,
            poisoned: false,
        })
    }

    fn call(&mut self, entry: EntryPoint, input: &[u8], scope: &CallScope) -> Result<Vec<u8>, EngineError> {
        if self.poisoned {
            return Err(EngineError::transport("engine instance was torn down"));
        }

        self.store.data_mut().call = scope.clone();
        let result = memory::call_entry_point(&mut self.store, &self.exports, entry, input);
        self.store.data_mut().call = CallScope::default();

        match result {
            Ok(CallOutcome::Output(output)) => Ok(output),
            Ok(CallOutcome::Failed(payload)) => Err(EngineError::from_engine_payload(&payload)),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    fn init_client(&mut self, config: &[u8], scope: &CallScope) -> Result<SessionId, EngineError> {
        let output = self.call(EntryPoint::InitClient, config, scope)?;
        wire::decode_session_id(&output)
    }

    fn invoke(&mut self, request: &[u8], scope: &CallScope) -> Result<Vec<u8>, EngineError> {
        self.call(EntryPoint::Invoke, request, scope)
    }

    fn release_client(&mut self, local_id: SessionId, scope: &CallScope) -> Result<(), EngineError> {
        let input = wire::encode_session_id(local_id)?;
        self.call(EntryPoint::ReleaseClient, &input, scope).map(|_| ())
    }
}

/// Single instance used in shared mode. Replaced wholesale after a teardown.
struct SharedSlot {
    instance: Option<GuestInstance>,
    generation: u64,
}

impl SharedSlot {
    fn ensure_instance(
        &mut self,
        module: &LoadedModule,
        scope: &CallScope,
    ) -> Result<&mut GuestInstance, EngineError> {
        if self.instance.as_ref().is_some_and(|instance| instance.poisoned) {
            warn!(
                "Shared engine instance generation {} was torn down, starting a fresh one",
                self.generation
            );
            self.instance = None;
        }

        if self.instance.is_none() {
            self.instance = Some(GuestInstance::spawn(module, scope)?);
            self.generation += 1;
        }

        self.instance
            .as_mut()
            .ok_or_else(|| EngineError::invariant("shared engine instance missing after spawn"))
    }

    fn healthy_generation(&self) -> Option<u64> {
        self.instance
            .as_ref()
            .filter(|instance| !instance.poisoned)
            .map(|_| self.generation)
    }
}

#[derive(Clone)]
enum Binding {
    Dedicated(Arc<Mutex<GuestInstance>>),
    Shared { local_id: SessionId, generation: u64 },
}

/// Engine hosted in-process by wasmtime.
///
/// The module is compiled once per backend; [`Isolation`] decides how sessions map onto
/// instances of it.
pub struct BytecodeBackend {
    module: Arc<LoadedModule>,
    isolation: Isolation,
    pool: InstancePool<Binding>,
    shared: Arc<Mutex<SharedSlot>>,
    calls: TransportCounter,
}

impl BytecodeBackend {
    /// Compile `module_bytes` (binary or text format) and link the host callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unavailable`] when the module does not compile, lacks a
    /// required export, or imports something the host does not provide.
    pub fn load(
        module_bytes: &[u8],
        isolation: Isolation,
        allowed_hosts: &[String],
    ) -> Result<Self, EngineError> {
        let mut config = Config::new();
        config.epoch_interruption(true);

        let engine = wasmtime::Engine::new(&config)
            .map_err(|e| EngineError::unavailable(format!("failed to create VM: {e:#}")))?;

        let module = Module::new(&engine, module_bytes)
            .map_err(|e| EngineError::unavailable(format!("failed to compile engine module: {e:#}")))?;
        verify_exports(&module)?;

        let mut linker = Linker::new(&engine);
        host::link_host_functions(&mut linker)?;
        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| EngineError::unavailable(format!("failed to link engine module: {e:#}")))?;

        let http = HttpBridge::new(allowed_hosts)?;
        let ticker = EpochTicker::start(&engine)?;

        info!("Loaded bytecode engine ({isolation:?} isolation)");

        Ok(Self {
            module: Arc::new(LoadedModule {
                engine,
                pre,
                http,
                _ticker: ticker,
            }),
            isolation,
            pool: InstancePool::new(),
            shared: Arc::new(Mutex::new(SharedSlot {
                instance: None,
                generation: 0,
            })),
            calls: TransportCounter::default(),
        })
    }

    /// [`BytecodeBackend::load`] for a module on disk.
    pub fn load_file(
        path: &Path,
        isolation: Isolation,
        allowed_hosts: &[String],
    ) -> Result<Self, EngineError> {
        let bytes = std::fs::read(path).map_err(|e| {
            EngineError::unavailable(format!("failed to read engine module {}: {e}", path.display()))
        })?;
        Self::load(&bytes, isolation, allowed_hosts)
    }

    /// How sessions map onto instances for this backend.
    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub(crate) fn session_state(&self, session_id: SessionId) -> Option<SessionState> {
        self.pool.state(session_id)
    }

    pub(crate) fn transport_calls(&self) -> u64 {
        self.calls.get()
    }

    pub(crate) async fn init_client(
        &self,
        config: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<SessionId, EngineError> {
        match self.isolation {
            Isolation::Spawned => self.init_dedicated(config, cancel).await,
            Isolation::Shared => self.init_shared(config, cancel).await,
        }
    }

    /// The public ID is reserved only once the instance is up, so failed or cancelled
    /// attempts leave no gap in the sequence.
    async fn init_dedicated(
        &self,
        config: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<SessionId, EngineError> {
        let module = Arc::clone(&self.module);
        let scope = CallScope::current();
        let worker_scope = scope.clone();

        self.calls.record();
        let instance = run_blocking(
            cancel,
            "init_client",
            move || {
                let mut instance = GuestInstance::spawn(&module, &worker_scope)?;
                instance.local_id = Some(instance.init_client(&config, &worker_scope)?);
                Ok(instance)
            },
            || scope.interrupt(),
        )
        .await?;

        let session_id = self.pool.reserve_next()?;
        self.pool
            .activate(session_id, Binding::Dedicated(Arc::new(Mutex::new(instance))))?;
        debug!("Spawned engine instance for session {session_id}");
        Ok(session_id)
    }

    async fn init_shared(
        &self,
        config: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<SessionId, EngineError> {
        let mut slot = lock_or_cancel(&self.shared, cancel, "init_client").await?;
        let module = Arc::clone(&self.module);
        let scope = CallScope::current();
        let worker_scope = scope.clone();

        self.calls.record();
        let (local_id, generation) = run_blocking(
            cancel,
            "init_client",
            move || {
                let local_id = slot
                    .ensure_instance(&module, &worker_scope)?
                    .init_client(&config, &worker_scope)?;
                Ok((local_id, slot.generation))
            },
            || scope.interrupt(),
        )
        .await?;

        let session_id = self.pool.reserve_next()?;
        self.pool
            .activate(session_id, Binding::Shared { local_id, generation })?;
        debug!("Registered session {session_id} on shared engine instance (local {local_id})");
        Ok(session_id)
    }

    pub(crate) async fn invoke(
        &self,
        session_id: Option<SessionId>,
        request: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        let Some(session_id) = session_id else {
            return self.invoke_ambient(request, cancel).await;
        };

        match self.pool.checkout(session_id)? {
            Binding::Dedicated(instance) => {
                let mut guard = lock_or_cancel(&instance, cancel, "invoke").await?;
                let request = RoutedRequest::decode(&request)?.encode_for(guard.local_id)?;
                let scope = CallScope::current();
                let worker_scope = scope.clone();

                self.calls.record();
                let result = run_blocking(
                    cancel,
                    "invoke",
                    move || guard.invoke(&request, &worker_scope),
                    || scope.interrupt(),
                )
                .await;

                if let Err(e) = &result
                    && !matches!(e, EngineError::Engine { .. } | EngineError::SessionExpired { .. })
                {
                    warn!(
                        "Tearing down engine instance for session {session_id} ({})",
                        e.error_category()
                    );
                    // The instance is unusable; its worker drops it once the trap unwinds.
                    let _ = self.pool.release(session_id);
                }
                result
            }
            Binding::Shared { local_id, generation } => {
                let mut slot = lock_or_cancel(&self.shared, cancel, "invoke").await?;
                if slot.healthy_generation() != Some(generation) {
                    let _ = self.pool.release(session_id);
                    return Err(EngineError::invalid_session(session_id));
                }

                let request = RoutedRequest::decode(&request)?.encode_for(Some(local_id))?;
                let module = Arc::clone(&self.module);
                let scope = CallScope::current();
                let worker_scope = scope.clone();

                self.calls.record();
                run_blocking(
                    cancel,
                    "invoke",
                    move || {
                        slot.ensure_instance(&module, &worker_scope)?
                            .invoke(&request, &worker_scope)
                    },
                    || scope.interrupt(),
                )
                .await
            }
        }
    }

    /// Session-less call: a throwaway instance in spawned mode, the shared instance otherwise.
    async fn invoke_ambient(
        &self,
        request: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, EngineError> {
        match self.isolation {
            Isolation::Spawned => {
                let module = Arc::clone(&self.module);
                let scope = CallScope::current();
                let worker_scope = scope.clone();

                self.calls.record();
                run_blocking(
                    cancel,
                    "invoke",
                    move || GuestInstance::spawn(&module, &worker_scope)?.invoke(&request, &worker_scope),
                    || scope.interrupt(),
                )
                .await
            }
            Isolation::Shared => {
                let mut slot = lock_or_cancel(&self.shared, cancel, "invoke").await?;
                let module = Arc::clone(&self.module);
                let scope = CallScope::current();
                let worker_scope = scope.clone();

                self.calls.record();
                run_blocking(
                    cancel,
                    "invoke",
                    move || {
                        slot.ensure_instance(&module, &worker_scope)?
                            .invoke(&request, &worker_scope)
                    },
                    || scope.interrupt(),
                )
                .await
            }
        }
    }

    pub(crate) async fn release_client(&self, session_id: SessionId) -> Result<(), EngineError> {
        let Some(binding) = self.pool.release(session_id)? else {
            debug!("Session {session_id} already released");
            return Ok(());
        };

        let cancel = CancellationToken::new();
        match binding {
            Binding::Dedicated(instance) => {
                let mut guard = instance.lock_owned().await;
                let Some(local_id) = guard.local_id else {
                    return Ok(());
                };
                if guard.poisoned {
                    return Ok(());
                }

                let scope = CallScope::current();
                self.calls.record();
                run_blocking(
                    &cancel,
                    "release_client",
                    move || guard.release_client(local_id, &scope),
                    || {},
                )
                .await
            }
            Binding::Shared { local_id, generation } => {
                let mut slot = Arc::clone(&self.shared).lock_owned().await;
                if slot.healthy_generation() != Some(generation) {
                    return Ok(());
                }

                let module = Arc::clone(&self.module);
                let scope = CallScope::current();
                self.calls.record();
                run_blocking(
                    &cancel,
                    "release_client",
                    move || {
                        slot.ensure_instance(&module, &scope)?
                            .release_client(local_id, &scope)
                    },
                    || {},
                )
                .await
            }
        }
    }
}

async fn lock_or_cancel<T>(
    mutex: &Arc<Mutex<T>>,
    cancel: &CancellationToken,
    operation: &'static str,
) -> Result<OwnedMutexGuard<T>, EngineError> {
    tokio::select! {
        guard = Arc::clone(mutex).lock_owned() => Ok(guard),
        _ = cancel.cancelled() => Err(EngineError::cancelled(operation)),
    }
}

fn verify_exports(module: &Module) -> Result<(), EngineError> {
    let has_memory = module
        .exports()
        .any(|export| export.name() == "memory" && matches!(export.ty(), ExternType::Memory(_)));
    if !has_memory {
        return Err(EngineError::unavailable("engine module does not export 'memory'"));
    }

    for name in REQUIRED_FUNCTION_EXPORTS {
        let exported = module
            .exports()
            .any(|export| export.name() == *name && matches!(export.ty(), ExternType::Func(_)));
        if !exported {
            return Err(EngineError::unavailable(format!(
                "engine module does not export function '{name}'"
            )));
        }
    }

    Ok(())
}
