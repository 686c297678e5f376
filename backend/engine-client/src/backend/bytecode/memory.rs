//! Buffer marshaling across the guest boundary.
//!
//! Every entry point has the shape
//! `fn(in_ptr, in_len, err_flag_ptr, out_ptr_ptr, out_len_ptr)`. The host allocates the
//! input buffer and three 4-byte cells inside guest memory, calls the entry point, and
//! reads the cells back as little-endian `u32`s. Every buffer touched by a call (input,
//! cells and the guest's output) is handed back to `deallocate` on every exit path;
//! [`call_entry_point`] is the only place this sequence is written.

use super::host::HostState;
use crate::error::engine::EngineError;

use log::warn;
use wasmtime::{Instance, Memory, Store, Trap, TypedFunc};

const CELL_SIZE: usize = 4;

type EntryPointFunc = TypedFunc<(i32, i32, i32, i32, i32), ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryPoint {
    InitClient,
    Invoke,
    ReleaseClient,
}

impl EntryPoint {
    pub(crate) const fn export_name(self) -> &'static str {
        match self {
            EntryPoint::InitClient => "init_client",
            EntryPoint::Invoke => "invoke",
            EntryPoint::ReleaseClient => "release_client",
        }
    }
}

/// Result of an entry point that ran to completion.
#[derive(Debug)]
pub(crate) enum CallOutcome {
    Output(Vec<u8>),
    /// Error flag was set; bytes are the engine's error payload.
    Failed(Vec<u8>),
}

pub(crate) struct GuestExports {
    memory: Memory,
    allocate: TypedFunc<i32, i32>,
    deallocate: TypedFunc<(i32, i32), ()>,
    init_client: EntryPointFunc,
    invoke: EntryPointFunc,
    release_client: EntryPointFunc,
}

impl GuestExports {
    pub(crate) fn resolve(
        instance: &Instance,
        store: &mut Store<HostState>,
    ) -> Result<Self, EngineError> {
        let missing = |name: &str, e: wasmtime::Error| {
            EngineError::unavailable(format!("engine export '{name}' has the wrong signature: {e}"))
        };

        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| EngineError::unavailable("engine module does not export its memory"))?;

        let allocate = instance
            .get_typed_func::<i32, i32>(&mut *store, "allocate")
            .map_err(|e| missing("allocate", e))?;
        let deallocate = instance
            .get_typed_func::<(i32, i32), ()>(&mut *store, "deallocate")
            .map_err(|e| missing("deallocate", e))?;

        let mut entry_point = |entry: EntryPoint| {
            instance
                .get_typed_func::<(i32, i32, i32, i32, i32), ()>(&mut *store, entry.export_name())
                .map_err(|e| missing(entry.export_name(), e))
        };

        Ok(Self {
            memory,
            allocate,
            deallocate,
            init_client: entry_point(EntryPoint::InitClient)?,
            invoke: entry_point(EntryPoint::Invoke)?,
            release_client: entry_point(EntryPoint::ReleaseClient)?,
        })
    }

    fn entry_point(&self, entry: EntryPoint) -> &EntryPointFunc {
        match entry {
            EntryPoint::InitClient => &self.init_client,
            EntryPoint::Invoke => &self.invoke,
            EntryPoint::ReleaseClient => &self.release_client,
        }
    }
}

/// Guest allocations made during one call, freed together.
#[derive(Default)]
struct Allocations {
    buffers: Vec<(i32, i32)>,
}

impl Allocations {
    fn allocate(
        &mut self,
        store: &mut Store<HostState>,
        exports: &GuestExports,
        length: usize,
    ) -> Result<usize, EngineError> {
        if length == 0 {
            return Ok(0);
        }

        let guest_length = guest_length(length)?;
        let ptr = exports
            .allocate
            .call(&mut *store, guest_length)
            .map_err(trap_error)?;

        if ptr == 0 {
            return Err(EngineError::transport(format!(
                "engine failed to allocate {length} bytes"
            )));
        }

        self.buffers.push((ptr, guest_length));
        Ok(guest_offset(ptr))
    }

    /// Take ownership of a buffer the guest allocated for its output.
    fn adopt(&mut self, ptr: u32, length: u32) {
        if ptr != 0 && length != 0 {
            self.buffers.push((ptr as i32, length as i32));
        }
    }

    fn free_all(self, store: &mut Store<HostState>, exports: &GuestExports) -> Result<(), EngineError> {
        let mut first_error = None;

        for (ptr, length) in self.buffers.into_iter().rev() {
            if let Err(e) = exports.deallocate.call(&mut *store, (ptr, length)) {
                warn!("Failed to free {length} bytes of engine memory at {ptr}: {e}");
                first_error.get_or_insert(trap_error(e));
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Call `entry` with `input`, returning the engine's output or error payload.
///
/// # Errors
///
/// Returns [`EngineError::Transport`] when the guest traps or cannot allocate,
/// [`EngineError::Cancelled`] when the call was interrupted, and
/// [`EngineError::InvariantViolation`] when a pointer the guest handed back lies outside
/// its memory.
pub(crate) fn call_entry_point(
    store: &mut Store<HostState>,
    exports: &GuestExports,
    entry: EntryPoint,
    input: &[u8],
) -> Result<CallOutcome, EngineError> {
    let mut allocations = Allocations::default();

    let outcome = call_with(store, exports, entry, input, &mut allocations);
    let freed = allocations.free_all(store, exports);

    let outcome = outcome?;
    freed?;
    Ok(outcome)
}

fn call_with(
    store: &mut Store<HostState>,
    exports: &GuestExports,
    entry: EntryPoint,
    input: &[u8],
    allocations: &mut Allocations,
) -> Result<CallOutcome, EngineError> {
    let input_ptr = allocations.allocate(store, exports, input.len())?;
    write(store, exports.memory, input_ptr, input)?;

    let err_flag_ptr = allocations.allocate(store, exports, CELL_SIZE)?;
    let out_ptr_ptr = allocations.allocate(store, exports, CELL_SIZE)?;
    let out_len_ptr = allocations.allocate(store, exports, CELL_SIZE)?;
    for cell in [err_flag_ptr, out_ptr_ptr, out_len_ptr] {
        write(store, exports.memory, cell, &0u32.to_le_bytes())?;
    }

    exports
        .entry_point(entry)
        .call(
            &mut *store,
            (
                input_ptr as i32,
                guest_length(input.len())?,
                err_flag_ptr as i32,
                out_ptr_ptr as i32,
                out_len_ptr as i32,
            ),
        )
        .map_err(trap_error)?;

    let err_flag = read_cell(store, exports.memory, err_flag_ptr)?;
    let out_ptr = read_cell(store, exports.memory, out_ptr_ptr)?;
    let out_len = read_cell(store, exports.memory, out_len_ptr)?;

    // The length is guest-controlled; size the host buffer only once it fits in memory.
    let memory_size = exports.memory.data_size(&*store);
    let in_bounds = (out_ptr as usize)
        .checked_add(out_len as usize)
        .is_some_and(|end| end <= memory_size);
    if out_len != 0 && !in_bounds {
        return Err(EngineError::invariant(format!(
            "{} returned {out_len} bytes at {out_ptr}, outside {memory_size} bytes of engine memory",
            entry.export_name()
        )));
    }
    allocations.adopt(out_ptr, out_len);

    let mut output = vec![0u8; out_len as usize];
    if !output.is_empty() {
        exports
            .memory
            .read(&*store, out_ptr as usize, &mut output)
            .map_err(|e| {
                EngineError::invariant(format!(
                    "{} returned {out_len} bytes at {out_ptr}, outside engine memory: {e}",
                    entry.export_name()
                ))
            })?;
    }

    if err_flag != 0 {
        Ok(CallOutcome::Failed(output))
    } else {
        Ok(CallOutcome::Output(output))
    }
}

fn write(
    store: &mut Store<HostState>,
    memory: Memory,
    offset: usize,
    bytes: &[u8],
) -> Result<(), EngineError> {
    if bytes.is_empty() {
        return Ok(());
    }
    memory.write(&mut *store, offset, bytes).map_err(|e| {
        EngineError::invariant(format!(
            "write of {} bytes at {offset} is outside engine memory: {e}",
            bytes.len()
        ))
    })
}

fn read_cell(store: &Store<HostState>, memory: Memory, offset: usize) -> Result<u32, EngineError> {
    let mut cell = [0u8; CELL_SIZE];
    memory
        .read(store, offset, &mut cell)
        .map_err(|e| EngineError::invariant(format!("scratch cell at {offset} is unreadable: {e}")))?;
    Ok(u32::from_le_bytes(cell))
}

fn guest_length(length: usize) -> Result<i32, EngineError> {
    i32::try_from(length)
        .map_err(|_| EngineError::message_too_large(length, i32::MAX as usize))
}

fn guest_offset(ptr: i32) -> usize {
    ptr as u32 as usize
}

/// Map a wasmtime failure; an interrupted call means the caller cancelled.
pub(crate) fn trap_error(error: wasmtime::Error) -> EngineError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => EngineError::cancelled("engine call"),
        _ => EngineError::transport(format!("engine call trapped: {error:#}")),
    }
}
