//! Binding to the companion desktop app's shared library.

use super::MessageChannel;
use super::status::{PLATFORM_STATUS_TABLE, StatusTable};
use crate::error::engine::EngineError;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::{ptr, slice};

use const_format::concatcp;
use libloading::Library;
use log::{debug, info};

const LIBRARY_STEM: &str = "op_sdk_ipc_client";
#[cfg(not(target_os = "windows"))]
const UNIX_LIBRARY_STEM: &str = concatcp!("lib", LIBRARY_STEM);

const SEND_MESSAGE_SYMBOL: &[u8] = b"op_sdk_ipc_send_message\0";
const FREE_RESPONSE_SYMBOL: &[u8] = b"op_sdk_ipc_free_response\0";

pub(crate) const DESKTOP_APP_NOT_FOUND: &str = "1Password desktop application not found";

pub(crate) type SendMessageFn = unsafe extern "C" fn(
    msg_ptr: *const u8,
    msg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
    out_cap: *mut usize,
) -> i32;

pub(crate) type FreeResponseFn = unsafe extern "C" fn(ptr: *mut u8, len: usize, cap: usize);

/// Opened once per process and shared by every account-scoped backend.
static LOADED_LIBRARY: Mutex<Option<Arc<NativeLibrary>>> = Mutex::new(None);

/// Well-known install locations, in search order.
pub fn default_library_locations() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_default();

    #[cfg(target_os = "macos")]
    {
        let framework = concatcp!("1Password.app/Contents/Frameworks/", UNIX_LIBRARY_STEM, ".dylib");
        vec![
            Path::new("/Applications").join(framework),
            home.join("Applications").join(framework),
        ]
    }

    #[cfg(target_os = "linux")]
    {
        let _ = home;
        let file = concatcp!(UNIX_LIBRARY_STEM, ".so");
        vec![
            Path::new("/usr/bin/1password").join(file),
            Path::new("/opt/1Password").join(file),
            Path::new("/snap/bin/1password").join(file),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        let file = concatcp!(LIBRARY_STEM, ".dll");
        let local = home.join("AppData").join("Local").join("1Password");
        vec![
            local.join(file),
            Path::new(r"C:\Program Files\1Password\app\8").join(file),
            Path::new(r"C:\Program Files (x86)\1Password\app\8").join(file),
            local.join("app").join("8").join(file),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        let _ = home;
        Vec::new()
    }
}

/// First existing candidate, trying `explicit` before the per-OS locations.
pub fn find_library(explicit: Option<&Path>) -> Result<PathBuf, EngineError> {
    explicit
        .map(Path::to_path_buf)
        .into_iter()
        .chain(default_library_locations())
        .find(|candidate| {
            let exists = candidate.is_file();
            debug!("Desktop library candidate {:?}: {}", candidate, if exists { "found" } else { "missing" });
            exists
        })
        .ok_or_else(|| EngineError::unavailable(DESKTOP_APP_NOT_FOUND))
}

/// Open the companion library, reusing the process-wide handle when one is loaded.
pub(crate) fn shared_library(explicit: Option<&Path>) -> Result<Arc<NativeLibrary>, EngineError> {
    let mut loaded = LOADED_LIBRARY
        .lock()
        .map_err(|_| EngineError::invariant("desktop library cache lock poisoned"))?;

    if let Some(library) = loaded.as_ref() {
        return Ok(Arc::clone(library));
    }

    let path = find_library(explicit)?;
    let library = Arc::new(NativeLibrary::open(&path)?);
    *loaded = Some(Arc::clone(&library));
    Ok(library)
}

pub(crate) struct NativeLibrary {
    send_message: SendMessageFn,
    free_response: FreeResponseFn,
    status_table: StatusTable,
    // Keeps the symbols above valid; `None` when they are plain functions.
    _library: Option<Library>,
}

impl NativeLibrary {
    pub(crate) fn open(path: &Path) -> Result<Self, EngineError> {
        // SAFETY: loading runs the library's initialisers; the companion app ships it
        // for exactly this purpose.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            EngineError::unavailable(format!("{DESKTOP_APP_NOT_FOUND}: failed to open {}: {e}", path.display()))
        })?;

        // SAFETY: the signatures match the companion library's exported C ABI.
        let send_message = unsafe { library.get::<SendMessageFn>(SEND_MESSAGE_SYMBOL) }
            .map(|symbol| *symbol)
            .map_err(|e| {
                EngineError::unavailable(format!("{DESKTOP_APP_NOT_FOUND}: missing send_message: {e}"))
            })?;
        // SAFETY: as above.
        let free_response = unsafe { library.get::<FreeResponseFn>(FREE_RESPONSE_SYMBOL) }
            .map(|symbol| *symbol)
            .map_err(|e| {
                EngineError::unavailable(format!("{DESKTOP_APP_NOT_FOUND}: missing free_response: {e}"))
            })?;

        info!("Loaded desktop app library from {}", path.display());

        Ok(Self {
            send_message,
            free_response,
            status_table: PLATFORM_STATUS_TABLE,
            _library: Some(library),
        })
    }

    /// Bind to entry points that live in this binary rather than a loaded library.
    #[cfg(test)]
    pub(crate) fn from_symbols(
        send_message: SendMessageFn,
        free_response: FreeResponseFn,
        status_table: StatusTable,
    ) -> Self {
        Self {
            send_message,
            free_response,
            status_table,
            _library: None,
        }
    }
}

/// Response buffer owned by the library, returned to it exactly once on drop.
struct OwnedResponse {
    ptr: *mut u8,
    len: usize,
    cap: usize,
    free: FreeResponseFn,
}

impl OwnedResponse {
    fn to_vec(&self) -> Vec<u8> {
        if self.ptr.is_null() || self.len == 0 {
            return Vec::new();
        }
        // SAFETY: the library reported `len` initialised bytes at `ptr`, valid until freed.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }.to_vec()
    }
}

impl Drop for OwnedResponse {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ptr/len/cap are exactly what send_message handed out, freed once.
            unsafe { (self.free)(self.ptr, self.len, self.cap) };
        }
    }
}

impl MessageChannel for NativeLibrary {
    fn send_message(&self, message: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut out_ptr: *mut u8 = ptr::null_mut();
        let mut out_len: usize = 0;
        let mut out_cap: usize = 0;

        // SAFETY: message outlives the call and the out-pointers reference live locals.
        let status = unsafe {
            (self.send_message)(
                message.as_ptr(),
                message.len(),
                &mut out_ptr,
                &mut out_len,
                &mut out_cap,
            )
        };

        let response = OwnedResponse {
            ptr: out_ptr,
            len: out_len,
            cap: out_cap,
            free: self.free_response,
        };

        match self.status_table.to_error(status) {
            Some(error) => Err(error),
            None => Ok(response.to_vec()),
        }
    }
}
