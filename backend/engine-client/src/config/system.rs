use log::trace;
use sysinfo::System;

pub const OS: &str = std::env::consts::OS;
pub const ARCHITECTURE: &str = std::env::consts::ARCH;

pub const DEFAULT_OS_VERSION: &str = "0.0.0";

/// Version of the running operating system, or [`DEFAULT_OS_VERSION`] when the
/// platform does not report one.
pub fn os_version() -> String {
    match System::os_version() {
        Some(version) if !version.trim().is_empty() => version.trim().to_string(),
        _ => {
            trace!("OS version unavailable, using {DEFAULT_OS_VERSION}");
            String::from(DEFAULT_OS_VERSION)
        }
    }
}
