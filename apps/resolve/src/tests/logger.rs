// Unit tests for logger module initialization logic
// Tests focus on thread-safety and error handling

use crate::error::ResolveError;
use crate::logger::{LOG_FILE_NAME, file_dispatch, initialize};

use std::path::PathBuf;

/// **VALUE**: Verifies that calling initialize() multiple times doesn't panic or fail.
///
/// **WHY THIS MATTERS**: Logging may be initialised from more than one code path; a
/// second global logger registration would otherwise panic inside fern.
///
/// **BUG THIS CATCHES**: Would catch if the Once or AtomicBool guards are removed.
#[test]
fn given_logger_initialized_when_called_again_then_returns_ok() {
    // GIVEN: A valid temporary directory
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");

    // WHEN: Calling initialize twice
    let result1 = initialize(temp_dir.path());
    let result2 = initialize(temp_dir.path());

    // THEN: Both return Ok
    assert!(result1.is_ok(), "First initialization should succeed");
    assert!(result2.is_ok(), "Second initialization should succeed (idempotent)");
}

/// **VALUE**: Verifies an unwritable log directory is a clear error.
///
/// **WHY THIS MATTERS**: A bad `--log-dir` must not crash the binary with a panic.
///
/// **BUG THIS CATCHES**: Would catch `fern::log_file()` being unwrapped.
#[test]
fn given_invalid_log_dir_when_creating_file_output_then_returns_error() {
    // GIVEN: A path that cannot hold a file
    let invalid_dir = PathBuf::from("/dev/null/invalid-path");

    // WHEN: Creating the file output
    let result = file_dispatch(&invalid_dir);

    // THEN: A Resolve error is returned
    match result {
        Err(ResolveError::Resolve { message, .. }) => {
            assert!(message.starts_with("Failed to create log file"));
        }
        Err(other) => panic!("expected a Resolve error, got {other:?}"),
        Ok(_) => panic!("expected the log file creation to fail"),
    }
}

/// **VALUE**: Verifies the log file lands in the requested directory.
///
/// **WHY THIS MATTERS**: Users are told where to find logs when reporting problems.
///
/// **BUG THIS CATCHES**: Would catch the file name or directory being ignored.
#[test]
fn given_log_dir_when_creating_file_output_then_file_is_created() {
    // GIVEN: An empty directory
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");

    // WHEN: Creating the file output
    let result = file_dispatch(temp_dir.path());

    // THEN: The log file exists
    assert!(result.is_ok());
    assert!(temp_dir.path().join(LOG_FILE_NAME).is_file());
}
