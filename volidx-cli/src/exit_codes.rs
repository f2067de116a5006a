//! Exit codes following sysexits.h conventions.
//!
//! These codes provide semantic meaning for different failure modes,
//! enabling pipelines and batch schedulers to handle errors appropriately.

use std::io::ErrorKind;

use volidx_core::VolumeIndexError;

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// General error (catch-all).
pub const GENERAL_ERROR: i32 = 1;

/// Command line usage error (missing or invalid arguments).
/// Maps to EX_USAGE from sysexits.h.
pub const USAGE_ERROR: i32 = 64;

/// Data format error (malformed specification, corrupt or incompatible index).
/// Maps to EX_DATAERR from sysexits.h.
pub const DATA_ERROR: i32 = 65;

/// Cannot open input file or volume.
/// Maps to EX_NOINPUT from sysexits.h.
pub const INPUT_ERROR: i32 = 66;

/// I/O error (cannot write output file).
/// Maps to EX_IOERR from sysexits.h.
pub const IO_ERROR: i32 = 74;

/// Another writer held the index lock for too long; retrying may succeed.
/// Maps to EX_TEMPFAIL from sysexits.h.
pub const TEMP_FAILURE: i32 = 75;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub const fn success() -> Self {
        Self {
            code: SUCCESS,
            message: None,
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");

        // Classify by the first typed error in the chain, then by message
        let code = err
            .chain()
            .find_map(|cause| {
                cause
                    .downcast_ref::<VolumeIndexError>()
                    .map(code_for_index_error)
                    .or_else(|| cause.downcast_ref::<std::io::Error>().map(code_for_io_error))
            })
            .unwrap_or_else(|| {
                if message.contains("Failed to read") {
                    INPUT_ERROR
                } else if message.contains("Failed to write") || message.contains("serialize") {
                    IO_ERROR
                } else {
                    GENERAL_ERROR
                }
            });

        Self {
            code,
            message: Some(message),
        }
    }
}

fn code_for_index_error(err: &VolumeIndexError) -> i32 {
    match err {
        VolumeIndexError::MissingField { .. }
        | VolumeIndexError::MalformedValue { .. }
        | VolumeIndexError::InvalidSpecification(_)
        | VolumeIndexError::DimensionMismatch { .. }
        | VolumeIndexError::IndexCorruption(_)
        | VolumeIndexError::IncompatibleIndex(_)
        | VolumeIndexError::Serialization(_) => DATA_ERROR,
        VolumeIndexError::Load(_) => INPUT_ERROR,
        VolumeIndexError::LockTimeout { .. } => TEMP_FAILURE,
        VolumeIndexError::Allocation { .. } => GENERAL_ERROR,
        VolumeIndexError::Io(e) => code_for_io_error(e),
    }
}

fn code_for_io_error(err: &std::io::Error) -> i32 {
    match err.kind() {
        ErrorKind::NotFound => INPUT_ERROR,
        _ => IO_ERROR,
    }
}
