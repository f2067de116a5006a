use std::path::PathBuf;

use thiserror::Error;

use crate::volume::Dims;

#[derive(Error, Debug)]
pub enum VolumeIndexError {
    #[error("Missing required field '{field}' in {}", source_path.display())]
    MissingField {
        field: &'static str,
        source_path: PathBuf,
    },

    #[error("Malformed value for '{field}' at line {line_number}: {line}")]
    MalformedValue {
        field: String,
        line_number: usize,
        line: String,
    },

    #[error("Invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("Failed to load volume: {0}")]
    Load(String),

    #[error("Volume dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: Dims, actual: Dims },

    #[error("Failed to allocate {bytes} bytes for volume buffer")]
    Allocation { bytes: usize },

    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    #[error("Incompatible index: {0}")]
    IncompatibleIndex(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(
        "Timed out after {waited_ms}ms waiting for index lock {} held by {}; if no append is running the lock is stale and can be removed",
        path.display(),
        lock_holder(holder_pid)
    )]
    LockTimeout {
        path: PathBuf,
        waited_ms: u64,
        /// Pid recorded in the lock file, when readable
        holder_pid: Option<u32>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VolumeIndexError {
    /// Whether the error only concerns one sample or query volume, so a batch
    /// can log it and move on.
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            Self::Load(_) | Self::DimensionMismatch { .. } | Self::Allocation { .. }
        )
    }
}

fn lock_holder(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!("pid {pid}"),
        None => "an unknown process".into(),
    }
}

pub type Result<T> = std::result::Result<T, VolumeIndexError>;
