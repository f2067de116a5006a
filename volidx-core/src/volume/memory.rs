//! In-memory volume loader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, VolumeIndexError};

use super::{VolumeLoader, VoxelBuffer};

/// Serves pre-built buffers keyed by path.
///
/// Useful for tests and for hosts that already hold decoded volumes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    volumes: HashMap<PathBuf, VoxelBuffer>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `buffer` under `path`, replacing any previous buffer.
    pub fn insert(&mut self, path: impl Into<PathBuf>, buffer: VoxelBuffer) {
        self.volumes.insert(path.into(), buffer);
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with_volume(mut self, path: impl Into<PathBuf>, buffer: VoxelBuffer) -> Self {
        self.insert(path, buffer);
        self
    }
}

impl VolumeLoader for InMemoryLoader {
    fn load(&self, path: &Path) -> Result<VoxelBuffer> {
        self.volumes
            .get(path)
            .cloned()
            .ok_or_else(|| VolumeIndexError::Load(format!("no volume at {}", path.display())))
    }
}
