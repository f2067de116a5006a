//! Exclusive writer lock for a consolidated index.
//!
//! The lock is a sibling file `<index>.lock` created with create-new
//! semantics and removed on drop. The file holds the owner's pid. A process
//! that dies while holding it leaves the file behind; it must be removed by
//! hand before the next append, and the timeout error names the file and pid.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Result, VolumeIndexError};

/// Held for the duration of one append.
#[derive(Debug)]
pub struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    /// Lock file path guarding `index_path`.
    pub fn lock_path(index_path: &Path) -> PathBuf {
        let mut name = OsString::from(index_path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Wait up to `timeout` for the lock, polling every `poll_interval`.
    pub fn acquire(index_path: &Path, timeout: Duration, poll_interval: Duration) -> Result<Self> {
        let path = Self::lock_path(index_path);
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", std::process::id()) {
                        debug!(error = %e, "Could not record pid in lock file");
                    }
                    debug!(path = %path.display(), "Acquired index lock");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        let holder_pid = read_holder_pid(&path);
                        warn!(
                            path = %path.display(),
                            holder_pid = ?holder_pid,
                            "Index lock still held; remove it if its writer is gone"
                        );
                        return Err(VolumeIndexError::LockTimeout {
                            path,
                            waited_ms: waited.as_millis() as u64,
                            holder_pid,
                        });
                    }
                    std::thread::sleep(poll_interval.min(timeout - waited));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released index lock"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove index lock"),
        }
    }
}
