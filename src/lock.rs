// SPDX-License-Identifier: GPL-3.0-only

//! Advisory file locks shared between the daemon and CLI processes
//!
//! `flock` locks belong to the open file description, so two opens of the
//! same path conflict even inside one process. Locks are released when the
//! guard is dropped or the owning process dies.

use crate::constants::timing;
use crate::errors::ControlError;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A held `flock`, released on drop
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        trace!(path = %self.path.display(), "Releasing lock");
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Non-blocking flock; `Ok(false)` when another holder has it
fn try_flock(file: &File, operation: libc::c_int) -> std::io::Result<bool> {
    // SAFETY: the fd is owned by `file` and stays open for the call
    let result = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Take an exclusive lock if nobody holds it
pub fn try_lock_exclusive(path: &Path) -> std::io::Result<Option<FileLock>> {
    let file = open_lock_file(path)?;
    if try_flock(&file, libc::LOCK_EX)? {
        Ok(Some(FileLock {
            _file: file,
            path: path.to_path_buf(),
        }))
    } else {
        Ok(None)
    }
}

/// Check whether someone holds an exclusive lock on `path`
pub fn is_locked(path: &Path) -> std::io::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let file = open_lock_file(path)?;
    // The probe lock is dropped with `file`
    Ok(!try_flock(&file, libc::LOCK_SH)?)
}

/// Per-device command lock serialising every mutating control command
#[derive(Debug, Clone)]
pub struct DeviceLock {
    path: PathBuf,
    index: u32,
    timeout: Duration,
}

impl DeviceLock {
    pub fn new(path: impl Into<PathBuf>, index: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            index,
            timeout,
        }
    }

    /// Wait for the lock, giving up with `LockContention` after the timeout
    pub async fn acquire(&self) -> Result<FileLock, ControlError> {
        let started = Instant::now();
        loop {
            match try_lock_exclusive(&self.path) {
                Ok(Some(lock)) => {
                    debug!(index = self.index, "Acquired device lock");
                    return Ok(lock);
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(ControlError::Transport(format!(
                        "cannot open lock {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                return Err(ControlError::LockContention {
                    index: self.index,
                    waited,
                });
            }
            tokio::time::sleep(timing::LOCK_POLL_INTERVAL).await;
        }
    }
}
