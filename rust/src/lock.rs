//! Advisory file locks over template directories and cache artifacts.
//!
//! A [`LockManager`] is created once per invocation and handed to
//! everything that needs locks.  Locks are `flock(2)` locks on a dedicated
//! lock file: `<dir>/.lock` for a template directory and `<artifact>.lock`
//! for a cache artifact.  A [`LockHandle`] releases its lock when dropped.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rustix::fs::FlockOperation;

use crate::errors::VzttError;

/// Name of the lock file inside a locked directory.
pub const DIR_LOCK_NAME: &str = ".lock";
/// Interval between attempts while waiting on a bounded lock.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    fn operation(self, blocking: bool) -> FlockOperation {
        match (self, blocking) {
            (LockMode::Read, true) => FlockOperation::LockShared,
            (LockMode::Write, true) => FlockOperation::LockExclusive,
            (LockMode::Read, false) => FlockOperation::NonBlockingLockShared,
            (LockMode::Write, false) => FlockOperation::NonBlockingLockExclusive,
        }
    }
}

/// A held lock.  Dropping it releases the lock.
#[derive(Debug)]
#[must_use = "the lock is released when the handle is dropped"]
pub struct LockHandle {
    /// `None` when locking is skipped.
    file: Option<File>,
    path: Utf8PathBuf,
    mode: LockMode,
}

impl LockHandle {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether a lock is actually held (false when locking is skipped).
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(f) = self.file.take() {
            if let Err(e) = rustix::fs::flock(&f, FlockOperation::Unlock) {
                tracing::warn!("Unlocking {}: {e}", self.path);
            } else {
                tracing::debug!("Unlocked {}", self.path);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LockManager {
    skip: bool,
}

impl LockManager {
    /// With `skip` set, every acquisition succeeds without locking anything.
    pub fn new(skip: bool) -> Self {
        Self { skip }
    }

    fn skipped(&self, path: &Utf8Path, mode: LockMode) -> LockHandle {
        tracing::debug!("Skipping lock of {path}");
        LockHandle {
            file: None,
            path: path.to_owned(),
            mode,
        }
    }

    fn open(path: &Utf8Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Opening lock file {path}"))
            .context(VzttError::CannotLock(path.to_string()))
    }

    /// Lock `path`.  A zero `timeout` waits indefinitely; otherwise the
    /// attempt fails with [`VzttError::LockTimeout`] after `timeout` seconds.
    pub fn acquire(&self, path: &Utf8Path, mode: LockMode, timeout: u64) -> Result<LockHandle> {
        if self.skip {
            return Ok(self.skipped(path, mode));
        }
        let f = Self::open(path)?;
        if timeout == 0 {
            rustix::fs::flock(&f, mode.operation(true))
                .map_err(std::io::Error::from)
                .context(VzttError::CannotLock(path.to_string()))?;
        } else {
            let deadline = Instant::now() + Duration::from_secs(timeout);
            loop {
                match rustix::fs::flock(&f, mode.operation(false)) {
                    Ok(()) => break,
                    Err(rustix::io::Errno::WOULDBLOCK) | Err(rustix::io::Errno::INTR) => {}
                    Err(e) => {
                        tracing::debug!("Failed to lock {path}: {e}");
                        return Err(anyhow::Error::new(std::io::Error::from(e))
                            .context(VzttError::CannotLock(path.to_string())));
                    }
                }
                let now = Instant::now();
                if now >= deadline {
                    tracing::debug!("Timed out locking {path}");
                    return Err(VzttError::LockTimeout {
                        path: path.to_owned(),
                        timeout,
                    }
                    .into());
                }
                std::thread::sleep(POLL_INTERVAL.min(deadline - now));
            }
        }
        tracing::debug!("Locked {path} ({mode:?})");
        Ok(LockHandle {
            file: Some(f),
            path: path.to_owned(),
            mode,
        })
    }

    /// Lock `path` without waiting; contention is [`VzttError::AlreadyLocked`].
    pub fn try_acquire(&self, path: &Utf8Path, mode: LockMode) -> Result<LockHandle> {
        if self.skip {
            return Ok(self.skipped(path, mode));
        }
        let f = Self::open(path)?;
        match rustix::fs::flock(&f, mode.operation(false)) {
            Ok(()) => {}
            Err(rustix::io::Errno::WOULDBLOCK) => {
                tracing::debug!("{path} is already locked");
                return Err(VzttError::AlreadyLocked(path.to_string()).into());
            }
            Err(e) => {
                return Err(anyhow::Error::new(std::io::Error::from(e))
                    .context(VzttError::CannotLock(path.to_string())))
            }
        }
        tracing::debug!("Locked {path} ({mode:?})");
        Ok(LockHandle {
            file: Some(f),
            path: path.to_owned(),
            mode,
        })
    }

    /// Explicitly release a lock; equivalent to dropping the handle.
    pub fn release(&self, handle: LockHandle) {
        drop(handle)
    }

    /// Lock a template directory via its `.lock` file.
    pub fn lock_dir(&self, dir: &Utf8Path, mode: LockMode, timeout: u64) -> Result<LockHandle> {
        let r = self.acquire(&dir.join(DIR_LOCK_NAME), mode, timeout);
        if let Err(e) = &r {
            tracing::error!("Cannot lock template area {dir}: {e}");
        }
        r
    }

    /// Lock a cache artifact; waits indefinitely.
    pub fn lock_artifact(&self, artifact: &Utf8Path, mode: LockMode) -> Result<LockHandle> {
        self.acquire(&artifact_lock_path(artifact), mode, 0)
    }
}

/// `<artifact>.lock`
pub fn artifact_lock_path(artifact: &Utf8Path) -> Utf8PathBuf {
    let mut s = artifact.to_string();
    s.push_str(".lock");
    s.into()
}
