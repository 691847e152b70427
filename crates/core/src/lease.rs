//! Single-writer guard around a sync cycle.

use crate::error::SyncError;
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub trait SyncLease: Send + Sync {
    /// Non-blocking. `Ok(None)` means someone else holds the lease.
    fn try_acquire(&self) -> Result<Option<LeaseGuard>, SyncError>;
}

/// Releases the lease when dropped.
pub struct LeaseGuard {
    _held: Box<dyn Send + Sync>,
}

impl LeaseGuard {
    fn new(held: impl Send + Sync + 'static) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

/// Advisory lock on a file; the OS drops it if the process dies.
pub struct FileLease {
    path: PathBuf,
}

impl FileLease {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Pid and start time of the current holder. Cleared on release, so only a
    /// crashed holder leaves a stale entry behind.
    pub fn holder(&self) -> Option<String> {
        fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

impl SyncLease for FileLease {
    fn try_acquire(&self) -> Result<Option<LeaseGuard>, SyncError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| SyncError::Other(e.into()))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| SyncError::Other(e.into()))?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!(path = %self.path.display(), "lock held elsewhere");
                return Ok(None);
            }
            Err(e) => return Err(SyncError::Other(e.into())),
        }
        file.set_len(0).map_err(|e| SyncError::Other(e.into()))?;
        writeln!(
            file,
            "pid={} since={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        )
        .map_err(|e| SyncError::Other(e.into()))?;
        Ok(Some(LeaseGuard::new(FileLock { file })))
    }
}

/// In-process lease. Clones share the flag.
#[derive(Clone, Default)]
pub struct MemoryLease {
    held: Arc<AtomicBool>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

struct MemoryHold(Arc<AtomicBool>);

impl Drop for MemoryHold {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncLease for MemoryLease {
    fn try_acquire(&self) -> Result<Option<LeaseGuard>, SyncError> {
        if self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        Ok(Some(LeaseGuard::new(MemoryHold(self.held.clone()))))
    }
}
