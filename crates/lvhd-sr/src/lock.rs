//! SR-wide advisory lock
//!
//! Every multi-step mutation runs under this file lock. Acquisition uses a
//! bounded sleep-and-retry loop and then reports busy instead of blocking
//! forever, so an operation can never deadlock against a collector run
//! holding the same lock.

use lvhd_common::{LockRetryConfig, Result, SrConfig, StorageError};
use std::fs::{self, File};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Handle to the per-SR lock file
pub struct SrLock {
    path: PathBuf,
    retry: LockRetryConfig,
}

impl SrLock {
    #[must_use]
    pub fn new(config: &SrConfig) -> Self {
        Self {
            path: config.lock_dir.join(format!("sr-{}.lock", config.uuid)),
            retry: config.lock_retry.clone(),
        }
    }

    /// Acquire exclusively, retrying for the configured bounded window.
    /// Returns [`StorageError::SrBusy`] once the window is exhausted.
    pub fn acquire(&self) -> Result<SrLockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.path)?;

        for attempt in 0..self.retry.attempts {
            match file.try_lock() {
                Ok(()) => {
                    debug!(path = %self.path.display(), attempt, "SR lock acquired");
                    return Ok(SrLockGuard { file });
                }
                Err(std::fs::TryLockError::WouldBlock) => {
                    std::thread::sleep(self.retry.interval());
                }
                Err(std::fs::TryLockError::Error(e)) => return Err(e.into()),
            }
        }
        warn!(path = %self.path.display(), "SR lock acquisition timed out");
        Err(StorageError::SrBusy)
    }
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct SrLockGuard {
    file: File,
}

impl Drop for SrLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("SR lock release failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> SrConfig {
        let mut cfg = SrConfig::new("test-sr", "vg");
        cfg.lock_dir = dir.to_path_buf();
        cfg.lock_retry = LockRetryConfig {
            attempts: 3,
            interval_ms: 10,
        };
        cfg
    }

    #[test]
    fn test_acquire_release_reacquire() {
        let dir = tempdir().unwrap();
        let lock = SrLock::new(&config(dir.path()));
        let guard = lock.acquire().unwrap();
        drop(guard);
        let _guard = lock.acquire().unwrap();
    }

    #[test]
    fn test_contention_reports_busy() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let lock = SrLock::new(&cfg);
        let _held = lock.acquire().unwrap();

        // a second open file description contends with the first
        let other = SrLock::new(&cfg);
        let err = other.acquire().unwrap_err();
        assert!(matches!(err, StorageError::SrBusy));
    }
}
