//! Advisory file lock guarding store mutations across processes.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use tracing::{debug, warn};

use crate::error::QueueError;

/// Bounded exponential backoff shared by lock acquisition and I/O retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Non-blocking lock attempts before giving up with `LockTimeout`.
    pub lock_attempts: u32,
    /// Whole-mutation attempts when disk I/O fails.
    pub io_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            lock_attempts: 20,
            io_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// Exclusive `flock` held for the lifetime of the guard.
///
/// The lock is released when the guard drops, on every exit path.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    pub fn acquire(path: &Path, policy: &RetryPolicy) -> Result<Self, QueueError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let attempts = policy.lock_attempts.max(1);
        let mut delay = policy.initial_delay;
        let mut attempt = 0;
        while attempt < attempts {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    if attempt > 0 {
                        debug!(path = %path.display(), attempt, "store lock acquired after contention");
                    }
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EWOULDBLOCK) => {
                    attempt += 1;
                    if attempt < attempts {
                        std::thread::sleep(delay);
                        delay = policy.next_delay(delay);
                    }
                }
                Err(errno) => return Err(QueueError::Io(errno.into())),
            }
        }

        Err(QueueError::LockTimeout {
            path: path.to_path_buf(),
            attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}
