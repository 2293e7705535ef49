//! Inter-process mutual exclusion backed by `flock(2)`.
//!
//! The lock lives on an open file description, so the kernel drops it when
//! the holder exits or crashes. The lock file itself is never removed:
//! unlinking it would let a later opener lock a fresh inode while an older
//! holder still owns the previous one.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::LockError;

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// How `acquire` behaves when another holder owns the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Block until the lock is free
    Blocking,
    /// Fail with `LockError::Contended` immediately
    NonBlocking,
    /// Keep retrying until the deadline, then fail with `LockError::Timeout`
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    mode: LockMode,
}

/// Exclusive possession of a `FileLock`. Dropping the token releases it.
pub struct LockToken {
    guard: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockToken").field("path", &self.path).finish()
    }
}

impl FileLock {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            mode: LockMode::Blocking,
        }
    }

    pub fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn acquire(&self) -> Result<LockToken, LockError> {
        match self.mode {
            LockMode::Blocking => self.lock(FlockArg::LockExclusive),
            LockMode::NonBlocking => self.lock(FlockArg::LockExclusiveNonblock),
            LockMode::Timeout(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    match self.lock(FlockArg::LockExclusiveNonblock) {
                        Err(LockError::Contended { .. }) if Instant::now() < deadline => {
                            thread::sleep(RETRY_INTERVAL);
                        }
                        Err(LockError::Contended { .. }) => {
                            return Err(LockError::Timeout {
                                path: self.path.clone(),
                            });
                        }
                        other => return other,
                    }
                }
            }
        }
    }

    pub fn release(token: LockToken) -> Result<(), LockError> {
        token.release()
    }

    fn lock(&self, arg: FlockArg) -> Result<LockToken, LockError> {
        let mut file = self.open()?;
        loop {
            match Flock::lock(file, arg) {
                Ok(guard) => {
                    return Ok(LockToken {
                        guard,
                        path: self.path.clone(),
                    })
                }
                // a signal interrupted the blocking wait
                Err((unlocked, Errno::EINTR)) => file = unlocked,
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    return Err(LockError::Contended {
                        path: self.path.clone(),
                    })
                }
                Err((_, errno)) => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        source: errno.into(),
                    })
                }
            }
        }
    }

    fn open(&self) -> Result<File, LockError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&self.path)
            .map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

impl LockToken {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> Result<(), LockError> {
        let path = self.path;
        self.guard
            .unlock()
            .map(drop)
            .map_err(|(_, errno)| LockError::Io {
                path,
                source: errno.into(),
            })
    }
}
