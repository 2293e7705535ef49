//! Error types for the supervisor and its components

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use nix::errno::Errno;

/// Failure to take the cross-process binary lock
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {path:?} is held by another replacer")]
    Contended { path: PathBuf },

    #[error("timed out waiting for lock {path:?}")]
    Timeout { path: PathBuf },

    #[error("lock {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// Contention and timeouts leave the binary untouched and may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Contended { .. } | LockError::Timeout { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplaceError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("candidate binary {path:?} is unreadable: {source}")]
    Candidate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("binary path {path:?} has no parent directory")]
    NoParent { path: PathBuf },

    #[error("{op} failed for {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("failed to bind listener {addr}: {source}")]
pub struct ListenError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to create readiness pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("failed to execute {path:?}: {source}")]
    Exec {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("spawned process has no pid")]
    NoPid,
}

impl SpawnError {
    /// The binary is still open for writing somewhere, typically a sibling
    /// forked while the install was in progress. Worth retrying shortly.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Exec { source, .. } if source.raw_os_error() == Some(Errno::ETXTBSY as i32)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("upgrade triggered without a candidate and no fetcher is configured")]
    NoFetcher,

    #[error("fetching candidate failed: {0}")]
    Fetch(#[source] io::Error),

    #[error(transparent)]
    Replace(#[from] ReplaceError),

    #[error("upgrade task failed: {0}")]
    Task(String),
}

/// Child-side failure to adopt the supervisor's environment
#[derive(Debug, thiserror::Error)]
pub enum InheritError {
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidVar { name: &'static str, value: String },

    #[error("readiness already reported")]
    AlreadyReady,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot resolve the running executable: {0}")]
    CurrentExe(#[source] io::Error),
}

/// Errors that end the supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Listen(#[from] ListenError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("child crashed {exits} times within {window_seconds}s, giving up")]
    CrashLoop { exits: usize, window_seconds: u64 },

    #[error("supervisor is no longer running")]
    Closed,
}
