//! Zero-downtime process supervision.
//!
//! A long-lived supervisor owns the listening sockets, runs the application
//! as a child process that inherits them, and on an upgrade trigger
//! atomically installs a new binary, starts a new child generation from it,
//! and drains the old one once the new one reports ready.

pub mod config;
pub mod error;
pub mod fetch;
pub mod inherit;
pub mod listeners;
pub mod lock;
pub mod process;
pub mod replace;
pub mod signals;
pub mod supervisor;

pub use config::{Config, SignalName};
pub use error::{
    ConfigError, InheritError, ListenError, LockError, ReplaceError, SpawnError, SupervisorError,
    UpgradeError,
};
pub use fetch::{Fetcher, StagedFile};
pub use inherit::Inherited;
pub use listeners::ListenerSet;
pub use lock::{FileLock, LockMode, LockToken};
pub use process::{ChildManager, ChildRecord, ChildStatus};
pub use replace::BinaryReplacer;
pub use signals::{Routes, SignalRouter};
pub use supervisor::{Event, State, Status, Supervisor, SupervisorHandle, UpgradeOutcome};
