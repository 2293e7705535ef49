//! The environment a supervised child starts with, and the child's side of it.
//!
//! A child spawned by the supervisor finds its listeners at descriptors
//! `3 .. 3+HANDOFF_LISTEN_FDS` in configured order, and a pipe at
//! `HANDOFF_READY_FD` on which it writes [`READY_TOKEN`] once it serves.

use std::env;
use std::fs::File;
use std::io::{self, Write};
use std::net::TcpListener;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use crate::error::InheritError;

pub const ENV_SUPERVISED: &str = "HANDOFF_SUPERVISED";
pub const ENV_GENERATION: &str = "HANDOFF_GENERATION";
pub const ENV_LISTEN_FDS: &str = "HANDOFF_LISTEN_FDS";
pub const ENV_READY_FD: &str = "HANDOFF_READY_FD";

pub const FIRST_INHERITED_FD: RawFd = 3;
pub const READY_TOKEN: &[u8] = b"ready";

/// What a supervised child received from its supervisor
#[derive(Debug)]
pub struct Inherited {
    pub generation: u64,
    pub listeners: Vec<TcpListener>,
    ready: Option<File>,
}

impl Inherited {
    /// Returns `None` when the process was not started by a supervisor.
    ///
    /// Takes ownership of the inherited descriptors and removes the
    /// variables so grandchildren do not adopt them too. Call once, before
    /// any other thread (an async runtime included) is started.
    pub fn from_env() -> Result<Option<Self>, InheritError> {
        if env::var(ENV_SUPERVISED).as_deref() != Ok("1") {
            return Ok(None);
        }
        let generation: u64 = parse_var(ENV_GENERATION)?;
        let count: RawFd = parse_var(ENV_LISTEN_FDS)?;
        let ready_fd: RawFd = parse_var(ENV_READY_FD)?;
        if count < 0 || ready_fd != FIRST_INHERITED_FD + count {
            return Err(InheritError::InvalidVar {
                name: ENV_READY_FD,
                value: ready_fd.to_string(),
            });
        }

        for name in [ENV_SUPERVISED, ENV_GENERATION, ENV_LISTEN_FDS, ENV_READY_FD] {
            env::remove_var(name);
        }

        // SAFETY: the supervisor placed these descriptors before exec and
        // nothing else in this process has claimed them.
        let listeners = (FIRST_INHERITED_FD..FIRST_INHERITED_FD + count)
            .map(|fd| TcpListener::from(unsafe { OwnedFd::from_raw_fd(fd) }))
            .collect();
        let ready = Some(File::from(unsafe { OwnedFd::from_raw_fd(ready_fd) }));

        Ok(Some(Self {
            generation,
            listeners,
            ready,
        }))
    }

    /// Tells the supervisor this child is serving. Closes the readiness pipe.
    pub fn ready(&mut self) -> io::Result<()> {
        let mut pipe = self
            .ready
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, InheritError::AlreadyReady))?;
        pipe.write_all(READY_TOKEN)
    }

    pub fn take_listeners(&mut self) -> Vec<TcpListener> {
        std::mem::take(&mut self.listeners)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<T, InheritError> {
    let value = env::var(name).unwrap_or_default();
    value
        .parse()
        .map_err(|_| InheritError::InvalidVar { name, value })
}
