//! Listening sockets owned by the supervisor for its whole lifetime.
//!
//! Sockets are bound once and handed to every child generation by
//! descriptor, so the kernel keeps queueing connections across restarts.

use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};

use log::info;

use crate::error::ListenError;

#[derive(Debug, Default)]
pub struct ListenerSet {
    listeners: Vec<TcpListener>,
}

impl ListenerSet {
    pub fn acquire(addrs: &[SocketAddr]) -> Result<Self, ListenError> {
        let mut listeners = Vec::with_capacity(addrs.len());
        for &addr in addrs {
            let listener =
                TcpListener::bind(addr).map_err(|source| ListenError { addr, source })?;
            info!("listening on {}", listener.local_addr().unwrap_or(addr));
            listeners.push(listener);
        }
        Ok(Self { listeners })
    }

    /// Descriptors in configured order; children see them from fd 3 upward.
    pub fn handles_for_inherit(&self) -> Vec<RawFd> {
        self.listeners.iter().map(|l| l.as_raw_fd()).collect()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn close_all(&mut self) {
        if !self.listeners.is_empty() {
            info!("closing {} listener(s)", self.listeners.len());
        }
        self.listeners.clear();
    }
}
