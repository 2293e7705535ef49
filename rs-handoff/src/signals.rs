//! Translates OS signals into supervisor events.

use std::io;
use std::thread::{self, JoinHandle};

use log::{debug, info};
use nix::sys::signal::Signal;
use signal_hook::iterator::{Handle, Signals};

use crate::config::Config;
use crate::supervisor::{Event, SupervisorHandle};

const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGTERM, Signal::SIGINT];

/// Which signal means what
#[derive(Debug, Clone)]
pub struct Routes {
    upgrade: Signal,
    forward: Vec<Signal>,
}

impl Routes {
    pub fn new(upgrade: Signal, forward: Vec<Signal>) -> Self {
        Self { upgrade, forward }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.upgrade_signal.0,
            config.forward_signals.iter().map(|s| s.0).collect(),
        )
    }

    pub fn route(&self, signal: Signal) -> Option<Event> {
        if SHUTDOWN_SIGNALS.contains(&signal) {
            Some(Event::Shutdown)
        } else if signal == self.upgrade {
            Some(Event::Upgrade { candidate: None })
        } else if self.forward.contains(&signal) {
            Some(Event::Forward(signal))
        } else {
            None
        }
    }

    fn registered(&self) -> Vec<i32> {
        let mut all: Vec<i32> = SHUTDOWN_SIGNALS
            .iter()
            .chain(Some(&self.upgrade))
            .chain(&self.forward)
            .map(|&s| s as i32)
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }
}

/// Background thread feeding signals into the supervisor's queue
pub struct SignalRouter {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl SignalRouter {
    pub fn spawn(routes: Routes, supervisor: SupervisorHandle) -> io::Result<Self> {
        let mut signals = Signals::new(routes.registered())?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("signal-router".into())
            .spawn(move || {
                for raw in signals.forever() {
                    let Ok(signal) = Signal::try_from(raw) else {
                        continue;
                    };
                    let Some(event) = routes.route(signal) else {
                        debug!("ignoring {}", signal);
                        continue;
                    };
                    info!("received {}", signal);
                    if supervisor.send(event).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self { handle, thread })
    }

    pub fn close(self) {
        self.handle.close();
        let _ = self.thread.join();
    }
}
