//! The supervisor's lifecycle state machine.
//!
//! ```text
//! Init -> Running -> Upgrading -> Restarting -> Running
//!            \            \             \
//!             +------------+-------------+--> Stopping -> Terminated
//! ```
//!
//! One task owns the [`Supervisor`] and consumes [`Event`]s in arrival
//! order. Exit watchers, readiness watchers, timers, the upgrade task and
//! the signal router only ever talk to it through the queue, so `state`
//! and the child table are never touched concurrently.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use sd_notify::NotifyState;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{SpawnError, SupervisorError, UpgradeError};
use crate::fetch::{Fetcher, StagedFile};
use crate::listeners::ListenerSet;
use crate::process::{
    describe, ChildManager, ChildRecord, ChildStatus, EXEC_BUSY_DELAY, EXEC_BUSY_RETRIES,
};
use crate::replace::{same_contents, BinaryReplacer};

type Flow = ControlFlow<Result<(), SupervisorError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Init,
    Running,
    Upgrading,
    Restarting,
    Stopping,
    Terminated,
}

#[derive(Debug)]
pub enum Event {
    ChildReady {
        generation: u64,
    },
    ChildNotReady {
        generation: u64,
        reason: String,
    },
    ChildExited {
        generation: u64,
        status: Option<ExitStatus>,
    },
    Respawn,
    /// Retry starting the upgraded generation after a busy binary
    RetryRestart,
    /// `None` asks the fetcher for a candidate
    Upgrade {
        candidate: Option<PathBuf>,
    },
    UpgradeFinished(Result<UpgradeOutcome, UpgradeError>),
    DrainExpired {
        generation: u64,
    },
    Forward(Signal),
    Shutdown,
}

#[derive(Debug)]
pub enum UpgradeOutcome {
    Installed(PathBuf),
    /// The candidate is byte-identical to the running binary
    Unchanged(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServingChild {
    pub generation: u64,
    pub pid: u32,
}

/// Snapshot published after every event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    /// Last generation spawned
    pub generation: u64,
    pub serving: Option<ServingChild>,
    pub live_children: usize,
    pub listeners: Vec<SocketAddr>,
    /// Upgrade triggers that ran to completion, successful or not
    pub upgrade_attempts: u64,
    /// Completed handoffs to a new generation
    pub upgrades: u64,
    pub last_error: Option<String>,
}

/// Sends triggers to a running supervisor and observes its status
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    events: UnboundedSender<Event>,
    status: watch::Receiver<Status>,
}

impl SupervisorHandle {
    pub fn send(&self, event: Event) -> Result<(), SupervisorError> {
        self.events.send(event).map_err(|_| SupervisorError::Closed)
    }

    pub fn upgrade<P: Into<PathBuf>>(&self, candidate: P) -> Result<(), SupervisorError> {
        self.send(Event::Upgrade {
            candidate: Some(candidate.into()),
        })
    }

    pub fn upgrade_from_fetcher(&self) -> Result<(), SupervisorError> {
        self.send(Event::Upgrade { candidate: None })
    }

    pub fn shutdown(&self) -> Result<(), SupervisorError> {
        self.send(Event::Shutdown)
    }

    pub fn forward(&self, signal: Signal) -> Result<(), SupervisorError> {
        self.send(Event::Forward(signal))
    }

    pub fn status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }
}

pub struct Supervisor {
    config: Config,
    replacer: Arc<BinaryReplacer>,
    fetcher: Option<Arc<dyn Fetcher>>,
    manager: ChildManager,
    listeners: ListenerSet,

    state: State,
    generation: u64,
    children: BTreeMap<u64, ChildRecord>,
    /// Generation serving traffic
    active: Option<u64>,
    /// New generation started by an upgrade, not yet ready
    incoming: Option<u64>,
    /// Previous generation draining after a handoff
    outgoing: Option<u64>,

    crashes: VecDeque<Instant>,
    failures: u32,
    busy_retries: u32,
    respawn_pending: bool,
    pending_upgrades: VecDeque<Option<PathBuf>>,
    shutdown_requested: bool,
    upgrade_attempts: u64,
    upgrades: u64,
    fatal: Option<SupervisorError>,
    last_error: Option<String>,

    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    status_tx: watch::Sender<Status>,
}

impl Supervisor {
    pub fn new(config: Config) -> Result<(Self, SupervisorHandle), SupervisorError> {
        let binary = config.binary_path()?;
        let replacer = BinaryReplacer::new(&binary).with_lock_mode(config.lock_mode());
        let fetcher = config
            .staged_binary
            .clone()
            .map(|path| Arc::new(StagedFile::new(path)) as Arc<dyn Fetcher>);
        let manager = ChildManager::new(
            binary,
            config.args.clone(),
            config.ready_timeout(),
            config.drain_signal.0,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::default());
        let handle = SupervisorHandle {
            events: events_tx.clone(),
            status: status_rx,
        };

        let supervisor = Self {
            config,
            replacer: Arc::new(replacer),
            fetcher,
            manager,
            listeners: ListenerSet::default(),
            state: State::Init,
            generation: 0,
            children: BTreeMap::new(),
            active: None,
            incoming: None,
            outgoing: None,
            crashes: VecDeque::new(),
            failures: 0,
            busy_retries: 0,
            respawn_pending: false,
            pending_upgrades: VecDeque::new(),
            shutdown_requested: false,
            upgrade_attempts: 0,
            upgrades: 0,
            fatal: None,
            last_error: None,
            events_tx,
            events_rx,
            status_tx,
        };
        Ok((supervisor, handle))
    }

    pub fn with_fetcher<F: Fetcher + 'static>(mut self, fetcher: F) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Binds the listeners, starts generation 1 and processes events until
    /// the supervisor terminates.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        info!(
            "supervising {:?} (lock {:?})",
            self.replacer.binary_path(),
            self.replacer.lock_path()
        );
        self.listeners = match ListenerSet::acquire(&self.config.listen) {
            Ok(listeners) => listeners,
            Err(e) => {
                error!("{}", e);
                self.state = State::Terminated;
                self.publish();
                return Err(e.into());
            }
        };

        if let ControlFlow::Break(result) = self.respawn() {
            return result;
        }
        self.publish();

        while let Some(event) = self.events_rx.recv().await {
            debug!("{:?} <- {:?}", self.state, event);
            if let ControlFlow::Break(result) = self.handle(event) {
                return result;
            }
            self.publish();
        }
        Err(SupervisorError::Closed)
    }

    fn handle(&mut self, event: Event) -> Flow {
        match event {
            Event::ChildReady { generation } => self.on_ready(generation),
            Event::ChildNotReady { generation, reason } => {
                self.on_not_ready(generation, reason);
                ControlFlow::Continue(())
            }
            Event::ChildExited { generation, status } => self.on_exit(generation, status),
            Event::Respawn => {
                self.respawn_pending = false;
                let may_respawn = match self.state {
                    State::Init | State::Running | State::Upgrading => true,
                    // the promoted generation died while the old one drains
                    State::Restarting => self.incoming.is_none(),
                    State::Stopping | State::Terminated => false,
                };
                if may_respawn && self.active.is_none() {
                    self.respawn()
                } else {
                    ControlFlow::Continue(())
                }
            }
            Event::RetryRestart => {
                let waiting = self.state == State::Restarting
                    && self.incoming.is_none()
                    && self.outgoing.is_none();
                if waiting {
                    self.enter_restarting()
                } else {
                    ControlFlow::Continue(())
                }
            }
            Event::Upgrade { candidate } => {
                self.on_upgrade(candidate);
                ControlFlow::Continue(())
            }
            Event::UpgradeFinished(result) => self.on_upgrade_finished(result),
            Event::DrainExpired { generation } => {
                if let Some(record) = self.children.get(&generation) {
                    warn!(
                        "generation {} did not exit within {}s",
                        generation, self.config.grace_period_seconds
                    );
                    self.manager.force_kill(record);
                }
                ControlFlow::Continue(())
            }
            Event::Forward(signal) => {
                match self.active.and_then(|g| self.children.get(&g)) {
                    Some(record) => {
                        info!("forwarding {} to generation {}", signal, record.generation);
                        record.signal(signal);
                    }
                    None => warn!("no serving child to forward {} to", signal),
                }
                ControlFlow::Continue(())
            }
            Event::Shutdown => self.on_shutdown(),
        }
    }

    fn on_ready(&mut self, generation: u64) -> Flow {
        let Some(record) = self.children.get_mut(&generation) else {
            return ControlFlow::Continue(());
        };
        if record.status == ChildStatus::Spawning {
            record.status = ChildStatus::Ready;
        }
        info!("generation {} (pid {}) is ready", generation, record.pid);

        match self.state {
            State::Init if self.active == Some(generation) => {
                self.failures = 0;
                self.enter_running()
            }
            State::Running | State::Upgrading | State::Restarting
                if self.active == Some(generation) =>
            {
                self.failures = 0;
                ControlFlow::Continue(())
            }
            State::Restarting if self.incoming == Some(generation) => {
                self.failures = 0;
                self.incoming = None;
                self.upgrades += 1;
                self.outgoing = self.active.replace(generation);
                match self.outgoing {
                    Some(old) => {
                        self.drain(old);
                        ControlFlow::Continue(())
                    }
                    None => self.enter_running(),
                }
            }
            _ => ControlFlow::Continue(()),
        }
    }

    fn on_not_ready(&mut self, generation: u64, reason: String) {
        let Some(record) = self.children.get(&generation) else {
            return;
        };
        if record.status != ChildStatus::Spawning {
            return;
        }
        let pid = record.pid;
        self.manager.force_kill(record);
        self.note_error(format!(
            "generation {} (pid {}) failed to become ready: {}",
            generation, pid, reason
        ));
    }

    fn on_exit(&mut self, generation: u64, status: Option<ExitStatus>) -> Flow {
        let Some(mut record) = self.children.remove(&generation) else {
            return ControlFlow::Continue(());
        };
        record.status = ChildStatus::Exited;
        info!(
            "generation {} (pid {}) exited with {} after {:.1}s",
            generation,
            record.pid,
            describe(status),
            record.started_at.elapsed().as_secs_f32()
        );

        if self.state == State::Stopping {
            return if self.children.is_empty() {
                self.finish()
            } else {
                ControlFlow::Continue(())
            };
        }
        if self.outgoing == Some(generation) {
            self.outgoing = None;
            return self.enter_running();
        }
        if self.incoming == Some(generation) {
            self.incoming = None;
            self.note_error(format!(
                "generation {} exited before becoming ready, generation {:?} keeps serving",
                generation, self.active
            ));
            return self.enter_running();
        }
        if self.active == Some(generation) {
            self.active = None;
            return self.child_failed();
        }
        ControlFlow::Continue(())
    }

    /// The serving position lost its child. Respawns with backoff, or gives
    /// up when the crash window overflows.
    fn child_failed(&mut self) -> Flow {
        let now = Instant::now();
        let window = self.config.crash_window();
        self.crashes.push_back(now);
        while let Some(&first) = self.crashes.front() {
            if now.duration_since(first) > window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }

        if self.crashes.len() > self.config.crash_limit {
            let err = SupervisorError::CrashLoop {
                exits: self.crashes.len(),
                window_seconds: self.config.crash_window_seconds,
            };
            error!("{}", err);
            return self.begin_stop(Some(err));
        }

        // an incoming generation is on its way and takes over once ready
        if self.state == State::Restarting && self.incoming.is_some() {
            return ControlFlow::Continue(());
        }

        self.failures += 1;
        let delay = self.config.respawn_backoff(self.failures);
        warn!(
            "respawning in {}ms ({} consecutive failures)",
            delay.as_millis(),
            self.failures
        );
        self.schedule_respawn(delay);
        ControlFlow::Continue(())
    }

    fn respawn(&mut self) -> Flow {
        match self.spawn_child() {
            Ok(generation) => {
                self.active = Some(generation);
                ControlFlow::Continue(())
            }
            Err(e) if self.retry_busy(&e) => {
                self.schedule_respawn(EXEC_BUSY_DELAY);
                ControlFlow::Continue(())
            }
            Err(e) => {
                self.note_error(format!(
                    "spawning generation {}: {}",
                    self.generation + 1,
                    e
                ));
                self.child_failed()
            }
        }
    }

    /// The generation number is only used up by a successful spawn.
    fn spawn_child(&mut self) -> Result<u64, SpawnError> {
        let generation = self.generation + 1;
        let record = self
            .manager
            .spawn(generation, &self.listeners, &self.events_tx)?;
        self.generation = generation;
        self.busy_retries = 0;
        self.children.insert(generation, record);
        Ok(generation)
    }

    fn retry_busy(&mut self, err: &SpawnError) -> bool {
        if !err.is_busy() || self.busy_retries >= EXEC_BUSY_RETRIES {
            self.busy_retries = 0;
            return false;
        }
        self.busy_retries += 1;
        warn!(
            "{:?} is busy, retrying in {}ms ({}/{})",
            self.replacer.binary_path(),
            EXEC_BUSY_DELAY.as_millis(),
            self.busy_retries,
            EXEC_BUSY_RETRIES
        );
        true
    }

    fn schedule_respawn(&mut self, delay: Duration) {
        if self.respawn_pending {
            return;
        }
        self.respawn_pending = true;
        self.after(delay, Event::Respawn);
    }

    fn on_upgrade(&mut self, candidate: Option<PathBuf>) {
        match self.state {
            State::Running => self.start_upgrade(candidate),
            State::Stopping | State::Terminated => {
                warn!("ignoring upgrade trigger during shutdown")
            }
            state => {
                info!("upgrade queued until {:?} completes", state);
                self.pending_upgrades.push_back(candidate);
            }
        }
    }

    fn start_upgrade(&mut self, candidate: Option<PathBuf>) {
        info!(
            "upgrading {:?} from {}",
            self.replacer.binary_path(),
            candidate
                .as_ref()
                .map(|p| format!("{p:?}"))
                .unwrap_or_else(|| "fetcher".into())
        );
        self.state = State::Upgrading;
        self.notify(&[NotifyState::Reloading]);

        let replacer = self.replacer.clone();
        let fetcher = self.fetcher.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                install_candidate(&replacer, fetcher.as_deref(), candidate)
            })
            .await
            .unwrap_or_else(|e| Err(UpgradeError::Task(e.to_string())));
            let _ = events.send(Event::UpgradeFinished(result));
        });
    }

    fn on_upgrade_finished(&mut self, result: Result<UpgradeOutcome, UpgradeError>) -> Flow {
        if self.state != State::Upgrading {
            warn!("upgrade result arrived in {:?}, ignoring", self.state);
            return ControlFlow::Continue(());
        }
        self.upgrade_attempts += 1;

        match result {
            Ok(UpgradeOutcome::Installed(candidate)) => {
                info!("installed {:?}", candidate);
                if self.shutdown_requested {
                    return self.begin_stop(None);
                }
                self.enter_restarting()
            }
            Ok(UpgradeOutcome::Unchanged(candidate)) => {
                info!("{:?} matches the running binary, not restarting", candidate);
                self.settle()
            }
            Err(e) => {
                self.note_error(format!(
                    "upgrade failed, generation {:?} keeps serving: {}",
                    self.active, e
                ));
                self.settle()
            }
        }
    }

    fn settle(&mut self) -> Flow {
        if self.shutdown_requested {
            self.begin_stop(None)
        } else {
            self.enter_running()
        }
    }

    fn enter_restarting(&mut self) -> Flow {
        self.state = State::Restarting;
        match self.spawn_child() {
            Ok(generation) => {
                self.incoming = Some(generation);
                ControlFlow::Continue(())
            }
            Err(e) if self.retry_busy(&e) => {
                self.after(EXEC_BUSY_DELAY, Event::RetryRestart);
                ControlFlow::Continue(())
            }
            Err(e) => {
                self.note_error(format!(
                    "spawning upgraded generation {}: {}",
                    self.generation + 1,
                    e
                ));
                self.enter_running()
            }
        }
    }

    fn enter_running(&mut self) -> Flow {
        self.state = State::Running;
        if let Some(record) = self.active.and_then(|g| self.children.get(&g)) {
            let status = format!("serving generation {}", record.generation);
            self.notify(&[NotifyState::Ready, NotifyState::Status(&status)]);
        }

        if self.active.is_none() && !self.respawn_pending {
            if let ControlFlow::Break(result) = self.respawn() {
                return ControlFlow::Break(result);
            }
        }
        if let Some(next) = self.pending_upgrades.pop_front() {
            self.start_upgrade(next);
        }
        ControlFlow::Continue(())
    }

    fn on_shutdown(&mut self) -> Flow {
        match self.state {
            State::Upgrading => {
                info!("shutdown deferred until the binary replacement finishes");
                self.shutdown_requested = true;
                ControlFlow::Continue(())
            }
            State::Stopping | State::Terminated => ControlFlow::Continue(()),
            _ => self.begin_stop(None),
        }
    }

    fn begin_stop(&mut self, fatal: Option<SupervisorError>) -> Flow {
        info!("stopping {} child(ren)", self.children.len());
        self.state = State::Stopping;
        self.notify(&[NotifyState::Stopping]);
        if fatal.is_some() {
            self.fatal = fatal;
        }
        self.pending_upgrades.clear();
        self.incoming = None;
        self.outgoing = None;

        let live: Vec<u64> = self.children.keys().copied().collect();
        for generation in live {
            self.drain(generation);
        }
        if self.children.is_empty() {
            self.finish()
        } else {
            ControlFlow::Continue(())
        }
    }

    fn finish(&mut self) -> Flow {
        self.listeners.close_all();
        self.active = None;
        self.state = State::Terminated;
        self.publish();
        info!("supervisor terminated");
        ControlFlow::Break(match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        })
    }

    fn drain(&mut self, generation: u64) {
        let Some(record) = self.children.get_mut(&generation) else {
            return;
        };
        if record.status == ChildStatus::Draining || !record.is_alive() {
            return;
        }
        self.manager.signal_drain(record);
        self.after(self.config.grace_period(), Event::DrainExpired { generation });
    }

    fn after(&self, delay: Duration, event: Event) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn note_error(&mut self, message: String) {
        error!("{}", message);
        self.last_error = Some(message);
    }

    fn notify(&self, states: &[NotifyState]) {
        if !self.config.systemd_notify {
            return;
        }
        if let Err(e) = sd_notify::notify(false, states) {
            debug!("sd_notify: {}", e);
        }
    }

    fn publish(&self) {
        let serving = self
            .active
            .and_then(|g| self.children.get(&g))
            .map(|record| ServingChild {
                generation: record.generation,
                pid: record.pid,
            });
        self.status_tx.send_replace(Status {
            state: self.state,
            generation: self.generation,
            serving,
            live_children: self.children.len(),
            listeners: self.listeners.local_addrs(),
            upgrade_attempts: self.upgrade_attempts,
            upgrades: self.upgrades,
            last_error: self.last_error.clone(),
        });
    }
}

fn install_candidate(
    replacer: &BinaryReplacer,
    fetcher: Option<&dyn Fetcher>,
    candidate: Option<PathBuf>,
) -> Result<UpgradeOutcome, UpgradeError> {
    let candidate = match candidate {
        Some(path) => path,
        None => fetcher
            .ok_or(UpgradeError::NoFetcher)?
            .fetch_candidate()
            .map_err(UpgradeError::Fetch)?,
    };
    if same_contents(&candidate, replacer.binary_path()) {
        return Ok(UpgradeOutcome::Unchanged(candidate));
    }
    replacer.replace(&candidate)?;
    Ok(UpgradeOutcome::Installed(candidate))
}
