//! Spawning, signalling and reaping of child generations.
//!
//! Each spawn gets two tasks: an exit watcher that owns the `Child` and is
//! the only place it is reaped, and a readiness watcher on the pipe the
//! child reports through. Signals to the child travel through the exit
//! watcher, so a pid is never signalled after it has been reaped.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, Pid};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::SpawnError;
use crate::inherit::{
    ENV_GENERATION, ENV_LISTEN_FDS, ENV_READY_FD, ENV_SUPERVISED, FIRST_INHERITED_FD, READY_TOKEN,
};
use crate::listeners::ListenerSet;
use crate::supervisor::Event;

/// Retries of an exec that failed because the binary is open for writing
pub const EXEC_BUSY_RETRIES: u32 = 3;
pub const EXEC_BUSY_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Spawning,
    Ready,
    Draining,
    Exited,
}

#[derive(Debug)]
pub struct ChildRecord {
    pub pid: u32,
    pub generation: u64,
    pub started_at: Instant,
    pub status: ChildStatus,
    control: UnboundedSender<Signal>,
}

impl ChildRecord {
    /// Delivers `signal` unless the child has already been reaped.
    pub fn signal(&self, signal: Signal) {
        if self.control.send(signal).is_err() {
            debug!(
                "generation {} (pid {}) already reaped, dropping {}",
                self.generation, self.pid, signal
            );
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status != ChildStatus::Exited
    }
}

#[derive(Debug, Clone)]
pub struct ChildManager {
    binary_path: PathBuf,
    args: Vec<String>,
    ready_timeout: Duration,
    drain_signal: Signal,
}

impl ChildManager {
    pub fn new(
        binary_path: PathBuf,
        args: Vec<String>,
        ready_timeout: Duration,
        drain_signal: Signal,
    ) -> Self {
        Self {
            binary_path,
            args,
            ready_timeout,
            drain_signal,
        }
    }

    /// Starts generation `generation` of the child with the listeners.
    ///
    /// Exactly one `Event::ChildExited` and one readiness event
    /// (`ChildReady` or `ChildNotReady`) follow on `events`.
    pub fn spawn(
        &self,
        generation: u64,
        listeners: &ListenerSet,
        events: &UnboundedSender<Event>,
    ) -> Result<ChildRecord, SpawnError> {
        let (ready_rx, ready_tx) = os_pipe::pipe().map_err(SpawnError::Pipe)?;

        let mut inherited = listeners.handles_for_inherit();
        inherited.push(ready_tx.as_raw_fd());
        let ready_fd = FIRST_INHERITED_FD + listeners.len() as RawFd;

        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args)
            .env(ENV_SUPERVISED, "1")
            .env(ENV_GENERATION, generation.to_string())
            .env(ENV_LISTEN_FDS, listeners.len().to_string())
            .env(ENV_READY_FD, ready_fd.to_string())
            .env_remove("NOTIFY_SOCKET");

        let mut scratch: Vec<RawFd> = vec![-1; inherited.len()];
        // SAFETY: the hook only calls fcntl(2) and dup2(2), both
        // async-signal-safe, and does not allocate.
        unsafe {
            cmd.pre_exec(move || place_descriptors(&inherited, &mut scratch));
        }

        // a busy binary is reported as `SpawnError::is_busy` for the caller to retry later
        let child = self.exec(&mut cmd)?;
        // the child holds the write end now; ours must close so EOF reaches the reader
        drop(ready_tx);

        let pid = child.id().ok_or(SpawnError::NoPid)?;
        info!(
            "spawned generation {} as pid {} from {:?}",
            generation, pid, self.binary_path
        );

        let (control, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_exit(generation, child, control_rx, events.clone()));
        tokio::spawn(watch_ready(
            generation,
            ready_rx,
            self.ready_timeout,
            events.clone(),
        ));

        Ok(ChildRecord {
            pid,
            generation,
            started_at: Instant::now(),
            status: ChildStatus::Spawning,
            control,
        })
    }

    fn exec(&self, cmd: &mut Command) -> Result<Child, SpawnError> {
        cmd.spawn().map_err(|source| SpawnError::Exec {
            path: self.binary_path.clone(),
            source,
        })
    }

    pub fn signal_drain(&self, record: &mut ChildRecord) {
        info!(
            "draining generation {} (pid {}) with {}",
            record.generation, record.pid, self.drain_signal
        );
        record.status = ChildStatus::Draining;
        record.signal(self.drain_signal);
    }

    pub fn force_kill(&self, record: &ChildRecord) {
        warn!(
            "killing generation {} (pid {})",
            record.generation, record.pid
        );
        record.signal(Signal::SIGKILL);
    }
}

/// Moves `fds` to `3..3+n` in the forked child, clearing close-on-exec.
fn place_descriptors(fds: &[RawFd], scratch: &mut [RawFd]) -> io::Result<()> {
    let floor = FIRST_INHERITED_FD + fds.len() as RawFd;
    // lift every source above the target range first so dup2 never clobbers one
    for (slot, &fd) in scratch.iter_mut().zip(fds) {
        *slot = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(floor))?;
    }
    for (offset, &fd) in scratch.iter().enumerate() {
        dup2(fd, FIRST_INHERITED_FD + offset as RawFd)?;
    }
    Ok(())
}

async fn watch_exit(
    generation: u64,
    mut child: Child,
    mut control: UnboundedReceiver<Signal>,
    events: UnboundedSender<Event>,
) {
    let pid = child.id().map(|id| Pid::from_raw(id as i32));
    let mut open = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = control.recv(), if open => match (signal, pid) {
                (Some(signal), Some(pid)) => {
                    if let Err(e) = kill(pid, signal) {
                        warn!("generation {}: kill({}, {}) failed: {}", generation, pid, signal, e);
                    }
                }
                (Some(_), None) => {}
                (None, _) => open = false,
            },
        }
    };

    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("generation {}: waiting for exit failed: {}", generation, e);
            None
        }
    };
    let _ = events.send(Event::ChildExited { generation, status });
}

async fn watch_ready(
    generation: u64,
    pipe: os_pipe::PipeReader,
    timeout: Duration,
    events: UnboundedSender<Event>,
) {
    // on timeout the read future and with it our end of the pipe are dropped,
    // whoever else still holds the write end
    let event = match tokio::time::timeout(timeout, read_token(pipe)).await {
        Ok(Ok(true)) => Event::ChildReady { generation },
        Ok(Ok(false)) => Event::ChildNotReady {
            generation,
            reason: "closed readiness pipe without reporting ready".into(),
        },
        Ok(Err(e)) => Event::ChildNotReady {
            generation,
            reason: format!("reading readiness pipe: {e}"),
        },
        Err(_) => Event::ChildNotReady {
            generation,
            reason: format!("not ready after {}s", timeout.as_secs_f32()),
        },
    };
    let _ = events.send(event);
}

async fn read_token(pipe: os_pipe::PipeReader) -> io::Result<bool> {
    let mut pipe = pipe::Receiver::from_owned_fd(OwnedFd::from(pipe))?;
    let mut buf = [0u8; READY_TOKEN.len()];
    match pipe.read_exact(&mut buf).await {
        Ok(_) => Ok(buf == READY_TOKEN),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Exit status rendered for logs
pub fn describe(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "unknown status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn token_must_match() {
        let (rx, mut tx) = os_pipe::pipe().unwrap();
        tx.write_all(READY_TOKEN).unwrap();
        drop(tx);
        assert!(read_token(rx).await.unwrap());

        let (rx, mut tx) = os_pipe::pipe().unwrap();
        tx.write_all(b"nope!").unwrap();
        drop(tx);
        assert!(!read_token(rx).await.unwrap());
    }

    #[tokio::test]
    async fn early_eof_is_not_ready() {
        let (rx, tx) = os_pipe::pipe().unwrap();
        drop(tx);
        assert!(!read_token(rx).await.unwrap());
    }

    #[tokio::test]
    async fn timeout_releases_the_pipe_while_a_writer_lingers() {
        let (rx, mut tx) = os_pipe::pipe().unwrap();
        let (events, mut seen) = mpsc::unbounded_channel();
        watch_ready(4, rx, Duration::from_millis(50), events).await;
        assert!(matches!(
            seen.recv().await,
            Some(Event::ChildNotReady { generation: 4, .. })
        ));

        // the read end is closed, so a late writer gets EPIPE
        let err = tx.write_all(READY_TOKEN).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn exit_and_readiness_are_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("child.sh");
        fs::write(
            &script,
            "#!/bin/sh\neval \"printf ready >&$HANDOFF_READY_FD\"\nexit 3\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let manager = ChildManager::new(
            script,
            Vec::new(),
            Duration::from_secs(5),
            Signal::SIGTERM,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let record = manager
            .spawn(7, &ListenerSet::default(), &tx)
            .unwrap();
        assert_eq!(record.generation, 7);
        assert_eq!(record.status, ChildStatus::Spawning);

        let mut ready = 0;
        let mut exited = None;
        while ready == 0 || exited.is_none() {
            match rx.recv().await.unwrap() {
                Event::ChildReady { generation: 7 } => ready += 1,
                Event::ChildExited {
                    generation: 7,
                    status,
                } => exited = status,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(ready, 1);
        assert_eq!(exited.unwrap().code(), Some(3));
    }
}
