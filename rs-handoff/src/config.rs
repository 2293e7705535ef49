//! Supervisor configuration, read from a JSON file.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;
use crate::lock::LockMode;

/// A signal written by name in the config, e.g. `"SIGHUP"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalName(pub Signal);

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl Serialize for SignalName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for SignalName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        let upper = name.to_ascii_uppercase();
        let full = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        Signal::from_str(&full)
            .map(SignalName)
            .map_err(|_| de::Error::custom(format!("unknown signal {name:?}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Executable the children run, and the file upgrades replace.
    /// Defaults to the supervisor's own executable.
    pub binary: Option<PathBuf>,
    pub args: Vec<String>,
    pub listen: Vec<SocketAddr>,
    /// Where the file fetcher picks up candidates on a signal-driven upgrade
    pub staged_binary: Option<PathBuf>,

    pub ready_timeout_seconds: u64,
    pub grace_period_seconds: u64,
    /// Unset means wait for the binary lock indefinitely
    pub lock_timeout_seconds: Option<u64>,

    /// More than `crash_limit` exits within `crash_window_seconds` is fatal
    pub crash_limit: usize,
    pub crash_window_seconds: u64,
    pub respawn_backoff_ms: u64,
    pub max_respawn_backoff_ms: u64,

    pub upgrade_signal: SignalName,
    pub drain_signal: SignalName,
    pub forward_signals: Vec<SignalName>,

    pub systemd_notify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binary: None,
            args: Vec::new(),
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 6188))],
            staged_binary: None,
            ready_timeout_seconds: 30,
            grace_period_seconds: 10,
            lock_timeout_seconds: None,
            crash_limit: 5,
            crash_window_seconds: 60,
            respawn_backoff_ms: 100,
            max_respawn_backoff_ms: 5_000,
            upgrade_signal: SignalName(Signal::SIGQUIT),
            drain_signal: SignalName(Signal::SIGTERM),
            forward_signals: vec![SignalName(Signal::SIGHUP), SignalName(Signal::SIGUSR1)],
            systemd_notify: true,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn binary_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.binary {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(ConfigError::CurrentExe),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_seconds)
    }

    pub fn lock_mode(&self) -> LockMode {
        match self.lock_timeout_seconds {
            Some(0) => LockMode::NonBlocking,
            Some(secs) => LockMode::Timeout(Duration::from_secs(secs)),
            None => LockMode::Blocking,
        }
    }

    /// Delay before the `failures`th consecutive respawn, doubling up to the cap
    pub fn respawn_backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let ms = self
            .respawn_backoff_ms
            .saturating_mul(1 << shift)
            .min(self.max_respawn_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen, Config::default().listen);
        assert_eq!(config.drain_signal, SignalName(Signal::SIGTERM));
        assert_eq!(config.lock_mode(), LockMode::Blocking);
    }

    #[test]
    fn parses_signal_names() {
        let config: Config = serde_json::from_str(
            r#"{
                "binary": "/opt/app/server",
                "listen": ["127.0.0.1:8080", "[::1]:8443"],
                "upgrade_signal": "usr2",
                "forward_signals": ["SIGHUP", "WINCH"],
                "grace_period_seconds": 3,
                "lock_timeout_seconds": 0
            }"#,
        )
        .unwrap();
        assert_eq!(config.upgrade_signal.0, Signal::SIGUSR2);
        assert_eq!(
            config.forward_signals,
            vec![SignalName(Signal::SIGHUP), SignalName(Signal::SIGWINCH)]
        );
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.grace_period(), Duration::from_secs(3));
        assert_eq!(config.lock_mode(), LockMode::NonBlocking);
        assert_eq!(config.binary_path().unwrap(), PathBuf::from("/opt/app/server"));
    }

    #[test]
    fn rejects_unknown_signal() {
        let err = serde_json::from_str::<Config>(r#"{"drain_signal": "SIGNOPE"}"#).unwrap_err();
        assert!(err.to_string().contains("SIGNOPE"));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = Config {
            respawn_backoff_ms: 100,
            max_respawn_backoff_ms: 1_000,
            ..Config::default()
        };
        assert_eq!(config.respawn_backoff(1), Duration::from_millis(100));
        assert_eq!(config.respawn_backoff(2), Duration::from_millis(200));
        assert_eq!(config.respawn_backoff(4), Duration::from_millis(800));
        assert_eq!(config.respawn_backoff(5), Duration::from_millis(1_000));
        assert_eq!(config.respawn_backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff.json");
        std::fs::write(&path, r#"{"listen": "not a list"}"#).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
