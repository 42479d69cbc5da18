//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// What a worker does with jobs it still owns when shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop claiming, wait for owned jobs to finish.
    Wait,
    /// Stop claiming, kill owned jobs.
    Kill,
}

/// Spooler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the shared queue database.
    pub db_path: PathBuf,
    /// Directory holding per-job `<id>.out` / `<id>.err` files.
    pub out_dir: PathBuf,
    /// Idle-poll backoff when nothing is claimable.
    pub poll_interval: Duration,
    /// Interval between child-exit checks while slots are busy.
    pub reap_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL on kill.
    pub kill_grace: Duration,
    /// SQLite busy timeout for a single statement.
    pub busy_timeout: Duration,
    /// Retries for a lock-timed-out store operation before surfacing it.
    pub lock_retries: u32,
    /// Shutdown behavior for owned jobs.
    pub shutdown_mode: ShutdownMode,
}

impl Default for Config {
    fn default() -> Self {
        let home = home_dir();
        Self {
            db_path: home.join(".tspy_queue.db"),
            out_dir: home.join(".tspy_out"),
            poll_interval: Duration::from_secs(2),
            reap_interval: Duration::from_millis(500),
            kill_grace: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            lock_retries: 3,
            shutdown_mode: ShutdownMode::Wait,
        }
    }
}

impl Config {
    /// Default config with `TSPY_DB_PATH` / `TSPY_OUT_DIR` overrides
    /// applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("TSPY_DB_PATH") {
            config.db_path = expand_home(&path);
        }
        if let Ok(dir) = std::env::var("TSPY_OUT_DIR") {
            config.out_dir = expand_home(&dir);
        }
        config
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        home_dir().join(rest)
    } else if path == "~" {
        home_dir()
    } else {
        PathBuf::from(path)
    }
}
