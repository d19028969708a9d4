//! Yum-side host checks: stale pidfile detection and lock probing.
//!
//! A yum process that wedged mid-transaction keeps its pidfile and its
//! lock forever; package installs on the host stop until someone kills it.
//! The pidfile must be old enough before anything is signalled; a young
//! pidfile just means yum is legitimately running.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DoctorError, Result};

/// Conventional yum pidfile location.
pub const YUM_PID_PATH: &str = "/var/run/yum.pid";

/// A pidfile younger than this is assumed to belong to a live, healthy yum.
pub const MIN_STUCK_AGE: Duration = Duration::from_secs(6 * 3600);

/// Expected comm value for the pid named in the pidfile.
const YUM_COMM: &str = "yum";

/// What the stuck-yum check concluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StuckYumOutcome {
    /// No pidfile, or the pidfile is recent: nothing to do.
    NotStuck,
    /// The stale process was signalled.
    Killed { pid: i32 },
    /// Dry-run: the process would have been signalled.
    WouldKill { pid: i32 },
    /// Pidfile present but unusable, or the pid's identity could not be
    /// confirmed; nothing was signalled.
    Indeterminate { reason: String },
}

/// Checks for (and optionally kills) a yum process stuck on a stale lock.
#[derive(Debug, Clone)]
pub struct StuckYumCheck {
    pid_path: PathBuf,
    min_age: Duration,
}

impl StuckYumCheck {
    pub fn new() -> Self {
        Self {
            pid_path: PathBuf::from(YUM_PID_PATH),
            min_age: MIN_STUCK_AGE,
        }
    }

    #[cfg(test)]
    pub fn at(pid_path: impl Into<PathBuf>, min_age: Duration) -> Self {
        Self {
            pid_path: pid_path.into(),
            min_age,
        }
    }

    /// Inspect the pidfile and kill the process it names when it is old
    /// enough and really is yum.
    pub fn check(&self, dry_run: bool) -> StuckYumOutcome {
        let (pid, mtime) = match pidfile_info(&self.pid_path) {
            Ok(info) => info,
            Err(DoctorError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("no yum pidfile, assuming yum not stuck");
                return StuckYumOutcome::NotStuck;
            }
            Err(err) => {
                warn!(path = %self.pid_path.display(), %err, "unreadable yum pidfile");
                return StuckYumOutcome::Indeterminate {
                    reason: err.to_string(),
                };
            }
        };

        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO);
        if age < self.min_age {
            info!(pid, age_secs = age.as_secs(), "yum pidfile is recent, not stuck");
            return StuckYumOutcome::NotStuck;
        }

        match process_comm(pid) {
            Some(comm) if comm == YUM_COMM => {}
            Some(comm) => {
                let reason = format!("pid {} is '{}', expected '{}'", pid, comm, YUM_COMM);
                warn!("{}", reason);
                return StuckYumOutcome::Indeterminate { reason };
            }
            None => {
                // Pid already gone, or /proc is unavailable (macOS).
                return StuckYumOutcome::Indeterminate {
                    reason: format!("cannot confirm identity of pid {}", pid),
                };
            }
        }

        if dry_run {
            info!(pid, "[dry-run] would kill stuck yum process");
            return StuckYumOutcome::WouldKill { pid };
        }

        info!(pid, age_secs = age.as_secs(), "killing stuck yum process");
        let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
        if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH) {
            return StuckYumOutcome::Indeterminate {
                reason: format!("failed to kill pid {}", pid),
            };
        }
        StuckYumOutcome::Killed { pid }
    }
}

impl Default for StuckYumCheck {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a pidfile: the pid it names plus the file's mtime.
pub fn pidfile_info(path: &Path) -> Result<(i32, SystemTime)> {
    let content = std::fs::read_to_string(path)?;
    let pid: i32 = content
        .trim()
        .parse()
        .map_err(|_| DoctorError::Config(format!("{} does not contain a pid", path.display())))?;
    // A pid <= 1 would make kill() do something very different.
    if pid <= 1 {
        return Err(DoctorError::Config(format!(
            "{} names implausible pid {}",
            path.display(),
            pid
        )));
    }
    let mtime = std::fs::metadata(path)?.modified()?;
    Ok((pid, mtime))
}

/// True when another package manager currently holds the yum lock: the
/// pidfile exists and the pid in it is alive.
pub fn yum_lock_held(pid_path: &Path) -> bool {
    match pidfile_info(pid_path) {
        Ok((pid, _)) => unsafe { libc::kill(pid, 0) == 0 },
        Err(_) => false,
    }
}

/// comm of a live process, via /proc on Linux. `None` when the pid is gone
/// or the platform has no procfs.
fn process_comm(pid: i32) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
    Some(comm.trim().to_string())
}
