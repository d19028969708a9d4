//! Enumeration and termination of processes holding database files open.
//!
//! A recovered or rebuilt database invalidates every file handle that was
//! open across the operation; the holders typically spin inside libdb until
//! killed. Discovery uses lsof's machine-readable `-F pcn` output, which is
//! parsed field-by-field instead of scraping the human table.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DoctorError, Result};
use crate::supervisor::{CommandRequest, DeadlineBudget, ExitDisposition, Supervisor};

/// Never signal init or the kernel.
const MIN_PID: i32 = 2;

/// How long killed holders get to disappear before being counted as
/// survivors.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// One process found holding a watched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub pid: i32,
    pub command: String,
}

/// Outcome of a kill sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub killed: Vec<i32>,
    pub survivors: Vec<i32>,
}

impl KillReport {
    pub fn all_reaped(&self) -> bool {
        self.survivors.is_empty()
    }
}

/// Seam between the state machine and the host's process table.
#[async_trait]
pub trait HandleInspector: Send + Sync {
    /// Processes currently holding any of `paths` open.
    async fn holders(&self, paths: &[PathBuf]) -> Result<Vec<Holder>>;

    /// Signal every holder of `paths`, wait for them to be reaped, and
    /// report who survived.
    async fn kill_holders(&self, paths: &[PathBuf], signal: i32) -> Result<KillReport>;
}

/// Production inspector backed by `lsof`.
pub struct LsofInspector {
    supervisor: Arc<Supervisor>,
    budget: Arc<DeadlineBudget>,
    lsof_bin: PathBuf,
    timeout: Duration,
    reap_timeout: Duration,
    ignore_pids: Vec<i32>,
}

impl LsofInspector {
    pub fn new(
        supervisor: Arc<Supervisor>,
        budget: Arc<DeadlineBudget>,
        lsof_bin: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            budget,
            lsof_bin,
            timeout,
            reap_timeout: REAP_TIMEOUT,
            ignore_pids: vec![std::process::id() as i32],
        }
    }

    /// Override how long killed holders get to disappear.
    pub fn with_reap_timeout(mut self, reap: Duration) -> Self {
        self.reap_timeout = reap;
        self
    }
}

#[async_trait]
impl HandleInspector for LsofInspector {
    async fn holders(&self, paths: &[PathBuf]) -> Result<Vec<Holder>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let mut argv = vec![
            self.lsof_bin.display().to_string(),
            "-F".to_string(),
            "pcn".to_string(),
            "--".to_string(),
        ];
        argv.extend(paths.iter().map(|p| p.display().to_string()));

        let timeout = self.budget.clamp(self.timeout)?;
        let result = self
            .supervisor
            .run(CommandRequest::new(argv, timeout))
            .await;

        match &result.disposition {
            ExitDisposition::SpawnFailed(err) => {
                return Err(DoctorError::InspectorUnavailable(err.clone()));
            }
            ExitDisposition::TimedOut => {
                return Err(DoctorError::InspectorUnavailable(
                    "lsof exceeded its deadline".to_string(),
                ));
            }
            // lsof exits 1 when none of the paths are open; that is an
            // answer, not a failure.
            _ => {}
        }

        let holders = parse_lsof_output(&result.stdout, &self.ignore_pids);
        debug!(count = holders.len(), "enumerated file holders");
        Ok(holders)
    }

    async fn kill_holders(&self, paths: &[PathBuf], signal: i32) -> Result<KillReport> {
        let holders = self.holders(paths).await?;
        if holders.is_empty() {
            return Ok(KillReport::default());
        }

        let mut signalled = Vec::new();
        for holder in &holders {
            if holder.pid < MIN_PID {
                warn!(pid = holder.pid, "refusing to signal low pid");
                continue;
            }
            info!(pid = holder.pid, command = %holder.command, signal, "killing holder");
            let rc = unsafe { libc::kill(holder.pid, signal) };
            if rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
                signalled.push(holder.pid);
            } else {
                warn!(pid = holder.pid, "kill failed");
            }
        }

        // Poll until the reap window closes; a pid still holding a watched
        // file after that counts as a survivor.
        let poll = Duration::from_millis(250);
        let mut waited = Duration::ZERO;
        let mut remaining = self.holders(paths).await?;
        while !remaining.is_empty() && waited < self.reap_timeout {
            tokio::time::sleep(poll).await;
            waited += poll;
            remaining = self.holders(paths).await?;
        }

        let survivors: Vec<i32> = remaining.iter().map(|h| h.pid).collect();
        let killed = signalled
            .into_iter()
            .filter(|pid| !survivors.contains(pid))
            .collect();
        Ok(KillReport { killed, survivors })
    }
}

/// Parse `lsof -F pcn` output into holders, dropping ignored pids.
///
/// The format is one field per line: `p<pid>` opens a process record,
/// `c<command>` names it, `n<path>` lists each open file. Only `p`/`c`
/// matter here; the paths were constrained by the lsof invocation itself.
pub fn parse_lsof_output(output: &str, ignore_pids: &[i32]) -> Vec<Holder> {
    let mut holders: Vec<Holder> = Vec::new();
    let mut current_pid: Option<i32> = None;

    for line in output.lines() {
        if let Some(pid_field) = line.strip_prefix('p') {
            current_pid = pid_field.trim().parse::<i32>().ok();
        } else if let Some(command) = line.strip_prefix('c') {
            if let Some(pid) = current_pid.take() {
                if ignore_pids.contains(&pid) || holders.iter().any(|h| h.pid == pid) {
                    continue;
                }
                holders.push(Holder {
                    pid,
                    command: command.trim().to_string(),
                });
            }
        }
    }

    holders
}
