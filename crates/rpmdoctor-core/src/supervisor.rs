//! Process supervision: every external binary runs through here.
//!
//! The supervisor guarantees that each invocation produces exactly one
//! [`CommandResult`]; children are never abandoned. A child that outlives
//! its deadline is signalled SIGTERM at the process-group level, given a
//! short grace period, then SIGKILLed. Non-zero exit is data, not an error;
//! callers interpret dispositions.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{DoctorError, Result};

/// Hard cap on captured bytes per stream.
const OUTPUT_CAP: usize = 64 * 1024 * 1024;

/// Appended to a stream that hit [`OUTPUT_CAP`].
const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Grace period between SIGTERM and SIGKILL on deadline expiry.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A single external command to run under supervision.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Argv; `argv[0]` is the binary path.
    pub argv: Vec<String>,
    /// Bytes written to the child's stdin, if any.
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock deadline for the whole invocation.
    pub timeout: Duration,
    /// Environment overlay applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
}

impl CommandRequest {
    pub fn new<I, S>(argv: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout,
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// How a supervised command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ExitDisposition {
    /// Normal exit with a status code.
    Exited(i32),

    /// Terminated by a signal we did not send.
    Signaled(i32),

    /// Exceeded its deadline and was terminated by the supervisor.
    TimedOut,

    /// The child could never be started (binary missing, permission denied).
    SpawnFailed(String),
}

impl ExitDisposition {
    pub fn success(&self) -> bool {
        matches!(self, ExitDisposition::Exited(0))
    }
}

/// Immutable record of one supervised invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub argv: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub disposition: ExitDisposition,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// True when the supervisor had to signal the child itself.
    pub terminated_by_us: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.disposition.success()
    }

    /// Non-blank stdout lines.
    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().filter(|l| !l.trim().is_empty())
    }

    fn spawn_failed(req: &CommandRequest, started_at: DateTime<Utc>, err: String) -> Self {
        Self {
            argv: req.argv.clone(),
            started_at,
            duration_ms: 0,
            disposition: ExitDisposition::SpawnFailed(err.clone()),
            stdout: String::new(),
            stderr: err,
            stdout_truncated: false,
            stderr_truncated: false,
            terminated_by_us: false,
        }
    }
}

/// Tracks the remaining wall-clock budget of a whole run.
///
/// Every external call clamps its own timeout against the remaining budget,
/// so an expired budget is observed as a `Deadline` error before the next
/// spawn rather than as an unbounded wait.
#[derive(Debug)]
pub struct DeadlineBudget {
    deadline: Instant,
}

impl DeadlineBudget {
    pub fn new(total: Duration) -> Self {
        Self {
            deadline: Instant::now() + total,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Clamp a desired timeout to the remaining budget.
    pub fn clamp(&self, want: Duration) -> Result<Duration> {
        let left = self.remaining();
        if left.is_zero() {
            return Err(DoctorError::Deadline);
        }
        Ok(want.min(left))
    }
}

/// Launches external commands and enforces their deadlines.
#[derive(Debug, Clone)]
pub struct Supervisor {
    grace: Duration,
    output_cap: usize,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            grace: KILL_GRACE,
            output_cap: OUTPUT_CAP,
        }
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A supervisor with a non-default SIGTERM→SIGKILL grace period.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            grace,
            output_cap: OUTPUT_CAP,
        }
    }

    /// Run one command to completion.
    ///
    /// Never returns `Err` for anything the child does: spawn failures,
    /// timeouts and non-zero exits are all encoded in the result.
    pub async fn run(&self, req: CommandRequest) -> CommandResult {
        let started_at = Utc::now();
        let start = Instant::now();
        debug!(argv = ?req.argv, timeout_secs = req.timeout.as_secs(), "running command");

        if req.argv.is_empty() {
            return CommandResult::spawn_failed(&req, started_at, "empty argv".to_string());
        }

        let mut cmd = Command::new(&req.argv[0]);
        cmd.args(&req.argv[1..])
            .stdin(if req.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        for (key, value) in &req.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &req.cwd {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return CommandResult::spawn_failed(&req, started_at, err.to_string());
            }
        };
        let pid = child.id().map(|p| p as i32);

        if let (Some(bytes), Some(mut stdin)) = (req.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            });
        }

        let cap = self.output_cap;
        let stdout_task = spawn_drain(child.stdout.take(), cap);
        let stderr_task = spawn_drain(child.stderr.take(), cap);

        let (disposition, terminated_by_us) =
            match tokio::time::timeout(req.timeout, child.wait()).await {
                Ok(Ok(status)) => (disposition_from_status(status), false),
                Ok(Err(err)) => {
                    // wait() failing after a successful spawn is exotic; treat
                    // the invocation as unstartable rather than guessing.
                    (ExitDisposition::SpawnFailed(err.to_string()), false)
                }
                Err(_) => {
                    warn!(argv = ?req.argv, "command exceeded deadline, terminating");
                    self.terminate_group(pid, &mut child).await;
                    (ExitDisposition::TimedOut, true)
                }
            };

        let (stdout, stdout_truncated) = finish_stream(stdout_task).await;
        let (stderr, stderr_truncated) = finish_stream(stderr_task).await;

        CommandResult {
            argv: req.argv,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            disposition,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            terminated_by_us,
        }
    }

    /// SIGTERM the child's process group, wait out the grace period, then
    /// SIGKILL whatever is left. The child was spawned with `process_group(0)`
    /// so the group id equals the child pid.
    async fn terminate_group(&self, pid: Option<i32>, child: &mut tokio::process::Child) {
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGTERM);
            if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
                return;
            }
            warn!(pid, "child survived SIGTERM, sending SIGKILL");
            signal_group(pid, libc::SIGKILL);
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

/// Send `sig` to the process group led by `pid`. ESRCH means the group is
/// already gone, which is fine.
fn signal_group(pid: i32, sig: i32) {
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, sig, %errno, "failed to signal process group");
        }
    }
}

fn disposition_from_status(status: std::process::ExitStatus) -> ExitDisposition {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitDisposition::Exited(code),
        None => ExitDisposition::Signaled(status.signal().unwrap_or(0)),
    }
}

fn spawn_drain<R>(stream: Option<R>, cap: usize) -> tokio::task::JoinHandle<(Vec<u8>, bool)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    match stream {
        Some(stream) => tokio::spawn(drain_stream(stream, cap)),
        None => tokio::spawn(async { (Vec::new(), false) }),
    }
}

/// Read a child stream to EOF, keeping at most `cap` bytes.
async fn drain_stream<R>(mut stream: R, cap: usize) -> (Vec<u8>, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let take = n.min(cap - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (buf, truncated)
}

async fn finish_stream(task: tokio::task::JoinHandle<(Vec<u8>, bool)>) -> (String, bool) {
    match task.await {
        Ok((bytes, truncated)) => {
            let mut text = String::from_utf8_lossy(&bytes).into_owned();
            if truncated {
                text.push_str(TRUNCATION_MARKER);
            }
            (text, truncated)
        }
        Err(_) => (String::new(), false),
    }
}
