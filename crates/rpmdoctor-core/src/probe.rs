//! Typed probes and repairs over the external rpm/db4 tooling.
//!
//! Every operation shells out through the supervisor and classifies the
//! outcome into an [`RpmSymptom`]. Classification itself is pure (a
//! function of the finished [`CommandResult`]), so it is unit-testable
//! against recorded transcripts without any rpm installation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{DoctorError, Result};
use crate::signature::{self, SignatureOutcome, SignatureSource};
use crate::supervisor::{CommandRequest, CommandResult, DeadlineBudget, ExitDisposition, Supervisor};
use crate::symptom::RpmSymptom;
use crate::yum;

/// How many package names to pass to one `rpm -q` invocation when
/// cross-checking the index.
const LOOKUP_CHUNK: usize = 512;

/// A classified probe outcome plus the raw transcript behind it.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub symptom: RpmSymptom,
    pub commands: Vec<CommandResult>,
}

impl ProbeReport {
    pub fn healthy(commands: Vec<CommandResult>) -> Self {
        Self {
            symptom: RpmSymptom::Healthy,
            commands,
        }
    }

    pub fn of(symptom: RpmSymptom, commands: Vec<CommandResult>) -> Self {
        Self { symptom, commands }
    }
}

/// Outcome of one repair invocation.
#[derive(Debug, Clone)]
pub struct RepairReport {
    pub succeeded: bool,
    /// The repair was skipped because another package manager holds the lock.
    pub blocked_by_lock: bool,
    pub commands: Vec<CommandResult>,
    pub detail: Option<String>,
}

impl RepairReport {
    pub fn ok(commands: Vec<CommandResult>) -> Self {
        Self {
            succeeded: true,
            blocked_by_lock: false,
            commands,
            detail: None,
        }
    }

    pub fn failed(commands: Vec<CommandResult>, detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            blocked_by_lock: false,
            commands,
            detail: Some(detail.into()),
        }
    }

    pub fn blocked() -> Self {
        Self {
            succeeded: false,
            blocked_by_lock: true,
            commands: Vec::new(),
            detail: Some("package manager lock held".to_string()),
        }
    }
}

/// Seam between the state machine and the host's rpm stack.
#[async_trait]
pub trait DbProbe: Send + Sync {
    async fn probe_query(&self) -> Result<ProbeReport>;
    async fn probe_tables(&self) -> Result<ProbeReport>;
    async fn probe_index_consistency(&self) -> Result<ProbeReport>;
    async fn probe_yum_transactions(&self) -> Result<ProbeReport>;

    async fn recover_db(&self) -> Result<RepairReport>;
    async fn rebuild_db(&self) -> Result<RepairReport>;
    async fn clean_yum_transactions(&self) -> Result<RepairReport>;

    /// `db_stat -CA` capture for later investigation. Failures are logged,
    /// never fatal.
    async fn collect_forensics(&self) -> Result<()>;

    /// `package-cleanup --cleandupes`. Only reachable when explicitly
    /// enabled; never part of the automatic repair table.
    async fn cleanup_duplicates(&self) -> Result<RepairReport>;
}

/// Production probe backed by the host's binaries.
pub struct RpmProbe {
    config: RunConfig,
    supervisor: Arc<Supervisor>,
    budget: Arc<DeadlineBudget>,
}

impl RpmProbe {
    pub fn new(config: RunConfig, supervisor: Arc<Supervisor>, budget: Arc<DeadlineBudget>) -> Self {
        Self {
            config,
            supervisor,
            budget,
        }
    }

    async fn run_bounded(&self, argv: Vec<String>, want: Duration) -> Result<CommandResult> {
        let timeout = self.budget.clamp(want)?;
        Ok(self.supervisor.run(CommandRequest::new(argv, timeout)).await)
    }

    fn bin(&self, which: &Option<PathBuf>, name: &str) -> Result<String> {
        which
            .as_ref()
            .map(|p| p.display().to_string())
            .ok_or_else(|| DoctorError::MissingBinary(name.to_string()))
    }

    fn dbpath(&self) -> String {
        self.config.db_path.display().to_string()
    }
}

#[async_trait]
impl DbProbe for RpmProbe {
    async fn probe_query(&self) -> Result<ProbeReport> {
        let rpm = self.bin(&self.config.binaries.rpm, "rpm")?;
        let result = self
            .run_bounded(
                vec![rpm, "--dbpath".into(), self.dbpath(), "-qa".into()],
                self.config.timeouts.query(),
            )
            .await?;

        let symptom = classify_query(&result, self.config.min_packages);
        debug!(symptom = %symptom, "query probe classified");
        Ok(ProbeReport::of(symptom, vec![result]))
    }

    async fn probe_tables(&self) -> Result<ProbeReport> {
        let verify = self.bin(&self.config.binaries.db_verify, "db_verify")?;
        let tables = list_tables(&self.config.db_path)?;

        if !tables.iter().any(|t| t.name == "Packages") {
            return Ok(ProbeReport::of(
                RpmSymptom::TableMissing {
                    table: "Packages".to_string(),
                },
                Vec::new(),
            ));
        }

        let mut commands = Vec::new();
        for table in &tables {
            if self.config.verify_skip.iter().any(|s| s == &table.name) {
                debug!(table = %table.name, "skipping table on verify skip-list");
                continue;
            }
            let result = self
                .run_bounded(
                    vec![verify.clone(), table.path.display().to_string()],
                    self.config.timeouts.verify(),
                )
                .await?;
            let verdict = classify_verify(&table.name, &result);
            commands.push(result);
            if let Some(symptom) = verdict {
                return Ok(ProbeReport::of(symptom, commands));
            }
        }

        Ok(ProbeReport::healthy(commands))
    }

    async fn probe_index_consistency(&self) -> Result<ProbeReport> {
        let rpm = self.bin(&self.config.binaries.rpm, "rpm")?;
        let names_result = self
            .run_bounded(
                vec![
                    rpm.clone(),
                    "--dbpath".into(),
                    self.dbpath(),
                    "-qa".into(),
                    "--qf".into(),
                    "%{NAME}\\n".into(),
                ],
                self.config.timeouts.query(),
            )
            .await?;

        if !names_result.success() {
            let symptom = classify_query(&names_result, 0);
            return Ok(ProbeReport::of(symptom, vec![names_result]));
        }

        let mut names: Vec<&str> = names_result.stdout_lines().collect();
        names.sort_unstable();
        names.dedup();
        let names: Vec<String> = names.into_iter().map(String::from).collect();

        let mut commands = Vec::new();
        for chunk in names.chunks(LOOKUP_CHUNK) {
            let mut argv = vec![rpm.clone(), "--dbpath".into(), self.dbpath(), "-q".into()];
            argv.extend(chunk.iter().cloned());
            let result = self
                .run_bounded(argv, self.config.timeouts.query())
                .await?;
            let inconsistent = result
                .stdout
                .lines()
                .chain(result.stderr.lines())
                .any(|l| l.trim_end().ends_with("is not installed"));
            commands.push(result);
            if inconsistent {
                let mut all = vec![names_result];
                all.extend(commands);
                return Ok(ProbeReport::of(RpmSymptom::IndexInconsistent, all));
            }
        }

        let mut all = vec![names_result];
        all.extend(commands);
        Ok(ProbeReport::healthy(all))
    }

    async fn probe_yum_transactions(&self) -> Result<ProbeReport> {
        let count = count_stale_transactions(&self.config.yum_state_dir);
        let symptom = if count > 0 {
            RpmSymptom::StaleYumTransaction { count }
        } else {
            RpmSymptom::Healthy
        };
        Ok(ProbeReport::of(symptom, Vec::new()))
    }

    async fn recover_db(&self) -> Result<RepairReport> {
        let recover = self.bin(&self.config.binaries.db_recover, "db_recover")?;
        info!(dbpath = %self.config.db_path.display(), "running db_recover");
        let timeout = self.budget.clamp(self.config.timeouts.recover())?;
        let result = self
            .supervisor
            .run(
                CommandRequest::new(
                    vec![recover, "-v".into(), "-h".into(), self.dbpath()],
                    timeout,
                )
                .current_dir(&self.config.db_path),
            )
            .await;

        if result.success() {
            Ok(RepairReport::ok(vec![result]))
        } else {
            let detail = failure_detail(&result);
            warn!(detail = %detail, "db_recover failed");
            Ok(RepairReport::failed(vec![result], detail))
        }
    }

    async fn rebuild_db(&self) -> Result<RepairReport> {
        let rpm = self.bin(&self.config.binaries.rpm, "rpm")?;
        info!(dbpath = %self.config.db_path.display(), "running rpm --rebuilddb");
        let result = self
            .run_bounded(
                vec![rpm, "--rebuilddb".into(), "--dbpath".into(), self.dbpath()],
                self.config.timeouts.rebuild(),
            )
            .await?;

        if result.success() {
            Ok(RepairReport::ok(vec![result]))
        } else {
            let detail = failure_detail(&result);
            warn!(detail = %detail, "rpm --rebuilddb failed");
            Ok(RepairReport::failed(vec![result], detail))
        }
    }

    async fn clean_yum_transactions(&self) -> Result<RepairReport> {
        if yum::yum_lock_held(Path::new(yum::YUM_PID_PATH)) {
            warn!("yum lock held, skipping transaction cleanup this pass");
            return Ok(RepairReport::blocked());
        }

        let yct = match &self.config.binaries.yum_complete_transaction {
            Some(path) => path.display().to_string(),
            None => {
                // dnf keeps no transaction journal to complete, so on dnf
                // hosts the stale files are inert leftovers; on yum hosts
                // the cleanup tool is simply not installed.
                let host_is_dnf = self
                    .config
                    .binaries
                    .yum
                    .as_ref()
                    .and_then(|p| p.file_name())
                    .is_some_and(|n| n == "dnf");
                info!(host_is_dnf, "yum-complete-transaction not present, skipping cleanup");
                return Ok(RepairReport {
                    succeeded: true,
                    blocked_by_lock: false,
                    commands: Vec::new(),
                    detail: Some(if host_is_dnf {
                        "dnf host: no transaction journal to complete".to_string()
                    } else {
                        "yum-complete-transaction not installed".to_string()
                    }),
                });
            }
        };

        let result = self
            .run_bounded(
                vec![yct, "--cleanup-only".into()],
                self.config.timeouts.yum(),
            )
            .await?;

        if result.success() {
            Ok(RepairReport::ok(vec![result]))
        } else {
            let detail = failure_detail(&result);
            Ok(RepairReport::failed(vec![result], detail))
        }
    }

    async fn collect_forensics(&self) -> Result<()> {
        let stat = match &self.config.binaries.db_stat {
            Some(path) => path.display().to_string(),
            None => return Ok(()),
        };
        let result = self
            .run_bounded(
                vec![stat, "-CA".into(), "-h".into(), self.dbpath()],
                self.config.timeouts.query(),
            )
            .await?;
        debug!(
            exit = ?result.disposition,
            output = %result.stdout,
            "db_stat forensic capture"
        );
        Ok(())
    }

    async fn cleanup_duplicates(&self) -> Result<RepairReport> {
        let cleanup = self.bin(&self.config.binaries.package_cleanup, "package-cleanup")?;
        let result = self
            .run_bounded(
                vec![cleanup, "--cleandupes".into()],
                self.config.timeouts.yum(),
            )
            .await?;
        if result.success() {
            Ok(RepairReport::ok(vec![result]))
        } else {
            let detail = failure_detail(&result);
            Ok(RepairReport::failed(vec![result], detail))
        }
    }
}

/// A db4 table file under the database directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFile {
    pub name: String,
    pub path: PathBuf,
}

/// db4 table files are exactly the regular files whose basename starts with
/// an uppercase letter (`Packages`, `Name`, `Providename`, ...); the
/// environment files (`__db.001`, `.dbenv.lock`) are lowercase or hidden.
pub fn list_tables(db_path: &Path) -> Result<Vec<TableFile>> {
    let mut tables = Vec::new();
    for entry in std::fs::read_dir(db_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
            tables.push(TableFile {
                name,
                path: entry.path(),
            });
        }
    }
    tables.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tables)
}

/// Count stale `transaction-*` journal files under the yum state dir.
/// A missing directory simply means no stale transactions.
pub fn count_stale_transactions(state_dir: &Path) -> usize {
    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("transaction-")
        })
        .count()
}

/// Classify a finished `rpm -qa`.
pub fn classify_query(result: &CommandResult, min_packages: usize) -> RpmSymptom {
    match &result.disposition {
        ExitDisposition::TimedOut => RpmSymptom::QueryHung,
        ExitDisposition::SpawnFailed(err) => RpmSymptom::Unknown { raw: err.clone() },
        ExitDisposition::Signaled(sig)
            if *sig == libc::SIGSEGV || *sig == libc::SIGBUS =>
        {
            // rpm crashing inside libdb is a classic wedged-environment
            // presentation.
            RpmSymptom::DbNeedsRecover
        }
        ExitDisposition::Exited(0) => {
            let got = result.stdout_lines().count();
            if got == 0 {
                RpmSymptom::QueryEmpty
            } else if got < min_packages {
                RpmSymptom::QueryShort {
                    got,
                    expected: min_packages,
                }
            } else {
                RpmSymptom::Healthy
            }
        }
        _ => match signature::classify(SignatureSource::Rpm, result) {
            Some(SignatureOutcome::NeedsRecover) => RpmSymptom::DbNeedsRecover,
            Some(SignatureOutcome::Corrupt) => RpmSymptom::TableCorrupt {
                table: "Packages".to_string(),
                detail: failure_detail(result),
            },
            None => RpmSymptom::Unknown {
                raw: failure_detail(result),
            },
        },
    }
}

/// Classify a finished `db_verify <table>`. `None` means the table is fine.
pub fn classify_verify(table: &str, result: &CommandResult) -> Option<RpmSymptom> {
    match &result.disposition {
        ExitDisposition::Exited(0) => None,
        ExitDisposition::TimedOut => Some(RpmSymptom::TableCorrupt {
            table: table.to_string(),
            detail: "db_verify exceeded its deadline".to_string(),
        }),
        _ => Some(RpmSymptom::TableCorrupt {
            table: table.to_string(),
            detail: failure_detail(result),
        }),
    }
}

/// First meaningful stderr line, bounded, for transcripts and logs.
fn failure_detail(result: &CommandResult) -> String {
    let line = result
        .stderr
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no diagnostic output");
    let mut detail = line.trim().to_string();
    if detail.len() > 200 {
        detail.truncate(200);
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fixture(disposition: ExitDisposition, stdout: &str, stderr: &str) -> CommandResult {
        CommandResult {
            argv: vec!["/bin/rpm".into(), "-qa".into()],
            started_at: Utc::now(),
            duration_ms: 100,
            disposition,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            stdout_truncated: false,
            stderr_truncated: false,
            terminated_by_us: false,
        }
    }

    fn packages(n: usize) -> String {
        (0..n)
            .map(|i| format!("pkg{}-1.0-1.x86_64\n", i))
            .collect()
    }

    #[test]
    fn test_query_healthy_at_threshold() {
        let r = fixture(ExitDisposition::Exited(0), &packages(30), "");
        assert_eq!(classify_query(&r, 30), RpmSymptom::Healthy);
    }

    #[test]
    fn test_query_short_below_threshold() {
        let r = fixture(ExitDisposition::Exited(0), &packages(29), "");
        assert_eq!(
            classify_query(&r, 30),
            RpmSymptom::QueryShort {
                got: 29,
                expected: 30
            }
        );
    }

    #[test]
    fn test_query_empty() {
        let r = fixture(ExitDisposition::Exited(0), "", "");
        assert_eq!(classify_query(&r, 30), RpmSymptom::QueryEmpty);

        // Whitespace-only stdout is still empty.
        let r = fixture(ExitDisposition::Exited(0), "\n  \n", "");
        assert_eq!(classify_query(&r, 30), RpmSymptom::QueryEmpty);
    }

    #[test]
    fn test_query_timeout_is_hung() {
        let mut r = fixture(ExitDisposition::TimedOut, "", "");
        r.terminated_by_us = true;
        assert_eq!(classify_query(&r, 30), RpmSymptom::QueryHung);
    }

    #[test]
    fn test_query_recover_signature() {
        let r = fixture(
            ExitDisposition::Exited(1),
            "",
            "error: cannot open Packages index using db3 - (-30974)",
        );
        assert_eq!(classify_query(&r, 30), RpmSymptom::DbNeedsRecover);
    }

    #[test]
    fn test_query_segfault_needs_recover() {
        let r = fixture(ExitDisposition::Signaled(libc::SIGSEGV), "", "");
        assert_eq!(classify_query(&r, 30), RpmSymptom::DbNeedsRecover);
    }

    #[test]
    fn test_query_unclassified_failure_is_unknown() {
        let r = fixture(ExitDisposition::Exited(2), "", "some new failure mode");
        match classify_query(&r, 30) {
            RpmSymptom::Unknown { raw } => assert_eq!(raw, "some new failure mode"),
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_clean_table() {
        let r = fixture(ExitDisposition::Exited(0), "", "");
        assert_eq!(classify_verify("Name", &r), None);
    }

    #[test]
    fn test_verify_bad_table() {
        let r = fixture(
            ExitDisposition::Exited(1),
            "",
            "db_verify: DB_VERIFY_BAD: Database verification failed",
        );
        match classify_verify("Packages", &r) {
            Some(RpmSymptom::TableCorrupt { table, detail }) => {
                assert_eq!(table, "Packages");
                assert!(detail.contains("DB_VERIFY_BAD"));
            }
            other => panic!("expected TableCorrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_list_tables_filters_env_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Packages", "Name", "Providename", "__db.001", ".dbenv.lock"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("Subdir")).unwrap();

        let tables = list_tables(dir.path()).unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Name", "Packages", "Providename"]);
    }

    #[test]
    fn test_count_stale_transactions() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(count_stale_transactions(dir.path()), 0);

        std::fs::write(dir.path().join("transaction-all.12345"), b"").unwrap();
        std::fs::write(dir.path().join("transaction-done.12345"), b"").unwrap();
        std::fs::write(dir.path().join("history"), b"").unwrap();
        assert_eq!(count_stale_transactions(dir.path()), 2);

        assert_eq!(
            count_stale_transactions(&dir.path().join("does-not-exist")),
            0
        );
    }

    #[test]
    fn test_failure_detail_prefers_stderr() {
        let r = fixture(ExitDisposition::Exited(1), "", "\n  \nfirst real line\nsecond");
        assert_eq!(failure_detail(&r), "first real line");

        let r = fixture(ExitDisposition::Exited(1), "", "");
        assert_eq!(failure_detail(&r), "no diagnostic output");
    }
}
