//! The remediation state machine.
//!
//! A bounded loop over `max_passes`. Each pass probes the database (query,
//! then tables, then index consistency, then yum transactions; the first
//! non-healthy classification wins), answers the symptom with exactly one
//! primary repair chosen from a fixed priority table, and re-probes before
//! the next pass. Holder killing is an auxiliary step ordered around the
//! primary repair; a rebuild is never started while holders exist and is
//! always followed by another holder sweep, because a rebuilt database
//! invalidates every cached file handle.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::error::{DoctorError, Result};
use crate::holders::HandleInspector;
use crate::probe::{DbProbe, ProbeReport};
use crate::supervisor::DeadlineBudget;
use crate::symptom::{RepairAction, RpmSymptom};
use crate::transcript::{PassRecord, RepairRecord, RunStatus, RunTranscript};
use crate::yum::{StuckYumCheck, StuckYumOutcome};

/// Which targeted probe to run after a repair, before the next full pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reprobe {
    Query,
    TablesThenQuery,
    Yum,
    None,
}

/// One pass's worth of repair, derived from the priority table.
#[derive(Debug, Clone, Copy)]
struct RepairPlan {
    kill_before: bool,
    primary: RepairAction,
    kill_after: bool,
    reprobe: Reprobe,
}

/// Drives probes and repairs until the database is healthy, the pass budget
/// is exhausted, or something non-recoverable happens.
pub struct Remediator {
    config: RunConfig,
    probe: Arc<dyn DbProbe>,
    inspector: Arc<dyn HandleInspector>,
    budget: Arc<DeadlineBudget>,
}

impl Remediator {
    pub fn new(
        config: RunConfig,
        probe: Arc<dyn DbProbe>,
        inspector: Arc<dyn HandleInspector>,
        budget: Arc<DeadlineBudget>,
    ) -> Self {
        Self {
            config,
            probe,
            inspector,
            budget,
        }
    }

    /// Run to completion. Deadline expiry and inspector loss end the run
    /// with a FAILED transcript; only configuration problems and internal
    /// bugs surface as `Err`.
    pub async fn run(&self) -> Result<RunTranscript> {
        let mut transcript = RunTranscript::new();
        info!(
            event = "run.started",
            run_id = %transcript.run_id,
            dbpath = %self.config.db_path.display(),
            dry_run = self.config.dry_run,
        );

        match self.drive(&mut transcript).await {
            Ok(status) => transcript.finish(status),
            Err(DoctorError::Deadline) => {
                error!(run_id = %transcript.run_id, "overall deadline exceeded");
                transcript.note("deadline");
                transcript.finish(RunStatus::Failed);
            }
            Err(DoctorError::InspectorUnavailable(msg)) => {
                error!(run_id = %transcript.run_id, %msg, "inspector unavailable");
                transcript.note(format!("inspector_unavailable: {}", msg));
                transcript.finish(RunStatus::Failed);
            }
            Err(other) => return Err(other),
        }

        info!(
            event = "run.finished",
            run_id = %transcript.run_id,
            status = %transcript.status,
            passes = transcript.passes.len(),
        );
        Ok(transcript)
    }

    async fn drive(&self, transcript: &mut RunTranscript) -> Result<RunStatus> {
        if !self.config.has_free_disk_space() {
            return Err(DoctorError::Config(format!(
                "need at least {} free bytes on {}",
                self.config.min_free_bytes,
                self.config.db_path.display()
            )));
        }

        if self.config.features.check_stuck_yum {
            match StuckYumCheck::new().check(self.config.dry_run) {
                StuckYumOutcome::Killed { pid } => {
                    transcript.note(format!("stuck_yum_killed: {}", pid));
                }
                StuckYumOutcome::Indeterminate { reason } => {
                    warn!(%reason, "stuck-yum check inconclusive");
                }
                StuckYumOutcome::NotStuck | StuckYumOutcome::WouldKill { .. } => {}
            }
        }

        // Repairs already simulated in this dry run: the next observation of
        // the same symptom is assumed fixed.
        let mut simulated_fixed: HashSet<&'static str> = HashSet::new();
        let mut recover_attempted = false;
        let mut rebuild_attempts = 0usize;
        let mut applied_any = false;

        for pass in 1..=self.config.max_passes {
            if self.budget.expired() {
                return Err(DoctorError::Deadline);
            }
            info!(event = "pass.started", pass);

            if self.config.features.forensic {
                self.probe.collect_forensics().await?;
            }

            let observed = self.full_probe().await?;
            info!(event = "pass.observed", pass, symptom = %observed);

            if observed.is_healthy() {
                transcript.passes.push(PassRecord {
                    pass,
                    observed,
                    repairs: Vec::new(),
                    post_symptom: None,
                });
                let status = if applied_any {
                    RunStatus::Remediated
                } else {
                    RunStatus::Ok
                };
                self.after_healthy_run(transcript).await;
                return Ok(status);
            }

            if self.config.dry_run && simulated_fixed.contains(observed.name()) {
                // The repair for this symptom was already simulated; in a
                // real run it would have taken effect by now.
                transcript.passes.push(PassRecord {
                    pass,
                    observed,
                    repairs: Vec::new(),
                    post_symptom: None,
                });
                return Ok(RunStatus::Remediated);
            }

            let plan = self.select_plan(&observed, recover_attempted, rebuild_attempts, transcript);

            if self.config.dry_run {
                let mut repairs = Vec::new();
                if plan.kill_before && self.config.features.kill_stuck {
                    repairs.push(RepairRecord::simulated(RepairAction::KillHolders, pass));
                }
                if plan.primary != RepairAction::Noop {
                    repairs.push(RepairRecord::simulated(plan.primary, pass));
                    simulated_fixed.insert(observed.name());
                    applied_any = true;
                }
                if plan.kill_after && self.config.features.kill_stuck {
                    repairs.push(RepairRecord::simulated(RepairAction::KillHolders, pass));
                }
                info!(event = "pass.simulated", pass, primary = %plan.primary);
                transcript.passes.push(PassRecord {
                    pass,
                    observed,
                    repairs,
                    post_symptom: None,
                });
                continue;
            }

            let mut repairs = Vec::new();

            if plan.kill_before {
                if let Some(record) = self.kill_holders_step(pass).await? {
                    repairs.push(record);
                }
            }

            let mut rebuild_failed = false;
            match plan.primary {
                RepairAction::RecoverDb => {
                    let report = self.probe.recover_db().await?;
                    recover_attempted = true;
                    applied_any = true;
                    let mut record =
                        RepairRecord::applied(RepairAction::RecoverDb, pass, report.succeeded);
                    if let Some(detail) = report.detail {
                        record = record.with_detail(detail);
                    }
                    repairs.push(record);
                }
                RepairAction::RebuildDb => {
                    rebuild_attempts += 1;
                    applied_any = true;
                    let report = self.probe.rebuild_db().await?;
                    let mut record =
                        RepairRecord::applied(RepairAction::RebuildDb, pass, report.succeeded);
                    if let Some(detail) = report.detail {
                        record = record.with_detail(detail);
                    }
                    rebuild_failed = !report.succeeded;
                    repairs.push(record);
                }
                RepairAction::CleanYumTx => {
                    let report = self.probe.clean_yum_transactions().await?;
                    let mut record = RepairRecord::applied(
                        RepairAction::CleanYumTx,
                        pass,
                        report.succeeded,
                    );
                    record.blocked_by_lock = report.blocked_by_lock;
                    if let Some(detail) = report.detail {
                        record = record.with_detail(detail);
                    }
                    if report.blocked_by_lock {
                        transcript.note("blocked_by_lock");
                    } else {
                        applied_any = true;
                    }
                    repairs.push(record);
                }
                RepairAction::KillHolders | RepairAction::Noop => {
                    repairs.push(RepairRecord::applied(RepairAction::Noop, pass, true));
                }
            }

            if plan.kill_after && !rebuild_failed {
                if let Some(record) = self.kill_holders_step(pass).await? {
                    repairs.push(record);
                }
            }

            if rebuild_failed {
                transcript.passes.push(PassRecord {
                    pass,
                    observed,
                    repairs,
                    post_symptom: None,
                });
                transcript.note("rebuild_failed");
                if self.budget.expired() {
                    transcript.note("deadline");
                }
                return Ok(RunStatus::Failed);
            }

            let post_symptom = self.reprobe(plan.reprobe).await?;
            if let Some(post) = &post_symptom {
                info!(event = "pass.reprobed", pass, symptom = %post);
            }

            transcript.passes.push(PassRecord {
                pass,
                observed,
                repairs,
                post_symptom,
            });
        }

        // Pass budget exhausted without a clean pass.
        if transcript.made_progress() {
            Ok(RunStatus::Partial)
        } else {
            Ok(RunStatus::Failed)
        }
    }

    /// Probe in fixed order; the first non-healthy classification wins.
    async fn full_probe(&self) -> Result<RpmSymptom> {
        let report = self.probe.probe_query().await?;
        if !report.symptom.is_healthy() {
            return Ok(report.symptom);
        }

        if self.config.features.check_tables {
            let report = self.probe.probe_tables().await?;
            if !report.symptom.is_healthy() {
                return Ok(report.symptom);
            }
        }

        if self.config.features.check_index {
            let report = self.probe.probe_index_consistency().await?;
            if !report.symptom.is_healthy() {
                return Ok(report.symptom);
            }
        }

        if self.config.features.yum_transactions {
            let report = self.probe.probe_yum_transactions().await?;
            if !report.symptom.is_healthy() {
                return Ok(report.symptom);
            }
        }

        Ok(RpmSymptom::Healthy)
    }

    /// The priority table, plus escalation and budget bookkeeping.
    fn select_plan(
        &self,
        symptom: &RpmSymptom,
        recover_attempted: bool,
        rebuild_attempts: usize,
        transcript: &mut RunTranscript,
    ) -> RepairPlan {
        let plan = match symptom {
            RpmSymptom::QueryHung => RepairPlan {
                kill_before: true,
                primary: self.recover_or_escalate(recover_attempted),
                kill_after: false,
                reprobe: Reprobe::Query,
            },
            RpmSymptom::DbNeedsRecover => RepairPlan {
                kill_before: false,
                primary: self.recover_or_escalate(recover_attempted),
                kill_after: true,
                reprobe: Reprobe::Query,
            },
            RpmSymptom::QueryEmpty | RpmSymptom::QueryShort { .. } => RepairPlan {
                kill_before: false,
                primary: self.recover_or_escalate(recover_attempted),
                kill_after: false,
                reprobe: Reprobe::Query,
            },
            RpmSymptom::TableCorrupt { .. } | RpmSymptom::TableMissing { .. } => RepairPlan {
                kill_before: true,
                primary: RepairAction::RebuildDb,
                kill_after: true,
                reprobe: Reprobe::TablesThenQuery,
            },
            RpmSymptom::IndexInconsistent => RepairPlan {
                kill_before: true,
                primary: RepairAction::RebuildDb,
                kill_after: true,
                reprobe: Reprobe::Query,
            },
            RpmSymptom::StaleYumTransaction { .. } => RepairPlan {
                kill_before: false,
                primary: RepairAction::CleanYumTx,
                kill_after: false,
                reprobe: Reprobe::Yum,
            },
            RpmSymptom::Healthy | RpmSymptom::Unknown { .. } => RepairPlan {
                kill_before: false,
                primary: RepairAction::Noop,
                kill_after: false,
                reprobe: Reprobe::None,
            },
        };

        // Escalations land on RebuildDb too, so gate and normalise it in one
        // place: a rebuild is always bracketed by holder sweeps.
        if plan.primary == RepairAction::RebuildDb {
            if !self.config.features.rebuild {
                transcript.note("rebuild_disabled");
                return RepairPlan {
                    primary: RepairAction::Noop,
                    kill_before: false,
                    kill_after: false,
                    reprobe: Reprobe::None,
                };
            }
            if rebuild_attempts >= 1 && !self.config.features.allow_multiple_rebuilds {
                transcript.note("rebuild_budget_exhausted");
                return RepairPlan {
                    primary: RepairAction::Noop,
                    kill_before: false,
                    kill_after: false,
                    reprobe: Reprobe::None,
                };
            }
            return RepairPlan {
                kill_before: true,
                kill_after: true,
                ..plan
            };
        }

        plan
    }

    /// Recovery-class symptoms get `db_recover` once; if the database is
    /// still bad on a later pass, the answer is a rebuild.
    fn recover_or_escalate(&self, recover_attempted: bool) -> RepairAction {
        if recover_attempted {
            RepairAction::RebuildDb
        } else {
            RepairAction::RecoverDb
        }
    }

    async fn kill_holders_step(&self, pass: u32) -> Result<Option<RepairRecord>> {
        if !self.config.features.kill_stuck {
            return Ok(None);
        }
        let paths = self.db_files();
        let report = self
            .inspector
            .kill_holders(&paths, self.config.stuck_signal)
            .await?;
        if report.killed.is_empty() && report.survivors.is_empty() {
            return Ok(None);
        }
        let detail = format!(
            "killed={:?} survivors={:?}",
            report.killed, report.survivors
        );
        info!(event = "holders.killed", pass, detail = %detail);
        Ok(Some(
            RepairRecord::applied(RepairAction::KillHolders, pass, report.all_reaped())
                .with_detail(detail),
        ))
    }

    async fn reprobe(&self, which: Reprobe) -> Result<Option<RpmSymptom>> {
        let report: ProbeReport = match which {
            Reprobe::Query => self.probe.probe_query().await?,
            Reprobe::TablesThenQuery => {
                let tables = self.probe.probe_tables().await?;
                if tables.symptom.is_healthy() {
                    self.probe.probe_query().await?
                } else {
                    tables
                }
            }
            Reprobe::Yum => self.probe.probe_yum_transactions().await?,
            Reprobe::None => return Ok(None),
        };
        Ok(Some(report.symptom))
    }

    /// Everything under the database directory, for the holder sweep.
    fn db_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.config.db_path) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Optional duplicate-package cleanup, only after a clean run and only
    /// when explicitly enabled.
    async fn after_healthy_run(&self, transcript: &mut RunTranscript) {
        if !self.config.features.dupe_cleanup || self.config.dry_run {
            return;
        }
        match self.probe.cleanup_duplicates().await {
            Ok(report) if report.succeeded => {
                transcript.note("dupe_cleanup_ran");
            }
            Ok(report) => {
                warn!(detail = ?report.detail, "duplicate cleanup failed");
                transcript.note("dupe_cleanup_failed");
            }
            Err(err) => {
                warn!(%err, "duplicate cleanup errored");
            }
        }
    }
}
