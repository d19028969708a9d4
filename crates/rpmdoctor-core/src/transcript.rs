//! Append-only audit log of one remediation run.
//!
//! The state machine is the only writer. Each pass records what was
//! observed, which repairs were applied (or simulated), and what a
//! follow-up probe saw, so the final status is reproducible from the
//! transcript alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::symptom::{RepairAction, RpmSymptom};

/// Final classification of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// A full pass found nothing wrong and no repair was ever applied.
    Ok,
    /// Repairs were applied and a subsequent full pass was clean.
    Remediated,
    /// Passes ran out but the symptom set was still changing.
    Partial,
    /// No progress, a non-recoverable repair failure, or the deadline.
    Failed,
}

impl RunStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RunStatus::Ok => "OK",
            RunStatus::Remediated => "REMEDIATED",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
        }
    }

    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Ok | RunStatus::Remediated => 0,
            RunStatus::Partial => 1,
            RunStatus::Failed => 2,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One repair attempt inside a pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRecord {
    pub action: RepairAction,
    /// Pass number the repair ran in (1-based).
    pub pass: u32,
    pub succeeded: bool,
    /// True in dry-run mode: the repair was logged, not executed.
    pub simulated: bool,
    /// True when another package manager held the lock and the repair was
    /// skipped for this pass.
    pub blocked_by_lock: bool,
    /// Free-form context (killed pids, stderr snippet, ...).
    pub detail: Option<String>,
}

impl RepairRecord {
    pub fn applied(action: RepairAction, pass: u32, succeeded: bool) -> Self {
        Self {
            action,
            pass,
            succeeded,
            simulated: false,
            blocked_by_lock: false,
            detail: None,
        }
    }

    pub fn simulated(action: RepairAction, pass: u32) -> Self {
        Self {
            action,
            pass,
            succeeded: true,
            simulated: true,
            blocked_by_lock: false,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One probe→repair→reprobe iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassRecord {
    pub pass: u32,
    pub observed: RpmSymptom,
    pub repairs: Vec<RepairRecord>,
    /// What a targeted re-probe saw after the repair, if one ran.
    pub post_symptom: Option<RpmSymptom>,
}

/// Complete record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTranscript {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub passes: Vec<PassRecord>,
    pub status: RunStatus,
    /// Abnormal-condition markers (`deadline`, `inspector_unavailable`, ...).
    pub notes: Vec<String>,
}

impl RunTranscript {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            passes: Vec::new(),
            status: RunStatus::Failed,
            notes: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// All non-noop actions in application order.
    pub fn actions(&self) -> Vec<RepairAction> {
        self.passes
            .iter()
            .flat_map(|p| p.repairs.iter())
            .filter(|r| r.action != RepairAction::Noop)
            .map(|r| r.action)
            .collect()
    }

    /// Count of primary (non-kill, non-noop) repairs.
    pub fn repair_count(&self) -> usize {
        self.actions()
            .iter()
            .filter(|a| !matches!(a, RepairAction::KillHolders))
            .count()
    }

    pub fn rebuild_count(&self) -> usize {
        self.actions()
            .iter()
            .filter(|a| matches!(a, RepairAction::RebuildDb))
            .count()
    }

    /// Whether the observed symptom changed between the last two passes.
    /// This is the "progress" signal distinguishing PARTIAL from FAILED.
    pub fn made_progress(&self) -> bool {
        let n = self.passes.len();
        if n < 2 {
            return false;
        }
        self.passes[n - 1].observed.name() != self.passes[n - 2].observed.name()
    }
}

impl Default for RunTranscript {
    fn default() -> Self {
        Self::new()
    }
}
