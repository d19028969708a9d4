//! Run summaries: the one-line human summary and the JSON record.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::symptom::RepairAction;
use crate::transcript::{RunStatus, RunTranscript};

/// Exit code for configuration errors (bad flag values, unusable paths).
pub const EXIT_CONFIG_ERROR: i32 = 64;

/// Exit code for a missing required external binary.
pub const EXIT_MISSING_BINARY: i32 = 65;

/// Machine-readable final record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub passes: usize,
    pub actions: Vec<RepairAction>,
    pub notes: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transcript: RunTranscript,
}

impl RunSummary {
    pub fn from_transcript(transcript: &RunTranscript) -> Self {
        Self {
            run_id: transcript.run_id.clone(),
            status: transcript.status,
            exit_code: transcript.status.exit_code(),
            passes: transcript.passes.len(),
            actions: transcript.actions(),
            notes: transcript.notes.clone(),
            started_at: transcript.started_at,
            finished_at: transcript.finished_at,
            transcript: transcript.clone(),
        }
    }

    /// The single-line human summary, e.g.
    /// `status=REMEDIATED passes=2 actions=[kill_holders,recover_db]`.
    pub fn summary_line(&self) -> String {
        let actions: Vec<&str> = self.actions.iter().map(|a| a.name()).collect();
        let mut line = format!(
            "status={} passes={} actions=[{}]",
            self.status,
            self.passes,
            actions.join(",")
        );
        if !self.notes.is_empty() {
            line.push_str(&format!(" notes=[{}]", self.notes.join(",")));
        }
        line
    }

    /// Write the JSON record to a caller-chosen path.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
