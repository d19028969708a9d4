//! Symptom and repair-action vocabulary of the remediation state machine.
//!
//! Probes classify external command outcomes into an [`RpmSymptom`]; the
//! state machine answers each symptom with a [`RepairAction`]. Both are
//! plain tagged enums so the priority table stays data, not code.

use serde::{Deserialize, Serialize};

/// Classified state of the RPM database as observed by one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RpmSymptom {
    /// Probe completed and found nothing wrong.
    Healthy,

    /// `rpm -qa` exceeded its deadline and had to be killed.
    QueryHung,

    /// `rpm -qa` exited cleanly but printed no packages at all.
    QueryEmpty,

    /// `rpm -qa` printed fewer packages than plausibly installed.
    QueryShort { got: usize, expected: usize },

    /// `db_verify` rejected a table file.
    TableCorrupt { table: String, detail: String },

    /// An expected table file is missing from the database directory.
    TableMissing { table: String },

    /// Per-package lookups disagree with the primary index.
    IndexInconsistent,

    /// Leftover `transaction-*` journal files under the yum state dir.
    StaleYumTransaction { count: usize },

    /// A known stderr signature indicating the environment needs db_recover.
    DbNeedsRecover,

    /// Non-zero exit that no classification rule recognises.
    Unknown { raw: String },
}

impl RpmSymptom {
    pub fn is_healthy(&self) -> bool {
        matches!(self, RpmSymptom::Healthy)
    }

    /// Stable snake_case name, used for progress comparison and summaries.
    pub fn name(&self) -> &'static str {
        match self {
            RpmSymptom::Healthy => "healthy",
            RpmSymptom::QueryHung => "query_hung",
            RpmSymptom::QueryEmpty => "query_empty",
            RpmSymptom::QueryShort { .. } => "query_short",
            RpmSymptom::TableCorrupt { .. } => "table_corrupt",
            RpmSymptom::TableMissing { .. } => "table_missing",
            RpmSymptom::IndexInconsistent => "index_inconsistent",
            RpmSymptom::StaleYumTransaction { .. } => "stale_yum_transaction",
            RpmSymptom::DbNeedsRecover => "db_needs_recover",
            RpmSymptom::Unknown { .. } => "unknown",
        }
    }
}

impl std::fmt::Display for RpmSymptom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpmSymptom::QueryShort { got, expected } => {
                write!(f, "query_short(got={}, expected>={})", got, expected)
            }
            RpmSymptom::TableCorrupt { table, .. } => write!(f, "table_corrupt({})", table),
            RpmSymptom::TableMissing { table } => write!(f, "table_missing({})", table),
            RpmSymptom::StaleYumTransaction { count } => {
                write!(f, "stale_yum_transaction(count={})", count)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Repairs the state machine can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Run `db_recover` against the database environment.
    RecoverDb,

    /// Run `rpm --rebuilddb`. Heavyweight; at most once per run by default.
    RebuildDb,

    /// Run the yum transaction-journal cleanup.
    CleanYumTx,

    /// Terminate processes holding open handles on database files.
    KillHolders,

    /// Nothing applicable (unknown symptom, or repair disabled by config).
    Noop,
}

impl RepairAction {
    pub fn name(&self) -> &'static str {
        match self {
            RepairAction::RecoverDb => "recover_db",
            RepairAction::RebuildDb => "rebuild_db",
            RepairAction::CleanYumTx => "clean_yum_tx",
            RepairAction::KillHolders => "kill_holders",
            RepairAction::Noop => "noop",
        }
    }
}

impl std::fmt::Display for RepairAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symptom_names_are_stable() {
        assert_eq!(RpmSymptom::Healthy.name(), "healthy");
        assert_eq!(RpmSymptom::QueryHung.name(), "query_hung");
        assert_eq!(
            RpmSymptom::TableCorrupt {
                table: "Packages".into(),
                detail: "DB_VERIFY_BAD".into()
            }
            .name(),
            "table_corrupt"
        );
    }

    #[test]
    fn test_symptom_display_carries_payload() {
        let s = RpmSymptom::QueryShort {
            got: 29,
            expected: 30,
        };
        assert_eq!(s.to_string(), "query_short(got=29, expected>=30)");

        let s = RpmSymptom::StaleYumTransaction { count: 2 };
        assert_eq!(s.to_string(), "stale_yum_transaction(count=2)");
    }

    #[test]
    fn test_symptom_serde_roundtrip() {
        let s = RpmSymptom::TableCorrupt {
            table: "Providename".into(),
            detail: "page 7 unreadable".into(),
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("table_corrupt"));
        let back: RpmSymptom = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn test_action_serde_is_snake_case() {
        let json = serde_json::to_string(&RepairAction::CleanYumTx).unwrap();
        assert_eq!(json, "\"clean_yum_tx\"");
    }
}
