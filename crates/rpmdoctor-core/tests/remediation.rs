//! End-to-end state-machine scenarios driven by scripted probe fakes.
//!
//! The fakes answer each probe from a queue and fall back to "healthy"
//! (resp. "repair succeeded") when their queue runs dry, which mirrors a
//! database that stays fixed once repaired.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rpmdoctor_core::probe::{DbProbe, ProbeReport, RepairReport};
use rpmdoctor_core::{
    DeadlineBudget, DoctorError, HandleInspector, Holder, KillReport, Remediator, RepairAction,
    Result, RpmSymptom, RunConfig, RunStatus, RunSummary,
};

#[derive(Default)]
struct ScriptedProbe {
    query: Mutex<VecDeque<RpmSymptom>>,
    tables: Mutex<VecDeque<RpmSymptom>>,
    index: Mutex<VecDeque<RpmSymptom>>,
    yum: Mutex<VecDeque<RpmSymptom>>,
    recover: Mutex<VecDeque<RepairReport>>,
    rebuild: Mutex<VecDeque<RepairReport>>,
    clean: Mutex<VecDeque<RepairReport>>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_query(&self, s: RpmSymptom) {
        self.query.lock().unwrap().push_back(s);
    }

    fn push_tables(&self, s: RpmSymptom) {
        self.tables.lock().unwrap().push_back(s);
    }

    fn push_yum(&self, s: RpmSymptom) {
        self.yum.lock().unwrap().push_back(s);
    }

    fn push_rebuild(&self, r: RepairReport) {
        self.rebuild.lock().unwrap().push_back(r);
    }

    fn push_recover(&self, r: RepairReport) {
        self.recover.lock().unwrap().push_back(r);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn pop_symptom(queue: &Mutex<VecDeque<RpmSymptom>>) -> ProbeReport {
        let symptom = queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RpmSymptom::Healthy);
        ProbeReport::of(symptom, Vec::new())
    }

    fn pop_repair(queue: &Mutex<VecDeque<RepairReport>>) -> RepairReport {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| RepairReport::ok(Vec::new()))
    }
}

#[async_trait]
impl DbProbe for ScriptedProbe {
    async fn probe_query(&self) -> Result<ProbeReport> {
        self.record("query");
        Ok(Self::pop_symptom(&self.query))
    }

    async fn probe_tables(&self) -> Result<ProbeReport> {
        self.record("tables");
        Ok(Self::pop_symptom(&self.tables))
    }

    async fn probe_index_consistency(&self) -> Result<ProbeReport> {
        self.record("index");
        Ok(Self::pop_symptom(&self.index))
    }

    async fn probe_yum_transactions(&self) -> Result<ProbeReport> {
        self.record("yum");
        Ok(Self::pop_symptom(&self.yum))
    }

    async fn recover_db(&self) -> Result<RepairReport> {
        self.record("recover");
        Ok(Self::pop_repair(&self.recover))
    }

    async fn rebuild_db(&self) -> Result<RepairReport> {
        self.record("rebuild");
        Ok(Self::pop_repair(&self.rebuild))
    }

    async fn clean_yum_transactions(&self) -> Result<RepairReport> {
        self.record("clean");
        Ok(Self::pop_repair(&self.clean))
    }

    async fn collect_forensics(&self) -> Result<()> {
        self.record("forensic");
        Ok(())
    }

    async fn cleanup_duplicates(&self) -> Result<RepairReport> {
        self.record("dupes");
        Ok(RepairReport::ok(Vec::new()))
    }
}

struct ScriptedInspector {
    reports: Mutex<VecDeque<KillReport>>,
    unavailable: bool,
    kill_calls: Mutex<usize>,
}

impl ScriptedInspector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reports: Mutex::new(VecDeque::new()),
            unavailable: false,
            kill_calls: Mutex::new(0),
        })
    }

    fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            reports: Mutex::new(VecDeque::new()),
            unavailable: true,
            kill_calls: Mutex::new(0),
        })
    }

    fn push_report(&self, report: KillReport) {
        self.reports.lock().unwrap().push_back(report);
    }

    fn kill_calls(&self) -> usize {
        *self.kill_calls.lock().unwrap()
    }
}

#[async_trait]
impl HandleInspector for ScriptedInspector {
    async fn holders(&self, _paths: &[PathBuf]) -> Result<Vec<Holder>> {
        Ok(Vec::new())
    }

    async fn kill_holders(&self, _paths: &[PathBuf], _signal: i32) -> Result<KillReport> {
        if self.unavailable {
            return Err(DoctorError::InspectorUnavailable(
                "lsof not installed".to_string(),
            ));
        }
        *self.kill_calls.lock().unwrap() += 1;
        Ok(self
            .reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

fn test_config() -> RunConfig {
    RunConfig {
        db_path: std::env::temp_dir(),
        min_free_bytes: 0,
        ..RunConfig::default()
    }
}

fn remediator(
    config: RunConfig,
    probe: Arc<ScriptedProbe>,
    inspector: Arc<ScriptedInspector>,
) -> Remediator {
    let budget = Arc::new(DeadlineBudget::new(Duration::from_secs(900)));
    Remediator::new(config, probe, inspector, budget)
}

/// Every pass applies at most one primary (non-kill) repair.
fn assert_one_primary_repair_per_pass(transcript: &rpmdoctor_core::RunTranscript) {
    for pass in &transcript.passes {
        let primaries = pass
            .repairs
            .iter()
            .filter(|r| {
                r.action != RepairAction::KillHolders && r.action != RepairAction::Noop
            })
            .count();
        assert!(
            primaries <= 1,
            "pass {} applied {} primary repairs",
            pass.pass,
            primaries
        );
    }
}

// ---------------------------------------------------------------------------
// The six literal scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn healthy_database_needs_one_pass_and_no_repairs() {
    let probe = ScriptedProbe::new();
    let inspector = ScriptedInspector::new();
    let transcript = remediator(test_config(), probe.clone(), inspector)
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.status, RunStatus::Ok);
    assert_eq!(transcript.passes.len(), 1);
    assert!(transcript.actions().is_empty());

    let summary = RunSummary::from_transcript(&transcript);
    assert_eq!(summary.summary_line(), "status=OK passes=1 actions=[]");
    assert_eq!(summary.exit_code, 0);
}

#[tokio::test]
async fn hung_query_is_killed_then_recovered() {
    let probe = ScriptedProbe::new();
    probe.push_query(RpmSymptom::QueryHung);
    // Post-repair re-probe and the next full pass both see a healthy query.
    let inspector = ScriptedInspector::new();
    inspector.push_report(KillReport {
        killed: vec![4242],
        survivors: vec![],
    });

    let transcript = remediator(test_config(), probe.clone(), inspector)
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.status, RunStatus::Remediated);
    assert_eq!(
        transcript.actions(),
        vec![RepairAction::KillHolders, RepairAction::RecoverDb]
    );
    assert_one_primary_repair_per_pass(&transcript);

    let summary = RunSummary::from_transcript(&transcript);
    assert_eq!(
        summary.summary_line(),
        "status=REMEDIATED passes=2 actions=[kill_holders,recover_db]"
    );
    assert_eq!(summary.exit_code, 0);
}

#[tokio::test]
async fn corrupt_packages_table_is_rebuilt_after_killing_holders() {
    let probe = ScriptedProbe::new();
    probe.push_tables(RpmSymptom::TableCorrupt {
        table: "Packages".to_string(),
        detail: "DB_VERIFY_BAD".to_string(),
    });
    let inspector = ScriptedInspector::new();
    inspector.push_report(KillReport {
        killed: vec![101],
        survivors: vec![],
    });
    // The post-rebuild sweep finds nobody left.

    let transcript = remediator(test_config(), probe.clone(), inspector)
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.status, RunStatus::Remediated);
    assert_eq!(
        transcript.actions(),
        vec![RepairAction::KillHolders, RepairAction::RebuildDb]
    );

    // The action immediately preceding the rebuild is the holder sweep.
    let actions = transcript.actions();
    let rebuild_at = actions
        .iter()
        .position(|a| *a == RepairAction::RebuildDb)
        .unwrap();
    assert_eq!(actions[rebuild_at - 1], RepairAction::KillHolders);
}

#[tokio::test]
async fn stale_yum_transaction_is_cleaned() {
    let probe = ScriptedProbe::new();
    probe.push_yum(RpmSymptom::StaleYumTransaction { count: 1 });

    let transcript = remediator(test_config(), probe.clone(), ScriptedInspector::new())
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.status, RunStatus::Remediated);
    assert_eq!(transcript.actions(), vec![RepairAction::CleanYumTx]);
    assert!(probe.calls().contains(&"clean"));
}

#[tokio::test]
async fn unclassifiable_failures_exhaust_passes_without_progress() {
    let probe = ScriptedProbe::new();
    for _ in 0..3 {
        probe.push_query(RpmSymptom::Unknown {
            raw: "inscrutable stderr".to_string(),
        });
    }

    let transcript = remediator(test_config(), probe.clone(), ScriptedInspector::new())
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.status, RunStatus::Failed);
    assert_eq!(transcript.passes.len(), 3);
    for pass in &transcript.passes {
        assert!(pass
            .repairs
            .iter()
            .all(|r| r.action == RepairAction::Noop));
    }
    assert_eq!(RunSummary::from_transcript(&transcript).exit_code, 2);
}

#[tokio::test]
async fn expired_deadline_fails_the_run() {
    let probe = ScriptedProbe::new();
    probe.push_query(RpmSymptom::QueryHung);
    let budget = Arc::new(DeadlineBudget::new(Duration::ZERO));
    let transcript = Remediator::new(
        test_config(),
        probe,
        ScriptedInspector::new(),
        budget,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(transcript.status, RunStatus::Failed);
    assert!(transcript.notes.iter().any(|n| n == "deadline"));
    assert_eq!(RunSummary::from_transcript(&transcript).exit_code, 2);
}

// ---------------------------------------------------------------------------
// Quantified invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rebuild_runs_at_most_once_per_run() {
    let probe = ScriptedProbe::new();
    // Tables stay corrupt no matter what.
    for _ in 0..8 {
        probe.push_tables(RpmSymptom::TableCorrupt {
            table: "Packages".to_string(),
            detail: "DB_VERIFY_BAD".to_string(),
        });
    }

    let transcript = remediator(test_config(), probe.clone(), ScriptedInspector::new())
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.rebuild_count(), 1);
    assert!(transcript
        .notes
        .iter()
        .any(|n| n == "rebuild_budget_exhausted"));
    assert_one_primary_repair_per_pass(&transcript);
}

#[tokio::test]
async fn multiple_rebuilds_need_explicit_permission() {
    let probe = ScriptedProbe::new();
    for _ in 0..8 {
        probe.push_tables(RpmSymptom::TableCorrupt {
            table: "Packages".to_string(),
            detail: "DB_VERIFY_BAD".to_string(),
        });
    }
    let mut config = test_config();
    config.features.allow_multiple_rebuilds = true;

    let transcript = remediator(config, probe.clone(), ScriptedInspector::new())
        .run()
        .await
        .unwrap();

    assert!(transcript.rebuild_count() > 1);
}

#[tokio::test]
async fn recover_escalates_to_rebuild_when_query_stays_short() {
    let probe = ScriptedProbe::new();
    // Pass 1 observes a short query, the re-probe still sees it, and pass 2
    // observes it again: recovery did not help, so pass 2 must rebuild.
    for _ in 0..3 {
        probe.push_query(RpmSymptom::QueryShort {
            got: 12,
            expected: 30,
        });
    }

    let transcript = remediator(test_config(), probe.clone(), ScriptedInspector::new())
        .run()
        .await
        .unwrap();

    let actions = transcript.actions();
    assert!(actions.contains(&RepairAction::RecoverDb));
    assert!(actions.contains(&RepairAction::RebuildDb));
    let recover_at = actions
        .iter()
        .position(|a| *a == RepairAction::RecoverDb)
        .unwrap();
    let rebuild_at = actions
        .iter()
        .position(|a| *a == RepairAction::RebuildDb)
        .unwrap();
    assert!(recover_at < rebuild_at);
    assert_eq!(transcript.status, RunStatus::Remediated);
}

#[tokio::test]
async fn failed_rebuild_is_non_recoverable() {
    let probe = ScriptedProbe::new();
    probe.push_tables(RpmSymptom::TableCorrupt {
        table: "Name".to_string(),
        detail: "DB_VERIFY_BAD".to_string(),
    });
    probe.push_rebuild(RepairReport::failed(
        Vec::new(),
        "rpmdb: damaged header",
    ));

    let transcript = remediator(test_config(), probe.clone(), ScriptedInspector::new())
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.status, RunStatus::Failed);
    assert!(transcript.notes.iter().any(|n| n == "rebuild_failed"));
}

#[tokio::test]
async fn partial_when_symptoms_change_but_passes_run_out() {
    let probe = ScriptedProbe::new();
    // Recovery keeps failing, and each pass sees a different presentation.
    probe.push_query(RpmSymptom::QueryEmpty);
    probe.push_recover(RepairReport::failed(Vec::new(), "db_recover: cannot allocate"));
    probe.push_query(RpmSymptom::QueryEmpty); // re-probe after recover
    probe.push_query(RpmSymptom::Unknown {
        raw: "novel".to_string(),
    });
    probe.push_query(RpmSymptom::QueryShort {
        got: 5,
        expected: 30,
    });
    let mut config = test_config();
    config.features.rebuild = false;

    let transcript = remediator(config, probe.clone(), ScriptedInspector::new())
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.passes.len(), 3);
    assert_eq!(transcript.status, RunStatus::Partial);
    assert_eq!(RunSummary::from_transcript(&transcript).exit_code, 1);
}

#[tokio::test]
async fn inspector_loss_fails_a_run_that_needs_it() {
    let probe = ScriptedProbe::new();
    probe.push_query(RpmSymptom::QueryHung);

    let transcript = remediator(test_config(), probe.clone(), ScriptedInspector::unavailable())
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.status, RunStatus::Failed);
    assert!(transcript
        .notes
        .iter()
        .any(|n| n.starts_with("inspector_unavailable")));
}

#[tokio::test]
async fn kill_stuck_disabled_skips_the_sweep() {
    let probe = ScriptedProbe::new();
    probe.push_query(RpmSymptom::QueryHung);
    let inspector = ScriptedInspector::new();
    let mut config = test_config();
    config.features.kill_stuck = false;

    let transcript = remediator(config, probe.clone(), inspector.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(inspector.kill_calls(), 0);
    assert_eq!(transcript.actions(), vec![RepairAction::RecoverDb]);
    assert_eq!(transcript.status, RunStatus::Remediated);
}

// ---------------------------------------------------------------------------
// Dry-run and idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_simulates_repairs_without_executing() {
    let probe = ScriptedProbe::new();
    probe.push_query(RpmSymptom::QueryHung);
    probe.push_query(RpmSymptom::QueryHung); // still hung next pass
    let mut config = test_config();
    config.dry_run = true;

    let transcript = remediator(config, probe.clone(), ScriptedInspector::new())
        .run()
        .await
        .unwrap();

    assert_eq!(transcript.status, RunStatus::Remediated);
    assert!(transcript
        .passes
        .iter()
        .flat_map(|p| p.repairs.iter())
        .all(|r| r.simulated));
    // No repair actually ran.
    assert!(!probe.calls().contains(&"recover"));
    assert!(!probe.calls().contains(&"rebuild"));
}

#[tokio::test]
async fn second_run_after_remediation_is_clean() {
    // First run remediates.
    let probe = ScriptedProbe::new();
    probe.push_query(RpmSymptom::QueryHung);
    let transcript = remediator(test_config(), probe, ScriptedInspector::new())
        .run()
        .await
        .unwrap();
    assert_eq!(transcript.status, RunStatus::Remediated);

    // Second run sees only health and applies nothing.
    let probe = ScriptedProbe::new();
    let transcript = remediator(test_config(), probe, ScriptedInspector::new())
        .run()
        .await
        .unwrap();
    assert_eq!(transcript.status, RunStatus::Ok);
    assert!(transcript.actions().is_empty());
}

#[tokio::test]
async fn probe_order_is_query_tables_index_yum() {
    let probe = ScriptedProbe::new();
    let _ = remediator(test_config(), probe.clone(), ScriptedInspector::new())
        .run()
        .await
        .unwrap();

    assert_eq!(probe.calls(), vec!["query", "tables", "index", "yum"]);
}
