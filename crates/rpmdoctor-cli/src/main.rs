//! rpmdoctor: detect and repair corruption in the RPM database.
//!
//! Designed to run unattended from a scheduler: one invocation probes the
//! database, applies a bounded sequence of repairs if needed, prints a
//! one-line summary (or a JSON record with `--json-summary`), and exits
//! 0/1/2 for healthy-or-remediated/partial/failed, 64 for configuration
//! errors and 65 for missing external binaries.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rpmdoctor_core::{
    init_tracing, Binaries, DeadlineBudget, DoctorError, LsofInspector, Remediator, RpmProbe,
    RunConfig, RunSummary, Supervisor, EXIT_CONFIG_ERROR, EXIT_MISSING_BINARY,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Verbosity {
    Quiet,
    Info,
    Debug,
}

impl Verbosity {
    fn level(self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rpmdoctor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Detect and repair RPM database corruption", long_about = None)]
struct Cli {
    /// Path to the RPM database
    #[arg(long, default_value = "/var/lib/rpm")]
    dbpath: PathBuf,

    /// Yum state directory (stale transaction journals live here)
    #[arg(long = "yum-statedir", default_value = "/var/lib/yum")]
    yum_statedir: PathBuf,

    /// Path to rpm (default: search PATH)
    #[arg(long)]
    rpm: Option<PathBuf>,

    /// Path to db_recover
    #[arg(long = "db-recover")]
    db_recover: Option<PathBuf>,

    /// Path to db_verify
    #[arg(long = "db-verify")]
    db_verify: Option<PathBuf>,

    /// Path to db_stat (forensic collection)
    #[arg(long = "db-stat")]
    db_stat: Option<PathBuf>,

    /// Path to yum (or dnf)
    #[arg(long)]
    yum: Option<PathBuf>,

    /// Path to yum-complete-transaction
    #[arg(long = "yum-complete-transaction")]
    yum_complete_transaction: Option<PathBuf>,

    /// Path to package-cleanup
    #[arg(long = "package-cleanup")]
    package_cleanup: Option<PathBuf>,

    /// Path to lsof
    #[arg(long)]
    lsof: Option<PathBuf>,

    /// Timeout for rpm queries, seconds
    #[arg(long = "timeout-query", default_value_t = 5)]
    timeout_query: u64,

    /// Timeout for db_verify per table, seconds
    #[arg(long = "timeout-verify", default_value_t = 5)]
    timeout_verify: u64,

    /// Timeout for db_recover, seconds
    #[arg(long = "timeout-recover", default_value_t = 90)]
    timeout_recover: u64,

    /// Timeout for rpm --rebuilddb, seconds
    #[arg(long = "timeout-rebuild", default_value_t = 600)]
    timeout_rebuild: u64,

    /// Timeout for yum operations, seconds
    #[arg(long = "timeout-yum", default_value_t = 120)]
    timeout_yum: u64,

    /// Timeout for lsof, seconds
    #[arg(long = "timeout-lsof", default_value_t = 10)]
    timeout_lsof: u64,

    /// Overall deadline for the whole run, seconds
    #[arg(long = "timeout-overall", default_value_t = 900)]
    timeout_overall: u64,

    /// Number of probe/repair passes to attempt
    #[arg(long = "max-passes", default_value_t = 3)]
    max_passes: u32,

    /// Fewer packages than this makes a query result suspect
    #[arg(long = "min-packages", default_value_t = 30)]
    min_packages: usize,

    /// Minimum free bytes required on the dbpath filesystem
    #[arg(long = "min-free-bytes", default_value_t = 150 * 1024 * 1024)]
    min_free_bytes: u64,

    /// Verify each table with db_verify (default on)
    #[arg(long = "check-tables", overrides_with = "no_check_tables")]
    check_tables: bool,
    #[arg(long = "no-check-tables", hide_short_help = true)]
    no_check_tables: bool,

    /// Cross-check per-package lookups against the primary index (default on)
    #[arg(long = "check-index", overrides_with = "no_check_index")]
    check_index: bool,
    #[arg(long = "no-check-index", hide_short_help = true)]
    no_check_index: bool,

    /// Allow rpm --rebuilddb as a repair (default on)
    #[arg(long = "rebuild", overrides_with = "no_rebuild")]
    rebuild: bool,
    #[arg(long = "no-rebuild", hide_short_help = true)]
    no_rebuild: bool,

    /// Kill processes holding stale database handles (default on)
    #[arg(long = "kill-stuck", overrides_with = "no_kill_stuck")]
    kill_stuck: bool,
    #[arg(long = "no-kill-stuck", hide_short_help = true)]
    no_kill_stuck: bool,

    /// Detect and clean stale yum transactions (default on)
    #[arg(long = "yum-transactions", overrides_with = "no_yum_transactions")]
    yum_transactions: bool,
    #[arg(long = "no-yum-transactions", hide_short_help = true)]
    no_yum_transactions: bool,

    /// Check for (and kill) a yum process stuck on a stale pidfile
    #[arg(long = "check-stuck-yum")]
    check_stuck_yum: bool,

    /// Collect db_stat output each pass for later investigation
    #[arg(long)]
    forensic: bool,

    /// Run package-cleanup --cleandupes after a healthy run
    #[arg(long = "dupe-cleanup")]
    dupe_cleanup: bool,

    /// Permit more than one rebuild per run
    #[arg(long = "allow-multiple-rebuilds")]
    allow_multiple_rebuilds: bool,

    /// Tables to skip during db_verify
    #[arg(long = "verify-skip", value_name = "TABLE")]
    verify_skip: Vec<String>,

    /// Log repairs without executing them
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = Verbosity::Info)]
    verbosity: Verbosity,

    /// Emit newline-delimited JSON log lines
    #[arg(long = "log-json")]
    log_json: bool,

    /// Emit the machine-readable final record on stdout
    #[arg(long = "json-summary")]
    json_summary: bool,

    /// Also write the JSON record to this path
    #[arg(long = "summary-file", value_name = "PATH")]
    summary_file: Option<PathBuf>,
}

/// Resolve a `--flag` / `--no-flag` pair against its default.
fn switch(on: bool, off: bool, default: bool) -> bool {
    if off {
        false
    } else if on {
        true
    } else {
        default
    }
}

fn build_config(cli: &Cli) -> RunConfig {
    let discovered = Binaries::discover();
    let binaries = Binaries {
        rpm: cli.rpm.clone().or(discovered.rpm),
        db_recover: cli.db_recover.clone().or(discovered.db_recover),
        db_verify: cli.db_verify.clone().or(discovered.db_verify),
        db_stat: cli.db_stat.clone().or(discovered.db_stat),
        yum: cli.yum.clone().or(discovered.yum),
        yum_complete_transaction: cli
            .yum_complete_transaction
            .clone()
            .or(discovered.yum_complete_transaction),
        package_cleanup: cli.package_cleanup.clone().or(discovered.package_cleanup),
        lsof: cli.lsof.clone().or(discovered.lsof),
    };

    let mut config = RunConfig {
        db_path: cli.dbpath.clone(),
        yum_state_dir: cli.yum_statedir.clone(),
        binaries,
        max_passes: cli.max_passes,
        min_packages: cli.min_packages,
        min_free_bytes: cli.min_free_bytes,
        dry_run: cli.dry_run,
        ..RunConfig::default()
    };

    config.timeouts.query_secs = cli.timeout_query;
    config.timeouts.verify_secs = cli.timeout_verify;
    config.timeouts.recover_secs = cli.timeout_recover;
    config.timeouts.rebuild_secs = cli.timeout_rebuild;
    config.timeouts.yum_secs = cli.timeout_yum;
    config.timeouts.lsof_secs = cli.timeout_lsof;
    config.timeouts.overall_secs = cli.timeout_overall;

    config.features.check_tables = switch(cli.check_tables, cli.no_check_tables, true);
    config.features.check_index = switch(cli.check_index, cli.no_check_index, true);
    config.features.rebuild = switch(cli.rebuild, cli.no_rebuild, true);
    config.features.kill_stuck = switch(cli.kill_stuck, cli.no_kill_stuck, true);
    config.features.yum_transactions =
        switch(cli.yum_transactions, cli.no_yum_transactions, true);
    config.features.check_stuck_yum = cli.check_stuck_yum;
    config.features.forensic = cli.forensic;
    config.features.dupe_cleanup = cli.dupe_cleanup;
    config.features.allow_multiple_rebuilds = cli.allow_multiple_rebuilds;

    if !cli.verify_skip.is_empty() {
        config.verify_skip = cli.verify_skip.clone();
    }

    config
}

/// Map a failure to the documented exit codes: 65 for a missing external
/// binary, 64 for configuration problems, 2 for everything else. anyhow
/// keeps the typed `DoctorError` downcastable through any added context.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DoctorError>() {
        Some(DoctorError::MissingBinary(_)) => EXIT_MISSING_BINARY,
        Some(DoctorError::Config(_)) => EXIT_CONFIG_ERROR,
        _ => 2,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json, cli.verbosity.level());

    match run(&cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("run aborted: {:#}", err);
            eprintln!("rpmdoctor: {:#}", err);
            ExitCode::from(exit_code_for(&err) as u8)
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = build_config(cli);
    config.validate()?;

    let supervisor = Arc::new(Supervisor::new());
    let budget = Arc::new(DeadlineBudget::new(config.timeouts.overall()));
    let probe = Arc::new(RpmProbe::new(
        config.clone(),
        supervisor.clone(),
        budget.clone(),
    ));
    let lsof_bin = config
        .binaries
        .lsof
        .clone()
        .unwrap_or_else(|| PathBuf::from("lsof"));
    let inspector = Arc::new(LsofInspector::new(
        supervisor,
        budget.clone(),
        lsof_bin,
        config.timeouts.lsof(),
    ));
    let remediator = Remediator::new(config, probe, inspector, budget);

    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    // On SIGINT/SIGTERM the run future is dropped; any in-flight child is
    // reaped through kill_on_drop.
    let transcript = tokio::select! {
        result = remediator.run() => result?,
        _ = sigint.recv() => {
            error!("interrupted by SIGINT, abandoning run");
            return Ok(ExitCode::from(2));
        }
        _ = sigterm.recv() => {
            error!("terminated by SIGTERM, abandoning run");
            return Ok(ExitCode::from(2));
        }
    };

    let summary = RunSummary::from_transcript(&transcript);

    if let Some(path) = &cli.summary_file {
        summary
            .write_to(path)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
    }

    if cli.json_summary {
        let json =
            serde_json::to_string_pretty(&summary).context("failed to serialise summary")?;
        println!("{}", json);
    } else {
        println!("{}", summary.summary_line());
    }

    Ok(ExitCode::from(summary.exit_code as u8))
}
