//! rpmdoctor-core: detection and bounded remediation of corruption in a
//! Berkeley-DB backed RPM database.
//!
//! The crate is organised around a small pipeline:
//!
//! - [`supervisor`] runs every external binary with a deadline and captures
//!   a structured [`supervisor::CommandResult`];
//! - [`probe`] wraps `rpm`, `db_recover`, `db_verify` and the yum tooling
//!   in typed operations that classify outcomes into [`symptom::RpmSymptom`]s
//!   via the [`signature`] table;
//! - [`holders`] finds and kills processes holding stale handles on
//!   database files;
//! - [`remediate`] drives probes and repairs in a bounded loop, producing a
//!   [`transcript::RunTranscript`] that [`report`] turns into the final
//!   summary and exit code.

pub mod config;
pub mod error;
pub mod holders;
pub mod probe;
pub mod remediate;
pub mod report;
pub mod signature;
pub mod supervisor;
pub mod symptom;
pub mod telemetry;
pub mod transcript;
pub mod yum;

pub use config::{Binaries, Features, RunConfig, Timeouts};
pub use error::{DoctorError, Result};
pub use holders::{HandleInspector, Holder, KillReport, LsofInspector};
pub use probe::{DbProbe, ProbeReport, RepairReport, RpmProbe};
pub use remediate::Remediator;
pub use report::{RunSummary, EXIT_CONFIG_ERROR, EXIT_MISSING_BINARY};
pub use supervisor::{CommandRequest, CommandResult, DeadlineBudget, ExitDisposition, Supervisor};
pub use symptom::{RepairAction, RpmSymptom};
pub use telemetry::init_tracing;
pub use transcript::{PassRecord, RepairRecord, RunStatus, RunTranscript};
