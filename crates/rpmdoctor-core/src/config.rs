//! Typed per-run configuration.
//!
//! Built once by the CLI, immutable afterwards. Everything the probes and
//! the state machine consult (paths, binary locations, timeouts, feature
//! switches) lives here, so behaviour is a function of `(RunConfig, host)`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DoctorError, Result};

/// Default RPM database location.
pub const DEFAULT_DB_PATH: &str = "/var/lib/rpm";

/// Default yum state directory (stale transaction journals live here).
pub const DEFAULT_YUM_STATE_DIR: &str = "/var/lib/yum";

/// Minimum free bytes required on the dbpath filesystem before any repair.
pub const DEFAULT_MIN_FREE_BYTES: u64 = 150 * 1024 * 1024;

/// Fewer `rpm -qa` lines than this means the query result is suspect.
pub const DEFAULT_MIN_PACKAGES: usize = 30;

/// Tables skipped by `db_verify`; these historically produce false alarms.
pub const DEFAULT_VERIFY_SKIP: &[&str] = &["Filedigests", "Obsoletename", "Provideversion"];

/// Resolved locations of the external binaries the tool drives.
///
/// `None` means "not found on this host"; whether that is fatal depends on
/// which features are enabled (see [`RunConfig::validate`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Binaries {
    pub rpm: Option<PathBuf>,
    pub db_recover: Option<PathBuf>,
    pub db_verify: Option<PathBuf>,
    pub db_stat: Option<PathBuf>,
    pub yum: Option<PathBuf>,
    pub yum_complete_transaction: Option<PathBuf>,
    pub package_cleanup: Option<PathBuf>,
    pub lsof: Option<PathBuf>,
}

impl Binaries {
    /// Resolve every binary through a PATH search, leaving gaps as `None`.
    pub fn discover() -> Self {
        Self {
            rpm: find_in_path("rpm"),
            db_recover: find_in_path("db_recover"),
            db_verify: find_in_path("db_verify"),
            db_stat: find_in_path("db_stat"),
            yum: find_in_path("yum").or_else(|| find_in_path("dnf")),
            yum_complete_transaction: find_in_path("yum-complete-transaction"),
            package_cleanup: find_in_path("package-cleanup"),
            lsof: find_in_path("lsof"),
        }
    }
}

/// Per-operation deadlines, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub query_secs: u64,
    pub verify_secs: u64,
    pub recover_secs: u64,
    pub rebuild_secs: u64,
    pub yum_secs: u64,
    pub lsof_secs: u64,
    pub overall_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            query_secs: 5,
            verify_secs: 5,
            recover_secs: 90,
            rebuild_secs: 600,
            yum_secs: 120,
            lsof_secs: 10,
            overall_secs: 900,
        }
    }
}

impl Timeouts {
    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }

    pub fn verify(&self) -> Duration {
        Duration::from_secs(self.verify_secs)
    }

    pub fn recover(&self) -> Duration {
        Duration::from_secs(self.recover_secs)
    }

    pub fn rebuild(&self) -> Duration {
        Duration::from_secs(self.rebuild_secs)
    }

    pub fn yum(&self) -> Duration {
        Duration::from_secs(self.yum_secs)
    }

    pub fn lsof(&self) -> Duration {
        Duration::from_secs(self.lsof_secs)
    }

    pub fn overall(&self) -> Duration {
        Duration::from_secs(self.overall_secs)
    }
}

/// Which checks and repairs are allowed to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    /// `db_verify` every table file per pass.
    pub check_tables: bool,
    /// Cross-check per-package lookups against the primary index.
    pub check_index: bool,
    /// Permit `rpm --rebuilddb` as a repair.
    pub rebuild: bool,
    /// Permit killing processes that hold stale database handles.
    pub kill_stuck: bool,
    /// Detect and clean stale yum transaction journals.
    pub yum_transactions: bool,
    /// Kill a yum process whose pidfile has gone stale (off by default,
    /// as in the original deployment).
    pub check_stuck_yum: bool,
    /// Collect `db_stat -CA` output each pass for later investigation.
    pub forensic: bool,
    /// Run `package-cleanup --cleandupes` after a healthy run. Deliberately
    /// off by default; duplicate removal is not part of the repair table.
    pub dupe_cleanup: bool,
    /// Allow more than one `rpm --rebuilddb` per run.
    pub allow_multiple_rebuilds: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            check_tables: true,
            check_index: true,
            rebuild: true,
            kill_stuck: true,
            yum_transactions: true,
            check_stuck_yum: false,
            forensic: false,
            dupe_cleanup: false,
            allow_multiple_rebuilds: false,
        }
    }
}

/// Immutable configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub db_path: PathBuf,
    pub yum_state_dir: PathBuf,
    pub binaries: Binaries,
    pub timeouts: Timeouts,
    pub features: Features,
    pub max_passes: u32,
    pub min_packages: usize,
    pub min_free_bytes: u64,
    pub verify_skip: Vec<String>,
    /// Signal sent to stuck holders (SIGKILL by default).
    pub stuck_signal: i32,
    pub dry_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            yum_state_dir: PathBuf::from(DEFAULT_YUM_STATE_DIR),
            binaries: Binaries::default(),
            timeouts: Timeouts::default(),
            features: Features::default(),
            max_passes: 3,
            min_packages: DEFAULT_MIN_PACKAGES,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            verify_skip: DEFAULT_VERIFY_SKIP.iter().map(|s| s.to_string()).collect(),
            stuck_signal: libc::SIGKILL,
            dry_run: false,
        }
    }
}

impl RunConfig {
    /// Check flag sanity and the presence of every binary the enabled
    /// feature set needs.
    ///
    /// `MissingBinary` and `Config` map to distinct exit codes, so the
    /// distinction matters to callers.
    pub fn validate(&self) -> Result<()> {
        if self.max_passes == 0 {
            return Err(DoctorError::Config("max-passes must be >= 1".to_string()));
        }

        require(&self.binaries.rpm, "rpm")?;
        require(&self.binaries.db_recover, "db_recover")?;
        if self.features.check_tables {
            require(&self.binaries.db_verify, "db_verify")?;
        }
        if self.features.kill_stuck {
            require(&self.binaries.lsof, "lsof")?;
        }
        if self.features.forensic {
            require(&self.binaries.db_stat, "db_stat")?;
        }
        if self.features.dupe_cleanup {
            require(&self.binaries.package_cleanup, "package-cleanup")?;
        }

        Ok(())
    }

    /// True when the dbpath filesystem has at least `min_free_bytes` free.
    /// Hosts where statvfs fails (some macOS setups) pass the check with a
    /// warning rather than blocking the run.
    pub fn has_free_disk_space(&self) -> bool {
        if self.min_free_bytes == 0 {
            return true;
        }
        match free_bytes(&self.db_path) {
            Some(free) => free >= self.min_free_bytes,
            None => {
                tracing::warn!(path = %self.db_path.display(), "statvfs failed, skipping free-space check");
                true
            }
        }
    }
}

fn require(bin: &Option<PathBuf>, name: &str) -> Result<()> {
    match bin {
        Some(path) if path.exists() => Ok(()),
        Some(path) => Err(DoctorError::MissingBinary(format!(
            "{} ({} does not exist)",
            name,
            path.display()
        ))),
        None => Err(DoctorError::MissingBinary(name.to_string())),
    }
}

/// Locate `name` on PATH, returning the first executable hit.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Free bytes available to unprivileged users on the filesystem of `path`.
fn free_bytes(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}
