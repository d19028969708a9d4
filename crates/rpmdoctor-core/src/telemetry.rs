//! Logging setup for rpmdoctor binaries.
//!
//! stdout belongs to the run summary (and the `--json-summary` record), so
//! every diagnostic line is routed to stderr. Verbosity comes from the
//! `--verbosity` flag unless `RUST_LOG` overrides it.

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber for one rpmdoctor process.
///
/// * `json` - emit newline-delimited JSON log lines instead of the human
///   format, for hosts that ship scheduler output to a log pipeline.
/// * `level` - default verbosity when `RUST_LOG` is not set.
///
/// Calling this more than once is harmless; only the first call installs a
/// subscriber, later ones are ignored.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().try_init().ok();
    } else {
        builder.try_init().ok();
    }
}
