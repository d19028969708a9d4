//! Stderr/stdout signature table for classifying external command failures.
//!
//! Different rpm and Berkeley-DB releases emit different diagnostics for the
//! same underlying corruption, so the mapping lives in a data table rather
//! than scattered string matching: adding a distribution's signature is a
//! new row, not new code. Rows are matched in order; the first hit wins.

use crate::supervisor::CommandResult;

/// Which binary produced the output being classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureSource {
    Rpm,
    DbVerify,
    DbRecover,
    Yum,
}

/// What a matched signature implies about the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOutcome {
    /// The environment is wedged; `db_recover` is the indicated repair.
    NeedsRecover,

    /// Table-level damage; `rpm --rebuilddb` is the indicated repair.
    Corrupt,
}

struct Signature {
    source: SignatureSource,
    needle: &'static str,
    outcome: SignatureOutcome,
}

/// Known diagnostics, seeded from transcripts captured on CentOS 6/7 and
/// Fedora hosts. Matching is substring, case-sensitive, against stderr then
/// stdout.
const SIGNATURES: &[Signature] = &[
    Signature {
        source: SignatureSource::Rpm,
        needle: "cannot open Packages index",
        outcome: SignatureOutcome::NeedsRecover,
    },
    Signature {
        source: SignatureSource::Rpm,
        needle: "cannot open Packages database",
        outcome: SignatureOutcome::NeedsRecover,
    },
    Signature {
        source: SignatureSource::Rpm,
        needle: "DB_RUNRECOVERY",
        outcome: SignatureOutcome::NeedsRecover,
    },
    Signature {
        source: SignatureSource::Rpm,
        needle: "error(3)",
        outcome: SignatureOutcome::NeedsRecover,
    },
    Signature {
        source: SignatureSource::Rpm,
        needle: "Berkeley DB library panic",
        outcome: SignatureOutcome::NeedsRecover,
    },
    Signature {
        source: SignatureSource::Rpm,
        needle: "Thread died in Berkeley DB library",
        outcome: SignatureOutcome::NeedsRecover,
    },
    Signature {
        source: SignatureSource::Rpm,
        needle: "region error detected",
        outcome: SignatureOutcome::NeedsRecover,
    },
    Signature {
        source: SignatureSource::Rpm,
        needle: "DB_PAGE_NOTFOUND",
        outcome: SignatureOutcome::Corrupt,
    },
    Signature {
        source: SignatureSource::DbVerify,
        needle: "DB_VERIFY_BAD",
        outcome: SignatureOutcome::Corrupt,
    },
    Signature {
        source: SignatureSource::DbVerify,
        needle: "verification failed",
        outcome: SignatureOutcome::Corrupt,
    },
    Signature {
        source: SignatureSource::DbRecover,
        needle: "DB_RUNRECOVERY",
        outcome: SignatureOutcome::NeedsRecover,
    },
];

/// Classify a finished command against the signature table.
///
/// Returns `None` when no known signature matches; the caller decides what
/// an unrecognised failure means for its probe.
pub fn classify(source: SignatureSource, result: &CommandResult) -> Option<SignatureOutcome> {
    SIGNATURES
        .iter()
        .filter(|sig| sig.source == source)
        .find(|sig| result.stderr.contains(sig.needle) || result.stdout.contains(sig.needle))
        .map(|sig| sig.outcome)
}
