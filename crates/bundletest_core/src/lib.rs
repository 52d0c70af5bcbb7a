//! Provide the shared vocabulary of the bundletest harness.
//!
//! This crate is intentionally small and dependency-light. It contains:
//! - the registry-backed vocabulary of the bundle-script language (keywords, operators, punctuation, host globals),
//! - the failure taxonomy every harness layer reports against.
//!
//! ## Notes
//!
//! - This is a "vocabulary" crate: **no IO**, no global state, and no harness-specific types.
//! - The syntax crate and the harness both key off these IDs so diagnostics, reports and docs stay aligned.

pub mod lang;

/// Classify why a step (or a whole case) failed.
///
/// The taxonomy is reported to suite maintainers verbatim, so each kind is meant to point at a different owner:
/// builder regressions, fixture expectations, harness tooling, or stored expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    /// The builder rejected the compilation, or reported errors/warnings the step did not declare.
    BuildError,
    /// Fixture code reported a failed expectation through the injected assertion surface.
    FixtureAssertionFailed,
    /// Fixture code raised an exception nobody caught (synchronously or from a timer).
    UncaughtException,
    /// The hot runtime aborted or failed while applying an update the fixture did not expect to fail.
    UpdateFailed,
    /// A hot update cycle did not settle within its budget.
    HmrTimeout,
    /// Any other suspension point (build, rebuild, timers) did not settle within its budget.
    Timeout,
    /// A requested emitted file or entry module was absent.
    EntryNotFound,
    /// Captured build facts diverged from the stored expectation.
    SnapshotMismatch,
    /// Two builds that must agree diverged.
    ParityMismatch,
    /// The case itself is malformed or the harness was driven incorrectly.
    HarnessUsageError,
}

impl FailureKind {
    /// All kinds, in report order.
    pub const ALL: &'static [FailureKind] = &[
        FailureKind::BuildError,
        FailureKind::FixtureAssertionFailed,
        FailureKind::UncaughtException,
        FailureKind::UpdateFailed,
        FailureKind::HmrTimeout,
        FailureKind::Timeout,
        FailureKind::EntryNotFound,
        FailureKind::SnapshotMismatch,
        FailureKind::ParityMismatch,
        FailureKind::HarnessUsageError,
    ];

    /// Stable spelling used in reports and stored expectations.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::BuildError => "BuildError",
            FailureKind::FixtureAssertionFailed => "FixtureAssertionFailed",
            FailureKind::UncaughtException => "UncaughtException",
            FailureKind::UpdateFailed => "UpdateFailed",
            FailureKind::HmrTimeout => "HmrTimeout",
            FailureKind::Timeout => "Timeout",
            FailureKind::EntryNotFound => "EntryNotFound",
            FailureKind::SnapshotMismatch => "SnapshotMismatch",
            FailureKind::ParityMismatch => "ParityMismatch",
            FailureKind::HarnessUsageError => "HarnessUsageError",
        }
    }

    /// Whether this kind points at the harness or the case definition rather than at the product under test.
    ///
    /// ## Notes
    /// - Reporters print these under a separate heading so tooling bugs are never read as regressions.
    pub fn is_tooling(self) -> bool {
        matches!(self, FailureKind::HarnessUsageError)
    }

    /// Resolve a stable spelling back to its kind.
    pub fn from_str(s: &str) -> Option<FailureKind> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
