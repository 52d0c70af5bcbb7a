//! Error types for the harness.
//!
//! Every layer has its own `thiserror` enum; all of them funnel into [`HarnessError`], which carries a
//! `miette` diagnostic code and maps onto the shared [`FailureKind`] taxonomy used by reports.

use std::path::PathBuf;

use bundletest_core::FailureKind;
use miette::Diagnostic;
use thiserror::Error;

use crate::builder::BuildFailure;
use crate::snapshot::Diff;

/// Errors raised while hosting emitted code.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    #[error("entry not found: {what}")]
    EntryNotFound { what: String },

    #[error("{message}")]
    FixtureAssertionFailed { message: String },

    #[error("{what} exceeded its budget")]
    Timeout { what: String },

    #[error("harness misuse: {message}")]
    Usage { message: String },

    #[error("failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },
}

/// Errors raised by the declarative-registration loader.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoaderError {
    #[error("module '{id}' was never registered")]
    NotRegistered { id: String },

    #[error("module '{id}' failed during execution: {message}")]
    Errored { id: String, message: String },
}

/// Top-level harness error; one variant per failure kind.
#[derive(Debug, Error, Diagnostic)]
pub enum HarnessError {
    #[error("build failed: {0}")]
    #[diagnostic(code(bundletest::build_error))]
    Build(#[from] BuildFailure),

    #[error("unexpected build diagnostics:\n{details}")]
    #[diagnostic(
        code(bundletest::build_error),
        help("declare expected errors/warnings for the step in case.toml if they are intended")
    )]
    UnexpectedDiagnostics { details: String },

    #[error("assertion failed: {message}")]
    #[diagnostic(code(bundletest::fixture_assertion_failed))]
    FixtureAssertionFailed { message: String },

    #[error("uncaught exception{}: {message}", if *.asynchronous { " in timer callback" } else { "" })]
    #[diagnostic(code(bundletest::uncaught_exception))]
    UncaughtException { message: String, asynchronous: bool },

    #[error("hot update failed: {message}")]
    #[diagnostic(code(bundletest::update_failed))]
    UpdateFailed { message: String },

    #[error("hot update did not settle: {what}")]
    #[diagnostic(code(bundletest::hmr_timeout))]
    HmrTimeout { what: String },

    #[error("timed out: {what}")]
    #[diagnostic(code(bundletest::timeout))]
    Timeout { what: String },

    #[error("entry not found: {what}")]
    #[diagnostic(code(bundletest::entry_not_found))]
    EntryNotFound { what: String },

    #[error("snapshot mismatch for {path}\n{diff}")]
    #[diagnostic(
        code(bundletest::snapshot_mismatch),
        help("re-run with --update-snapshots if the change is intended")
    )]
    SnapshotMismatch { path: PathBuf, diff: Diff },

    #[error("parity mismatch between '{left}' and '{right}' at step {step}\n{diff}")]
    #[diagnostic(code(bundletest::parity_mismatch))]
    ParityMismatch {
        left: String,
        right: String,
        step: usize,
        diff: Diff,
    },

    #[error("harness misuse: {message}")]
    #[diagnostic(code(bundletest::harness_usage))]
    Usage { message: String },

    #[error("{context}: {source}")]
    #[diagnostic(code(bundletest::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    /// The taxonomy bucket this error reports under.
    pub fn kind(&self) -> FailureKind {
        match self {
            HarnessError::Build(failure) => match failure {
                BuildFailure::Timeout { .. } => FailureKind::Timeout,
                _ => FailureKind::BuildError,
            },
            HarnessError::UnexpectedDiagnostics { .. } => FailureKind::BuildError,
            HarnessError::FixtureAssertionFailed { .. } => FailureKind::FixtureAssertionFailed,
            HarnessError::UncaughtException { .. } => FailureKind::UncaughtException,
            HarnessError::UpdateFailed { .. } => FailureKind::UpdateFailed,
            HarnessError::HmrTimeout { .. } => FailureKind::HmrTimeout,
            HarnessError::Timeout { .. } => FailureKind::Timeout,
            HarnessError::EntryNotFound { .. } => FailureKind::EntryNotFound,
            HarnessError::SnapshotMismatch { .. } => FailureKind::SnapshotMismatch,
            HarnessError::ParityMismatch { .. } => FailureKind::ParityMismatch,
            // Unreadable fixtures or work directories are problems with the case, not the bundler.
            HarnessError::Usage { .. } | HarnessError::Io { .. } => FailureKind::HarnessUsageError,
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        HarnessError::Usage {
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HarnessError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<SandboxError> for HarnessError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::EntryNotFound { what } => HarnessError::EntryNotFound { what },
            SandboxError::FixtureAssertionFailed { message } => HarnessError::FixtureAssertionFailed { message },
            SandboxError::Timeout { what } => HarnessError::Timeout { what },
            SandboxError::Usage { message } => HarnessError::Usage { message },
            SandboxError::Io { path, message } => HarnessError::EntryNotFound {
                what: format!("{} ({})", path.display(), message),
            },
        }
    }
}

impl From<LoaderError> for SandboxError {
    fn from(err: LoaderError) -> Self {
        match err {
            LoaderError::NotRegistered { id } => SandboxError::EntryNotFound {
                what: format!("module '{}'", id),
            },
            LoaderError::Errored { .. } => SandboxError::Usage {
                message: err.to_string(),
            },
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_cover_taxonomy() {
        let errors = vec![
            HarnessError::UnexpectedDiagnostics { details: String::new() },
            HarnessError::FixtureAssertionFailed { message: String::new() },
            HarnessError::UncaughtException {
                message: String::new(),
                asynchronous: true,
            },
            HarnessError::UpdateFailed { message: String::new() },
            HarnessError::HmrTimeout { what: String::new() },
            HarnessError::Timeout { what: String::new() },
            HarnessError::EntryNotFound { what: String::new() },
            HarnessError::SnapshotMismatch {
                path: PathBuf::new(),
                diff: Diff::default(),
            },
            HarnessError::ParityMismatch {
                left: String::new(),
                right: String::new(),
                step: 0,
                diff: Diff::default(),
            },
            HarnessError::usage(""),
        ];
        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds, FailureKind::ALL.to_vec());
    }

    #[test]
    fn test_uncaught_message_mentions_timers() {
        let err = HarnessError::UncaughtException {
            message: "Error: boom".to_string(),
            asynchronous: true,
        };
        assert_eq!(err.to_string(), "uncaught exception in timer callback: Error: boom");
    }

    #[test]
    fn test_loader_not_registered_is_entry_not_found() {
        let err: HarnessError = SandboxError::from(LoaderError::NotRegistered { id: "./x".into() }).into();
        assert_eq!(err.kind(), FailureKind::EntryNotFound);
    }
}
