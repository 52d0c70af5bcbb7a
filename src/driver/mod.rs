//! Case driver and step scheduler.
//!
//! Runs one [`Case`]: every builder configuration gets its own working copy, builder session and sandbox, and
//! walks the steps in order. A failure stops the remaining steps of that configuration only. After all
//! configurations ran, parity is checked across their per-step snapshots.
//!
//! Per step:
//!
//! 1. apply the step's delta to the working copy
//! 2. build (watch cases wait for the debounced rebuild after step 0)
//! 3. check diagnostics against the step's expectations, both ways
//! 4. execute: load into the sandbox (step 0, watch reloads) or drive the hot update
//! 5. custom assertion, then the stored snapshot
//!
//! ## Modules
//!
//! - `suite` - runs many cases concurrently

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod suite;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bundletest_core::FailureKind;
use miette::Diagnostic;

use crate::builder::{
    BuildDiagnostic, BuildFailure, BuildRequest, BuildResult, BuildSession, Builder, BuilderConfig, WatchOptions,
};
use crate::case::{Case, Step, StepContext, StepExpectation, Workspace};
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::hmr::{HmrClient, UpdateRequest};
use crate::sandbox::{ExecutionOutcome, ModuleFormat, RunMode, Sandbox, SandboxOptions};
use crate::snapshot::{self, Snapshot};

pub use suite::{run_suite, SuiteSummary};

/// One failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseFailure {
    pub config: String,
    pub step: usize,
    pub kind: FailureKind,
    pub message: String,
    /// Diagnostic code of the underlying error, e.g. `bundletest::snapshot_mismatch`.
    pub code: Option<String>,
    pub help: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigReport {
    pub name: String,
    pub steps_passed: usize,
    pub failure: Option<CaseFailure>,
}

/// Outcome of one case across all configurations.
#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    pub configs: Vec<ConfigReport>,
    /// Step and parity failures, in the order they happened.
    pub failures: Vec<CaseFailure>,
    pub duration: Duration,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct CaseDriver {
    config: HarnessConfig,
    builder: Arc<dyn Builder>,
}

/// Working state of one configuration while its steps run.
struct ConfigRun<'a> {
    case: &'a Case,
    name: String,
    format: ModuleFormat,
    session: Option<Box<dyn BuildSession>>,
    sandbox: Option<Sandbox>,
    snapshots: Vec<Snapshot>,
}

impl CaseDriver {
    pub fn new(config: HarnessConfig, builder: Arc<dyn Builder>) -> Self {
        Self { config, builder }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            debounce: self.config.rebuild_debounce,
            poll_interval: self.config.poll_interval,
            timeout: self.config.rebuild_timeout,
        }
    }

    fn sandbox_options(&self, run: &ConfigRun<'_>) -> SandboxOptions {
        SandboxOptions {
            mode: run.case.kind,
            format: run.format,
            document: run.case.document,
            globals: run.case.globals.clone(),
            fuel: self.config.step_fuel,
            deadline: self.config.execution_deadline,
            max_timer_runs: self.config.max_timer_runs,
            retry_errored_within_load: self.config.retry_errored_within_load,
        }
    }

    /// Run every configuration of `case`; `shared_cache` is the cache directory of the case's cache group.
    #[tracing::instrument(skip_all, fields(case = %case.name))]
    pub async fn run_case(&self, case: &Case, shared_cache: Option<PathBuf>) -> CaseReport {
        let start = Instant::now();
        let mut configs = Vec::new();
        let mut failures = Vec::new();
        let mut snapshots: Vec<(String, Vec<Snapshot>)> = Vec::new();

        for config in &case.configs {
            let mut run = ConfigRun {
                case,
                name: config.name.clone(),
                format: config.format,
                session: None,
                sandbox: None,
                snapshots: Vec::new(),
            };
            let mut steps_passed = 0;
            let mut failure = None;
            let cache = shared_cache.as_ref().map(|dir| dir.join(&config.name));
            match self.start_config(&mut run, config, cache) {
                Ok(workspace) => {
                    for step in &case.steps {
                        tracing::debug!(config = %run.name, step = step.index, "step started");
                        match self.run_step(&mut run, &workspace, step).await {
                            Ok(()) => steps_passed += 1,
                            Err(err) => {
                                failure = Some(failure_of(&run.name, step.index, &err));
                                break;
                            }
                        }
                    }
                    if failure.is_none() {
                        if let Err(err) = finish_config(&mut run) {
                            failure = Some(failure_of(&run.name, case.steps.len().saturating_sub(1), &err));
                        }
                    }
                }
                Err(err) => failure = Some(failure_of(&run.name, 0, &err)),
            }
            if let Some(sandbox) = run.sandbox.take() {
                sandbox.teardown();
            }
            if let Some(f) = &failure {
                tracing::debug!(config = %f.config, step = f.step, kind = %f.kind.as_str(), "configuration failed");
                failures.push(f.clone());
            }
            snapshots.push((run.name.clone(), std::mem::take(&mut run.snapshots)));
            configs.push(ConfigReport {
                name: run.name,
                steps_passed,
                failure,
            });
        }

        if let Some(mode) = case.parity {
            failures.extend(parity_failures(&snapshots, mode));
        }
        CaseReport {
            name: case.name.clone(),
            configs,
            failures,
            duration: start.elapsed(),
        }
    }

    fn start_config(
        &self,
        run: &mut ConfigRun<'_>,
        config: &BuilderConfig,
        cache: Option<PathBuf>,
    ) -> Result<Workspace, HarnessError> {
        if run.case.kind == RunMode::Single && run.case.steps.len() > 1 {
            return Err(HarnessError::usage(format!(
                "single-shot case has {} steps; declare kind = \"watch\" or \"hot\"",
                run.case.steps.len()
            )));
        }
        let workspace = Workspace::new(self.config.work_root.as_deref(), cache)?;
        let request = BuildRequest {
            project_root: workspace.project_root().to_path_buf(),
            output_dir: workspace.output_dir().to_path_buf(),
            cache_dir: workspace.cache_dir().to_path_buf(),
            config: config.clone(),
        };
        // Sessions snapshot the tree when they start, so the initial files go in first.
        if let Some(step) = run.case.steps.first() {
            workspace.apply(&step.delta)?;
        }
        run.session = Some(self.builder.start(request)?);
        Ok(workspace)
    }

    async fn run_step(&self, run: &mut ConfigRun<'_>, workspace: &Workspace, step: &Step) -> Result<(), HarnessError> {
        let rebuild = step.index > 0 && run.case.kind == RunMode::Watch && !step.delta.is_empty();
        if step.index > 0 {
            workspace.apply(&step.delta)?;
        }
        let build = self.build(run, rebuild).await?;
        check_diagnostics(&step.expect, &build)?;

        let outcome = self.execute(run, step, &build)?;
        if let Some(outcome) = &outcome {
            if let Some(error) = &outcome.error {
                return Err(HarnessError::UncaughtException {
                    message: error.message.clone(),
                    asynchronous: error.asynchronous,
                });
            }
        }

        if let Some(assertion) = &step.assertion {
            let context = StepContext {
                case: &run.case.name,
                config: &run.name,
                step: step.index,
                build: &build,
                outcome: outcome.as_ref(),
            };
            assertion(&context).map_err(|message| HarnessError::FixtureAssertionFailed { message })?;
        }

        let captured = Snapshot::capture(&build);
        if run.case.snapshot {
            let path = snapshot::snapshot_path(&run.case.snapshot_dir(), &run.name, step.index);
            let status = snapshot::check_stored(&path, &captured, self.config.update_snapshots)?;
            tracing::debug!(?status, "snapshot checked");
        }
        run.snapshots.push(captured);
        Ok(())
    }

    /// Run the build off the async runtime, bounded by the configured timeout.
    async fn build(&self, run: &mut ConfigRun<'_>, rebuild: bool) -> Result<BuildResult, HarnessError> {
        let Some(mut session) = run.session.take() else {
            return Err(HarnessError::usage("builder session is gone after an earlier timeout"));
        };
        let watch = self.watch_options();
        let limit = if rebuild {
            self.config.rebuild_timeout + self.config.build_timeout
        } else {
            self.config.build_timeout
        };
        let task = tokio::task::spawn_blocking(move || {
            let result = if rebuild {
                session.next_rebuild(&watch)
            } else {
                session.build()
            };
            (session, result)
        });
        match tokio::time::timeout(limit, task).await {
            Ok(Ok((session, result))) => {
                run.session = Some(session);
                Ok(result?)
            }
            Ok(Err(join)) => Err(HarnessError::Build(BuildFailure::Crashed {
                message: format!("builder task failed: {}", join),
            })),
            Err(_) => Err(HarnessError::Build(BuildFailure::Timeout { elapsed: limit })),
        }
    }

    /// Feed the build to the sandbox; `None` when nothing ran (an expected build failure).
    fn execute(
        &self,
        run: &mut ConfigRun<'_>,
        step: &Step,
        build: &BuildResult,
    ) -> Result<Option<ExecutionOutcome>, HarnessError> {
        let kind = run.case.kind;
        if kind == RunMode::Hot {
            if let Some(sandbox) = run.sandbox.as_mut() {
                let client = HmrClient::new(self.config.update_timeout, self.config.step_fuel);
                if sandbox.outstanding_update().is_none() {
                    let request = UpdateRequest {
                        expect_error: step.expect.expects_errors(),
                    };
                    client.request_next_update(sandbox, request)?;
                }
                let resolution = client.drive(sandbox, build)?;
                return Ok(Some(resolution.outcome));
            }
        }

        if build.has_errors() {
            return Ok(None);
        }
        if kind == RunMode::Single || run.sandbox.is_none() {
            let mut sandbox = Sandbox::new(self.sandbox_options(run));
            if kind == RunMode::Hot {
                sandbox.set_hot_hash(build.stats.hash.clone());
            }
            if let Some(old) = run.sandbox.replace(sandbox) {
                old.teardown();
            }
        }
        let Some(sandbox) = run.sandbox.as_mut() else {
            return Ok(None);
        };
        if kind == RunMode::Watch {
            sandbox.set_watch_step(step.index);
        }
        let outcome = sandbox.load(&build.output_dir, &build.entry_files)?;
        Ok(Some(outcome))
    }
}

/// A fixture may not still wait on an update once the steps are exhausted.
fn finish_config(run: &mut ConfigRun<'_>) -> Result<(), HarnessError> {
    match &run.sandbox {
        Some(sandbox) if sandbox.is_suspended() || sandbox.outstanding_update().is_some() => Err(HarnessError::usage(
            "fixture still awaits an update after the last step",
        )),
        _ => Ok(()),
    }
}

pub(crate) fn failure_of(config: &str, step: usize, err: &HarnessError) -> CaseFailure {
    CaseFailure {
        config: config.to_string(),
        step,
        kind: err.kind(),
        message: err.to_string(),
        code: err.code().map(|code| code.to_string()),
        help: err.help().map(|help| help.to_string()),
    }
}

/// Every expected substring must match a reported diagnostic and every reported diagnostic must be expected.
pub fn check_diagnostics(expect: &StepExpectation, build: &BuildResult) -> Result<(), HarnessError> {
    let mut problems = Vec::new();
    match_both_ways("error", &expect.errors, &build.errors, &mut problems);
    match_both_ways("warning", &expect.warnings, &build.warnings, &mut problems);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::UnexpectedDiagnostics {
            details: problems.join("\n"),
        })
    }
}

fn match_both_ways(what: &str, expected: &[String], actual: &[BuildDiagnostic], problems: &mut Vec<String>) {
    let rendered: Vec<String> = actual.iter().map(ToString::to_string).collect();
    for pattern in expected {
        if !rendered.iter().any(|r| r.contains(pattern.as_str())) {
            problems.push(format!("expected {} matching '{}' was not reported", what, pattern));
        }
    }
    for r in &rendered {
        if !expected.iter().any(|pattern| r.contains(pattern.as_str())) {
            problems.push(format!("unexpected {}: {}", what, r));
        }
    }
}

/// Compare the first configuration against every other one, step by step.
fn parity_failures(snapshots: &[(String, Vec<Snapshot>)], mode: snapshot::ParityMode) -> Vec<CaseFailure> {
    let Some((first, baseline)) = snapshots.first() else {
        return Vec::new();
    };
    let mut failures = Vec::new();
    for (name, other) in &snapshots[1..] {
        for (step, (left, right)) in baseline.iter().zip(other).enumerate() {
            let diff = snapshot::compare_parity(left, right, mode);
            if diff.is_empty() {
                continue;
            }
            let err = HarnessError::ParityMismatch {
                left: first.clone(),
                right: name.clone(),
                step,
                diff,
            };
            failures.push(failure_of(&format!("{} vs {}", first, name), step, &err));
            break;
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ScriptBundler;
    use crate::case::load_case;
    use std::fs;
    use std::path::Path;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn driver() -> CaseDriver {
        CaseDriver::new(
            HarnessConfig::default()
                .with_rebuild_debounce(Duration::from_millis(5))
                .with_build_timeout(Duration::from_secs(20)),
            Arc::new(ScriptBundler),
        )
    }

    fn diag_build(errors: &[&str], warnings: &[&str]) -> BuildResult {
        BuildResult {
            errors: errors.iter().map(|e| BuildDiagnostic::error(*e)).collect(),
            warnings: warnings.iter().map(|w| BuildDiagnostic::warning(*w)).collect(),
            ..BuildResult::default()
        }
    }

    #[test]
    fn test_diagnostics_are_symmetric() {
        let none = StepExpectation::default();
        assert!(check_diagnostics(&none, &diag_build(&[], &[])).is_ok());
        assert!(check_diagnostics(&none, &diag_build(&["Module not found"], &[])).is_err());

        let expects = StepExpectation {
            errors: vec!["not found".to_string()],
            warnings: vec![],
        };
        assert!(check_diagnostics(&expects, &diag_build(&["Module not found"], &[])).is_ok());
        let err = check_diagnostics(&expects, &diag_build(&[], &[])).unwrap_err();
        assert_eq!(err.kind(), FailureKind::BuildError);
        assert!(err.to_string().contains("expected error matching 'not found' was not reported"));
        assert!(check_diagnostics(&expects, &diag_build(&["Module not found"], &["x"])).is_err());
    }

    #[test]
    fn test_failures_carry_diagnostic_code_and_help() {
        let err = check_diagnostics(&StepExpectation::default(), &diag_build(&[], &["unused export"])).unwrap_err();
        let failure = failure_of("default", 2, &err);
        assert_eq!(failure.kind, FailureKind::BuildError);
        assert_eq!(failure.code.as_deref(), Some("bundletest::build_error"));
        assert!(failure.help.unwrap().contains("case.toml"));

        let failure = failure_of("default", 0, &HarnessError::usage("no entry"));
        assert_eq!(failure.code.as_deref(), Some("bundletest::harness_usage"));
        assert_eq!(failure.help, None);
    }

    #[tokio::test]
    async fn test_single_case_passes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.js", "import two from \"./two\";\nexpect(two + two).toBe(4);\n");
        write(dir.path(), "two.js", "export default 2;\n");
        let case = load_case("single", dir.path()).unwrap();
        let report = driver().run_case(&case, None).await;
        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.configs[0].steps_passed, 1);
    }

    #[tokio::test]
    async fn test_failed_expectation_reports_step_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.js", "expect(1).toBe(2);\n");
        let case = load_case("failing", dir.path()).unwrap();
        let report = driver().run_case(&case, None).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::FixtureAssertionFailed);
        assert_eq!(report.failures[0].config, "default");
        assert_eq!(report.failures[0].step, 0);
    }

    #[tokio::test]
    async fn test_multi_step_single_case_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.js", "let a = 1;\n---\nlet a = 2;\n");
        let case = load_case("misdeclared", dir.path()).unwrap();
        let report = driver().run_case(&case, None).await;
        assert_eq!(report.failures[0].kind, FailureKind::HarnessUsageError);
    }

    #[tokio::test]
    async fn test_watch_case_reloads_changed_modules() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "case.toml", "kind = \"watch\"\n");
        write(
            dir.path(),
            "index.js",
            "import value from \"./value\";\nSTATE.seen = STATE.seen || 0;\nSTATE.seen += 1;\nexpect(value).toBe(WATCH_STEP + 1);\n",
        );
        write(dir.path(), "value.js", "export default 1;\n---\nexport default 2;\n");
        let case = load_case("watch", dir.path()).unwrap();
        let report = driver().run_case(&case, None).await;
        assert!(report.passed(), "{:?}", report.failures);
        assert_eq!(report.configs[0].steps_passed, 2);
    }

    #[tokio::test]
    async fn test_custom_assertion_runs_with_build() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "index.js", "let a = 1;\n");
        let case = load_case("custom", dir.path())
            .unwrap()
            .with_assertion(0, |ctx| {
                if ctx.build.entry_files == ["main.js"] {
                    Err("entry is main.js".to_string())
                } else {
                    Ok(())
                }
            });
        let report = driver().run_case(&case, None).await;
        assert_eq!(report.failures[0].kind, FailureKind::FixtureAssertionFailed);
        assert!(report.failures[0].message.contains("entry is main.js"));
    }
}
