//! Hot-update protocol client.
//!
//! Settles `NEXT_HMR` promises. For each hot step the client runs the program's own `module.hot.check()` against
//! the new output directory, then `module.hot.apply()` (every dispose runs before any accept). The promise resolves
//! with the outdated module ids, or with the captured error when the step expects one.

use std::time::Duration;

use crate::builder::BuildResult;
use crate::error::HarnessError;
use crate::sandbox::value::Value;
use crate::sandbox::{
    Abort, ApplyReport, ExecutionOutcome, HotApplyError, HotCheckError, ModuleFormat, PromiseRef, Sandbox, UpdateKind,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    /// Apply-stage and build-stage failures settle the promise instead of failing the step.
    pub expect_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    Applied(ApplyReport),
    /// No manifest, or a manifest that replaces nothing.
    NoOp,
    /// The update failed and the fixture asked to observe the failure.
    CapturedError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResolution {
    pub result: UpdateResult,
    /// The segment run after settling the promise.
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, Copy)]
pub struct HmrClient {
    update_deadline: Duration,
    fuel: u64,
}

impl HmrClient {
    pub fn new(update_deadline: Duration, fuel: u64) -> Self {
        Self { update_deadline, fuel }
    }

    /// Open an update promise from the host side.
    pub fn request_next_update(&self, sandbox: &mut Sandbox, request: UpdateRequest) -> Result<PromiseRef, HarnessError> {
        Ok(sandbox.request_update(UpdateKind::Hmr, request.expect_error)?)
    }

    /// Check for and apply the update `build` produced, settle the outstanding promise and resume the program.
    #[tracing::instrument(skip_all, fields(compilation = build.compilation))]
    pub fn drive(&self, sandbox: &mut Sandbox, build: &BuildResult) -> Result<UpdateResolution, HarnessError> {
        let Some(pending) = sandbox.outstanding_update() else {
            return Err(HarnessError::usage("no hot update was requested before the rebuild"));
        };
        if pending.kind != UpdateKind::Hmr {
            return Err(HarnessError::usage(
                "fixture awaits NEXT_REBUILD but the case drives hot updates",
            ));
        }
        let expect_error = pending.expect_error;

        let result = match self.check_and_apply(sandbox, build) {
            Ok(result) => result,
            Err(failure) => match failure {
                ApplyFailure::Rejected(message) if expect_error => UpdateResult::CapturedError(message),
                ApplyFailure::Rejected(message) => return Err(HarnessError::UpdateFailed { message }),
                ApplyFailure::Harness(err) => return Err(err),
            },
        };
        tracing::debug!(?result, status = sandbox.hot_status().as_str(), "hot update settled");

        match &result {
            UpdateResult::Applied(report) => {
                let outdated = report.outdated.iter().map(|id| Value::str(id)).collect();
                sandbox.resolve_update(Value::array(outdated), None);
            }
            UpdateResult::NoOp => sandbox.resolve_update(Value::array(Vec::new()), None),
            UpdateResult::CapturedError(message) => {
                sandbox.resolve_update(Value::error("UpdateError", message), Some(message.clone()));
            }
        }
        let outcome = sandbox.resume()?;
        Ok(UpdateResolution { result, outcome })
    }

    fn check_and_apply(&self, sandbox: &mut Sandbox, build: &BuildResult) -> Result<UpdateResult, ApplyFailure> {
        if build.has_errors() {
            let details: Vec<String> = build.errors.iter().map(ToString::to_string).collect();
            return Err(ApplyFailure::Rejected(details.join("\n")));
        }
        let Some(current) = sandbox.hot_hash().map(str::to_string) else {
            sandbox.set_hot_hash(build.stats.hash.clone());
            return Ok(UpdateResult::NoOp);
        };
        if sandbox.format() == ModuleFormat::Register
            && build.output_dir.join(format!("{}.hot-update.json", current)).exists()
        {
            return Err(ApplyFailure::Rejected(
                "hot updates are not supported for the register format".to_string(),
            ));
        }

        match sandbox.hot_check(&build.output_dir) {
            Ok(Some(_)) => {}
            Ok(None) => {
                sandbox.set_hot_hash(build.stats.hash.clone());
                return Ok(UpdateResult::NoOp);
            }
            Err(HotCheckError::Invalid(message)) => return Err(ApplyFailure::Rejected(message)),
            Err(HotCheckError::Io { path, source }) => {
                return Err(ApplyFailure::Harness(HarnessError::io(
                    format!("reading {}", path.display()),
                    source,
                )));
            }
        }
        match sandbox.hot_apply(self.fuel, self.update_deadline) {
            Ok(report) => Ok(UpdateResult::Applied(report)),
            Err(HotApplyError::Aborted(message) | HotApplyError::Failed(message)) => {
                Err(ApplyFailure::Rejected(message))
            }
            Err(HotApplyError::Interrupted(abort)) => Err(ApplyFailure::Harness(match abort {
                Abort::OutOfFuel => HarnessError::HmrTimeout {
                    what: "update handlers ran out of fuel".to_string(),
                },
                Abort::Deadline => HarnessError::HmrTimeout {
                    what: format!("update exceeded {:?}", self.update_deadline),
                },
                Abort::TimerBudget(runs) => HarnessError::HmrTimeout {
                    what: format!("timer queue ({} runs) during update", runs),
                },
                Abort::Assertion(message) => HarnessError::FixtureAssertionFailed { message },
                Abort::Usage(message) => HarnessError::Usage { message },
            })),
        }
    }
}

enum ApplyFailure {
    /// Counts as an update failure; capturable with `expectError`.
    Rejected(String),
    Harness(HarnessError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::reference::ScriptSession;
    use crate::builder::{BuildSession, BuildRequest, BuilderConfig};
    use crate::sandbox::{RunMode, SandboxOptions};
    use bundletest_core::FailureKind;
    use std::fs;

    struct HotProject {
        dir: tempfile::TempDir,
        session: ScriptSession,
    }

    impl HotProject {
        fn new(files: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("src")).unwrap();
            for (name, text) in files {
                fs::write(dir.path().join("src").join(name), text).unwrap();
            }
            let session = ScriptSession::new(BuildRequest {
                project_root: dir.path().join("src"),
                output_dir: dir.path().join("out"),
                cache_dir: dir.path().join("cache"),
                config: BuilderConfig {
                    hot: true,
                    ..BuilderConfig::default()
                },
            })
            .unwrap();
            Self { dir, session }
        }

        fn edit(&mut self, name: &str, text: &str) -> BuildResult {
            fs::write(self.dir.path().join("src").join(name), text).unwrap();
            self.session.build().unwrap()
        }
    }

    fn hot_sandbox() -> Sandbox {
        Sandbox::new(SandboxOptions {
            mode: RunMode::Hot,
            ..SandboxOptions::default()
        })
    }

    fn client() -> HmrClient {
        HmrClient::new(Duration::from_secs(5), 100_000)
    }

    #[test]
    fn test_accepted_update_resolves_and_resumes() {
        let mut project = HotProject::new(&[
            (
                "index.js",
                "import value from \"./value\";\nmodule.hot.accept(\"./value\");\nexpect(value).toBe(1);\nlet changed = await NEXT_HMR();\nexpect(changed).toEqual([\"./value.js\"]);\nexpect(value).toBe(2);\n",
            ),
            ("value.js", "export default 1;\n"),
        ]);
        let first = project.session.build().unwrap();
        let mut sandbox = hot_sandbox();
        sandbox.set_hot_hash(first.stats.hash.clone());
        let outcome = sandbox.load(&first.output_dir, &first.entry_files).unwrap();
        assert!(outcome.is_suspended());

        let second = project.edit("value.js", "export default 2;\n");
        let resolution = client().drive(&mut sandbox, &second).unwrap();
        assert!(matches!(resolution.result, UpdateResult::Applied(_)));
        assert_eq!(resolution.outcome.error, None);
        assert!(!resolution.outcome.is_suspended());
        assert_eq!(sandbox.hot_hash(), Some(second.stats.hash.as_str()));
    }

    #[test]
    fn test_unaccepted_update_fails_unless_expected() {
        let mut project = HotProject::new(&[
            ("index.js", "import value from \"./value\";\nawait NEXT_HMR();\n"),
            ("value.js", "export default 1;\n"),
        ]);
        let first = project.session.build().unwrap();
        let mut sandbox = hot_sandbox();
        sandbox.set_hot_hash(first.stats.hash.clone());
        sandbox.load(&first.output_dir, &first.entry_files).unwrap();

        let second = project.edit("value.js", "export default 2;\n");
        let err = client().drive(&mut sandbox, &second).unwrap_err();
        assert_eq!(err.kind(), FailureKind::UpdateFailed);
        assert!(err.to_string().contains("Aborted because ./index.js is not accepted"));
    }

    #[test]
    fn test_build_error_is_captured_when_expected() {
        let mut project = HotProject::new(&[
            (
                "index.js",
                "let err = await NEXT_HMR({ expectError: true });\nexpect(err.name).toBe(\"UpdateError\");\n",
            ),
            ("value.js", "export default 1;\n"),
        ]);
        let first = project.session.build().unwrap();
        let mut sandbox = hot_sandbox();
        sandbox.set_hot_hash(first.stats.hash.clone());
        sandbox.load(&first.output_dir, &first.entry_files).unwrap();

        let broken = project.edit("index.js", "let = ;\n");
        let resolution = client().drive(&mut sandbox, &broken).unwrap();
        assert!(matches!(resolution.result, UpdateResult::CapturedError(_)));
        assert_eq!(resolution.outcome.error, None);
    }

    #[test]
    fn test_drive_without_request_is_usage_error() {
        let mut project = HotProject::new(&[("index.js", "let a = 1;\n")]);
        let first = project.session.build().unwrap();
        let mut sandbox = hot_sandbox();
        sandbox.load(&first.output_dir, &first.entry_files).unwrap();
        let err = client().drive(&mut sandbox, &first).unwrap_err();
        assert_eq!(err.kind(), FailureKind::HarnessUsageError);
    }

    #[test]
    fn test_host_requested_update_without_manifest_is_noop() {
        let mut project = HotProject::new(&[("index.js", "let a = 1;\n")]);
        let first = project.session.build().unwrap();
        let mut sandbox = hot_sandbox();
        sandbox.set_hot_hash(first.stats.hash.clone());
        sandbox.load(&first.output_dir, &first.entry_files).unwrap();
        let promise = client()
            .request_next_update(&mut sandbox, UpdateRequest::default())
            .unwrap();
        let same = project.session.build().unwrap();
        let resolution = client().drive(&mut sandbox, &same).unwrap();
        assert_eq!(resolution.result, UpdateResult::NoOp);
        assert!(promise.borrow().is_settled());
    }

    #[test]
    fn test_program_can_check_and_apply_on_its_own() {
        let mut project = HotProject::new(&[
            (
                "index.js",
                concat!(
                    "import value from \"./value\";\n",
                    "module.hot.accept(\"./value\");\n",
                    "expect(module.hot.check()).toBe(null);\n",
                    "await NEXT_HMR();\n",
                    "expect(module.hot.check()).toEqual([\"./value.js\"]);\n",
                    "expect(module.hot.apply()).toEqual([\"./value.js\"]);\n",
                    "expect(value).toBe(2);\n",
                    "expect(module.hot.status()).toBe(\"idle\");\n",
                    "expect(module.hot.apply()).toEqual([]);\n",
                ),
            ),
            ("value.js", "export default 1;\n"),
        ]);
        let first = project.session.build().unwrap();
        let mut sandbox = hot_sandbox();
        sandbox.set_hot_hash(first.stats.hash.clone());
        let outcome = sandbox.load(&first.output_dir, &first.entry_files).unwrap();
        assert!(outcome.is_suspended());
        assert_eq!(outcome.error, None);

        let second = project.edit("value.js", "export default 2;\n");
        assert_eq!(second.output_dir, first.output_dir);
        sandbox.resolve_update(Value::Undefined, None);
        let outcome = sandbox.resume().unwrap();
        assert_eq!(outcome.error, None);
        assert!(!outcome.is_suspended());
        assert_eq!(outcome.assertions, 7);
        assert_eq!(sandbox.hot_hash(), Some(second.stats.hash.as_str()));
    }
}
