//! Isolated execution of emitted bundles.
//!
//! A [`Sandbox`] owns one runtime: global scope, `STATE`, module registries, timers and hot runtime. `watch` and
//! `hot` cases keep a single sandbox for every step; `single` cases discard it after the step.
//!
//! ## Entry frames
//!
//! Entry modules run as resumable frames. `await` at the top level of an entry on an unsettled update promise
//! (from `NEXT_HMR` / `NEXT_REBUILD`) parks the frame; the harness settles the promise and calls
//! [`Sandbox::resume`]. Any other `await` placement is a usage error.

pub mod scope;
pub mod value;

mod globals;
mod hot;
mod interp;
mod modules;
mod timers;

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use bundletest_script::ast::{Body, DeclKind, Ident, Item, Statement};
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
pub use hot::{ApplyReport, HotApplyError, HotCheckError, HotStatus};
pub use interp::Abort;
use interp::{Interrupt, Runtime, Signal};
pub use modules::Factory;
use scope::{Env, Scope};
use value::Value;

/// How a case drives its sandbox across steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Single,
    Watch,
    Hot,
}

/// Module format of the emitted chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    /// CommonJS-like factories resolved by the built-in registry.
    #[default]
    Define,
    /// Declarative registrations resolved by the loader emulator.
    Register,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    #[default]
    None,
    Html,
}

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub mode: RunMode,
    pub format: ModuleFormat,
    pub document: DocumentType,
    /// Extra globals from case metadata.
    pub globals: BTreeMap<String, serde_json::Value>,
    /// Fuel per execution segment.
    pub fuel: u64,
    /// Wall-clock bound per execution segment.
    pub deadline: Duration,
    pub max_timer_runs: usize,
    pub retry_errored_within_load: bool,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Single,
            format: ModuleFormat::Define,
            document: DocumentType::None,
            globals: BTreeMap::new(),
            fuel: 2_000_000,
            deadline: Duration::from_secs(10),
            max_timer_runs: 10_000,
            retry_errored_within_load: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Hmr,
    Rebuild,
}

#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Resolved(Value),
}

/// The single outstanding await point of a sandbox.
#[derive(Debug)]
pub struct UpdatePromise {
    pub kind: UpdateKind,
    pub expect_error: bool,
    pub state: PromiseState,
    pub captured_error: Option<String>,
}

pub type PromiseRef = Rc<RefCell<UpdatePromise>>;

impl UpdatePromise {
    pub fn new(kind: UpdateKind, expect_error: bool) -> Self {
        Self {
            kind,
            expect_error,
            state: PromiseState::Pending,
            captured_error: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state, PromiseState::Resolved(_))
    }
}

/// What the harness sees of an unsettled promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUpdate {
    pub kind: UpdateKind,
    pub expect_error: bool,
}

/// An exception nobody caught.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uncaught {
    pub message: String,
    /// Raised from a timer callback rather than from the entry itself.
    pub asynchronous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub level: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStatus {
    #[default]
    Completed,
    /// An entry is parked on an unsettled update promise.
    Suspended(UpdateKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// First uncaught exception of the segment.
    pub error: Option<Uncaught>,
    /// Passing `expect` assertions so far, over the sandbox lifetime.
    pub assertions: usize,
    pub timers_run: usize,
}

impl ExecutionOutcome {
    fn record(&mut self, uncaught: Uncaught) {
        match &self.error {
            None => self.error = Some(uncaught),
            Some(_) => tracing::debug!(message = %uncaught.message, "additional uncaught exception"),
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.status, ExecutionStatus::Suspended(_))
    }
}

struct Awaiting {
    binding: Option<(DeclKind, Ident)>,
    promise: PromiseRef,
}

struct EntryFrame {
    id: String,
    env: Env,
    body: Body,
    pc: usize,
    awaiting: Option<Awaiting>,
}

pub struct Sandbox {
    rt: Runtime,
    options: SandboxOptions,
    frame: Option<EntryFrame>,
    queue: VecDeque<String>,
    loads: usize,
}

impl Sandbox {
    pub fn new(options: SandboxOptions) -> Self {
        let mut rt = Runtime::new(&options);
        rt.install_globals(&options);
        Self {
            rt,
            options,
            frame: None,
            queue: VecDeque::new(),
            loads: 0,
        }
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Load emitted files and run their entries.
    ///
    /// The first load fills an empty registry. Later loads replace only factories whose text changed and evict
    /// their dependents from the instance cache. When an entry is parked on `NEXT_REBUILD`, the reload settles
    /// that promise and resumes the entry instead of starting the entries again.
    #[tracing::instrument(skip_all, fields(dir = %output_dir.display(), load = self.loads))]
    pub fn load(&mut self, output_dir: &Path, entry_files: &[String]) -> Result<ExecutionOutcome, SandboxError> {
        let mut sources = Vec::with_capacity(entry_files.len());
        for file in entry_files {
            let path = output_dir.join(file);
            match std::fs::read_to_string(&path) {
                Ok(text) => sources.push(text),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SandboxError::EntryNotFound {
                        what: format!("emitted file '{}'", file),
                    });
                }
                Err(err) => {
                    return Err(SandboxError::Io {
                        path,
                        message: err.to_string(),
                    });
                }
            }
        }

        self.rt.hot.update_source = Some(output_dir.to_path_buf());
        self.rt.begin_segment(self.options.fuel, self.options.deadline);
        let mut outcome = ExecutionOutcome::default();
        let mut changed = Vec::new();
        let mut entries = Vec::new();
        for (file, text) in entry_files.iter().zip(&sources) {
            let program = match bundletest_script::parse_source(text) {
                Ok(program) => program,
                Err(errors) => {
                    let message = errors.first().map(|e| e.message.clone()).unwrap_or_default();
                    outcome.record(Uncaught {
                        message: format!("SyntaxError: {} ({})", message, file),
                        asynchronous: false,
                    });
                    return self.finish_segment(outcome);
                }
            };
            let mut chunk_statements = Vec::new();
            for item in program.items {
                match item.node {
                    Item::Define(m) => {
                        let text = text.get(item.span.start..item.span.end).unwrap_or_default();
                        if self.rt.registry.define(&m.id, Factory::new(m.body, text)) {
                            changed.push(m.id);
                        }
                    }
                    Item::Register(m) => self.rt.loader.register(&m.id, m.deps, m.body),
                    Item::Entry(id) => entries.push(id),
                    Item::Statement(stmt) => chunk_statements.push(stmt),
                }
            }
            if !chunk_statements.is_empty() {
                let env = Scope::child(&self.rt.globals);
                match self.rt.exec_block(&chunk_statements, &env) {
                    Ok(_) => {}
                    Err(Interrupt::Throw(e)) => {
                        outcome.record(Uncaught {
                            message: e.describe_thrown(),
                            asynchronous: false,
                        });
                        return self.finish_segment(outcome);
                    }
                    Err(Interrupt::Abort(abort)) => return Err(self.abort(abort)),
                }
            }
        }

        if self.loads > 0 {
            let evicted = self.rt.registry.evict_with_dependents(&changed);
            tracing::debug!(?changed, ?evicted, "reloaded modules");
        }
        self.loads += 1;

        if let Some(frame) = &self.frame {
            let rebuild = frame
                .awaiting
                .as_ref()
                .filter(|a| a.promise.borrow().kind == UpdateKind::Rebuild)
                .map(|a| Rc::clone(&a.promise));
            let Some(promise) = rebuild else {
                return Err(SandboxError::Usage {
                    message: "emitted output was reloaded while an entry is suspended on a hot update".to_string(),
                });
            };
            let changed = Value::array(changed.iter().map(|id| Value::str(id)).collect());
            settle(&promise, Value::object_from([("changed", changed)]), None);
            return self.run(outcome);
        }

        for id in entries {
            if !self.rt.entry_exists(&id) {
                return Err(SandboxError::EntryNotFound {
                    what: format!("entry module '{}'", id),
                });
            }
            self.queue.push_back(id);
        }
        self.run(outcome)
    }

    /// Continue a parked entry after its promise was settled.
    pub fn resume(&mut self) -> Result<ExecutionOutcome, SandboxError> {
        self.rt.begin_segment(self.options.fuel, self.options.deadline);
        self.run(ExecutionOutcome::default())
    }

    /// The unsettled update promise, if any.
    pub fn outstanding_update(&self) -> Option<PendingUpdate> {
        self.rt.pending_update.as_ref().and_then(|p| {
            let p = p.borrow();
            (!p.is_settled()).then_some(PendingUpdate {
                kind: p.kind,
                expect_error: p.expect_error,
            })
        })
    }

    /// Create an update promise from the host side, as if the fixture had called `NEXT_HMR` / `NEXT_REBUILD`.
    pub fn request_update(&mut self, kind: UpdateKind, expect_error: bool) -> Result<PromiseRef, SandboxError> {
        match self.rt.request_update(kind, expect_error) {
            Ok(Value::Promise(promise)) => Ok(promise),
            Ok(_) | Err(Interrupt::Throw(_)) => Err(SandboxError::Usage {
                message: "update request did not produce a promise".to_string(),
            }),
            Err(Interrupt::Abort(abort)) => Err(self.abort(abort)),
        }
    }

    /// Settle the outstanding promise; the parked entry observes `value` when resumed.
    pub fn resolve_update(&mut self, value: Value, captured_error: Option<String>) {
        if let Some(promise) = self.rt.pending_update.take() {
            settle(&promise, value, captured_error);
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.frame.as_ref().is_some_and(|f| f.awaiting.is_some())
    }

    pub fn set_watch_step(&mut self, step: usize) {
        if let Err(err) = self.rt.globals.assign("WATCH_STEP", Value::Number(step as f64)) {
            tracing::warn!(?err, "WATCH_STEP could not be updated");
        }
    }

    /// Run the program's `module.hot.check()` against `output_dir`: the ids the pending update replaces or
    /// removes, or `None` when there is nothing to apply.
    pub fn hot_check(&mut self, output_dir: &Path) -> Result<Option<Vec<String>>, HotCheckError> {
        self.rt.hot.update_source = Some(output_dir.to_path_buf());
        self.rt.hot_check()
    }

    /// Run the program's `module.hot.apply()` within its own fuel and deadline budget.
    #[tracing::instrument(skip_all)]
    pub fn hot_apply(&mut self, fuel: u64, deadline: Duration) -> Result<ApplyReport, HotApplyError> {
        self.rt.begin_segment(fuel, deadline);
        self.rt.hot_apply()
    }

    pub fn hot_hash(&self) -> Option<&str> {
        self.rt.hot.current_hash.as_deref()
    }

    pub fn set_hot_hash(&mut self, hash: impl Into<String>) {
        self.rt.hot.current_hash = Some(hash.into());
    }

    pub fn hot_status(&self) -> HotStatus {
        self.rt.hot.status.get()
    }

    pub fn format(&self) -> ModuleFormat {
        self.options.format
    }

    pub fn assertions(&self) -> usize {
        self.rt.assertions
    }

    pub fn console_lines(&self) -> &[ConsoleLine] {
        &self.rt.console
    }

    pub fn teardown(self) {
        tracing::debug!(
            loads = self.loads,
            pending_timers = self.rt.timers.len(),
            suspended = self.frame.is_some(),
            "sandbox torn down"
        );
    }

    fn run(&mut self, mut outcome: ExecutionOutcome) -> Result<ExecutionOutcome, SandboxError> {
        loop {
            if self.frame.is_none() {
                let Some(id) = self.queue.pop_front() else {
                    break;
                };
                match self.rt.start_entry(&id) {
                    Ok(Some((env, body))) => {
                        self.frame = Some(EntryFrame {
                            id,
                            env,
                            body,
                            pc: 0,
                            awaiting: None,
                        });
                    }
                    Ok(None) => continue,
                    Err(Interrupt::Throw(e)) => {
                        outcome.record(Uncaught {
                            message: e.describe_thrown(),
                            asynchronous: false,
                        });
                        self.queue.clear();
                        break;
                    }
                    Err(Interrupt::Abort(abort)) => return Err(self.abort(abort)),
                }
            }
            match self.step_frame() {
                Ok(None) => {}
                Ok(Some(kind)) => {
                    outcome.status = ExecutionStatus::Suspended(kind);
                    break;
                }
                Err(Interrupt::Throw(e)) => {
                    outcome.record(Uncaught {
                        message: e.describe_thrown(),
                        asynchronous: false,
                    });
                    self.queue.clear();
                    break;
                }
                Err(Interrupt::Abort(abort)) => return Err(self.abort(abort)),
            }
        }
        self.finish_segment(outcome)
    }

    /// Drain timers and fill in the counters.
    fn finish_segment(&mut self, mut outcome: ExecutionOutcome) -> Result<ExecutionOutcome, SandboxError> {
        let mut uncaught = Vec::new();
        let drained = self.rt.drain_timers(&mut uncaught);
        for error in uncaught {
            outcome.record(error);
        }
        match drained {
            Ok(runs) => outcome.timers_run += runs,
            Err(Interrupt::Abort(abort)) => return Err(self.abort(abort)),
            Err(Interrupt::Throw(e)) => outcome.record(Uncaught {
                message: e.describe_thrown(),
                asynchronous: true,
            }),
        }
        outcome.assertions = self.rt.assertions;
        Ok(outcome)
    }

    /// Run the current frame until it completes (`None`) or parks on a promise.
    fn step_frame(&mut self) -> Result<Option<UpdateKind>, Interrupt> {
        let Some(mut frame) = self.frame.take() else {
            return Ok(None);
        };
        if let Some(awaiting) = frame.awaiting.take() {
            let state = awaiting.promise.borrow().state.clone();
            match state {
                PromiseState::Resolved(value) => bind_await(&frame.env, awaiting.binding, value),
                PromiseState::Pending => {
                    let kind = awaiting.promise.borrow().kind;
                    frame.awaiting = Some(awaiting);
                    self.frame = Some(frame);
                    return Ok(Some(kind));
                }
            }
        }

        let result = loop {
            let Some(stmt) = frame.body.get(frame.pc) else {
                break Ok(None);
            };
            frame.pc += 1;
            let Statement::Await(a) = &stmt.node else {
                match self.rt.exec_stmt(stmt, &frame.env) {
                    Ok(Signal::Normal) => continue,
                    Ok(Signal::Return(_)) => break Ok(None),
                    Err(interrupt) => break Err(interrupt),
                }
            };
            let value = match self.rt.tick().and_then(|_| self.rt.eval(&a.expr, &frame.env)) {
                Ok(value) => value,
                Err(interrupt) => break Err(interrupt),
            };
            let Value::Promise(promise) = value else {
                bind_await(&frame.env, a.binding.clone(), value);
                continue;
            };
            let state = promise.borrow().state.clone();
            match state {
                PromiseState::Resolved(value) => bind_await(&frame.env, a.binding.clone(), value),
                PromiseState::Pending => {
                    let kind = promise.borrow().kind;
                    tracing::debug!(entry = %frame.id, ?kind, "entry suspended");
                    frame.awaiting = Some(Awaiting {
                        binding: a.binding.clone(),
                        promise,
                    });
                    break Ok(Some(kind));
                }
            }
        };

        match result {
            Ok(Some(kind)) => {
                self.frame = Some(frame);
                Ok(Some(kind))
            }
            Ok(None) => {
                self.rt.finish_entry(&frame.id, &Ok(()));
                Ok(None)
            }
            Err(interrupt) => {
                let failed = Err(match &interrupt {
                    Interrupt::Throw(e) => Interrupt::Throw(e.clone()),
                    Interrupt::Abort(a) => Interrupt::Abort(a.clone()),
                });
                self.rt.finish_entry(&frame.id, &failed);
                Err(interrupt)
            }
        }
    }

    /// Drop any parked work and translate a harness-level stop.
    fn abort(&mut self, abort: Abort) -> SandboxError {
        if let Some(frame) = self.frame.take() {
            self.rt.finish_entry(&frame.id, &Err(Interrupt::Abort(abort.clone())));
        }
        self.queue.clear();
        match abort {
            Abort::Assertion(message) => SandboxError::FixtureAssertionFailed { message },
            Abort::OutOfFuel => SandboxError::Timeout {
                what: "execution fuel".to_string(),
            },
            Abort::Deadline => SandboxError::Timeout {
                what: "execution deadline".to_string(),
            },
            Abort::TimerBudget(runs) => SandboxError::Timeout {
                what: format!("timer queue ({} runs)", runs),
            },
            Abort::Usage(message) => SandboxError::Usage { message },
        }
    }
}

fn settle(promise: &PromiseRef, value: Value, captured_error: Option<String>) {
    let mut promise = promise.borrow_mut();
    promise.state = PromiseState::Resolved(value);
    promise.captured_error = captured_error;
}

fn bind_await(env: &Env, binding: Option<(DeclKind, Ident)>, value: Value) {
    if let Some((kind, name)) = binding {
        env.declare(&name, value, kind == DeclKind::Let);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    fn files() -> Vec<String> {
        vec!["main.js".to_string()]
    }

    #[test]
    fn test_single_load_runs_entry_assertions() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            "define \"./index\" {\n  expect(2 + 2).toBe(4);\n}\nentry \"./index\";\n",
        );
        let mut sandbox = Sandbox::new(SandboxOptions::default());
        let outcome = sandbox.load(dir.path(), &files()).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.assertions, 1);
    }

    #[test]
    fn test_missing_file_and_module_are_entry_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::new(SandboxOptions::default());
        assert!(matches!(
            sandbox.load(dir.path(), &files()),
            Err(SandboxError::EntryNotFound { .. })
        ));
        write(dir.path(), "main.js", "entry \"./nowhere\";\n");
        assert_eq!(
            sandbox.load(dir.path(), &files()),
            Err(SandboxError::EntryNotFound {
                what: "entry module './nowhere'".to_string()
            })
        );
    }

    #[test]
    fn test_failed_expectation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.js", "define \"a\" { expect(1).toBe(2); }\nentry \"a\";\n");
        let mut sandbox = Sandbox::new(SandboxOptions::default());
        match sandbox.load(dir.path(), &files()) {
            Err(SandboxError::FixtureAssertionFailed { message }) => assert!(message.contains("Expected: 2")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timer_exceptions_surface_as_async_errors() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            "define \"a\" { setTimeout(() => { throw new TypeError(\"late\"); }, 10); }\nentry \"a\";\n",
        );
        let mut sandbox = Sandbox::new(SandboxOptions::default());
        let outcome = sandbox.load(dir.path(), &files()).unwrap();
        assert_eq!(
            outcome.error,
            Some(Uncaught {
                message: "TypeError: late".to_string(),
                asynchronous: true
            })
        );
        assert_eq!(outcome.timers_run, 1);
    }

    #[test]
    fn test_entry_parks_on_update_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            "define \"a\" {\n  STATE.before = true;\n  let result = await NEXT_HMR();\n  STATE.after = result;\n}\nentry \"a\";\n",
        );
        let mut sandbox = Sandbox::new(SandboxOptions {
            mode: RunMode::Hot,
            ..SandboxOptions::default()
        });
        let outcome = sandbox.load(dir.path(), &files()).unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Suspended(UpdateKind::Hmr));
        assert_eq!(
            sandbox.outstanding_update(),
            Some(PendingUpdate {
                kind: UpdateKind::Hmr,
                expect_error: false
            })
        );
        sandbox.resolve_update(Value::str("done"), None);
        let outcome = sandbox.resume().unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert!(!sandbox.is_suspended());
        let globals = Rc::clone(&sandbox.rt.globals);
        let state = sandbox.rt.lookup_ident("STATE", &globals).unwrap();
        let after = sandbox.rt.get_property(&state, "after").unwrap();
        assert_eq!(after.to_js_string(), "done");
    }

    #[test]
    fn test_reload_replaces_only_changed_modules() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = |value: u32| {
            format!(
                "define \"./dep\" {{ STATE.depRuns = (STATE.depRuns || 0) + 1; module.exports = {}; }}\n\
                 define \"./static\" {{ STATE.staticRuns = (STATE.staticRuns || 0) + 1; }}\n\
                 define \"./index\" {{ require(\"./static\"); expect(require(\"./dep\")).toBe(WATCH_STEP + 1); }}\n\
                 entry \"./index\";\n",
                value
            )
        };
        let mut sandbox = Sandbox::new(SandboxOptions {
            mode: RunMode::Watch,
            ..SandboxOptions::default()
        });
        write(dir.path(), "main.js", &chunk(1));
        sandbox.load(dir.path(), &files()).unwrap();
        write(dir.path(), "main.js", &chunk(2));
        sandbox.set_watch_step(1);
        let outcome = sandbox.load(dir.path(), &files()).unwrap();
        assert_eq!(outcome.assertions, 2);

        let globals = Rc::clone(&sandbox.rt.globals);
        let state = sandbox.rt.lookup_ident("STATE", &globals).unwrap();
        let dep_runs = sandbox.rt.get_property(&state, "depRuns").unwrap();
        let static_runs = sandbox.rt.get_property(&state, "staticRuns").unwrap();
        assert_eq!(dep_runs.to_js_string(), "2");
        assert_eq!(static_runs.to_js_string(), "1");
    }

    #[test]
    fn test_await_outside_entry_top_level_is_misuse() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.js",
            "define \"a\" { function f() { await NEXT_HMR(); } f(); }\nentry \"a\";\n",
        );
        let mut sandbox = Sandbox::new(SandboxOptions {
            mode: RunMode::Hot,
            ..SandboxOptions::default()
        });
        assert!(matches!(
            sandbox.load(dir.path(), &files()),
            Err(SandboxError::Usage { .. })
        ));
    }
}
