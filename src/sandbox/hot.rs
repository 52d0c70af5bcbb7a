//! The program-facing hot runtime: `module.hot` and update application.
//!
//! Propagation follows the bundler runtime contract. Starting from every replaced module that is currently
//! instantiated, walk parent edges until each path ends at a self-accepting module or at a parent that accepts
//! the dependency. Reaching an entry (or a module nobody required) or a declining module aborts the update
//! before anything is mutated.
//!
//! Application order: dispose handlers of every outdated instance, factory replacement, accept callbacks of
//! accepting parents, then re-execution of self-accepted modules.
//!
//! `module.hot.check()` looks up `<current-hash>.hot-update.json` in the update source and loads the replacement
//! factories it names; `module.hot.apply()` applies them. The harness drives updates through the same two entry
//! points.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use bundletest_script::ast::Item;
use serde::Deserialize;
use thiserror::Error;

use super::interp::{Abort, Interrupt, Runtime};
use super::modules::Factory;
use super::value::{strict_equals, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotStatus {
    Idle,
    Check,
    Dispose,
    Apply,
    Abort,
    Fail,
}

impl HotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HotStatus::Idle => "idle",
            HotStatus::Check => "check",
            HotStatus::Dispose => "dispose",
            HotStatus::Apply => "apply",
            HotStatus::Abort => "abort",
            HotStatus::Fail => "fail",
        }
    }
}

#[derive(Clone)]
pub struct AcceptEntry {
    pub dep: String,
    pub callback: Option<Value>,
    pub error_handler: Option<Value>,
}

/// Registrations a module made through its `module.hot` object.
#[derive(Default)]
pub struct HotRecord {
    pub self_accepted: bool,
    pub self_accept_error_handler: Option<Value>,
    pub self_declined: bool,
    pub accepted: Vec<AcceptEntry>,
    pub declined: BTreeSet<String>,
    pub dispose_handlers: Vec<Value>,
}

pub struct HotRuntime {
    pub enabled: bool,
    pub status: Rc<Cell<HotStatus>>,
    /// Hash of the compilation the running program corresponds to.
    pub current_hash: Option<String>,
    /// Output directory `check` reads update manifests from.
    pub update_source: Option<PathBuf>,
    /// Update found by the last `check`, waiting for `apply`.
    pending: Option<HotUpdate>,
    /// Dispose data waiting for the next instance of each module.
    data: HashMap<String, Value>,
}

/// `<hash>.hot-update.json`
#[derive(Debug, Deserialize)]
struct Manifest {
    /// Hash of the compilation the update leads to.
    h: String,
    /// Chunks carrying replacement modules.
    #[serde(default)]
    c: Vec<String>,
    /// Removed module ids.
    #[serde(default)]
    m: Vec<String>,
}

/// Replacement factories for one update.
pub struct HotUpdate {
    pub hash: String,
    pub modules: Vec<(String, Factory)>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub outdated: Vec<String>,
    pub accept_callbacks: usize,
    pub reexecuted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HotApplyError {
    /// Propagation hit an entry or a decline; nothing changed.
    Aborted(String),
    /// Factories were replaced but a handler or re-execution threw.
    Failed(String),
    Interrupted(Abort),
}

#[derive(Debug, Error)]
pub enum HotCheckError {
    /// Malformed manifest or update chunk; counts as a failed update.
    #[error("{0}")]
    Invalid(String),

    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HotRuntime {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            status: Rc::new(Cell::new(HotStatus::Idle)),
            current_hash: None,
            update_source: None,
            pending: None,
            data: HashMap::new(),
        }
    }

    /// Build the `module.hot` object for a fresh instance of `id`.
    pub fn make_hot_object(&mut self, id: &str, record: &Rc<RefCell<HotRecord>>) -> Value {
        let data = self.data.remove(id).unwrap_or(Value::Undefined);
        let weak = Rc::downgrade(record);
        let status = Rc::clone(&self.status);
        Value::object_from([
            ("accept", accept_fn(weak.clone())),
            ("decline", decline_fn(weak.clone())),
            ("dispose", dispose_fn("dispose", weak.clone())),
            ("addDisposeHandler", dispose_fn("addDisposeHandler", weak)),
            ("check", check_fn()),
            ("apply", apply_fn()),
            (
                "status",
                Value::native("status", move |_, _| Ok(Value::str(status.get().as_str()))),
            ),
            ("data", data),
        ])
    }
}

/// Module ids named by a dependency argument: a string or an array of strings.
fn dependency_list(arg: &Value) -> Option<Vec<String>> {
    match arg {
        Value::Str(s) => Some(vec![s.to_string()]),
        Value::Array(items) => Some(items.borrow().iter().map(Value::to_js_string).collect()),
        _ => None,
    }
}

fn function_arg(args: &[Value], index: usize) -> Option<Value> {
    args.get(index).filter(|v| v.is_function()).cloned()
}

fn accept_fn(record: Weak<RefCell<HotRecord>>) -> Value {
    Value::native("accept", move |_, args| {
        let Some(record) = record.upgrade() else {
            return Ok(Value::Undefined);
        };
        let mut record = record.borrow_mut();
        match args.first().and_then(dependency_list) {
            Some(deps) => {
                let callback = function_arg(&args, 1);
                let error_handler = function_arg(&args, 2);
                for dep in deps {
                    record.accepted.push(AcceptEntry {
                        dep,
                        callback: callback.clone(),
                        error_handler: error_handler.clone(),
                    });
                }
            }
            None => {
                record.self_accepted = true;
                record.self_accept_error_handler = function_arg(&args, 0);
            }
        }
        Ok(Value::Undefined)
    })
}

fn decline_fn(record: Weak<RefCell<HotRecord>>) -> Value {
    Value::native("decline", move |_, args| {
        let Some(record) = record.upgrade() else {
            return Ok(Value::Undefined);
        };
        let mut record = record.borrow_mut();
        match args.first().and_then(dependency_list) {
            Some(deps) => record.declined.extend(deps),
            None => record.self_declined = true,
        }
        Ok(Value::Undefined)
    })
}

fn dispose_fn(name: &str, record: Weak<RefCell<HotRecord>>) -> Value {
    Value::native(name, move |rt, args| {
        let Some(handler) = function_arg(&args, 0) else {
            return Err(rt.type_error("dispose handler must be a function"));
        };
        if let Some(record) = record.upgrade() {
            record.borrow_mut().dispose_handlers.push(handler);
        }
        Ok(Value::Undefined)
    })
}

fn check_fn() -> Value {
    Value::native("check", |rt, _| match rt.hot_check() {
        Ok(Some(ids)) => Ok(Value::array(ids.iter().map(|id| Value::str(id)).collect())),
        Ok(None) => Ok(Value::Null),
        Err(err) => Err(rt.throw_error("Error", err.to_string())),
    })
}

fn apply_fn() -> Value {
    Value::native("apply", |rt, _| match rt.hot_apply() {
        Ok(report) => Ok(Value::array(report.outdated.iter().map(|id| Value::str(id)).collect())),
        Err(HotApplyError::Aborted(message) | HotApplyError::Failed(message)) => Err(rt.throw_error("Error", message)),
        Err(HotApplyError::Interrupted(abort)) => Err(Interrupt::Abort(abort)),
    })
}

/// Read the manifest for `current` and the update chunks it names. `Ok(None)` when there is no manifest.
fn read_update(dir: &Path, current: &str) -> Result<Option<HotUpdate>, HotCheckError> {
    let manifest_path = dir.join(format!("{}.hot-update.json", current));
    let manifest: Manifest = match std::fs::read_to_string(&manifest_path) {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| HotCheckError::Invalid(format!("invalid update manifest: {}", e)))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(hash = %current, "no update manifest");
            return Ok(None);
        }
        Err(source) => {
            return Err(HotCheckError::Io {
                path: manifest_path,
                source,
            })
        }
    };

    let mut modules = Vec::new();
    for chunk in &manifest.c {
        let path = dir.join(format!("{}.{}.hot-update.js", chunk, current));
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(source) => return Err(HotCheckError::Io { path, source }),
        };
        let program = bundletest_script::parse_source(&text).map_err(|errors| {
            let message = errors.first().map(|e| e.message.clone()).unwrap_or_default();
            HotCheckError::Invalid(format!("SyntaxError in update chunk: {}", message))
        })?;
        for item in program.items {
            if let Item::Define(m) = item.node {
                let source = text.get(item.span.start..item.span.end).unwrap_or_default();
                modules.push((m.id, Factory::new(m.body, source)));
            }
        }
    }
    Ok(Some(HotUpdate {
        hash: manifest.h,
        modules,
        removed: manifest.m,
    }))
}

impl Runtime {
    /// Look for an update to the current compilation and hold it for `hot_apply`. Returns the ids it replaces
    /// or removes, or `None` when there is nothing to apply.
    pub(super) fn hot_check(&mut self) -> Result<Option<Vec<String>>, HotCheckError> {
        let (Some(dir), Some(current)) = (self.hot.update_source.clone(), self.hot.current_hash.clone()) else {
            return Ok(None);
        };
        let status = Rc::clone(&self.hot.status);
        status.set(HotStatus::Check);
        let found = read_update(&dir, &current);
        status.set(if found.is_ok() { HotStatus::Idle } else { HotStatus::Fail });
        let Some(update) = found? else {
            return Ok(None);
        };
        if update.modules.is_empty() && update.removed.is_empty() {
            self.hot.current_hash = Some(update.hash);
            return Ok(None);
        }
        let ids = update
            .modules
            .iter()
            .map(|(id, _)| id.clone())
            .chain(update.removed.iter().cloned())
            .collect();
        self.hot.pending = Some(update);
        Ok(Some(ids))
    }

    /// Apply the update held by the last `hot_check`; an empty report when there is none.
    pub(super) fn hot_apply(&mut self) -> Result<ApplyReport, HotApplyError> {
        match self.hot.pending.take() {
            Some(update) => self.apply_hot_update(update),
            None => Ok(ApplyReport::default()),
        }
    }

    pub(super) fn apply_hot_update(&mut self, update: HotUpdate) -> Result<ApplyReport, HotApplyError> {
        let status = Rc::clone(&self.hot.status);
        status.set(HotStatus::Check);

        // ---- propagation (read-only) ----
        let changed: Vec<String> = update
            .modules
            .iter()
            .map(|(id, _)| id.clone())
            .chain(update.removed.iter().cloned())
            .collect();
        let mut outdated: Vec<String> = Vec::new();
        let mut self_accepted: Vec<(String, Option<Value>)> = Vec::new();
        let mut outdated_deps: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for id in &changed {
            let mut queue = VecDeque::from([id.clone()]);
            while let Some(module) = queue.pop_front() {
                if outdated.contains(&module) {
                    continue;
                }
                let Some(instance) = self.registry.instances.get(&module) else {
                    continue;
                };
                let (declined, accepted, handler) = instance
                    .hot
                    .as_ref()
                    .map(|r| {
                        let r = r.borrow();
                        (r.self_declined, r.self_accepted, r.self_accept_error_handler.clone())
                    })
                    .unwrap_or((false, false, None));
                if declined {
                    status.set(HotStatus::Abort);
                    return Err(HotApplyError::Aborted(format!(
                        "Aborted because of self decline: {}",
                        module
                    )));
                }
                if accepted {
                    outdated.push(module.clone());
                    self_accepted.push((module, handler));
                    continue;
                }
                if self.registry.entries.contains(&module) || instance.parents.is_empty() {
                    status.set(HotStatus::Abort);
                    return Err(HotApplyError::Aborted(format!("Aborted because {} is not accepted", module)));
                }
                outdated.push(module.clone());
                for parent in &instance.parents {
                    let Some(parent_instance) = self.registry.instances.get(parent) else {
                        continue;
                    };
                    let (declines, accepts) = parent_instance
                        .hot
                        .as_ref()
                        .map(|r| {
                            let r = r.borrow();
                            (r.declined.contains(&module), r.accepted.iter().any(|a| a.dep == module))
                        })
                        .unwrap_or((false, false));
                    if declines {
                        status.set(HotStatus::Abort);
                        return Err(HotApplyError::Aborted(format!(
                            "Aborted because of declined dependency: {} in {}",
                            module, parent
                        )));
                    }
                    if accepts {
                        let deps = outdated_deps.entry(parent.clone()).or_default();
                        if !deps.contains(&module) {
                            deps.push(module.clone());
                        }
                    } else {
                        queue.push_back(parent.clone());
                    }
                }
            }
        }
        tracing::debug!(?outdated, "hot update propagated");

        // ---- dispose ----
        status.set(HotStatus::Dispose);
        let mut errors: Vec<String> = Vec::new();
        let mut preserved_parents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for module in &outdated {
            let Some(instance) = self.registry.instances.remove(module) else {
                continue;
            };
            let data = Value::Object(Value::new_object());
            let handlers = instance
                .hot
                .as_ref()
                .map(|r| r.borrow().dispose_handlers.clone())
                .unwrap_or_default();
            for handler in handlers {
                match self.call_function(&handler, vec![data.clone()]) {
                    Ok(_) => {}
                    Err(Interrupt::Throw(e)) => errors.push(format!(
                        "dispose handler of {} threw: {}",
                        module,
                        e.describe_thrown()
                    )),
                    Err(Interrupt::Abort(abort)) => return Err(HotApplyError::Interrupted(abort)),
                }
            }
            self.hot.data.insert(module.clone(), data);
            preserved_parents.insert(module.clone(), instance.parents);
        }
        for instance in self.registry.instances.values_mut() {
            instance.parents.retain(|p| !outdated.contains(p));
        }

        // ---- apply ----
        status.set(HotStatus::Apply);
        for (id, factory) in update.modules {
            self.registry.factories.insert(id, factory);
        }
        for id in &update.removed {
            self.registry.factories.remove(id);
            self.hot.data.remove(id);
        }
        self.hot.current_hash = Some(update.hash);

        let mut report = ApplyReport {
            outdated: outdated.clone(),
            ..ApplyReport::default()
        };
        for (parent, deps) in &outdated_deps {
            if outdated.contains(parent) {
                continue;
            }
            let Some(record) = self.registry.instances.get(parent).and_then(|i| i.hot.clone()) else {
                continue;
            };
            let entries: Vec<AcceptEntry> = record
                .borrow()
                .accepted
                .iter()
                .filter(|a| deps.contains(&a.dep))
                .cloned()
                .collect();
            let mut called: Vec<Value> = Vec::new();
            for entry in entries {
                let Some(callback) = entry.callback else {
                    continue;
                };
                if called.iter().any(|c| strict_equals(c, &callback)) {
                    continue;
                }
                called.push(callback.clone());
                let deps_arg = Value::array(deps.iter().map(|d| Value::str(d)).collect());
                match self.call_function(&callback, vec![deps_arg]) {
                    Ok(_) => report.accept_callbacks += 1,
                    Err(Interrupt::Throw(e)) => {
                        let context = Value::object_from([
                            ("moduleId", Value::str(parent)),
                            ("dependencyId", Value::str(&entry.dep)),
                        ]);
                        self.report_handler_error(
                            entry.error_handler,
                            e,
                            context,
                            format!("accept handler of {}", parent),
                            &mut errors,
                        )?;
                    }
                    Err(Interrupt::Abort(abort)) => return Err(HotApplyError::Interrupted(abort)),
                }
            }
        }

        for (module, handler) in self_accepted {
            if update.removed.contains(&module) {
                continue;
            }
            match self.require_module(None, &module) {
                Ok(_) => {
                    if let (Some(instance), Some(parents)) = (
                        self.registry.instances.get_mut(&module),
                        preserved_parents.remove(&module),
                    ) {
                        instance.parents.extend(parents);
                    }
                    report.reexecuted.push(module);
                }
                Err(Interrupt::Throw(e)) => {
                    let context = Value::str(&module);
                    self.report_handler_error(
                        handler,
                        e,
                        context,
                        format!("self-accepted module {}", module),
                        &mut errors,
                    )?;
                }
                Err(Interrupt::Abort(abort)) => return Err(HotApplyError::Interrupted(abort)),
            }
        }

        if errors.is_empty() {
            status.set(HotStatus::Idle);
            Ok(report)
        } else {
            status.set(HotStatus::Fail);
            Err(HotApplyError::Failed(errors.join("\n")))
        }
    }

    /// Route an error to the module's error handler, or record it as an update failure.
    fn report_handler_error(
        &mut self,
        handler: Option<Value>,
        error: Value,
        context: Value,
        what: String,
        errors: &mut Vec<String>,
    ) -> Result<(), HotApplyError> {
        let Some(handler) = handler else {
            errors.push(format!("{} threw: {}", what, error.describe_thrown()));
            return Ok(());
        };
        match self.call_function(&handler, vec![error, context]) {
            Ok(_) => Ok(()),
            Err(Interrupt::Throw(e)) => {
                errors.push(format!("error handler of {} threw: {}", what, e.describe_thrown()));
                Ok(())
            }
            Err(Interrupt::Abort(abort)) => Err(HotApplyError::Interrupted(abort)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_spelling() {
        let names: Vec<_> = [
            HotStatus::Idle,
            HotStatus::Check,
            HotStatus::Dispose,
            HotStatus::Apply,
            HotStatus::Abort,
            HotStatus::Fail,
        ]
        .iter()
        .map(|s| s.as_str())
        .collect();
        assert_eq!(names, vec!["idle", "check", "dispose", "apply", "abort", "fail"]);
    }

    #[test]
    fn test_dependency_list_accepts_string_or_array() {
        assert_eq!(dependency_list(&Value::str("./a")), Some(vec!["./a".to_string()]));
        assert_eq!(
            dependency_list(&Value::array(vec![Value::str("./a"), Value::str("./b")])),
            Some(vec!["./a".to_string(), "./b".to_string()])
        );
        assert_eq!(dependency_list(&Value::Undefined), None);
    }

    #[test]
    fn test_hot_object_records_registrations() {
        let mut hot = HotRuntime::new(true);
        let record = Rc::new(RefCell::new(HotRecord::default()));
        let obj = hot.make_hot_object("./m", &record);
        let Value::Object(obj) = obj else {
            panic!("expected object");
        };
        let accept = obj.borrow().get("accept").cloned().unwrap();
        let decline = obj.borrow().get("decline").cloned().unwrap();
        let options = crate::sandbox::SandboxOptions::default();
        let mut rt = Runtime::new(&options);
        rt.begin_segment(1_000, std::time::Duration::from_secs(1));
        rt.call_function(&accept, vec![Value::str("./dep")]).unwrap();
        rt.call_function(&decline, vec![]).unwrap();
        rt.call_function(&accept, vec![]).unwrap();
        let record = record.borrow();
        assert_eq!(record.accepted.len(), 1);
        assert_eq!(record.accepted[0].dep, "./dep");
        assert!(record.self_declined);
        assert!(record.self_accepted);
    }
}
