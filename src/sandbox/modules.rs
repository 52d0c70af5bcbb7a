//! Module registries and module execution.
//!
//! `define` modules live in [`ModuleRegistry`]: factories keyed by id plus an instance cache, with parent edges
//! recorded on every `require` so hot updates can propagate. `register` modules are tracked by the
//! [`Loader`](crate::loader::Loader); this file runs their bodies once the loader hands out a plan.
//! Inside a `define` body an AMD `define([deps], factory)` call is also understood.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use bundletest_script::ast::{Body, ImportClause, Statement};
use bundletest_script::specifiers::AMD_PSEUDO_DEPENDENCIES;

use super::hot::HotRecord;
use super::interp::{Interrupt, Runtime};
use super::scope::{Binding, Env, ExportSink, ExportTable, ImportRef, Scope};
use super::value::{ObjRef, Value};
use super::ModuleFormat;
use crate::error::LoaderError;
use crate::loader::{ExecPlan, ExecStart, LocalBinding};

/// A `define` factory as emitted.
#[derive(Clone)]
pub struct Factory {
    pub body: Body,
    /// Hash of the emitted text; reloads compare it to find changed modules.
    pub fingerprint: u64,
    /// Whether the body uses `import`/`export` (controls default-import interop).
    pub esm: bool,
}

impl Factory {
    pub fn new(body: Body, text: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let esm = body
            .iter()
            .any(|s| matches!(s.node, Statement::Import(_) | Statement::Export(_)));
        Self {
            body,
            fingerprint: hasher.finish(),
            esm,
        }
    }
}

pub struct ModuleInstance {
    pub module_obj: ObjRef,
    pub hot: Option<Rc<RefCell<HotRecord>>>,
    pub parents: BTreeSet<String>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    pub(super) factories: HashMap<String, Factory>,
    pub(super) instances: HashMap<String, ModuleInstance>,
    /// Modules started through an `entry` item; hot propagation stops (and aborts) here.
    pub(super) entries: BTreeSet<String>,
}

impl ModuleRegistry {
    /// Install a factory; returns `true` if it is new or its content changed.
    pub fn define(&mut self, id: &str, factory: Factory) -> bool {
        let changed = self
            .factories
            .get(id)
            .is_none_or(|old| old.fingerprint != factory.fingerprint);
        self.factories.insert(id.to_string(), factory);
        changed
    }

    pub fn has_factory(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn is_esm(&self, id: &str) -> bool {
        self.factories.get(id).is_some_and(|f| f.esm)
    }

    /// Drop the cached instances of `ids` and of every module that (transitively) required them.
    pub fn evict_with_dependents(&mut self, ids: &[String]) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut queue: Vec<String> = ids.to_vec();
        while let Some(id) = queue.pop() {
            let Some(instance) = self.instances.remove(&id) else {
                continue;
            };
            queue.extend(instance.parents.iter().cloned());
            evicted.push(id);
        }
        for instance in self.instances.values_mut() {
            for id in &evicted {
                instance.parents.remove(id);
            }
        }
        evicted.sort();
        evicted
    }
}

impl Runtime {
    /// Resolve `id` for `parent` (or for chunk-level code when `None`) and return its exports.
    pub(super) fn require_module(&mut self, parent: Option<&str>, id: &str) -> Result<Value, Interrupt> {
        let registered = match self.format {
            ModuleFormat::Register => self.loader.contains(id) || !self.registry.has_factory(id),
            ModuleFormat::Define => self.loader.contains(id) && !self.registry.has_factory(id),
        };
        if registered {
            return self.execute_registered(id).map(Value::Object);
        }

        if let Some(instance) = self.registry.instances.get_mut(id) {
            if let Some(parent) = parent {
                instance.parents.insert(parent.to_string());
            }
            return Ok(module_exports(&instance.module_obj));
        }

        let Some(factory) = self.registry.factories.get(id).cloned() else {
            return Err(self.throw_error("Error", format!("Cannot find module '{}'", id)));
        };
        let module_obj = self.create_instance(id, parent);
        let result = self
            .define_scope(id, &factory.body, &module_obj)
            .and_then(|env| self.exec_stmts(&factory.body, &env));
        match result {
            Ok(_) => Ok(module_exports(&module_obj)),
            Err(interrupt) => {
                // A throwing factory leaves no cached instance; the next require runs it again.
                self.registry.instances.remove(id);
                Err(interrupt)
            }
        }
    }

    /// Read a `define`-format import binding.
    pub(super) fn read_import(&mut self, import: &ImportRef) -> Result<Value, Interrupt> {
        let exports = self.require_module(Some(&import.importer), &import.module)?;
        match import.name.as_deref() {
            None => Ok(exports),
            Some("default") if !self.registry.is_esm(&import.module) => Ok(exports),
            Some(name) => self.get_property(&exports, name),
        }
    }

    fn create_instance(&mut self, id: &str, parent: Option<&str>) -> ObjRef {
        let module_obj = Value::new_object();
        {
            let mut m = module_obj.borrow_mut();
            m.set("id", Value::str(id));
            m.set("exports", Value::Object(Value::new_object()));
        }
        let hot = if self.hot.enabled {
            let record = Rc::new(RefCell::new(HotRecord::default()));
            let hot_obj = self.hot.make_hot_object(id, &record);
            module_obj.borrow_mut().set("hot", hot_obj);
            Some(record)
        } else {
            None
        };
        self.registry.instances.insert(
            id.to_string(),
            ModuleInstance {
                module_obj: Rc::clone(&module_obj),
                hot,
                parents: parent.map(|p| BTreeSet::from([p.to_string()])).unwrap_or_default(),
            },
        );
        module_obj
    }

    /// Module scope for a `define` body: `module`, `exports`, `require`, hoisted functions, then imports
    /// (which run their dependencies first).
    fn define_scope(&mut self, id: &str, body: &Body, module_obj: &ObjRef) -> Result<Env, Interrupt> {
        let table = Rc::new(ExportTable::scan(body, ExportSink::Module(Rc::clone(module_obj))));
        let env = Scope::module(&self.globals, table);
        env.declare("module", Value::Object(Rc::clone(module_obj)), false);
        env.declare("exports", module_exports(module_obj), true);
        env.declare("require", module_require(id), false);
        env.declare("define", amd_define(id, module_obj), false);
        self.hoist_functions(body, &env);

        for stmt in body.iter() {
            let Statement::Import(decl) = &stmt.node else {
                continue;
            };
            self.require_module(Some(id), &decl.source)?;
            let import = |name: Option<&str>| {
                Binding::Import(Rc::new(ImportRef {
                    importer: id.to_string(),
                    module: decl.source.clone(),
                    name: name.map(str::to_string),
                }))
            };
            match &decl.clause {
                ImportClause::SideEffect => {}
                ImportClause::Default(local) => env.declare_binding(local, import(Some("default"))),
                ImportClause::Namespace(local) => env.declare_binding(local, import(None)),
                ImportClause::Named(specs) => {
                    for spec in specs {
                        env.declare_binding(&spec.local, import(Some(&spec.imported)));
                    }
                }
            }
        }
        Ok(env)
    }

    /// Module scope for a `register` body, with the loader's live cells bound as locals.
    fn register_scope(&mut self, plan: &ExecPlan) -> Env {
        let sink = ExportSink::Register {
            namespace: Rc::clone(&plan.namespace),
            setters: Rc::clone(&plan.setters),
        };
        let env = Scope::module(&self.globals, Rc::new(ExportTable::scan(&plan.body, sink)));
        let module_obj = Value::object_from([
            ("id", Value::str(&plan.id)),
            ("exports", Value::Object(Rc::clone(&plan.namespace))),
        ]);
        env.declare("module", module_obj, false);
        env.declare("exports", Value::Object(Rc::clone(&plan.namespace)), false);
        env.declare("require", module_require(&plan.id), false);
        for (local, binding) in &plan.locals {
            match binding {
                LocalBinding::Cell(cell) => env.declare_binding(local, Binding::Live(Rc::clone(cell))),
                LocalBinding::Namespace(ns) => env.declare(local, Value::Object(Rc::clone(ns)), false),
            }
        }
        self.hoist_functions(&plan.body, &env);
        env
    }

    /// Instantiate, link and execute a `register` module (and its dependencies) and return its namespace.
    pub(super) fn execute_registered(&mut self, id: &str) -> Result<ObjRef, Interrupt> {
        self.loader.instantiate(id).map_err(|err| self.loader_throw(id, err))?;
        for module in self.loader.link(id) {
            match self.execute_record(&module) {
                // Importers observe the failure when they reach execution themselves.
                Ok(()) | Err(Interrupt::Throw(_)) => {}
                Err(abort) => return Err(abort),
            }
        }
        if let Some(error) = self.loader.error(id) {
            return Err(Interrupt::Throw(error));
        }
        self.loader
            .namespace(id)
            .ok_or_else(|| self.loader_throw(id, LoaderError::NotRegistered { id: id.to_string() }))
    }

    fn execute_record(&mut self, id: &str) -> Result<(), Interrupt> {
        let plan = match self.begin_record(id)? {
            Some(plan) => plan,
            None => return Ok(()),
        };
        let env = self.register_scope(&plan);
        let result = self.exec_stmts(&plan.body, &env).map(|_| ());
        self.finish_record(id, &result);
        result
    }

    /// Start executing a record; `None` when it already ran. Fails if a dependency errored.
    fn begin_record(&mut self, id: &str) -> Result<Option<ExecPlan>, Interrupt> {
        let plan = match self.loader.begin_execute(id) {
            Ok(ExecStart::Done(_)) => return Ok(None),
            Ok(ExecStart::Run(plan)) => plan,
            Err(err) => return Err(self.loader_throw(id, err)),
        };
        if let Some(error) = plan.deps.iter().find_map(|dep| self.loader.error(dep)) {
            self.loader.finish_execute(id, Err(error.clone()));
            return Err(Interrupt::Throw(error));
        }
        Ok(Some(plan))
    }

    fn finish_record(&mut self, id: &str, result: &Result<(), Interrupt>) {
        let outcome = match result {
            Ok(()) => Ok(()),
            Err(Interrupt::Throw(error)) => Err(error.clone()),
            Err(Interrupt::Abort(_)) => Err(Value::error("Error", "execution aborted")),
        };
        self.loader.finish_execute(id, outcome);
    }

    fn loader_throw(&self, id: &str, err: LoaderError) -> Interrupt {
        match (&err, self.loader.error(id)) {
            (LoaderError::Errored { .. }, Some(error)) => Interrupt::Throw(error),
            _ => self.throw_error("Error", err.to_string()),
        }
    }

    /// Prepare the scope an entry frame runs in.
    ///
    /// Returns `None` when a `register` entry already executed. The caller reports a missing module as
    /// `EntryNotFound` before calling this.
    pub(super) fn start_entry(&mut self, id: &str) -> Result<Option<(Env, Body)>, Interrupt> {
        if self.format == ModuleFormat::Register {
            self.loader.instantiate(id).map_err(|err| self.loader_throw(id, err))?;
            for module in self.loader.link(id) {
                if module == id {
                    continue;
                }
                match self.execute_record(&module) {
                    Ok(()) | Err(Interrupt::Throw(_)) => {}
                    Err(abort) => return Err(abort),
                }
            }
            let Some(plan) = self.begin_record(id)? else {
                return Ok(None);
            };
            let env = self.register_scope(&plan);
            return Ok(Some((env, plan.body)));
        }

        let Some(factory) = self.registry.factories.get(id).cloned() else {
            return Err(self.throw_error("Error", format!("Cannot find module '{}'", id)));
        };
        // Entries always start fresh.
        self.registry.instances.remove(id);
        self.registry.entries.insert(id.to_string());
        let module_obj = self.create_instance(id, None);
        match self.define_scope(id, &factory.body, &module_obj) {
            Ok(env) => Ok(Some((env, factory.body))),
            Err(interrupt) => {
                self.registry.instances.remove(id);
                Err(interrupt)
            }
        }
    }

    pub(super) fn finish_entry(&mut self, id: &str, result: &Result<(), Interrupt>) {
        if self.format == ModuleFormat::Register {
            self.finish_record(id, result);
            return;
        }
        if result.is_err() {
            self.registry.instances.remove(id);
        }
    }

    pub(super) fn entry_exists(&self, id: &str) -> bool {
        match self.format {
            ModuleFormat::Define => self.registry.has_factory(id),
            ModuleFormat::Register => self.loader.contains(id),
        }
    }
}

fn module_exports(module_obj: &ObjRef) -> Value {
    module_obj.borrow().get("exports").cloned().unwrap_or(Value::Undefined)
}

/// The module-local `require`, which records `id` as the parent of whatever it loads.
fn module_require(id: &str) -> Value {
    let id = id.to_string();
    Value::native("require", move |rt, args| match args.first() {
        Some(Value::Str(spec)) => rt.require_module(Some(&id), spec),
        _ => Err(rt.type_error("require() expects a module id string")),
    })
}

/// AMD `define([deps], factory)` inside a module body. Dependencies load through the module's `require`; the
/// factory's return value, when defined, replaces `module.exports`.
fn amd_define(id: &str, module_obj: &ObjRef) -> Value {
    let id = id.to_string();
    let module_obj = Rc::clone(module_obj);
    Value::native("define", move |rt, args| {
        let mut args = args.into_iter().peekable();
        if matches!(args.peek(), Some(Value::Str(_))) {
            args.next();
        }
        let deps: Vec<Value> = match args.peek() {
            Some(Value::Array(items)) => {
                let items = items.borrow().clone();
                args.next();
                items
            }
            _ => AMD_PSEUDO_DEPENDENCIES.iter().map(|d| Value::str(d)).collect(),
        };
        let factory = args.next().unwrap_or(Value::Undefined);
        if !factory.is_function() {
            module_obj.borrow_mut().set("exports", factory);
            return Ok(Value::Undefined);
        }
        let mut inputs = Vec::with_capacity(deps.len());
        for dep in deps {
            let Value::Str(spec) = dep else {
                return Err(rt.type_error("define() dependencies must be module id strings"));
            };
            inputs.push(match spec.as_ref() {
                "require" => module_require(&id),
                "exports" => module_exports(&module_obj),
                "module" => Value::Object(Rc::clone(&module_obj)),
                _ => rt.require_module(Some(&id), &spec)?,
            });
        }
        let result = rt.call_function(&factory, inputs)?;
        if !matches!(result, Value::Undefined) {
            module_obj.borrow_mut().set("exports", result);
        }
        Ok(Value::Undefined)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::value::same_value;

    fn factory(source: &str) -> Factory {
        let program = bundletest_script::parse_source(source).unwrap();
        let body: Vec<_> = program
            .items
            .into_iter()
            .filter_map(|i| match i.node {
                bundletest_script::ast::Item::Statement(s) => Some(s),
                _ => None,
            })
            .collect();
        Factory::new(Rc::new(body), source)
    }

    #[test]
    fn test_define_reports_content_changes() {
        let mut registry = ModuleRegistry::default();
        assert!(registry.define("a", factory("let x = 1;\n")));
        assert!(!registry.define("a", factory("let x = 1;\n")));
        assert!(registry.define("a", factory("let x = 2;\n")));
        assert!(!registry.is_esm("a"));
        assert!(registry.define("b", factory("export let y = 1;\n")));
        assert!(registry.is_esm("b"));
    }

    #[test]
    fn test_evict_follows_parent_edges() {
        let mut registry = ModuleRegistry::default();
        for (id, parents) in [("leaf", vec!["mid"]), ("mid", vec!["top"]), ("top", vec![]), ("other", vec![])] {
            registry.instances.insert(
                id.to_string(),
                ModuleInstance {
                    module_obj: Value::new_object(),
                    hot: None,
                    parents: parents.into_iter().map(str::to_string).collect(),
                },
            );
        }
        let evicted = registry.evict_with_dependents(&["leaf".to_string()]);
        assert_eq!(evicted, vec!["leaf", "mid", "top"]);
        assert!(registry.instances.contains_key("other"));
    }

    #[test]
    fn test_require_executes_once_and_interops_default() {
        let options = crate::sandbox::SandboxOptions::default();
        let mut rt = Runtime::new(&options);
        rt.install_globals(&options);
        rt.begin_segment(10_000, std::time::Duration::from_secs(5));
        rt.registry.define("cjs", factory("STATE.runs = (STATE.runs || 0) + 1;\nmodule.exports = 41;\n"));
        rt.registry.define(
            "esm",
            factory("import value from \"cjs\";\nexport default value + 1;\n"),
        );
        let exports = rt.require_module(None, "esm").unwrap();
        let default = rt.get_property(&exports, "default").unwrap();
        assert!(same_value(&default, &Value::Number(42.0)));
        rt.require_module(None, "cjs").unwrap();
        let globals = Rc::clone(&rt.globals);
        let state = rt.lookup_ident("STATE", &globals).unwrap();
        let runs = rt.get_property(&state, "runs").unwrap();
        assert!(same_value(&runs, &Value::Number(1.0)));
    }

    #[test]
    fn test_amd_define_runs_factory_with_dependencies() {
        let options = crate::sandbox::SandboxOptions::default();
        let mut rt = Runtime::new(&options);
        rt.install_globals(&options);
        rt.begin_segment(10_000, std::time::Duration::from_secs(5));
        rt.registry.define("base", factory("define(function () { return 41; });\n"));
        rt.registry.define(
            "answer",
            factory("define([\"base\", \"exports\", \"module\"], function (base, exports, module) {\n  exports.value = base + 1;\n  exports.id = module.id;\n});\n"),
        );
        rt.registry.define("literal", factory("define({ kind: \"object\" });\n"));

        let answer = rt.require_module(None, "answer").unwrap();
        let value = rt.get_property(&answer, "value").unwrap();
        assert!(same_value(&value, &Value::Number(42.0)));
        let id = rt.get_property(&answer, "id").unwrap();
        assert!(same_value(&id, &Value::str("answer")));
        assert!(same_value(&rt.require_module(None, "base").unwrap(), &Value::Number(41.0)));
        let literal = rt.require_module(None, "literal").unwrap();
        let kind = rt.get_property(&literal, "kind").unwrap();
        assert!(same_value(&kind, &Value::str("object")));
    }

    #[test]
    fn test_throwing_factory_is_not_cached() {
        let options = crate::sandbox::SandboxOptions::default();
        let mut rt = Runtime::new(&options);
        rt.install_globals(&options);
        rt.begin_segment(10_000, std::time::Duration::from_secs(5));
        rt.registry.define("bad", factory("throw new Error(\"nope\");\n"));
        assert!(matches!(rt.require_module(None, "bad"), Err(Interrupt::Throw(_))));
        assert!(!rt.registry.instances.contains_key("bad"));
        match rt.require_module(None, "missing") {
            Err(Interrupt::Throw(v)) => assert_eq!(v.describe_thrown(), "Error: Cannot find module 'missing'"),
            _ => panic!("expected a throw"),
        }
    }
}
