//! Declarative-registration module loader.
//!
//! Emitted `register "<id>" [deps] { ... }` items land here. The loader only tracks records and their phases:
//! it wires live bindings between records and decides execution order, while the sandbox runtime runs the
//! factory bodies it hands out.
//!
//! ## Phases
//!
//! `Registered → Instantiating → Instantiated → Executing → Executed`, with `Errored` reachable from
//! `Instantiating` (a dependency could not be resolved) or `Executing` (the factory threw). `Errored` is terminal
//! for that registration; registering the same id again yields a fresh record.
//!
//! ## Live bindings
//!
//! Every named or default import becomes a [`LiveCell`] owned by the importer. The cell is pushed onto the
//! dependency's setter list, and the dependency's export sink writes the cell whenever it assigns the export.
//! That is what lets cyclic imports observe exports assigned after the importer started executing.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use bundletest_script::ast::{Body, ImportClause, Statement};

use crate::error::LoaderError;
use crate::sandbox::scope::{LiveCell, SetterList};
use crate::sandbox::value::{ObjRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Registered,
    Instantiating,
    Instantiated,
    Executing,
    Executed,
    Errored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Allow a record that errored during this load to execute again when requested.
    pub retry_errored_within_load: bool,
}

/// An importer-side binding created during instantiation.
#[derive(Clone)]
pub enum LocalBinding {
    Cell(LiveCell),
    Namespace(ObjRef),
}

pub struct ModuleRecord {
    pub id: String,
    pub deps: Vec<String>,
    /// `None` for a placeholder created because another record depends on this id.
    pub body: Option<Body>,
    pub phase: Phase,
    pub namespace: ObjRef,
    pub setters: SetterList,
    pub locals: Vec<(String, LocalBinding)>,
    pub error: Option<Value>,
}

impl ModuleRecord {
    fn new(id: &str, deps: Vec<String>, body: Option<Body>) -> Self {
        Self {
            id: id.to_string(),
            deps,
            body,
            phase: Phase::Registered,
            namespace: Value::new_object(),
            setters: Rc::new(RefCell::new(Vec::new())),
            locals: Vec::new(),
            error: None,
        }
    }
}

/// Everything the runtime needs to execute one record.
pub struct ExecPlan {
    pub id: String,
    pub body: Body,
    pub deps: Vec<String>,
    pub namespace: ObjRef,
    pub setters: SetterList,
    pub locals: Vec<(String, LocalBinding)>,
}

pub enum ExecStart {
    Run(ExecPlan),
    /// Already executed, or executing further up a cycle: use the namespace as it stands.
    Done(ObjRef),
}

pub struct Loader {
    options: LoaderOptions,
    records: HashMap<String, ModuleRecord>,
}

impl Loader {
    pub fn new(options: LoaderOptions) -> Self {
        Self {
            options,
            records: HashMap::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.get(id).is_some_and(|r| r.body.is_some())
    }

    pub fn phase(&self, id: &str) -> Option<Phase> {
        self.records.get(id).map(|r| r.phase)
    }

    pub fn namespace(&self, id: &str) -> Option<ObjRef> {
        self.records.get(id).map(|r| Rc::clone(&r.namespace))
    }

    /// Error value of an errored record.
    pub fn error(&self, id: &str) -> Option<Value> {
        self.records
            .get(id)
            .filter(|r| r.phase == Phase::Errored)
            .and_then(|r| r.error.clone())
    }

    /// Record a declaration. Placeholders keep their namespace and setters so earlier wiring stays valid;
    /// any other existing record is replaced by a fresh one.
    pub fn register(&mut self, id: &str, deps: Vec<String>, body: Body) {
        match self.records.get_mut(id) {
            Some(record) if record.body.is_none() => {
                record.deps = deps;
                record.body = Some(body);
            }
            _ => {
                self.records
                    .insert(id.to_string(), ModuleRecord::new(id, deps, Some(body)));
            }
        }
    }

    /// Resolve dependencies (registering placeholders for unseen ids) and wire live bindings.
    pub fn instantiate(&mut self, id: &str) -> Result<(), LoaderError> {
        let Some(record) = self.records.get_mut(id) else {
            return Err(LoaderError::NotRegistered { id: id.to_string() });
        };
        if record.phase != Phase::Registered {
            return Ok(());
        }
        let Some(body) = record.body.clone() else {
            return Err(LoaderError::NotRegistered { id: id.to_string() });
        };
        record.phase = Phase::Instantiating;

        let mut deps = record.deps.clone();
        for stmt in body.iter() {
            if let Statement::Import(decl) = &stmt.node {
                if !deps.contains(&decl.source) {
                    deps.push(decl.source.clone());
                }
            }
        }

        for dep in &deps {
            self.records
                .entry(dep.clone())
                .or_insert_with(|| ModuleRecord::new(dep, Vec::new(), None));
            if let Err(err) = self.instantiate(dep) {
                self.fail(id, Value::error("Error", &err.to_string()));
                return Err(err);
            }
        }

        let mut locals = Vec::new();
        for stmt in body.iter() {
            let Statement::Import(decl) = &stmt.node else {
                continue;
            };
            let Some(dep) = self.records.get(&decl.source) else {
                continue;
            };
            match &decl.clause {
                ImportClause::SideEffect => {}
                ImportClause::Namespace(local) => {
                    locals.push((local.clone(), LocalBinding::Namespace(Rc::clone(&dep.namespace))));
                }
                ImportClause::Default(local) => {
                    locals.push((local.clone(), LocalBinding::Cell(wire(dep, "default"))));
                }
                ImportClause::Named(specs) => {
                    for spec in specs {
                        locals.push((spec.local.clone(), LocalBinding::Cell(wire(dep, &spec.imported))));
                    }
                }
            }
        }

        if let Some(record) = self.records.get_mut(id) {
            record.deps = deps;
            record.locals = locals;
            record.phase = Phase::Instantiated;
        }
        Ok(())
    }

    /// Dependency-first execution order rooted at `id`; a back edge is simply not followed.
    pub fn link(&self, id: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        self.visit(id, &mut visited, &mut order);
        order
    }

    fn visit(&self, id: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(id.to_string()) {
            return;
        }
        if let Some(record) = self.records.get(id) {
            for dep in &record.deps {
                self.visit(dep, visited, order);
            }
        }
        order.push(id.to_string());
    }

    /// Move a record into `Executing` and hand out its plan, or report why it cannot run.
    pub fn begin_execute(&mut self, id: &str) -> Result<ExecStart, LoaderError> {
        self.instantiate(id)?;
        let retry = self.options.retry_errored_within_load;
        let Some(record) = self.records.get_mut(id) else {
            return Err(LoaderError::NotRegistered { id: id.to_string() });
        };
        match record.phase {
            Phase::Executed | Phase::Executing => return Ok(ExecStart::Done(Rc::clone(&record.namespace))),
            Phase::Errored if !retry => {
                let message = record
                    .error
                    .as_ref()
                    .map(Value::describe_thrown)
                    .unwrap_or_default();
                return Err(LoaderError::Errored {
                    id: id.to_string(),
                    message,
                });
            }
            Phase::Errored => tracing::debug!(module = id, "retrying errored record"),
            Phase::Registered | Phase::Instantiating | Phase::Instantiated => {}
        }
        let Some(body) = record.body.clone() else {
            return Err(LoaderError::NotRegistered { id: id.to_string() });
        };
        record.phase = Phase::Executing;
        record.error = None;
        Ok(ExecStart::Run(ExecPlan {
            id: id.to_string(),
            body,
            deps: record.deps.clone(),
            namespace: Rc::clone(&record.namespace),
            setters: Rc::clone(&record.setters),
            locals: record.locals.clone(),
        }))
    }

    pub fn finish_execute(&mut self, id: &str, result: Result<(), Value>) {
        match result {
            Ok(()) => {
                if let Some(record) = self.records.get_mut(id) {
                    record.phase = Phase::Executed;
                }
            }
            Err(error) => self.fail(id, error),
        }
    }

    fn fail(&mut self, id: &str, error: Value) {
        if let Some(record) = self.records.get_mut(id) {
            tracing::debug!(module = id, error = %error.describe_thrown(), "module errored");
            record.phase = Phase::Errored;
            record.error = Some(error);
        }
    }
}

/// Create an importer cell for `name`, seeded with the current export value, and subscribe it.
fn wire(dep: &ModuleRecord, name: &str) -> LiveCell {
    let current = dep.namespace.borrow().get(name).cloned().unwrap_or(Value::Undefined);
    let cell: LiveCell = Rc::new(RefCell::new(current));
    dep.setters.borrow_mut().push((name.to_string(), Rc::clone(&cell)));
    cell
}
