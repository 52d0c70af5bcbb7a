//! Lexical scopes and module export tables.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bundletest_script::ast::{ExportDecl, Spanned, Statement};

use super::value::{ObjRef, Value};

pub type Env = Rc<Scope>;

/// A cell an importer reads through; the exporting module writes it via its setter list.
pub type LiveCell = Rc<RefCell<Value>>;
pub type SetterList = Rc<RefCell<Vec<(String, LiveCell)>>>;

/// A lazily resolved `define`-format import: reads go through the registry every time.
#[derive(Debug, Clone)]
pub struct ImportRef {
    pub importer: String,
    pub module: String,
    /// `None` for `import * as ns`.
    pub name: Option<String>,
}

pub enum Binding {
    Value { value: Value, mutable: bool },
    Import(Rc<ImportRef>),
    Live(LiveCell),
}

/// What a variable lookup found.
pub enum Lookup {
    Value(Value),
    Import(Rc<ImportRef>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignError {
    Undeclared,
    Constant,
}

/// Where a module's exports are published.
pub enum ExportSink {
    /// `define` format: properties of whatever `module.exports` currently holds.
    Module(ObjRef),
    /// `register` format: a fixed namespace object plus the importers' setter cells.
    Register { namespace: ObjRef, setters: SetterList },
}

impl ExportSink {
    pub fn publish(&self, name: &str, value: &Value) {
        match self {
            ExportSink::Module(module) => {
                let exports = module.borrow().get("exports").cloned();
                if let Some(Value::Object(exports)) = exports {
                    exports.borrow_mut().set(name, value.clone());
                }
            }
            ExportSink::Register { namespace, setters } => {
                namespace.borrow_mut().set(name, value.clone());
                for (export, cell) in setters.borrow().iter() {
                    if export == name {
                        *cell.borrow_mut() = value.clone();
                    }
                }
            }
        }
    }
}

/// Exported names of one module body, keyed by the local binding that feeds them.
pub struct ExportTable {
    pub sink: ExportSink,
    by_local: HashMap<String, Vec<String>>,
}

impl ExportTable {
    pub fn scan(body: &[Spanned<Statement>], sink: ExportSink) -> Self {
        let mut by_local: HashMap<String, Vec<String>> = HashMap::new();
        for stmt in body {
            let Statement::Export(decl) = &stmt.node else {
                continue;
            };
            match decl {
                ExportDecl::Let(l) => by_local.entry(l.name.clone()).or_default().push(l.name.clone()),
                ExportDecl::Function(f) => {
                    if let Some(name) = &f.name {
                        by_local.entry(name.clone()).or_default().push(name.clone());
                    }
                }
                ExportDecl::Named(specs) => {
                    for spec in specs {
                        by_local.entry(spec.local.clone()).or_default().push(spec.exported.clone());
                    }
                }
                ExportDecl::Default(_) => {}
            }
        }
        Self { sink, by_local }
    }

    pub fn is_exported(&self, local: &str) -> bool {
        self.by_local.contains_key(local)
    }

    pub fn publish_local(&self, local: &str, value: &Value) {
        if let Some(names) = self.by_local.get(local) {
            for name in names {
                self.sink.publish(name, value);
            }
        }
    }
}

pub struct Scope {
    vars: RefCell<HashMap<String, Binding>>,
    parent: Option<Env>,
    /// Set on module scopes only.
    exports: Option<Rc<ExportTable>>,
}

impl Scope {
    pub fn root() -> Env {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: None,
            exports: None,
        })
    }

    pub fn child(parent: &Env) -> Env {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
            exports: None,
        })
    }

    pub fn module(parent: &Env, exports: Rc<ExportTable>) -> Env {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
            exports: Some(exports),
        })
    }

    /// Declare (or redeclare) a variable; exported module-level names are published immediately.
    pub fn declare(&self, name: &str, value: Value, mutable: bool) {
        if let Some(table) = &self.exports {
            table.publish_local(name, &value);
        }
        self.vars
            .borrow_mut()
            .insert(name.to_string(), Binding::Value { value, mutable });
    }

    pub fn declare_binding(&self, name: &str, binding: Binding) {
        self.vars.borrow_mut().insert(name.to_string(), binding);
    }

    pub fn lookup(&self, name: &str) -> Option<Lookup> {
        if let Some(binding) = self.vars.borrow().get(name) {
            return Some(match binding {
                Binding::Value { value, .. } => Lookup::Value(value.clone()),
                Binding::Import(import) => Lookup::Import(Rc::clone(import)),
                Binding::Live(cell) => Lookup::Value(cell.borrow().clone()),
            });
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    pub fn assign(&self, name: &str, new_value: Value) -> Result<(), AssignError> {
        let local = match self.vars.borrow_mut().get_mut(name) {
            Some(Binding::Value { value, mutable: true }) => {
                *value = new_value.clone();
                Some(Ok(()))
            }
            Some(_) => Some(Err(AssignError::Constant)),
            None => None,
        };
        if let Some(result) = local {
            if result.is_ok() {
                if let Some(table) = &self.exports {
                    table.publish_local(name, &new_value);
                }
            }
            return result;
        }
        match &self.parent {
            Some(parent) => parent.assign(name, new_value),
            None => Err(AssignError::Undeclared),
        }
    }

    /// The export table of the nearest enclosing module scope.
    pub fn module_exports(&self) -> Option<Rc<ExportTable>> {
        match &self.exports {
            Some(table) => Some(Rc::clone(table)),
            None => self.parent.as_ref().and_then(|p| p.module_exports()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::value::strict_equals;

    fn value_of(env: &Env, name: &str) -> Value {
        match env.lookup(name) {
            Some(Lookup::Value(v)) => v,
            _ => panic!("{} not bound", name),
        }
    }

    #[test]
    fn test_assignment_walks_parents_and_respects_const() {
        let root = Scope::root();
        root.declare("a", Value::Number(1.0), true);
        root.declare("b", Value::Number(1.0), false);
        let inner = Scope::child(&root);
        inner.assign("a", Value::Number(2.0)).unwrap();
        assert!(strict_equals(&value_of(&root, "a"), &Value::Number(2.0)));
        assert_eq!(inner.assign("b", Value::Null), Err(AssignError::Constant));
        assert_eq!(inner.assign("zzz", Value::Null), Err(AssignError::Undeclared));
    }

    #[test]
    fn test_register_sink_updates_setters() {
        let namespace = Value::new_object();
        let cell: LiveCell = Rc::new(RefCell::new(Value::Undefined));
        let setters: SetterList = Rc::new(RefCell::new(vec![("count".to_string(), Rc::clone(&cell))]));
        let body = bundletest_script::parse_source("export let count = 0;\n").unwrap();
        let stmts: Vec<_> = body
            .items
            .into_iter()
            .filter_map(|i| match i.node {
                bundletest_script::ast::Item::Statement(s) => Some(s),
                _ => None,
            })
            .collect();
        let table = Rc::new(ExportTable::scan(
            &stmts,
            ExportSink::Register {
                namespace: Rc::clone(&namespace),
                setters,
            },
        ));
        let env = Scope::module(&Scope::root(), table);
        env.declare("count", Value::Number(0.0), true);
        env.assign("count", Value::Number(5.0)).unwrap();
        assert!(strict_equals(&cell.borrow(), &Value::Number(5.0)));
        assert!(strict_equals(
            namespace.borrow().get("count").unwrap(),
            &Value::Number(5.0)
        ));
    }
}
