//! Tree-walking evaluator for bundle script.
//!
//! `Runtime` owns everything a running program can touch: the global scope, both module registries, the timer
//! queue, the hot runtime and the execution budget. Host functions receive `&mut Runtime`, so nothing here is
//! shared across threads or across sandboxes.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bundletest_script::ast::*;

use super::hot::HotRuntime;
use super::modules::ModuleRegistry;
use super::scope::{AssignError, Env, Lookup, Scope};
use super::timers::TimerQueue;
use super::value::{loose_equals, same_value, strict_equals, ArrRef, Function, Value};
use super::{ConsoleLine, ModuleFormat, RunMode, SandboxOptions, UpdatePromise};
use crate::loader::{Loader, LoaderOptions};

/// Nested calls allowed before a `RangeError` is thrown.
const MAX_CALL_DEPTH: usize = 200;

/// Deadline checks happen once per this many fuel units.
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

/// Largest valid array length; indices stop one below it.
const MAX_ARRAY_LENGTH: usize = u32::MAX as usize;

/// Non-local exit from evaluation.
#[derive(Debug)]
pub enum Interrupt {
    /// A program-level exception; `try`/`catch` can observe it.
    Throw(Value),
    /// A harness-level stop; never observable by the program.
    Abort(Abort),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Abort {
    Assertion(String),
    OutOfFuel,
    Deadline,
    TimerBudget(usize),
    Usage(String),
}

/// Completion of a statement list.
pub(super) enum Signal {
    Normal,
    Return(Value),
}

/// Fuel and wall-clock bound for one execution segment.
#[derive(Debug, Clone)]
pub(super) struct Budget {
    pub fuel: u64,
    pub deadline: Option<Instant>,
    used: u64,
}

impl Budget {
    fn unlimited() -> Self {
        Self {
            fuel: u64::MAX,
            deadline: None,
            used: 0,
        }
    }
}

pub struct Runtime {
    pub(super) globals: Env,
    pub(super) registry: ModuleRegistry,
    pub(super) loader: Loader,
    pub(super) timers: TimerQueue,
    pub(super) hot: HotRuntime,
    pub(super) mode: RunMode,
    pub(super) format: ModuleFormat,
    pub(super) budget: Budget,
    pub(super) assertions: usize,
    pub(super) pending_update: Option<Rc<RefCell<UpdatePromise>>>,
    pub(super) console: Vec<ConsoleLine>,
    depth: usize,
}

impl Runtime {
    pub(super) fn new(options: &SandboxOptions) -> Self {
        Self {
            globals: Scope::root(),
            registry: ModuleRegistry::default(),
            loader: Loader::new(LoaderOptions {
                retry_errored_within_load: options.retry_errored_within_load,
            }),
            timers: TimerQueue::new(options.max_timer_runs),
            hot: HotRuntime::new(options.mode == RunMode::Hot),
            mode: options.mode,
            format: options.format,
            budget: Budget::unlimited(),
            assertions: 0,
            pending_update: None,
            console: Vec::new(),
            depth: 0,
        }
    }

    /// Start a new execution segment with fresh fuel and deadline.
    pub(super) fn begin_segment(&mut self, fuel: u64, deadline: Duration) {
        self.budget = Budget {
            fuel,
            deadline: Instant::now().checked_add(deadline),
            used: 0,
        };
        self.depth = 0;
    }

    pub(super) fn tick(&mut self) -> Result<(), Interrupt> {
        if self.budget.fuel == 0 {
            return Err(Interrupt::Abort(Abort::OutOfFuel));
        }
        self.budget.fuel -= 1;
        self.budget.used += 1;
        if self.budget.used % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some(deadline) = self.budget.deadline {
                if Instant::now() >= deadline {
                    return Err(Interrupt::Abort(Abort::Deadline));
                }
            }
        }
        Ok(())
    }

    /// Spend `units` of fuel at once, for work proportional to a size rather than a statement.
    fn charge(&mut self, units: u64) -> Result<(), Interrupt> {
        if self.budget.fuel < units {
            self.budget.fuel = 0;
            return Err(Interrupt::Abort(Abort::OutOfFuel));
        }
        self.budget.fuel -= units;
        self.budget.used += units;
        Ok(())
    }

    pub(super) fn throw_error(&self, name: &str, message: impl AsRef<str>) -> Interrupt {
        Interrupt::Throw(Value::error(name, message.as_ref()))
    }

    pub(super) fn type_error(&self, message: impl AsRef<str>) -> Interrupt {
        self.throw_error("TypeError", message)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Hoist function declarations, then run the statements.
    pub(super) fn exec_block(&mut self, stmts: &[Spanned<Statement>], env: &Env) -> Result<Signal, Interrupt> {
        self.hoist_functions(stmts, env);
        self.exec_stmts(stmts, env)
    }

    pub(super) fn exec_stmts(&mut self, stmts: &[Spanned<Statement>], env: &Env) -> Result<Signal, Interrupt> {
        for stmt in stmts {
            if let Signal::Return(value) = self.exec_stmt(stmt, env)? {
                return Ok(Signal::Return(value));
            }
        }
        Ok(Signal::Normal)
    }

    pub(super) fn hoist_functions(&mut self, stmts: &[Spanned<Statement>], env: &Env) {
        for stmt in stmts {
            let def = match &stmt.node {
                Statement::Function(def) | Statement::Export(ExportDecl::Function(def)) => def,
                _ => continue,
            };
            if let Some(name) = &def.name {
                let closure = Value::Function(Rc::new(Function::Closure {
                    def: Rc::clone(def),
                    env: Rc::clone(env),
                }));
                env.declare(name, closure, true);
            }
        }
    }

    pub(super) fn exec_stmt(&mut self, stmt: &Spanned<Statement>, env: &Env) -> Result<Signal, Interrupt> {
        self.tick()?;
        match &stmt.node {
            Statement::Let(l) | Statement::Export(ExportDecl::Let(l)) => {
                let value = match &l.init {
                    Some(init) => self.eval(init, env)?,
                    None => Value::Undefined,
                };
                env.declare(&l.name, value, l.kind == DeclKind::Let);
            }
            // Hoisted when the enclosing block started; imports are bound by the module prologue.
            Statement::Function(_)
            | Statement::Export(ExportDecl::Function(_))
            | Statement::Export(ExportDecl::Named(_))
            | Statement::Import(_) => {}
            Statement::Export(ExportDecl::Default(expr)) => {
                let value = self.eval(expr, env)?;
                if let Some(table) = env.module_exports() {
                    table.sink.publish("default", &value);
                }
            }
            Statement::If(s) => {
                let branch = if self.eval(&s.condition, env)?.truthy() {
                    Some(&s.then_body)
                } else {
                    s.else_body.as_ref()
                };
                if let Some(body) = branch {
                    return self.exec_block(body, &Scope::child(env));
                }
            }
            Statement::Return(value) => {
                let value = match value {
                    Some(e) => self.eval(e, env)?,
                    None => Value::Undefined,
                };
                return Ok(Signal::Return(value));
            }
            Statement::Throw(e) => {
                let value = self.eval(e, env)?;
                return Err(Interrupt::Throw(value));
            }
            Statement::Try(t) => match self.exec_block(&t.body, &Scope::child(env)) {
                Err(Interrupt::Throw(thrown)) => {
                    let handler_env = Scope::child(env);
                    if let Some(param) = &t.param {
                        handler_env.declare(param, thrown, true);
                    }
                    return self.exec_block(&t.handler, &handler_env);
                }
                other => return other,
            },
            Statement::Assign(a) => self.exec_assign(a, env)?,
            Statement::Await(_) => {
                return Err(Interrupt::Abort(Abort::Usage(
                    "`await` is only supported at the top level of an entry module".to_string(),
                )));
            }
            Statement::Expr(e) => {
                self.eval(e, env)?;
            }
        }
        Ok(Signal::Normal)
    }

    fn exec_assign(&mut self, a: &AssignStmt, env: &Env) -> Result<(), Interrupt> {
        match &a.target.node {
            Expr::Ident(name) => {
                let value = self.assigned_value(a, env, |rt| rt.lookup_ident(name, env))?;
                env.assign(name, value).map_err(|err| match err {
                    AssignError::Undeclared => self.throw_error("ReferenceError", format!("{} is not defined", name)),
                    AssignError::Constant => self.type_error("Assignment to constant variable."),
                })
            }
            Expr::Member(obj, key) => {
                let target = self.eval(obj, env)?;
                let value = self.assigned_value(a, env, |rt| rt.get_property(&target, key))?;
                self.set_property(&target, key, value)
            }
            Expr::Index(obj, index) => {
                let target = self.eval(obj, env)?;
                let key = self.eval(index, env)?.to_js_string();
                let value = self.assigned_value(a, env, |rt| rt.get_property(&target, &key))?;
                self.set_property(&target, &key, value)
            }
            _ => Err(self.throw_error("SyntaxError", "Invalid assignment target")),
        }
    }

    /// Right-hand side of an assignment, folding in the current value for `+=` / `-=`.
    fn assigned_value(
        &mut self,
        a: &AssignStmt,
        env: &Env,
        current: impl FnOnce(&mut Self) -> Result<Value, Interrupt>,
    ) -> Result<Value, Interrupt> {
        let op = match a.op {
            AssignOp::Assign => return self.eval(&a.value, env),
            AssignOp::Add => BinaryOp::Add,
            AssignOp::Sub => BinaryOp::Sub,
        };
        let lhs = current(self)?;
        let rhs = self.eval(&a.value, env)?;
        Ok(binary(op, &lhs, &rhs))
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    pub(super) fn eval(&mut self, expr: &Spanned<Expr>, env: &Env) -> Result<Value, Interrupt> {
        match &expr.node {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::str(s)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Ident(name) => self.lookup_ident(name, env),
            Expr::Member(obj, key) => {
                let target = self.eval(obj, env)?;
                self.get_property(&target, key)
            }
            Expr::Index(obj, index) => {
                let target = self.eval(obj, env)?;
                let key = self.eval(index, env)?.to_js_string();
                self.get_property(&target, &key)
            }
            Expr::Call(callee, args) => {
                let function = self.eval(callee, env)?;
                let args = self.eval_args(args, env)?;
                if !function.is_function() {
                    return Err(self.type_error(format!("{} is not a function", describe_callee(&callee.node))));
                }
                self.call_function(&function, args)
            }
            Expr::New(callee, args) => {
                let function = self.eval(callee, env)?;
                let args = self.eval_args(args, env)?;
                self.construct(&function, args, &callee.node)
            }
            Expr::Object(fields) => {
                let obj = Value::new_object();
                for (key, value) in fields {
                    let value = self.eval(value, env)?;
                    obj.borrow_mut().set(key, value);
                }
                Ok(Value::Object(obj))
            }
            Expr::Array(items) => Ok(Value::array(self.eval_args(items, env)?)),
            Expr::Function(def) => Ok(Value::Function(Rc::new(Function::Closure {
                def: Rc::clone(def),
                env: Rc::clone(env),
            }))),
            Expr::Unary(op, operand) => {
                if let (UnaryOp::Typeof, Expr::Ident(name)) = (op, &operand.node) {
                    // `typeof undeclared` is not an error.
                    if env.lookup(name).is_none() {
                        return Ok(Value::str("undefined"));
                    }
                }
                let value = self.eval(operand, env)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Typeof => Value::str(value.type_of()),
                })
            }
            Expr::Binary(lhs, BinaryOp::And, rhs) => {
                let left = self.eval(lhs, env)?;
                if left.truthy() { self.eval(rhs, env) } else { Ok(left) }
            }
            Expr::Binary(lhs, BinaryOp::Or, rhs) => {
                let left = self.eval(lhs, env)?;
                if left.truthy() { Ok(left) } else { self.eval(rhs, env) }
            }
            Expr::Binary(lhs, op, rhs) => {
                let left = self.eval(lhs, env)?;
                let right = self.eval(rhs, env)?;
                Ok(binary(*op, &left, &right))
            }
        }
    }

    fn eval_args(&mut self, args: &[Spanned<Expr>], env: &Env) -> Result<Vec<Value>, Interrupt> {
        args.iter().map(|a| self.eval(a, env)).collect()
    }

    pub(super) fn lookup_ident(&mut self, name: &str, env: &Env) -> Result<Value, Interrupt> {
        match env.lookup(name) {
            Some(Lookup::Value(v)) => Ok(v),
            Some(Lookup::Import(import)) => self.read_import(&import),
            None => Err(self.throw_error("ReferenceError", format!("{} is not defined", name))),
        }
    }

    pub(super) fn call_function(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, Interrupt> {
        let Value::Function(function) = callee else {
            return Err(self.type_error(format!("{} is not a function", callee.inspect())));
        };
        self.tick()?;
        if self.depth >= MAX_CALL_DEPTH {
            return Err(self.throw_error("RangeError", "Maximum call stack size exceeded"));
        }
        self.depth += 1;
        let result = match function.as_ref() {
            Function::Native { call, .. } => call(self, args),
            Function::Closure { def, env } => {
                let scope = Scope::child(env);
                for (i, param) in def.params.iter().enumerate() {
                    scope.declare(param, args.get(i).cloned().unwrap_or(Value::Undefined), true);
                }
                match self.exec_block(&def.body, &scope) {
                    Ok(Signal::Return(value)) => Ok(value),
                    Ok(Signal::Normal) => Ok(Value::Undefined),
                    Err(interrupt) => Err(interrupt),
                }
            }
        };
        self.depth -= 1;
        result
    }

    fn construct(&mut self, callee: &Value, args: Vec<Value>, callee_expr: &Expr) -> Result<Value, Interrupt> {
        let Value::Function(function) = callee else {
            return Err(self.type_error(format!("{} is not a constructor", describe_callee(callee_expr))));
        };
        match function.as_ref() {
            Function::Native { constructor: false, .. } => {
                Err(self.type_error(format!("{} is not a constructor", describe_callee(callee_expr))))
            }
            Function::Native { .. } => self.call_function(callee, args),
            Function::Closure { .. } => match self.call_function(callee, args)? {
                value @ (Value::Object(_) | Value::Array(_)) => Ok(value),
                _ => Ok(Value::Object(Value::new_object())),
            },
        }
    }

    // ========================================================================
    // Properties
    // ========================================================================

    pub(super) fn get_property(&mut self, target: &Value, key: &str) -> Result<Value, Interrupt> {
        match target {
            Value::Undefined | Value::Null => Err(self.type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                target.to_js_string(),
                key
            ))),
            Value::Object(o) => Ok(o.borrow().get(key).cloned().unwrap_or(Value::Undefined)),
            Value::Array(items) => Ok(array_property(items, key)),
            Value::Str(s) => Ok(string_property(s, key)),
            Value::Function(f) if key == "name" => Ok(Value::str(f.name())),
            Value::Number(_) | Value::Bool(_) | Value::Function(_) | Value::Promise(_) => Ok(Value::Undefined),
        }
    }

    pub(super) fn set_property(&mut self, target: &Value, key: &str, value: Value) -> Result<(), Interrupt> {
        match target {
            Value::Object(o) => {
                o.borrow_mut().set(key, value);
                Ok(())
            }
            Value::Array(items) => {
                if key == "length" {
                    let len = value.to_number();
                    if !(len >= 0.0 && len.fract() == 0.0 && len <= MAX_ARRAY_LENGTH as f64) {
                        return Err(self.throw_error("RangeError", "Invalid array length"));
                    }
                    let len = len as usize;
                    self.grow_array(items, len)?;
                    items.borrow_mut().truncate(len);
                } else if let Ok(index) = key.parse::<usize>() {
                    // Keys past the last valid index are plain properties, which arrays do not keep.
                    if index < MAX_ARRAY_LENGTH {
                        self.grow_array(items, index + 1)?;
                        items.borrow_mut()[index] = value;
                    }
                }
                Ok(())
            }
            Value::Undefined | Value::Null => Err(self.type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                target.to_js_string(),
                key
            ))),
            // Primitive wrappers drop writes silently.
            _ => Ok(()),
        }
    }

    /// Extend `items` with holes up to `len`, paying one fuel unit per new slot.
    fn grow_array(&mut self, items: &ArrRef, len: usize) -> Result<(), Interrupt> {
        let current = items.borrow().len();
        if len > current {
            self.charge((len - current) as u64)?;
            items.borrow_mut().resize(len, Value::Undefined);
        }
        Ok(())
    }
}

/// Evaluate a non-short-circuit binary operator.
pub(super) fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    let stringy = |v: &Value| matches!(v, Value::Str(_) | Value::Object(_) | Value::Array(_) | Value::Function(_));
    match op {
        BinaryOp::Add if stringy(left) || stringy(right) => {
            Value::str(&format!("{}{}", left.to_js_string(), right.to_js_string()))
        }
        BinaryOp::Add => Value::Number(left.to_number() + right.to_number()),
        BinaryOp::Sub => Value::Number(left.to_number() - right.to_number()),
        BinaryOp::Mul => Value::Number(left.to_number() * right.to_number()),
        BinaryOp::Div => Value::Number(left.to_number() / right.to_number()),
        BinaryOp::Rem => Value::Number(left.to_number() % right.to_number()),
        BinaryOp::Eq => Value::Bool(loose_equals(left, right)),
        BinaryOp::NotEq => Value::Bool(!loose_equals(left, right)),
        BinaryOp::StrictEq => Value::Bool(strict_equals(left, right)),
        BinaryOp::StrictNotEq => Value::Bool(!strict_equals(left, right)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = match (left, right) {
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => left.to_number().partial_cmp(&right.to_number()),
            };
            let Some(ordering) = ordering else {
                return Value::Bool(false);
            };
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::LtEq => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        // Short-circuit operators are handled by the evaluator; this keeps the function total.
        BinaryOp::And => if left.truthy() { right.clone() } else { left.clone() },
        BinaryOp::Or => if left.truthy() { left.clone() } else { right.clone() },
    }
}

fn describe_callee(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::Member(obj, key) => format!("{}.{}", describe_callee(&obj.node), key),
        _ => "expression".to_string(),
    }
}

fn index_arg(args: &[Value], i: usize, len: usize, default: usize) -> usize {
    match args.get(i) {
        None | Some(Value::Undefined) => default,
        Some(v) => {
            let n = v.to_number();
            if n.is_nan() {
                0
            } else if n < 0.0 {
                len.saturating_sub((-n) as usize)
            } else {
                (n as usize).min(len)
            }
        }
    }
}

fn array_property(items: &ArrRef, key: &str) -> Value {
    if key == "length" {
        return Value::Number(items.borrow().len() as f64);
    }
    if let Ok(index) = key.parse::<usize>() {
        return items.borrow().get(index).cloned().unwrap_or(Value::Undefined);
    }
    let items = Rc::clone(items);
    match key {
        "push" => Value::native("push", move |_, args| {
            let mut items = items.borrow_mut();
            items.extend(args);
            Ok(Value::Number(items.len() as f64))
        }),
        "pop" => Value::native("pop", move |_, _| Ok(items.borrow_mut().pop().unwrap_or(Value::Undefined))),
        "includes" => Value::native("includes", move |_, args| {
            let needle = args.first().cloned().unwrap_or(Value::Undefined);
            Ok(Value::Bool(items.borrow().iter().any(|v| same_value(v, &needle))))
        }),
        "indexOf" => Value::native("indexOf", move |_, args| {
            let needle = args.first().cloned().unwrap_or(Value::Undefined);
            let found = items.borrow().iter().position(|v| strict_equals(v, &needle));
            Ok(Value::Number(found.map_or(-1.0, |i| i as f64)))
        }),
        "join" => Value::native("join", move |_, args| {
            let sep = match args.first() {
                None | Some(Value::Undefined) => ",".to_string(),
                Some(v) => v.to_js_string(),
            };
            let parts: Vec<String> = items
                .borrow()
                .iter()
                .map(|v| match v {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_js_string(),
                })
                .collect();
            Ok(Value::str(&parts.join(&sep)))
        }),
        "slice" => Value::native("slice", move |_, args| {
            let items = items.borrow();
            let start = index_arg(&args, 0, items.len(), 0);
            let end = index_arg(&args, 1, items.len(), items.len());
            Ok(Value::array(items.get(start..end.max(start)).unwrap_or_default().to_vec()))
        }),
        "map" | "forEach" | "filter" => {
            let method = key.to_string();
            Value::native(key, move |rt, args| {
                let callback = args.first().cloned().unwrap_or(Value::Undefined);
                // Snapshot so callbacks may mutate the array.
                let snapshot: Vec<Value> = items.borrow().clone();
                let mut out = Vec::new();
                for (i, item) in snapshot.into_iter().enumerate() {
                    let result = rt.call_function(&callback, vec![item.clone(), Value::Number(i as f64)])?;
                    match method.as_str() {
                        "map" => out.push(result),
                        "filter" if result.truthy() => out.push(item),
                        _ => {}
                    }
                }
                Ok(if method == "forEach" { Value::Undefined } else { Value::array(out) })
            })
        }
        _ => Value::Undefined,
    }
}

fn string_property(s: &Rc<str>, key: &str) -> Value {
    if key == "length" {
        return Value::Number(s.encode_utf16().count() as f64);
    }
    if let Ok(index) = key.parse::<usize>() {
        return s
            .chars()
            .nth(index)
            .map(|c| Value::str(&c.to_string()))
            .unwrap_or(Value::Undefined);
    }
    let s = Rc::clone(s);
    let arg = |args: &[Value]| args.first().map(Value::to_js_string).unwrap_or_default();
    match key {
        "includes" => Value::native("includes", move |_, args| Ok(Value::Bool(s.contains(arg(&args).as_str())))),
        "startsWith" => Value::native("startsWith", move |_, args| Ok(Value::Bool(s.starts_with(arg(&args).as_str())))),
        "endsWith" => Value::native("endsWith", move |_, args| Ok(Value::Bool(s.ends_with(arg(&args).as_str())))),
        "indexOf" => Value::native("indexOf", move |_, args| {
            let found = s.find(arg(&args).as_str()).map(|byte| s[..byte].chars().count());
            Ok(Value::Number(found.map_or(-1.0, |i| i as f64)))
        }),
        "toUpperCase" => Value::native("toUpperCase", move |_, _| Ok(Value::str(&s.to_uppercase()))),
        "toLowerCase" => Value::native("toLowerCase", move |_, _| Ok(Value::str(&s.to_lowercase()))),
        "trim" => Value::native("trim", move |_, _| Ok(Value::str(s.trim()))),
        "split" => Value::native("split", move |_, args| {
            let sep = arg(&args);
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::str(&c.to_string())).collect()
            } else {
                s.split(sep.as_str()).map(Value::str).collect()
            };
            Ok(Value::array(parts))
        }),
        "slice" => Value::native("slice", move |_, args| {
            let chars: Vec<char> = s.chars().collect();
            let start = index_arg(&args, 0, chars.len(), 0);
            let end = index_arg(&args, 1, chars.len(), chars.len());
            Ok(Value::str(&chars.get(start..end.max(start)).unwrap_or_default().iter().collect::<String>()))
        }),
        _ => Value::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxOptions;

    fn statements(source: &str) -> Vec<Spanned<Statement>> {
        bundletest_script::parse_source(source)
            .unwrap()
            .items
            .into_iter()
            .filter_map(|item| match item.node {
                Item::Statement(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn exec(source: &str, fuel: u64) -> (Runtime, Env, Result<Signal, Interrupt>) {
        let options = SandboxOptions::default();
        let mut rt = Runtime::new(&options);
        rt.install_globals(&options);
        let env = Scope::child(&rt.globals);
        rt.begin_segment(fuel, Duration::from_secs(5));
        let result = rt.exec_block(&statements(source), &env);
        (rt, env, result)
    }

    fn run(source: &str) -> (Runtime, Env) {
        let (rt, env, result) = exec(source, 100_000);
        match result {
            Ok(_) => (rt, env),
            Err(Interrupt::Throw(v)) => panic!("uncaught: {}", v.describe_thrown()),
            Err(Interrupt::Abort(a)) => panic!("aborted: {:?}", a),
        }
    }

    fn get(rt: &mut Runtime, env: &Env, name: &str) -> Value {
        rt.lookup_ident(name, env).unwrap()
    }

    #[test]
    fn test_arithmetic_and_string_concat() {
        let (mut rt, env) = run("let a = 2 + 2;\nlet b = \"n=\" + a;\nlet c = 7 % 4 * 2;\n");
        assert!(same_value(&get(&mut rt, &env, "a"), &Value::Number(4.0)));
        assert_eq!(get(&mut rt, &env, "b").to_js_string(), "n=4");
        assert!(same_value(&get(&mut rt, &env, "c"), &Value::Number(6.0)));
    }

    #[test]
    fn test_closures_capture_environment() {
        let source = r#"
function counter() {
  let n = 0;
  return () => { n += 1; return n; };
}
const next = counter();
next();
let seen = next();
"#;
        let (mut rt, env) = run(source);
        assert!(same_value(&get(&mut rt, &env, "seen"), &Value::Number(2.0)));
    }

    #[test]
    fn test_try_catch_observes_thrown_errors() {
        let source = r#"
let message = "";
try { null.x; } catch (e) { message = e.message; }
let kind = "";
try { throw new Error("boom"); } catch (e) { kind = e.name + ":" + e.message; }
"#;
        let (mut rt, env) = run(source);
        assert_eq!(
            get(&mut rt, &env, "message").to_js_string(),
            "Cannot read properties of null (reading 'x')"
        );
        assert_eq!(get(&mut rt, &env, "kind").to_js_string(), "Error:boom");
    }

    #[test]
    fn test_array_helpers() {
        let (mut rt, env) = run("let xs = [1, 2, 3];\nxs.push(4);\nlet doubled = xs.map(x => x * 2).join(\"-\");\n");
        assert_eq!(get(&mut rt, &env, "doubled").to_js_string(), "2-4-6-8");
    }

    #[test]
    fn test_array_length_writes() {
        let source = r#"
let xs = [1, 2, 3];
xs.length = 1;
let ys = [];
ys[2] = "c";
let message = "";
try { xs.length = 1e300; } catch (e) { message = e.name + ": " + e.message; }
"#;
        let (mut rt, env) = run(source);
        assert_eq!(get(&mut rt, &env, "xs").to_js_string(), "1");
        assert_eq!(get(&mut rt, &env, "ys").to_js_string(), ",,c");
        assert_eq!(get(&mut rt, &env, "message").to_js_string(), "RangeError: Invalid array length");
    }

    #[test]
    fn test_sparse_array_growth_spends_fuel() {
        let (_, _, result) = exec("let xs = [];\nxs[4000000000] = 1;\n", 10_000);
        assert!(matches!(result, Err(Interrupt::Abort(Abort::OutOfFuel))));
        let (_, _, result) = exec("let xs = [];\nxs[10000000000000000000] = 1;\nxs.length = 4294967296;\n", 10_000);
        match result {
            Err(Interrupt::Throw(v)) => assert_eq!(v.describe_thrown(), "RangeError: Invalid array length"),
            _ => panic!("expected RangeError"),
        }
    }

    #[test]
    fn test_const_assignment_throws() {
        match exec("const a = 1;\na = 2;\n", 1_000).2 {
            Err(Interrupt::Throw(v)) => assert_eq!(v.describe_thrown(), "TypeError: Assignment to constant variable."),
            other => panic!("expected TypeError, got ok={}", other.is_ok()),
        }
    }

    #[test]
    fn test_fuel_exhaustion_aborts() {
        let (_, _, result) = exec("function f() { return f(); }\nf();\n", 50);
        assert!(matches!(result, Err(Interrupt::Abort(Abort::OutOfFuel))));
    }

    #[test]
    fn test_unbounded_recursion_is_a_range_error() {
        match exec("function f() { return f(); }\nf();\n", 1_000_000).2 {
            Err(Interrupt::Throw(v)) => assert!(v.describe_thrown().starts_with("RangeError")),
            _ => panic!("expected RangeError"),
        }
    }

    #[test]
    fn test_comparison_operators() {
        assert!(binary(BinaryOp::Lt, &Value::str("a"), &Value::str("b")).truthy());
        assert!(!binary(BinaryOp::Gt, &Value::Number(f64::NAN), &Value::Number(1.0)).truthy());
        assert!(binary(BinaryOp::GtEq, &Value::Number(2.0), &Value::str("2")).truthy());
    }
}
