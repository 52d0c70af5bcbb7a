//! Runtime values of the sandbox.
//!
//! Values are reference-counted and single-threaded: a sandbox never leaves the thread that drives its case.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use bundletest_script::ast::FunctionDef;

use super::interp::{Interrupt, Runtime};
use super::scope::Env;
use super::UpdatePromise;

pub type ObjRef = Rc<RefCell<Object>>;
pub type ArrRef = Rc<RefCell<Vec<Value>>>;
pub type NativeCall = dyn Fn(&mut Runtime, Vec<Value>) -> Result<Value, Interrupt>;

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Object(ObjRef),
    Array(ArrRef),
    Function(Rc<Function>),
    /// A pending or settled `NEXT_HMR` / `NEXT_REBUILD` request.
    Promise(Rc<RefCell<UpdatePromise>>),
}

pub enum Function {
    Closure { def: Rc<FunctionDef>, env: Env },
    Native {
        name: String,
        call: Box<NativeCall>,
        constructor: bool,
    },
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Closure { def, .. } => def.name.as_deref().unwrap_or(""),
            Function::Native { name, .. } => name,
        }
    }
}

/// Host-side tag for objects that render or compare specially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectClass {
    Plain,
    Error,
    Element,
}

pub struct Object {
    pub class: ObjectClass,
    props: Vec<(String, Value)>,
}

impl Object {
    pub fn new(class: ObjectClass) -> Self {
        Self { class, props: Vec::new() }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        match self.props.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.props.push((key.to_string(), value)),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.props.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.props.iter().map(|(k, _)| k.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn new_object() -> ObjRef {
        Rc::new(RefCell::new(Object::new(ObjectClass::Plain)))
    }

    pub fn object_from<I, K>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let obj = Value::new_object();
        {
            let mut o = obj.borrow_mut();
            for (k, v) in entries {
                o.set(k.as_ref(), v);
            }
        }
        Value::Object(obj)
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn native<F>(name: &str, call: F) -> Value
    where
        F: Fn(&mut Runtime, Vec<Value>) -> Result<Value, Interrupt> + 'static,
    {
        Value::Function(Rc::new(Function::Native {
            name: name.to_string(),
            call: Box::new(call),
            constructor: false,
        }))
    }

    pub fn constructor<F>(name: &str, call: F) -> Value
    where
        F: Fn(&mut Runtime, Vec<Value>) -> Result<Value, Interrupt> + 'static,
    {
        Value::Function(Rc::new(Function::Native {
            name: name.to_string(),
            call: Box::new(call),
            constructor: true,
        }))
    }

    /// An error object shaped like `new <name>(message)`.
    pub fn error(name: &str, message: &str) -> Value {
        let mut obj = Object::new(ObjectClass::Error);
        obj.set("name", Value::str(name));
        obj.set("message", Value::str(message));
        Value::Object(Rc::new(RefCell::new(obj)))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn as_object(&self) -> Option<&ObjRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::Null | Value::Object(_) | Value::Array(_) | Value::Promise(_) => "object",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => {
                let t = s.trim();
                if t.is_empty() { 0.0 } else { t.parse().unwrap_or(f64::NAN) }
            }
            Value::Array(items) => {
                let items = items.borrow();
                match items.len() {
                    0 => 0.0,
                    1 => items[0].to_number(),
                    _ => f64::NAN,
                }
            }
            _ => f64::NAN,
        }
    }

    /// String conversion as the `+` operator and template positions see it.
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => items
                .borrow()
                .iter()
                .map(|v| match v {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_js_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(o) => {
                let o = o.borrow();
                if o.class == ObjectClass::Error {
                    error_summary(&o)
                } else {
                    "[object Object]".to_string()
                }
            }
            Value::Function(f) => format!("function {}() {{ [code] }}", f.name()),
            Value::Promise(_) => "[object Promise]".to_string(),
        }
    }

    /// Human-readable rendering used in assertion messages and console output.
    pub fn inspect(&self) -> String {
        let mut out = String::new();
        inspect_into(self, &mut out, 0);
        out
    }

    /// Message for an uncaught throw: `Name: message` for error objects, the rendered value otherwise.
    pub fn describe_thrown(&self) -> String {
        match self {
            Value::Object(o) if o.borrow().class == ObjectClass::Error => error_summary(&o.borrow()),
            Value::Str(s) => s.to_string(),
            other => other.inspect(),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::str(s),
            serde_json::Value::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::object_from(map.iter().map(|(k, v)| (k, Value::from_json(v)))),
        }
    }

    /// JSON projection; functions and `undefined` properties are dropped like `JSON.stringify` does.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_depth(0)
    }

    fn to_json_depth(&self, depth: usize) -> serde_json::Value {
        if depth > 32 {
            return serde_json::Value::Null;
        }
        match self {
            Value::Null | Value::Undefined | Value::Function(_) | Value::Promise(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Array(items) => {
                serde_json::Value::Array(items.borrow().iter().map(|v| v.to_json_depth(depth + 1)).collect())
            }
            Value::Object(o) => {
                let mut map = serde_json::Map::new();
                for (k, v) in o.borrow().entries() {
                    if matches!(v, Value::Undefined | Value::Function(_)) {
                        continue;
                    }
                    map.insert(k.to_string(), v.to_json_depth(depth + 1));
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inspect())
    }
}

fn error_summary(o: &Object) -> String {
    let name = o.get("name").map(Value::to_js_string).unwrap_or_else(|| "Error".to_string());
    let message = o.get("message").map(Value::to_js_string).unwrap_or_default();
    if message.is_empty() { name } else { format!("{}: {}", name, message) }
}

fn inspect_into(value: &Value, out: &mut String, depth: usize) {
    match value {
        Value::Str(s) => {
            let _ = write!(out, "{:?}", s.as_ref());
        }
        Value::Array(items) => {
            if depth > 4 {
                out.push_str("[Array]");
                return;
            }
            out.push('[');
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                inspect_into(item, out, depth + 1);
            }
            out.push(']');
        }
        Value::Object(o) => {
            let o = o.borrow();
            if o.class == ObjectClass::Error {
                let _ = write!(out, "[{}]", error_summary(&o));
                return;
            }
            if depth > 4 {
                out.push_str("[Object]");
                return;
            }
            if o.props.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{ ");
            for (i, (k, v)) in o.entries().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: ", k);
                inspect_into(v, out, depth + 1);
            }
            out.push_str(" }");
        }
        Value::Function(f) => {
            if f.name().is_empty() {
                out.push_str("[Function (anonymous)]");
            } else {
                let _ = write!(out, "[Function: {}]", f.name());
            }
        }
        Value::Promise(p) => {
            let state = if p.borrow().is_settled() { "settled" } else { "pending" };
            let _ = write!(out, "Promise {{ <{}> }}", state);
        }
        other => out.push_str(&other.to_js_string()),
    }
}

/// Format a number the way JavaScript prints it for the common cases fixtures hit.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

/// `===`
pub fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
        (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Promise(x), Value::Promise(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// `==`
pub fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
        (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
        (Value::Number(_), Value::Str(_) | Value::Bool(_))
        | (Value::Str(_) | Value::Bool(_), Value::Number(_))
        | (Value::Bool(_), Value::Str(_))
        | (Value::Str(_), Value::Bool(_)) => a.to_number() == b.to_number(),
        _ => strict_equals(a, b),
    }
}

/// `Object.is`, used by `toBe`.
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => strict_equals(a, b),
    }
}

/// Recursive structural equality, used by `toEqual`. Properties holding `undefined` are ignored.
pub fn deep_equals(a: &Value, b: &Value) -> bool {
    deep_equals_depth(a, b, 0)
}

fn deep_equals_depth(a: &Value, b: &Value, depth: usize) -> bool {
    if depth > 64 {
        return false;
    }
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| deep_equals_depth(l, r, depth + 1))
        }
        (Value::Object(x), Value::Object(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            if x.class != y.class {
                return false;
            }
            let defined = |o: &Object| -> Vec<String> {
                let mut keys: Vec<String> = o
                    .entries()
                    .filter(|(_, v)| !matches!(v, Value::Undefined))
                    .map(|(k, _)| k.to_string())
                    .collect();
                keys.sort();
                keys
            };
            let keys = defined(&x);
            keys == defined(&y)
                && keys.iter().all(|k| match (x.get(k), y.get(k)) {
                    (Some(l), Some(r)) => deep_equals_depth(l, r, depth + 1),
                    _ => false,
                })
        }
        _ => same_value(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(1e21), "1000000000000000000000");
    }

    #[test]
    fn test_loose_and_strict_equality() {
        assert!(loose_equals(&Value::Null, &Value::Undefined));
        assert!(!strict_equals(&Value::Null, &Value::Undefined));
        assert!(loose_equals(&Value::Number(1.0), &Value::str("1")));
        assert!(!strict_equals(&Value::Number(1.0), &Value::str("1")));
        assert!(same_value(&Value::Number(f64::NAN), &Value::Number(f64::NAN)));
    }

    #[test]
    fn test_deep_equality_ignores_order_and_undefined() {
        let a = Value::object_from([("x", Value::Number(1.0)), ("y", Value::array(vec![Value::Bool(true)]))]);
        let b = Value::object_from([
            ("y", Value::array(vec![Value::Bool(true)])),
            ("z", Value::Undefined),
            ("x", Value::Number(1.0)),
        ]);
        assert!(deep_equals(&a, &b));
        assert!(!strict_equals(&a, &b));
    }

    #[test]
    fn test_inspect_renders_nested_values() {
        let v = Value::object_from([
            ("a", Value::str("x")),
            ("b", Value::array(vec![Value::Number(1.0), Value::Null])),
        ]);
        assert_eq!(v.inspect(), "{ a: \"x\", b: [1, null] }");
        assert_eq!(Value::error("TypeError", "nope").inspect(), "[TypeError: nope]");
    }

    #[test]
    fn test_json_projection_drops_functions() {
        let v = Value::object_from([
            ("n", Value::Number(2.0)),
            ("f", Value::native("f", |_, _| Ok(Value::Undefined))),
        ]);
        assert_eq!(v.to_json(), serde_json::json!({ "n": 2.0 }));
        let back = Value::from_json(&serde_json::json!({ "n": 2, "list": [1, "a"] }));
        assert!(deep_equals(
            &back,
            &Value::object_from([
                ("n", Value::Number(2.0)),
                ("list", Value::array(vec![Value::Number(1.0), Value::str("a")]))
            ])
        ));
    }
}
