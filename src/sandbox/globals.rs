//! Host globals injected into every sandbox.
//!
//! Which names exist is decided by the host-global registry in `bundletest_core`; this file supplies their
//! runtime values. Built-in constructors (`Error`, `TypeError`, ...) and the `Object`/`JSON` helpers are always
//! present because emitted code relies on them.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bundletest_core::lang::globals::{self as host_globals, HostGlobalId};

use super::interp::{Abort, Interrupt, Runtime};
use super::value::{deep_equals, same_value, strict_equals, Object, ObjectClass, ObjRef, Value};
use super::{ConsoleLine, DocumentType, RunMode, SandboxOptions, UpdateKind, UpdatePromise};

const ERROR_CONSTRUCTORS: &[&str] = &["Error", "TypeError", "RangeError", "ReferenceError", "SyntaxError"];

impl Runtime {
    pub(super) fn install_globals(&mut self, options: &SandboxOptions) {
        let globals = Rc::clone(&self.globals);
        for info in host_globals::HOST_GLOBALS {
            let value = match info.id {
                HostGlobalId::Document if options.document != DocumentType::Html => continue,
                HostGlobalId::Document => document(),
                HostGlobalId::Expect => Value::native("expect", |_, args| {
                    let actual = args.into_iter().next().unwrap_or(Value::Undefined);
                    Ok(matchers(actual, false))
                }),
                HostGlobalId::SetTimeout => Value::native("setTimeout", |rt, args| {
                    let mut args = args.into_iter();
                    let callback = args.next().unwrap_or(Value::Undefined);
                    if !callback.is_function() {
                        return Err(rt.type_error("setTimeout callback must be a function"));
                    }
                    let delay = args.next().map(|d| d.to_number()).unwrap_or(0.0);
                    let id = rt.timers.schedule(callback, delay, args.collect());
                    Ok(Value::Number(id as f64))
                }),
                HostGlobalId::Console => console(),
                HostGlobalId::Require => Value::native("require", |rt, args| match args.first() {
                    Some(Value::Str(id)) => rt.require_module(None, id),
                    _ => Err(rt.type_error("require() expects a module id string")),
                }),
                HostGlobalId::State => Value::Object(Value::new_object()),
                HostGlobalId::NextHmr => Value::native("NEXT_HMR", |rt, args| {
                    let expect_error = args
                        .first()
                        .and_then(Value::as_object)
                        .and_then(|o| o.borrow().get("expectError").map(Value::truthy))
                        .unwrap_or(false);
                    rt.request_update(UpdateKind::Hmr, expect_error)
                }),
                HostGlobalId::NextRebuild => {
                    Value::native("NEXT_REBUILD", |rt, _| rt.request_update(UpdateKind::Rebuild, false))
                }
                HostGlobalId::WatchStep => Value::Number(0.0),
            };
            globals.declare(info.name, value, info.id == HostGlobalId::WatchStep);
        }

        globals.declare("clearTimeout", clear_timeout(), false);
        for name in ERROR_CONSTRUCTORS {
            globals.declare(name, error_constructor(name), false);
        }
        globals.declare("Object", object_helpers(), false);
        globals.declare("JSON", json_helpers(), false);
        for (name, value) in &options.globals {
            globals.declare(name, Value::from_json(value), true);
        }
    }

    /// Create the single outstanding update promise for this sandbox.
    pub(super) fn request_update(&mut self, kind: UpdateKind, expect_error: bool) -> Result<Value, Interrupt> {
        let (required, name) = match kind {
            UpdateKind::Hmr => (RunMode::Hot, "NEXT_HMR"),
            UpdateKind::Rebuild => (RunMode::Watch, "NEXT_REBUILD"),
        };
        if self.mode != required {
            return Err(Interrupt::Abort(Abort::Usage(format!(
                "{}() is not available in {:?} cases",
                name, self.mode
            ))));
        }
        if self.pending_update.as_ref().is_some_and(|p| !p.borrow().is_settled()) {
            return Err(Interrupt::Abort(Abort::Usage(format!(
                "{}() called while another update is still outstanding",
                name
            ))));
        }
        let promise = Rc::new(RefCell::new(UpdatePromise::new(kind, expect_error)));
        self.pending_update = Some(Rc::clone(&promise));
        Ok(Value::Promise(promise))
    }

    fn log_console(&mut self, level: &'static str, args: &[Value]) {
        let message = args
            .iter()
            .map(|v| match v {
                Value::Str(s) => s.to_string(),
                other => other.inspect(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            "warn" | "error" => tracing::warn!(target: "bundletest::console", method = level, "{}", message),
            _ => tracing::debug!(target: "bundletest::console", method = level, "{}", message),
        }
        self.console.push(ConsoleLine { level, message });
    }
}

// ============================================================================
// expect()
// ============================================================================

fn matchers(actual: Value, negated: bool) -> Value {
    let mut entries: Vec<(&str, Value)> = vec![
        ("toBe", comparing("toBe", &actual, negated, same_value)),
        ("toEqual", comparing("toEqual", &actual, negated, deep_equals)),
        ("toContain", comparing("toContain", &actual, negated, contains)),
        ("toBeTruthy", predicate("toBeTruthy", &actual, negated, Value::truthy)),
        ("toBeFalsy", predicate("toBeFalsy", &actual, negated, |v| !v.truthy())),
        (
            "toBeUndefined",
            predicate("toBeUndefined", &actual, negated, |v| matches!(v, Value::Undefined)),
        ),
        ("toThrow", to_throw(&actual, negated)),
    ];
    if !negated {
        entries.push(("not", matchers(actual, true)));
    }
    Value::object_from(entries)
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.borrow().iter().any(|v| same_value(v, needle)),
        Value::Str(s) => s.contains(needle.to_js_string().as_str()),
        _ => false,
    }
}

fn matcher_name(matcher: &str, negated: bool) -> String {
    if negated { format!("not.{}", matcher) } else { matcher.to_string() }
}

/// Count a passing assertion or abort with a failure report.
fn settle(rt: &mut Runtime, passed: bool, negated: bool, message: impl FnOnce() -> String) -> Result<Value, Interrupt> {
    if passed == negated {
        return Err(Interrupt::Abort(Abort::Assertion(message())));
    }
    rt.assertions += 1;
    Ok(Value::Undefined)
}

fn comparing(name: &'static str, actual: &Value, negated: bool, test: fn(&Value, &Value) -> bool) -> Value {
    let actual = actual.clone();
    Value::native(name, move |rt, args| {
        let expected = args.into_iter().next().unwrap_or(Value::Undefined);
        let passed = test(&actual, &expected);
        settle(rt, passed, negated, || {
            format!(
                "expect(received).{}(expected)\n\nExpected: {}{}\nReceived: {}",
                matcher_name(name, negated),
                if negated { "not " } else { "" },
                expected.inspect(),
                actual.inspect()
            )
        })
    })
}

fn predicate(name: &'static str, actual: &Value, negated: bool, test: fn(&Value) -> bool) -> Value {
    let actual = actual.clone();
    Value::native(name, move |rt, _| {
        let passed = test(&actual);
        settle(rt, passed, negated, || {
            format!(
                "expect(received).{}()\n\nReceived: {}",
                matcher_name(name, negated),
                actual.inspect()
            )
        })
    })
}

fn to_throw(actual: &Value, negated: bool) -> Value {
    let actual = actual.clone();
    Value::native("toThrow", move |rt, args| {
        if !actual.is_function() {
            return Err(rt.type_error("expect(received).toThrow() requires a function"));
        }
        let wanted = args.first().map(Value::to_js_string);
        let thrown = match rt.call_function(&actual, Vec::new()) {
            Ok(_) => None,
            Err(Interrupt::Throw(e)) => Some(e.describe_thrown()),
            Err(abort) => return Err(abort),
        };
        let passed = match (&thrown, &wanted) {
            (Some(message), Some(wanted)) => message.contains(wanted.as_str()),
            (Some(_), None) => true,
            (None, _) => false,
        };
        settle(rt, passed, negated, || {
            format!(
                "expect(received).{}({})\n\nThrown: {}",
                matcher_name("toThrow", negated),
                wanted.clone().unwrap_or_default(),
                thrown.clone().unwrap_or_else(|| "nothing".to_string())
            )
        })
    })
}

// ============================================================================
// console, timers, built-ins
// ============================================================================

fn console() -> Value {
    let method = |level: &'static str| {
        Value::native(level, move |rt, args| {
            rt.log_console(level, &args);
            Ok(Value::Undefined)
        })
    };
    Value::object_from([
        ("log", method("log")),
        ("info", method("info")),
        ("warn", method("warn")),
        ("error", method("error")),
    ])
}

fn clear_timeout() -> Value {
    Value::native("clearTimeout", |rt, args| {
        if let Some(Value::Number(id)) = args.first() {
            rt.timers.cancel(*id as u64);
        }
        Ok(Value::Undefined)
    })
}

fn error_constructor(name: &'static str) -> Value {
    Value::constructor(name, move |_, args| {
        let message = match args.first() {
            None | Some(Value::Undefined) => String::new(),
            Some(v) => v.to_js_string(),
        };
        Ok(Value::error(name, &message))
    })
}

fn object_helpers() -> Value {
    Value::object_from([(
        "keys",
        Value::native("keys", |_, args| {
            let keys = match args.first() {
                Some(Value::Object(o)) => o.borrow().keys().map(Value::str).collect(),
                Some(Value::Array(items)) => (0..items.borrow().len()).map(|i| Value::str(&i.to_string())).collect(),
                _ => Vec::new(),
            };
            Ok(Value::array(keys))
        }),
    )])
}

fn json_helpers() -> Value {
    Value::object_from([
        (
            "stringify",
            Value::native("stringify", |_, args| match args.first() {
                None | Some(Value::Undefined) | Some(Value::Function(_)) => Ok(Value::Undefined),
                Some(v) => Ok(Value::str(&v.to_json().to_string())),
            }),
        ),
        (
            "parse",
            Value::native("parse", |rt, args| {
                let text = args.first().map(Value::to_js_string).unwrap_or_default();
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(json) => Ok(Value::from_json(&json)),
                    Err(err) => Err(rt.throw_error("SyntaxError", format!("Unexpected token in JSON: {}", err))),
                }
            }),
        ),
    ])
}

// ============================================================================
// document
// ============================================================================

fn document() -> Value {
    let head = element("head");
    let body = element("body");
    let doc = Value::object_from([
        ("title", Value::str("")),
        ("head", head),
        ("body", body),
        (
            "createElement",
            Value::native("createElement", |_, args| {
                let tag = args.first().map(Value::to_js_string).unwrap_or_default();
                Ok(element(&tag))
            }),
        ),
    ]);
    if let Value::Object(obj) = &doc {
        let weak = Rc::downgrade(obj);
        obj.borrow_mut().set(
            "getElementsByTagName",
            Value::native("getElementsByTagName", move |_, args| {
                let tag = args.first().map(Value::to_js_string).unwrap_or_default().to_uppercase();
                let mut found = Vec::new();
                if let Some(doc) = weak.upgrade() {
                    for part in ["head", "body"] {
                        if let Some(root) = doc.borrow().get(part) {
                            collect_by_tag(root, &tag, &mut found);
                        }
                    }
                }
                Ok(Value::array(found))
            }),
        );
    }
    doc
}

fn element(tag: &str) -> Value {
    let obj: ObjRef = Rc::new(RefCell::new(Object::new(ObjectClass::Element)));
    let weak = Rc::downgrade(&obj);
    {
        let mut o = obj.borrow_mut();
        o.set("tagName", Value::str(&tag.to_uppercase()));
        o.set("children", Value::array(Vec::new()));
        o.set("attributes", Value::Object(Value::new_object()));
        o.set("textContent", Value::str(""));
        o.set("appendChild", append_child(weak.clone()));
        o.set("setAttribute", set_attribute(weak.clone()));
        o.set("getAttribute", get_attribute(weak));
    }
    Value::Object(obj)
}

fn append_child(this: Weak<RefCell<Object>>) -> Value {
    Value::native("appendChild", move |rt, args| {
        let child = args.into_iter().next().unwrap_or(Value::Undefined);
        if !matches!(&child, Value::Object(o) if o.borrow().class == ObjectClass::Element) {
            return Err(rt.type_error("appendChild expects an element"));
        }
        if let Some(Value::Array(children)) = this.upgrade().and_then(|o| o.borrow().get("children").cloned()) {
            if !children.borrow().iter().any(|c| strict_equals(c, &child)) {
                children.borrow_mut().push(child.clone());
            }
        }
        Ok(child)
    })
}

fn set_attribute(this: Weak<RefCell<Object>>) -> Value {
    Value::native("setAttribute", move |_, args| {
        let name = args.first().map(Value::to_js_string).unwrap_or_default();
        let value = args.get(1).map(Value::to_js_string).unwrap_or_default();
        if let Some(Value::Object(attrs)) = this.upgrade().and_then(|o| o.borrow().get("attributes").cloned()) {
            attrs.borrow_mut().set(&name, Value::str(&value));
        }
        Ok(Value::Undefined)
    })
}

fn get_attribute(this: Weak<RefCell<Object>>) -> Value {
    Value::native("getAttribute", move |_, args| {
        let name = args.first().map(Value::to_js_string).unwrap_or_default();
        let attrs = this.upgrade().and_then(|o| o.borrow().get("attributes").cloned());
        Ok(match attrs {
            Some(Value::Object(attrs)) => attrs.borrow().get(&name).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        })
    })
}

fn collect_by_tag(node: &Value, tag: &str, out: &mut Vec<Value>) {
    let Value::Object(obj) = node else {
        return;
    };
    let children = {
        let o = obj.borrow();
        if o.get("tagName").is_some_and(|t| t.to_js_string() == tag) {
            out.push(node.clone());
        }
        o.get("children").cloned()
    };
    if let Some(Value::Array(children)) = children {
        for child in children.borrow().iter() {
            collect_by_tag(child, tag, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn runtime(options: SandboxOptions) -> Runtime {
        let mut rt = Runtime::new(&options);
        rt.install_globals(&options);
        rt.begin_segment(100_000, Duration::from_secs(5));
        rt
    }

    fn eval(rt: &mut Runtime, source: &str) -> Result<(), Interrupt> {
        let program = bundletest_script::parse_source(source).unwrap();
        let stmts: Vec<_> = program
            .items
            .into_iter()
            .filter_map(|i| match i.node {
                bundletest_script::ast::Item::Statement(s) => Some(s),
                _ => None,
            })
            .collect();
        let env = super::super::scope::Scope::child(&rt.globals);
        rt.exec_block(&stmts, &env).map(|_| ())
    }

    #[test]
    fn test_passing_matchers_are_counted() {
        let mut rt = runtime(SandboxOptions::default());
        eval(
            &mut rt,
            "expect(2 + 2).toBe(4);\nexpect({ a: [1] }).toEqual({ a: [1] });\nexpect([1, 2]).toContain(2);\nexpect(1).not.toBe(2);\nexpect(() => { throw new Error(\"bad\"); }).toThrow(\"bad\");\n",
        )
        .unwrap();
        assert_eq!(rt.assertions, 5);
    }

    #[test]
    fn test_failing_matcher_reports_both_sides() {
        let mut rt = runtime(SandboxOptions::default());
        match eval(&mut rt, "expect(1).toBe(2);\n") {
            Err(Interrupt::Abort(Abort::Assertion(message))) => {
                assert_eq!(message, "expect(received).toBe(expected)\n\nExpected: 2\nReceived: 1");
            }
            _ => panic!("expected an assertion failure"),
        }
    }

    #[test]
    fn test_update_requests_depend_on_mode() {
        let mut rt = runtime(SandboxOptions::default());
        assert!(matches!(
            eval(&mut rt, "NEXT_HMR();\n"),
            Err(Interrupt::Abort(Abort::Usage(_)))
        ));

        let mut rt = runtime(SandboxOptions {
            mode: RunMode::Hot,
            ..SandboxOptions::default()
        });
        eval(&mut rt, "let p = NEXT_HMR({ expectError: true });\n").unwrap();
        assert!(rt.pending_update.as_ref().is_some_and(|p| p.borrow().expect_error));
        assert!(matches!(
            eval(&mut rt, "NEXT_HMR();\n"),
            Err(Interrupt::Abort(Abort::Usage(_)))
        ));
    }

    #[test]
    fn test_document_only_for_html() {
        let mut rt = runtime(SandboxOptions::default());
        assert!(eval(&mut rt, "expect(typeof document).toBe(\"undefined\");\n").is_ok());

        let mut rt = runtime(SandboxOptions {
            document: DocumentType::Html,
            ..SandboxOptions::default()
        });
        let source = r#"
const link = document.createElement("link");
link.setAttribute("href", "main.css");
document.head.appendChild(link);
const found = document.getElementsByTagName("link");
expect(found.length).toBe(1);
expect(found[0].getAttribute("href")).toBe("main.css");
"#;
        eval(&mut rt, source).unwrap();
    }

    #[test]
    fn test_custom_globals_and_console() {
        let mut options = SandboxOptions::default();
        options
            .globals
            .insert("FEATURE".to_string(), serde_json::json!({ "enabled": true }));
        let mut rt = runtime(options);
        eval(&mut rt, "expect(FEATURE.enabled).toBe(true);\nconsole.warn(\"careful\", 1);\n").unwrap();
        assert_eq!(rt.console.len(), 1);
        assert_eq!(rt.console[0].message, "careful 1");
    }
}
