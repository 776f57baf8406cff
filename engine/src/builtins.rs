// builtins.rs — Standard library reachable from formulas
//
// Globals (`Math`, `Object`, `Array`, `JSON`, `Promise`, ...), member access
// with the array, string and number methods, and the call/construct helpers
// that word their errors in terms of the formula's source text.
//
// Preconditions: none.
// Postconditions: methods never mutate their receiver; every array or object
//   they return is new.
// Failure modes: type errors are returned as `Throw` values.
// Side effects: `Promise` executors and callbacks run synchronously.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::analyze::Form;
use crate::flow::{self, Pending};
use crate::value::{arg, format_number, BoundFn, ErrorKind, Function, NativeFn, Object, Outcome, Throw, Value};

type Method = fn(&Value, &[Value]) -> Outcome;

/// Longest array or string a single builtin call may allocate.
const MAX_LENGTH: usize = 1 << 24;

fn within_limit(len: f64, message: &str) -> Result<usize, Throw> {
    if len > MAX_LENGTH as f64 {
        return Err(Throw::error(ErrorKind::Range, message));
    }
    Ok(len as usize)
}

const GLOBAL_NAMES: &[&str] = &[
    "Math", "Object", "Array", "String", "Number", "Boolean", "JSON", "Promise", "Error", "isNaN",
    "isFinite", "parseInt", "parseFloat", "undefined", "NaN", "Infinity",
];

pub fn is_global(name: &str) -> bool {
    GLOBAL_NAMES.contains(&name)
}

struct Library {
    globals: HashMap<&'static str, Value>,
    statics: HashMap<&'static str, Rc<Object>>,
}

thread_local! {
    static LIBRARY: RefCell<Option<Rc<Library>>> = const { RefCell::new(None) };
}

fn library() -> Rc<Library> {
    LIBRARY.with(|cell| cell.borrow_mut().get_or_insert_with(|| Rc::new(Library::new())).clone())
}

/// The value of a standard global; `undefined` for unknown names.
pub fn global(name: &str) -> Value {
    library().globals.get(name).cloned().unwrap_or_default()
}

/// Static members of a global constructor (`Array.isArray`, ...).
fn static_member(function: &Function, key: &str) -> Option<Value> {
    let Function::Native(_) = function else {
        return None;
    };
    library()
        .statics
        .get(function.name())
        .and_then(|members| members.get(key).cloned())
}

fn native(name: &str, f: impl Fn(&[Value]) -> Outcome + 'static) -> Value {
    Value::native(name, f)
}

fn constructor(name: &str, f: impl Fn(&[Value]) -> Outcome + 'static) -> Value {
    Value::Function(Function::Native(Rc::new(NativeFn::constructor(name, move |_, args| f(args)))))
}

fn math(f: fn(f64) -> f64) -> impl Fn(&[Value]) -> Outcome {
    move |args| Ok(Value::Number(f(arg(args, 0).to_number())))
}

fn members(entries: Vec<(&str, Value)>) -> Rc<Object> {
    Rc::new(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

impl Library {
    fn new() -> Self {
        let mut globals = HashMap::new();
        let mut statics = HashMap::new();

        globals.insert(
            "Math",
            Value::Object(members(vec![
                ("PI", Value::Number(std::f64::consts::PI)),
                ("E", Value::Number(std::f64::consts::E)),
                ("LN2", Value::Number(std::f64::consts::LN_2)),
                ("LN10", Value::Number(std::f64::consts::LN_10)),
                ("SQRT2", Value::Number(std::f64::consts::SQRT_2)),
                ("abs", native("abs", math(f64::abs))),
                ("floor", native("floor", math(f64::floor))),
                ("ceil", native("ceil", math(f64::ceil))),
                ("round", native("round", math(|x| (x + 0.5).floor()))),
                ("trunc", native("trunc", math(f64::trunc))),
                ("sign", native("sign", math(|x| if x == 0.0 || x.is_nan() { x } else { x.signum() }))),
                ("sqrt", native("sqrt", math(f64::sqrt))),
                ("cbrt", native("cbrt", math(f64::cbrt))),
                ("exp", native("exp", math(f64::exp))),
                ("log", native("log", math(f64::ln))),
                ("log2", native("log2", math(f64::log2))),
                ("log10", native("log10", math(f64::log10))),
                ("sin", native("sin", math(f64::sin))),
                ("cos", native("cos", math(f64::cos))),
                ("tan", native("tan", math(f64::tan))),
                ("asin", native("asin", math(f64::asin))),
                ("acos", native("acos", math(f64::acos))),
                ("atan", native("atan", math(f64::atan))),
                ("atan2", native("atan2", |args| {
                    Ok(Value::Number(arg(args, 0).to_number().atan2(arg(args, 1).to_number())))
                })),
                ("pow", native("pow", |args| {
                    Ok(Value::Number(arg(args, 0).to_number().powf(arg(args, 1).to_number())))
                })),
                ("min", native("min", |args| {
                    Ok(Value::Number(args.iter().map(Value::to_number).fold(f64::INFINITY, js_min)))
                })),
                ("max", native("max", |args| {
                    Ok(Value::Number(args.iter().map(Value::to_number).fold(f64::NEG_INFINITY, js_max)))
                })),
                ("hypot", native("hypot", |args| {
                    Ok(Value::Number(args.iter().map(|v| v.to_number().powi(2)).sum::<f64>().sqrt()))
                })),
            ])),
        );

        globals.insert(
            "Object",
            native("Object", |args| {
                let value = arg(args, 0);
                Ok(if value.is_nullish() { Value::object(Vec::<(String, Value)>::new()) } else { value })
            }),
        );
        statics.insert(
            "Object",
            members(vec![
                ("keys", native("keys", |args| {
                    Ok(Value::array(entries_of(&arg(args, 0)).into_iter().map(|(k, _)| Value::from(k))))
                })),
                ("values", native("values", |args| {
                    Ok(Value::array(entries_of(&arg(args, 0)).into_iter().map(|(_, v)| v)))
                })),
                ("entries", native("entries", |args| {
                    Ok(Value::array(
                        entries_of(&arg(args, 0))
                            .into_iter()
                            .map(|(k, v)| Value::array(vec![Value::from(k), v])),
                    ))
                })),
                ("assign", native("assign", |args| {
                    let mut merged = Object::new();
                    for source in args {
                        spread_into(&mut merged, source);
                    }
                    Ok(Value::Object(Rc::new(merged)))
                })),
                ("fromEntries", native("fromEntries", |args| {
                    let mut entries = Object::new();
                    for pair in iterate(&arg(args, 0))? {
                        let pair = iterate(&pair)?;
                        entries.insert(property_key(&arg(&pair, 0)), arg(&pair, 1));
                    }
                    Ok(Value::Object(Rc::new(entries)))
                })),
            ]),
        );

        globals.insert(
            "Array",
            constructor("Array", |args| match args {
                [Value::Number(n)] => {
                    if n.fract() != 0.0 || *n < 0.0 || *n > u32::MAX as f64 {
                        return Err(Throw::error(ErrorKind::Range, "Invalid array length"));
                    }
                    let len = within_limit(*n, "Array length exceeds the supported maximum")?;
                    Ok(Value::array(std::iter::repeat(Value::Undefined).take(len)))
                }
                _ => Ok(Value::array(args.iter().cloned())),
            }),
        );
        statics.insert(
            "Array",
            members(vec![
                ("isArray", native("isArray", |args| Ok(Value::Bool(matches!(arg(args, 0), Value::Array(_)))))),
                ("of", native("of", |args| Ok(Value::array(args.iter().cloned())))),
                ("from", native("from", |args| {
                    let source = arg(args, 0);
                    let items = match &source {
                        Value::Object(entries) => {
                            let len = entries.get("length").map_or(0.0, Value::to_number);
                            let len = if len.is_nan() { 0.0 } else { len.max(0.0).trunc() };
                            vec![Value::Undefined; within_limit(len, "Array length exceeds the supported maximum")?]
                        }
                        _ => iterate(&source)?,
                    };
                    match args.get(1) {
                        Some(Value::Function(f)) => items
                            .iter()
                            .enumerate()
                            .map(|(i, v)| f.call(&Value::Undefined, &[v.clone(), Value::from(i as f64)]))
                            .collect::<Result<Vec<_>, _>>()
                            .map(Value::from),
                        _ => Ok(Value::from(items)),
                    }
                })),
            ]),
        );

        globals.insert("String", native("String", |args| Ok(Value::from(arg(args, 0).to_display()))));
        statics.insert(
            "String",
            members(vec![("fromCharCode", native("fromCharCode", |args| {
                Ok(Value::from(
                    args.iter()
                        .filter_map(|v| char::from_u32(v.to_number() as u32))
                        .collect::<String>(),
                ))
            }))]),
        );

        globals.insert("Number", native("Number", |args| Ok(Value::Number(arg(args, 0).to_number()))));
        statics.insert(
            "Number",
            members(vec![
                ("isInteger", native("isInteger", |args| {
                    Ok(Value::Bool(arg(args, 0).as_number().is_some_and(|n| n.is_finite() && n.fract() == 0.0)))
                })),
                ("isFinite", native("isFinite", |args| {
                    Ok(Value::Bool(arg(args, 0).as_number().is_some_and(f64::is_finite)))
                })),
                ("isNaN", native("isNaN", |args| Ok(Value::Bool(arg(args, 0).as_number().is_some_and(f64::is_nan))))),
                ("parseFloat", native("parseFloat", |args| Ok(parse_float(&arg(args, 0).to_display())))),
                ("EPSILON", Value::Number(f64::EPSILON)),
                ("MAX_SAFE_INTEGER", Value::Number(9_007_199_254_740_991.0)),
                ("MIN_SAFE_INTEGER", Value::Number(-9_007_199_254_740_991.0)),
            ]),
        );

        globals.insert("Boolean", native("Boolean", |args| Ok(Value::Bool(arg(args, 0).truthy()))));

        globals.insert(
            "Error",
            constructor("Error", |args| {
                Ok(Value::error(ErrorKind::Evaluation, arg(args, 0).to_display()))
            }),
        );

        globals.insert(
            "JSON",
            Value::Object(members(vec![
                ("stringify", native("stringify", |args| {
                    let value = arg(args, 0);
                    if matches!(value, Value::Undefined | Value::Function(_)) {
                        return Ok(Value::Undefined);
                    }
                    Ok(Value::from(value.to_json().to_string()))
                })),
                ("parse", native("parse", |args| {
                    serde_json::from_str::<serde_json::Value>(&arg(args, 0).to_display())
                        .map(|json| Value::from_json(&json))
                        .map_err(|e| Throw::error(ErrorKind::Evaluation, format!("JSON.parse: {e}")))
                })),
            ])),
        );

        globals.insert(
            "Promise",
            constructor("Promise", |args| {
                let pending = Pending::new();
                let Value::Function(executor) = arg(args, 0) else {
                    return Err(Throw::type_error(format!(
                        "Promise resolver {} is not a function",
                        arg(args, 0)
                    )));
                };
                let (on_resolve, on_reject) = (pending.clone(), pending.clone());
                let resolve = native("resolve", move |args| {
                    on_resolve.resolve(arg(args, 0));
                    Ok(Value::Undefined)
                });
                let reject = native("reject", move |args| {
                    on_reject.reject(arg(args, 0));
                    Ok(Value::Undefined)
                });
                if let Err(Throw::Error(error)) = executor.call(&Value::Undefined, &[resolve, reject]) {
                    pending.reject(error);
                }
                Ok(Value::Pending(pending))
            }),
        );
        statics.insert(
            "Promise",
            members(vec![
                ("resolve", native("resolve", |args| match arg(args, 0) {
                    value if value.is_async() => Ok(value),
                    value => Ok(Value::Pending(Pending::resolved(value))),
                })),
                ("reject", native("reject", |args| Ok(Value::Pending(Pending::rejected(arg(args, 0)))))),
                ("all", native("all", |args| {
                    let items = iterate(&arg(args, 0))?;
                    if items.iter().any(Value::is_async) {
                        return Ok(flow::compose(items, Rc::new(|values: &[Value]| Ok(Value::array(values.iter().cloned())))));
                    }
                    Ok(Value::Pending(Pending::resolved(Value::from(items))))
                })),
            ]),
        );

        globals.insert("isNaN", native("isNaN", |args| Ok(Value::Bool(arg(args, 0).to_number().is_nan()))));
        globals.insert("isFinite", native("isFinite", |args| Ok(Value::Bool(arg(args, 0).to_number().is_finite()))));
        globals.insert("parseFloat", native("parseFloat", |args| Ok(parse_float(&arg(args, 0).to_display()))));
        globals.insert(
            "parseInt",
            native("parseInt", |args| {
                let radix = match arg(args, 1) {
                    Value::Undefined => 10,
                    r => r.to_number() as u32,
                };
                Ok(parse_int(&arg(args, 0).to_display(), radix))
            }),
        );
        globals.insert("undefined", Value::Undefined);
        globals.insert("NaN", Value::Number(f64::NAN));
        globals.insert("Infinity", Value::Number(f64::INFINITY));

        Library { globals, statics }
    }
}

fn js_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }
}

fn js_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }
}

/// Longest numeric prefix, as `parseFloat` reads it.
fn parse_float(text: &str) -> Value {
    let text = text.trim_start();
    let unsigned = text.trim_start_matches(['+', '-']);
    if unsigned.starts_with("Infinity") && text.len() - unsigned.len() <= 1 {
        let negative = text.starts_with('-');
        return Value::Number(if negative { f64::NEG_INFINITY } else { f64::INFINITY });
    }
    let prefix = text
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .filter(|&end| {
            let candidate = &text[..end];
            !candidate.contains(|c: char| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
                && candidate.parse::<f64>().is_ok()
        })
        .last();
    Value::Number(prefix.and_then(|end| text[..end].parse().ok()).unwrap_or(f64::NAN))
}

fn parse_int(text: &str, radix: u32) -> Value {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, digits) = match (radix, digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X"))) {
        (0 | 16, Some(hex)) => (16, hex),
        (0, None) => (10, digits),
        (r, _) => (r, digits),
    };
    if !(2..=36).contains(&radix) {
        return Value::Number(f64::NAN);
    }
    let prefix: String = digits.chars().take_while(|c| c.is_digit(radix)).collect();
    if prefix.is_empty() {
        return Value::Number(f64::NAN);
    }
    let magnitude = prefix
        .chars()
        .filter_map(|c| c.to_digit(radix))
        .fold(0.0, |acc, d| acc * f64::from(radix) + f64::from(d));
    Value::Number(if negative { -magnitude } else { magnitude })
}

// ── try / await / throw as values ──

/// `try`, `await` and `throw` referenced outside of call position. Their
/// arguments are already evaluated, so only asynchronous values are guarded.
pub fn form_function(form: Form) -> Value {
    match form {
        Form::Throw => native("throw", |args| Err(Throw::Error(arg(args, 0)))),
        Form::Try => native("try", |args| {
            flow::try_catch(Ok(arg(args, 0)), handler("try", arg(args, 1))?)
        }),
        Form::Await => native("await", |args| {
            flow::await_stale(Ok(arg(args, 0)), handler("await", arg(args, 1))?)
        }),
    }
}

/// The optional handler argument of `try`/`await`.
pub fn handler(form: &str, value: Value) -> Result<Option<Function>, Throw> {
    match value {
        Value::Function(f) => Ok(Some(f)),
        v if v.is_nullish() => Ok(None),
        v => Err(Throw::type_error(format!("{form} handler {v} is not a function"))),
    }
}

// ── Calls ──

pub fn call(function: &Value, this: &Value, args: &[Value], text: &str) -> Outcome {
    match function {
        Value::Function(f) => f.call(this, args),
        _ => Err(Throw::type_error(format!("{text} is not a function"))),
    }
}

pub fn construct(function: &Value, args: &[Value], text: &str) -> Outcome {
    match function {
        Value::Function(f) => f
            .construct(args)
            .unwrap_or_else(|| Err(Throw::type_error(format!("{text} is not a constructor")))),
        _ => Err(Throw::type_error(format!("{text} is not a constructor"))),
    }
}

// ── Conversions ──

/// Items produced by spreading `value`.
pub fn iterate(value: &Value) -> Result<Vec<Value>, Throw> {
    match value {
        Value::Array(items) => Ok(items.to_vec()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::from(c.to_string())).collect()),
        _ => Err(Throw::type_error(format!("{value} is not iterable"))),
    }
}

pub fn property_key(key: &Value) -> String {
    match key {
        Value::Str(s) => s.to_string(),
        Value::Number(n) => format_number(*n),
        other => other.to_display(),
    }
}

/// Own enumerable entries, as object spread and `Object.entries` see them.
fn entries_of(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(entries) => entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        Value::Str(s) => s.chars().enumerate().map(|(i, c)| (i.to_string(), Value::from(c.to_string()))).collect(),
        _ => Vec::new(),
    }
}

pub fn spread_into(target: &mut Object, source: &Value) {
    target.extend(entries_of(source));
}

// ── Member access ──

fn bound(receiver: &Value, name: &str, method: Method) -> Value {
    Value::Function(Function::Bound(Rc::new(BoundFn {
        this: receiver.clone(),
        target: Function::Native(Rc::new(NativeFn::new(name, method))),
    })))
}

fn index_of(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as usize),
        Value::Str(s) => s.parse().ok(),
        _ => None,
    }
}

/// `object[key]`.
pub fn get_member(object: &Value, key: &Value) -> Outcome {
    let name = property_key(key);
    match object {
        Value::Undefined | Value::Null => Err(Throw::type_error(format!(
            "Cannot read properties of {object} (reading '{name}')"
        ))),
        Value::Array(items) => Ok(match index_of(key) {
            Some(i) => items.get(i).cloned().unwrap_or_default(),
            None if name == "length" => Value::Number(items.len() as f64),
            None => array_method(&name).map_or(Value::Undefined, |m| bound(object, &name, m)),
        }),
        Value::Str(s) => Ok(match index_of(key) {
            Some(i) => s.chars().nth(i).map_or(Value::Undefined, |c| Value::from(c.to_string())),
            None if name == "length" => Value::Number(s.chars().count() as f64),
            None => string_method(&name).map_or(Value::Undefined, |m| bound(object, &name, m)),
        }),
        Value::Number(_) => Ok(number_method(&name).map_or(Value::Undefined, |m| bound(object, &name, m))),
        Value::Object(entries) => Ok(entries.get(&name).cloned().unwrap_or_default()),
        Value::Error(e) => Ok(match name.as_str() {
            "message" => Value::from(e.message.as_str()),
            "name" => Value::from(e.kind.name()),
            _ => Value::Undefined,
        }),
        Value::Function(f) => Ok(match name.as_str() {
            "name" => Value::from(f.name()),
            _ => static_member(f, &name).unwrap_or_default(),
        }),
        Value::Host(host) => Ok(host.get(&name).unwrap_or_default()),
        Value::Bool(_) | Value::Pending(_) | Value::Stream(_) => Ok(Value::Undefined),
    }
}

fn callback(value: &Value) -> Result<&Function, Throw> {
    value
        .as_function()
        .ok_or_else(|| Throw::type_error(format!("{value} is not a function")))
}

fn items_of(this: &Value) -> &[Value] {
    this.as_array().unwrap_or_default()
}

/// Each item with its index, passed to `f` as `(item, index, array)`.
fn each<'a>(
    this: &'a Value,
    f: &'a Function,
) -> impl Iterator<Item = (&'a Value, Outcome)> + 'a {
    items_of(this)
        .iter()
        .enumerate()
        .map(move |(i, item)| (item, f.call(&Value::Undefined, &[item.clone(), Value::from(i as f64), this.clone()])))
}

/// Relative index as `slice` and `at` read it.
fn relative(value: &Value, len: usize, default: usize) -> usize {
    if value.is_nullish() {
        return default;
    }
    let n = value.to_number();
    let n = if n.is_nan() { 0.0 } else { n.trunc() };
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        (n as usize).min(len)
    }
}

fn array_method(name: &str) -> Option<Method> {
    let method: Method = match name {
        "map" => |this, args| {
            let handler = arg(args, 0);
            let f = callback(&handler)?;
            each(this, f).map(|(_, r)| r).collect::<Result<Vec<_>, _>>().map(Value::from)
        },
        "filter" => |this, args| {
            let handler = arg(args, 0);
            let f = callback(&handler)?;
            let mut kept = Vec::new();
            for (item, keep) in each(this, f) {
                if keep?.truthy() {
                    kept.push(item.clone());
                }
            }
            Ok(Value::from(kept))
        },
        "find" => |this, args| {
            let handler = arg(args, 0);
            let f = callback(&handler)?;
            for (item, hit) in each(this, f) {
                if hit?.truthy() {
                    return Ok(item.clone());
                }
            }
            Ok(Value::Undefined)
        },
        "findIndex" => |this, args| {
            let handler = arg(args, 0);
            let f = callback(&handler)?;
            for (i, (_, hit)) in each(this, f).enumerate() {
                if hit?.truthy() {
                    return Ok(Value::from(i as f64));
                }
            }
            Ok(Value::Number(-1.0))
        },
        "some" => |this, args| {
            let handler = arg(args, 0);
            let f = callback(&handler)?;
            for (_, hit) in each(this, f) {
                if hit?.truthy() {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        },
        "every" => |this, args| {
            let handler = arg(args, 0);
            let f = callback(&handler)?;
            for (_, hit) in each(this, f) {
                if !hit?.truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        },
        "reduce" => |this, args| {
            let handler = arg(args, 0);
            let f = callback(&handler)?;
            let items = items_of(this);
            let (mut acc, start) = match args.get(1) {
                Some(initial) => (initial.clone(), 0),
                None => match items.first() {
                    Some(first) => (first.clone(), 1),
                    None => {
                        return Err(Throw::type_error("Reduce of empty array with no initial value"))
                    }
                },
            };
            for (i, item) in items.iter().enumerate().skip(start) {
                acc = f.call(
                    &Value::Undefined,
                    &[acc, item.clone(), Value::from(i as f64), this.clone()],
                )?;
            }
            Ok(acc)
        },
        "concat" => |this, args| {
            let mut items = items_of(this).to_vec();
            for a in args {
                match a {
                    Value::Array(more) => items.extend(more.iter().cloned()),
                    other => items.push(other.clone()),
                }
            }
            Ok(Value::from(items))
        },
        "slice" => |this, args| {
            let items = items_of(this);
            let start = relative(&arg(args, 0), items.len(), 0);
            let end = relative(&arg(args, 1), items.len(), items.len());
            Ok(Value::array(items.get(start..end.max(start)).unwrap_or_default().iter().cloned()))
        },
        "join" => |this, args| {
            let separator = match arg(args, 0) {
                Value::Undefined => ",".to_string(),
                s => s.to_display(),
            };
            Ok(Value::from(
                items_of(this)
                    .iter()
                    .map(|v| if v.is_nullish() { String::new() } else { v.to_display() })
                    .collect::<Vec<_>>()
                    .join(&separator),
            ))
        },
        "indexOf" => |this, args| {
            let needle = arg(args, 0);
            Ok(Value::Number(
                items_of(this)
                    .iter()
                    .position(|v| v.strict_equals(&needle))
                    .map_or(-1.0, |i| i as f64),
            ))
        },
        "includes" => |this, args| {
            let needle = arg(args, 0);
            Ok(Value::Bool(items_of(this).iter().any(|v| v.same_value(&needle))))
        },
        "reverse" => |this, _| Ok(Value::array(items_of(this).iter().rev().cloned())),
        "at" => |this, args| {
            let items = items_of(this);
            let n = arg(args, 0).to_number();
            let n = if n.is_nan() { 0.0 } else { n.trunc() };
            let i = if n < 0.0 { items.len() as f64 + n } else { n };
            Ok(if i < 0.0 { Value::Undefined } else { items.get(i as usize).cloned().unwrap_or_default() })
        },
        "flat" => |this, args| {
            let depth = match arg(args, 0) {
                Value::Undefined => 1,
                d => d.to_number().max(0.0) as usize,
            };
            Ok(Value::from(flatten(items_of(this), depth)))
        },
        "flatMap" => |this, args| {
            let handler = arg(args, 0);
            let f = callback(&handler)?;
            let mapped = each(this, f).map(|(_, r)| r).collect::<Result<Vec<_>, _>>()?;
            Ok(Value::from(flatten(&mapped, 1)))
        },
        "sort" => |this, args| {
            let mut items = items_of(this).to_vec();
            let mut failure = None;
            match arg(args, 0) {
                Value::Function(f) => items.sort_by(|a, b| {
                    match f.call(&Value::Undefined, &[a.clone(), b.clone()]) {
                        Ok(order) => order.to_number().partial_cmp(&0.0).unwrap_or(std::cmp::Ordering::Equal),
                        Err(e) => {
                            failure.get_or_insert(e);
                            std::cmp::Ordering::Equal
                        }
                    }
                }),
                _ => items.sort_by_key(|v| v.to_display()),
            }
            match failure {
                Some(e) => Err(e),
                None => Ok(Value::from(items)),
            }
        },
        _ => return None,
    };
    Some(method)
}

fn flatten(items: &[Value], depth: usize) -> Vec<Value> {
    let mut out = Vec::new();
    for item in items {
        match item {
            Value::Array(inner) if depth > 0 => out.extend(flatten(inner, depth - 1)),
            other => out.push(other.clone()),
        }
    }
    out
}

fn text_of(this: &Value) -> String {
    this.to_display()
}

fn string_method(name: &str) -> Option<Method> {
    let method: Method = match name {
        "toUpperCase" => |this, _| Ok(Value::from(text_of(this).to_uppercase())),
        "toLowerCase" => |this, _| Ok(Value::from(text_of(this).to_lowercase())),
        "trim" => |this, _| Ok(Value::from(text_of(this).trim())),
        "trimStart" => |this, _| Ok(Value::from(text_of(this).trim_start())),
        "trimEnd" => |this, _| Ok(Value::from(text_of(this).trim_end())),
        "split" => |this, args| {
            let text = text_of(this);
            Ok(match arg(args, 0) {
                Value::Undefined => Value::array(vec![Value::from(text)]),
                sep => {
                    let sep = sep.to_display();
                    if sep.is_empty() {
                        Value::array(text.chars().map(|c| Value::from(c.to_string())))
                    } else {
                        Value::array(text.split(sep.as_str()).map(Value::from))
                    }
                }
            })
        },
        "slice" | "substring" => |this, args| {
            let chars: Vec<char> = text_of(this).chars().collect();
            let start = relative(&arg(args, 0), chars.len(), 0);
            let end = relative(&arg(args, 1), chars.len(), chars.len());
            Ok(Value::from(chars.get(start..end.max(start)).unwrap_or_default().iter().collect::<String>()))
        },
        "indexOf" => |this, args| {
            let text = text_of(this);
            let needle = arg(args, 0).to_display();
            Ok(Value::Number(
                text.find(&needle).map_or(-1.0, |byte| text[..byte].chars().count() as f64),
            ))
        },
        "includes" => |this, args| Ok(Value::Bool(text_of(this).contains(&arg(args, 0).to_display()))),
        "startsWith" => |this, args| Ok(Value::Bool(text_of(this).starts_with(&arg(args, 0).to_display()))),
        "endsWith" => |this, args| Ok(Value::Bool(text_of(this).ends_with(&arg(args, 0).to_display()))),
        "replace" => |this, args| {
            let from = arg(args, 0).to_display();
            let to = arg(args, 1).to_display();
            Ok(Value::from(text_of(this).replacen(&from, &to, 1)))
        },
        "replaceAll" => |this, args| {
            Ok(Value::from(text_of(this).replace(&arg(args, 0).to_display(), &arg(args, 1).to_display())))
        },
        "repeat" => |this, args| {
            let count = arg(args, 0).to_number();
            if !(0.0..=1e6).contains(&count) {
                return Err(Throw::error(ErrorKind::Range, format!("Invalid count value: {}", format_number(count))));
            }
            let text = text_of(this);
            within_limit(count.trunc() * text.len() as f64, "Invalid string length")?;
            Ok(Value::from(text.repeat(count as usize)))
        },
        "padStart" => |this, args| pad(this, args, true).map(Value::from),
        "padEnd" => |this, args| pad(this, args, false).map(Value::from),
        "charAt" => |this, args| {
            let i = arg(args, 0).to_number().max(0.0) as usize;
            Ok(Value::from(text_of(this).chars().nth(i).map(String::from).unwrap_or_default()))
        },
        "charCodeAt" => |this, args| {
            let i = arg(args, 0).to_number().max(0.0) as usize;
            Ok(Value::Number(text_of(this).chars().nth(i).map_or(f64::NAN, |c| c as u32 as f64)))
        },
        "concat" => |this, args| {
            let mut text = text_of(this);
            for a in args {
                text.push_str(&a.to_display());
            }
            Ok(Value::from(text))
        },
        _ => return None,
    };
    Some(method)
}

fn pad(this: &Value, args: &[Value], at_start: bool) -> Result<String, Throw> {
    let text = text_of(this);
    let width = arg(args, 0).to_number();
    let width = if width.is_nan() { 0 } else { within_limit(width.max(0.0), "Invalid string length")? };
    let fill = match arg(args, 1) {
        Value::Undefined => " ".to_string(),
        f => f.to_display(),
    };
    let len = text.chars().count();
    if len >= width || fill.is_empty() {
        return Ok(text);
    }
    let padding: String = fill.chars().cycle().take(width - len).collect();
    Ok(if at_start { padding + &text } else { text + &padding })
}

fn number_method(name: &str) -> Option<Method> {
    let method: Method = match name {
        "toFixed" => |this, args| {
            let digits = arg(args, 0).to_number();
            let digits = if digits.is_nan() { 0 } else { digits as usize };
            if digits > 100 {
                return Err(Throw::error(ErrorKind::Range, "toFixed() digits argument must be between 0 and 100"));
            }
            let n = this.to_number();
            Ok(Value::from(if n.is_finite() { format!("{n:.digits$}") } else { format_number(n) }))
        },
        "toString" => |this, args| {
            let n = this.to_number();
            match arg(args, 0) {
                Value::Undefined => Ok(Value::from(format_number(n))),
                radix => {
                    let radix = radix.to_number() as u32;
                    if !(2..=36).contains(&radix) {
                        return Err(Throw::error(ErrorKind::Range, "toString() radix must be between 2 and 36"));
                    }
                    Ok(Value::from(to_radix(n, radix)))
                }
            }
        },
        _ => return None,
    };
    Some(method)
}

fn to_radix(n: f64, radix: u32) -> String {
    if !n.is_finite() || radix == 10 {
        return format_number(n);
    }
    let mut magnitude = n.abs().trunc() as u64;
    let mut digits = Vec::new();
    loop {
        digits.push(std::char::from_digit((magnitude % u64::from(radix)) as u32, radix).unwrap_or('0'));
        magnitude /= u64::from(radix);
        if magnitude == 0 {
            break;
        }
    }
    if n < 0.0 {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nums(items: &[f64]) -> Value {
        Value::array(items.iter().map(|v| Value::from(*v)))
    }

    fn invoke(receiver: &Value, name: &str, args: &[Value]) -> Outcome {
        let method = get_member(receiver, &Value::str(name))?;
        call(&method, &Value::Undefined, args, name)
    }

    #[test]
    fn nullish_member_access_names_the_key() {
        let err = get_member(&Value::Undefined, &Value::str("wrong")).err().unwrap();
        let Throw::Error(e) = err else { panic!("expected an error") };
        assert_eq!(
            e.as_error().unwrap().message,
            "Cannot read properties of undefined (reading 'wrong')"
        );
    }

    #[test]
    fn array_methods() {
        let double = Value::native("double", |args| Ok(Value::Number(arg(args, 0).to_number() * 2.0)));
        assert_eq!(invoke(&nums(&[1.0, 2.0]), "map", &[double]).unwrap(), nums(&[2.0, 4.0]));
        assert_eq!(invoke(&nums(&[0.0, 1.0, 2.0, 3.0, 4.0]), "slice", &[2.into()]).unwrap(), nums(&[2.0, 3.0, 4.0]));
        assert_eq!(invoke(&nums(&[1.0, 2.0]), "concat", &[3.into()]).unwrap(), nums(&[1.0, 2.0, 3.0]));
        assert_eq!(invoke(&nums(&[1.0, 2.0]), "join", &["-".into()]).unwrap(), Value::from("1-2"));
        assert_eq!(get_member(&nums(&[1.0, 2.0]), &Value::str("length")).unwrap(), Value::from(2));
    }

    #[test]
    fn find_index_reports_position() {
        let big = Value::native("big", |args| Ok(Value::Bool(arg(args, 0).to_number() > 1.0)));
        assert_eq!(invoke(&nums(&[1.0, 5.0]), "findIndex", &[big.clone()]).unwrap(), Value::from(1));
        assert_eq!(invoke(&nums(&[1.0, 5.0]), "find", &[big]).unwrap(), Value::from(5));
    }

    #[test]
    fn string_and_number_methods() {
        assert_eq!(invoke(&Value::str("boom"), "toUpperCase", &[]).unwrap(), Value::from("BOOM"));
        assert_eq!(invoke(&Value::str("7"), "padStart", &[3.into(), "0".into()]).unwrap(), Value::from("007"));
        assert_eq!(invoke(&Value::str("7"), "padEnd", &[3.into(), "0".into()]).unwrap(), Value::from("700"));
        assert_eq!(invoke(&Value::from(3.14159), "toFixed", &[2.into()]).unwrap(), Value::from("3.14"));
        assert_eq!(invoke(&Value::from(255), "toString", &[16.into()]).unwrap(), Value::from("ff"));
    }

    #[test]
    fn globals_and_statics() {
        let is_array = get_member(&global("Array"), &Value::str("isArray")).unwrap();
        assert_eq!(call(&is_array, &Value::Undefined, &[nums(&[])], "isArray").unwrap(), Value::Bool(true));
        assert_eq!(
            construct(&global("Array"), &[3.into()], "Array").unwrap(),
            Value::array(vec![Value::Undefined; 3])
        );
        assert!(construct(&global("Math"), &[], "Math").is_err());
        assert_eq!(parse_int("0x1f", 0), Value::from(31));
        assert_eq!(parse_float("3.5px"), Value::from(3.5));
    }
}
