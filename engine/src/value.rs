// value.rs — Dynamic values flowing through formulas
//
// Formulas compute JavaScript-like values: primitives, immutable arrays and
// objects, functions (compiled arrows, natives, bound methods), error values,
// and the two asynchronous shapes (`Pending`, subscribable streams). Host
// applications add their own types through `HostObject`.
//
// Preconditions: none.
// Postconditions: containers are shared (`Rc`) and never mutated after
//   construction; cloning a `Value` is cheap.
// Failure modes: none; conversions follow JavaScript coercion rules.
// Side effects: none.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::evaluator::ArrowFn;
use crate::flow::{Pending, Subscribable};
use crate::overload::Overload;

/// Ordered string-keyed record.
pub type Object = IndexMap<String, Value>;

/// Result of evaluating anything: a value or a throw.
pub type Outcome = Result<Value, Throw>;

/// A dynamic value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    /// Holes read as `Undefined`.
    Array(Rc<Vec<Value>>),
    Object(Rc<Object>),
    Function(Function),
    Error(Rc<ErrorValue>),
    Pending(Pending),
    Stream(Rc<dyn Subscribable>),
    Host(Rc<dyn HostObject>),
}

// ── Errors as values ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Evaluation,
    CircularDependency,
    Settlement,
    Type,
    Reference,
    Range,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Evaluation => "Error",
            ErrorKind::CircularDependency => "CircularDependencyError",
            ErrorKind::Settlement => "SettlementError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Range => "RangeError",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
}

/// Non-local exit from an evaluation.
#[derive(Clone)]
pub enum Throw {
    /// Any thrown value; usually a `Value::Error`.
    Error(Value),
    /// A dependency is pending; evaluation resumes when it settles.
    Stale(Pending),
}

impl Throw {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Throw::Error(Value::error(kind, message))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Throw::error(ErrorKind::Type, message)
    }
}

impl fmt::Debug for Throw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Throw::Error(value) => write!(f, "Throw({value:?})"),
            Throw::Stale(_) => f.write_str("Stale"),
        }
    }
}

// ── Functions ──

#[derive(Clone)]
pub enum Function {
    Arrow(Rc<ArrowFn>),
    Native(Rc<NativeFn>),
    Bound(Rc<BoundFn>),
}

type NativeCall = dyn Fn(&Value, &[Value]) -> Outcome;

/// A function implemented in Rust. Receives `this` and the arguments.
pub struct NativeFn {
    name: String,
    call: Rc<NativeCall>,
    constructible: bool,
}

/// A method bound to its receiver by member access.
pub struct BoundFn {
    pub this: Value,
    pub target: Function,
}

impl NativeFn {
    pub fn new(
        name: impl Into<String>,
        call: impl Fn(&Value, &[Value]) -> Outcome + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            call: Rc::new(call),
            constructible: false,
        }
    }

    /// A native that may also be invoked with `new`.
    pub fn constructor(
        name: impl Into<String>,
        call: impl Fn(&Value, &[Value]) -> Outcome + 'static,
    ) -> Self {
        Self {
            constructible: true,
            ..Self::new(name, call)
        }
    }
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Arrow(_) => "",
            Function::Native(native) => &native.name,
            Function::Bound(bound) => bound.target.name(),
        }
    }

    pub fn call(&self, this: &Value, args: &[Value]) -> Outcome {
        match self {
            Function::Arrow(arrow) => arrow.call(args),
            Function::Native(native) => (native.call)(this, args),
            Function::Bound(bound) => bound.target.call(&bound.this, args),
        }
    }

    /// `None` when the function cannot be used with `new`.
    pub fn construct(&self, args: &[Value]) -> Option<Outcome> {
        match self {
            Function::Native(native) if native.constructible => {
                Some((native.call)(&Value::Undefined, args))
            }
            Function::Bound(bound) => bound.target.construct(args),
            _ => None,
        }
    }

    fn addr(&self) -> *const () {
        match self {
            Function::Arrow(rc) => Rc::as_ptr(rc) as *const (),
            Function::Native(rc) => Rc::as_ptr(rc) as *const (),
            Function::Bound(rc) => Rc::as_ptr(rc) as *const (),
        }
    }
}

// ── Host objects ──

/// A value type supplied by the embedding application.
pub trait HostObject {
    fn type_name(&self) -> &str;

    /// Property lookup for member access.
    fn get(&self, _key: &str) -> Option<Value> {
        None
    }

    /// Operator overload capability, if the type has one.
    fn overload(&self) -> Option<&dyn Overload> {
        None
    }

    fn describe(&self) -> String {
        format!("[object {}]", self.type_name())
    }

    fn as_any(&self) -> &dyn Any;
}

// ── Construction ──

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Array(Rc::new(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Object(Rc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Value {
        Value::Error(Rc::new(ErrorValue {
            kind,
            message: message.into(),
        }))
    }

    /// A native function that ignores `this`.
    pub fn native(name: impl Into<String>, f: impl Fn(&[Value]) -> Outcome + 'static) -> Value {
        Value::Function(Function::Native(Rc::new(NativeFn::new(
            name,
            move |_, args| f(args),
        ))))
    }

    pub fn host(object: impl HostObject + 'static) -> Value {
        Value::Host(Rc::new(object))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }
}

impl From<Pending> for Value {
    fn from(pending: Pending) -> Self {
        Value::Pending(pending)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

/// Argument `i`, or `undefined` when absent.
pub fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or_default()
}

// ── Inspection ──

impl Value {
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::Array(_)
            | Value::Object(_)
            | Value::Error(_)
            | Value::Pending(_)
            | Value::Stream(_)
            | Value::Host(_) => "object",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Value::Pending(_) | Value::Stream(_))
    }

    /// Primitives keep native operator semantics.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_) | Value::Str(_)
        )
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_arrow(&self) -> Option<&ArrowFn> {
        match self {
            Value::Function(Function::Arrow(arrow)) => Some(arrow),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_host<T: 'static>(&self) -> Option<&T> {
        match self {
            Value::Host(host) => host.as_any().downcast_ref(),
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

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => string_to_number(s),
            Value::Array(_) => string_to_number(&self.to_display()),
            _ => f64::NAN,
        }
    }

    /// JavaScript `String(value)`.
    pub fn to_display(&self) -> String {
        match self {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => items
                .iter()
                .map(|v| if v.is_nullish() { String::new() } else { v.to_display() })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".into(),
            Value::Function(Function::Arrow(arrow)) => arrow.signature(),
            Value::Function(f) => format!("function {}() {{ [native code] }}", f.name()),
            Value::Error(e) => format!("{}: {}", e.kind.name(), e.message),
            Value::Pending(_) => "[object Promise]".into(),
            Value::Stream(_) => "[object Observable]".into(),
            Value::Host(host) => host.describe(),
        }
    }

    /// Identity used to suppress re-publishing an unchanged value: equal
    /// primitives (NaN included) or the same shared reference.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self.strict_equals(other),
        }
    }

    /// JavaScript `===`.
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a.addr() == b.addr(),
            (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(a, b),
            (Value::Pending(a), Value::Pending(b)) => a.ptr_eq(b),
            (Value::Stream(a), Value::Stream(b)) => rc_addr(a) == rc_addr(b),
            (Value::Host(a), Value::Host(b)) => rc_addr(a) == rc_addr(b),
            _ => false,
        }
    }

    /// Identity of an asynchronous value, used to subscribe to it once.
    pub(crate) fn async_identity(&self) -> Option<*const ()> {
        match self {
            Value::Pending(p) => Some(p.addr()),
            Value::Stream(s) => Some(rc_addr(s)),
            _ => None,
        }
    }
}

pub(crate) fn rc_addr<T: ?Sized>(rc: &Rc<T>) -> *const () {
    Rc::as_ptr(rc) as *const ()
}

fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).map_or(f64::NAN, |v| v as f64);
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        // Rust accepts "inf" and "nan", JavaScript does not.
        _ if trimmed.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => f64::NAN,
        _ => trimmed.parse().unwrap_or(f64::NAN),
    }
}

/// JavaScript `Number.prototype.toString()`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.into();
    }
    if n == 0.0 {
        return "0".into();
    }
    let abs = n.abs();
    if (1e-6..1e21).contains(&abs) {
        if n.fract() == 0.0 {
            format!("{n:.0}")
        } else {
            format!("{n}")
        }
    } else {
        let exp = format!("{n:e}");
        match exp.split_once('e') {
            Some((mantissa, power)) if !power.starts_with('-') => format!("{mantissa}e+{power}"),
            _ => exp,
        }
    }
}

// ── JSON interchange ──

impl Value {
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::str(s),
            serde_json::Value::Array(items) => Value::array(items.iter().map(Value::from_json)),
            serde_json::Value::Object(entries) => Value::object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v))),
            ),
        }
    }

    /// Data view of the value; functions and async values become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null | Value::Function(_) | Value::Pending(_) | Value::Stream(_) => {
                serde_json::Value::Null
            }
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n).map_or(serde_json::Value::Null, Into::into)
                }
            }
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Array(items) => items.iter().map(Value::to_json).collect(),
            Value::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .filter(|(_, v)| !matches!(v, Value::Undefined))
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Error(e) => serde_json::json!({ "error": e.kind.name(), "message": e.message }),
            Value::Host(host) => serde_json::Value::String(host.describe()),
        }
    }
}

// ── Equality and formatting ──

/// Structural equality for data; identity for functions, async values and
/// host objects.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| ka == kb && va == vb)
            }
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => self.strict_equals(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", &**s),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(entries) => f.debug_map().entries(entries.iter()).finish(),
            Value::Function(Function::Arrow(arrow)) => write!(f, "[Function: {}]", arrow.signature()),
            Value::Function(func) => write!(f, "[Function: {}]", func.name()),
            Value::Pending(p) => write!(f, "[Pending{}]", if p.is_settled() { ": settled" } else { "" }),
            other => f.write_str(&other.to_display()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_format_like_javascript() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(f64::NAN), "NaN");
    }

    #[test]
    fn string_coercion() {
        assert_eq!(Value::array(vec![1.into(), Value::Null, "x".into()]).to_display(), "1,,x");
        assert_eq!(Value::object([("a", Value::from(1))]).to_display(), "[object Object]");
        assert_eq!(Value::error(ErrorKind::Type, "bad").to_display(), "TypeError: bad");
    }

    #[test]
    fn number_coercion() {
        assert_eq!(Value::str(" 12 ").to_number(), 12.0);
        assert_eq!(Value::str("").to_number(), 0.0);
        assert!(Value::str("inf").to_number().is_nan());
        assert_eq!(Value::array(vec![7.into()]).to_number(), 7.0);
        assert_eq!(Value::Bool(true).to_number(), 1.0);
        assert!(Value::Undefined.to_number().is_nan());
    }

    #[test]
    fn identity_versus_structure() {
        let a = Value::array(vec![1.into()]);
        let b = Value::array(vec![1.into()]);
        assert_eq!(a, b);
        assert!(!a.same_value(&b));
        assert!(a.same_value(&a.clone()));
        assert!(Value::Number(f64::NAN).same_value(&Value::Number(f64::NAN)));
        assert!(!Value::Number(f64::NAN).strict_equals(&Value::Number(f64::NAN)));
    }

    #[test]
    fn json_round_trip() {
        let json = serde_json::json!({"b": [1, 2.5, null], "a": "x"});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
        assert_eq!(value.as_object().map(|o| o.len()), Some(2));
    }
}
