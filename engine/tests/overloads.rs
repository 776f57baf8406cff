// Operator overloading: host objects with operator capabilities, elementwise
// containers, and the permanence of fast specialization.

use std::any::Any;
use std::rc::Rc;

use calcgraph::ast::{BinaryOp, UnaryOp};
use calcgraph::overload::{apply_binary, Overload};
use calcgraph::value::{HostObject, Outcome};
use calcgraph::{Compilation, Value};

// ── A complex number host type ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    fn value(re: f64, im: f64) -> Value {
        Value::host(Complex { re, im })
    }

    fn of(value: &Value) -> Option<Complex> {
        match value {
            Value::Number(n) => Some(Complex { re: *n, im: 0.0 }),
            other => other.as_host::<Complex>().copied(),
        }
    }
}

impl HostObject for Complex {
    fn type_name(&self) -> &str {
        "Complex"
    }

    fn get(&self, key: &str) -> Option<Value> {
        match key {
            "re" => Some(Value::from(self.re)),
            "im" => Some(Value::from(self.im)),
            _ => None,
        }
    }

    fn overload(&self) -> Option<&dyn Overload> {
        Some(self)
    }

    fn describe(&self) -> String {
        format!("{}{:+}i", self.re, self.im)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Overload for Complex {
    fn unary(&self, op: UnaryOp) -> Option<Outcome> {
        match op {
            UnaryOp::Neg => Some(Ok(Complex::value(-self.re, -self.im))),
            UnaryOp::BitNot => Some(Ok(Complex::value(self.re, -self.im))),
            _ => None,
        }
    }

    fn binary(&self, op: BinaryOp, other: &Value, reversed: bool) -> Option<Outcome> {
        let other = Complex::of(other)?;
        let (a, b) = if reversed { (other, *self) } else { (*self, other) };
        let result = match op {
            BinaryOp::Add => Complex::value(a.re + b.re, a.im + b.im),
            BinaryOp::Sub => Complex::value(a.re - b.re, a.im - b.im),
            BinaryOp::Mul => Complex::value(a.re * b.re - a.im * b.im, a.re * b.im + a.im * b.re),
            BinaryOp::StrictEq | BinaryOp::Eq => Value::Bool(a == b),
            _ => return None,
        };
        Some(Ok(result))
    }
}

fn eval(source: &str, z: Value) -> Value {
    let unit = Compilation::new(source).unwrap();
    unit.evaluate(Rc::new(move |name: &str| Ok(if name == "z" { z.clone() } else { Value::Undefined })))
        .unwrap()
}

fn z() -> Value {
    Complex::value(2.0, 3.0)
}

// ── Host overloads ──────────────────────────────────────────────────────────

#[test]
fn host_operators_take_priority() {
    assert_eq!(eval("(z * ~z).re", z()), Value::from(13));
    assert_eq!(eval("(z * ~z).im", z()), Value::from(0));
    assert_eq!(eval("(-z).im", z()), Value::from(-3));
}

#[test]
fn primitives_mix_on_either_side() {
    assert_eq!(eval("(z + 1).re", z()), Value::from(3));
    assert_eq!(eval("(2 * z).im", z()), Value::from(6));
    assert_eq!(eval("(10 - z).re", z()), Value::from(8));
}

#[test]
fn declined_operators_fall_back() {
    // no overload for `/`: both operands coerce to NaN
    let value = eval("z / 2", z());
    assert!(value.as_number().is_some_and(f64::is_nan));
    assert_eq!(eval("typeof z", z()), Value::from("object"));
    assert_eq!(eval("`${z}`", z()), Value::from("2+3i"));
}

#[test]
fn containers_apply_host_overloads_elementwise() {
    assert_eq!(eval("([1, 2] * z)[1].im", z()), Value::from(6));
    assert_eq!(eval("({a: z, b: 1} + z).a.re", z()), Value::from(4));
}

// ── Elementwise containers ──────────────────────────────────────────────────

#[test]
fn arrays_broadcast_scalars() {
    let value = eval("[1, 2, 3] * 2 + 1", Value::Undefined);
    assert_eq!(value, Value::array(vec![3.into(), 5.into(), 7.into()]));
    let value = eval("10 - [1, 2]", Value::Undefined);
    assert_eq!(value, Value::array(vec![9.into(), 8.into()]));
}

#[test]
fn arrays_combine_pairwise() {
    let value = eval("[1, 2] + [10, 20]", Value::Undefined);
    assert_eq!(value, Value::array(vec![11.into(), 22.into()]));
}

#[test]
fn objects_combine_by_key() {
    let value = eval("({a: 1, b: 2}) + 10", Value::Undefined);
    assert_eq!(value, Value::object([("a", Value::from(11)), ("b", Value::from(12))]));
    let value = eval("-({x: 1, y: [2, 3]})", Value::Undefined);
    assert_eq!(
        value,
        Value::object([
            ("x", Value::from(-1)),
            ("y", Value::array(vec![(-2).into(), (-3).into()])),
        ])
    );
}

#[test]
fn strict_equality_is_never_overloaded() {
    assert_eq!(eval("z === z", z()), Value::Bool(true));
    assert_eq!(eval("[1] === [1]", Value::Undefined), Value::Bool(false));
    assert_eq!(eval("z == z", z()).as_bool(), Some(true));
}

// ── Specialization permanence ───────────────────────────────────────────────

#[test]
fn fast_specialization_is_permanent() {
    let f = eval("x => x * 2", Value::Undefined);
    let f = f.as_function().unwrap();
    assert_eq!(f.call(&Value::Undefined, &[3.into()]).unwrap(), Value::from(6));

    let doubled = f.call(&Value::Undefined, &[z()]).unwrap();
    assert!(doubled.as_number().is_some_and(f64::is_nan));
}

#[test]
fn slow_specialization_handles_everything() {
    let f = eval("x => x * 2", Value::Undefined);
    let f = f.as_function().unwrap();
    let doubled = f.call(&Value::Undefined, &[z()]).unwrap();
    assert_eq!(doubled.as_host::<Complex>(), Some(&Complex { re: 4.0, im: 6.0 }));
    assert_eq!(f.call(&Value::Undefined, &[3.into()]).unwrap(), Value::from(6));
}

#[test]
fn resolver_functions_are_usable_directly() {
    let sum = apply_binary(BinaryOp::Add, &z(), &Value::from(1)).unwrap();
    assert_eq!(sum.as_host::<Complex>(), Some(&Complex { re: 3.0, im: 3.0 }));
    let add = calcgraph::overload::binary_op(BinaryOp::from_symbol("+").unwrap());
    assert_eq!(add(&Value::from("a"), &Value::from(1)).unwrap(), Value::from("a1"));
}
