// overload.rs — Operator overload resolution
//
// Resolves a unary or binary operator against runtime operand values:
// host objects with the `Overload` capability first, then elementwise
// application over arrays and plain objects, then native JavaScript
// semantics for primitives.
//
// Preconditions: none.
// Postconditions: results are fresh values; operands are never retained.
// Failure modes: an overload may return a `Throw`; everything else is total.
// Side effects: none beyond what a host overload does.

use std::rc::Rc;

use crate::ast::{BinaryOp, UnaryOp};
use crate::value::{Object, Outcome, Throw, Value};

/// Operator capability of a host object.
///
/// Return `None` to decline an operator; resolution then falls through to the
/// other operand, then to the generic rules.
pub trait Overload {
    fn unary(&self, _op: UnaryOp) -> Option<Outcome> {
        None
    }

    /// `reversed` is true when `self` is the right-hand operand.
    fn binary(&self, _op: BinaryOp, _other: &Value, _reversed: bool) -> Option<Outcome> {
        None
    }
}

/// The resolver for one unary operator.
pub fn unary_op(op: UnaryOp) -> impl Fn(&Value) -> Outcome {
    move |operand| apply_unary(op, operand)
}

/// The resolver for one binary operator.
pub fn binary_op(op: BinaryOp) -> impl Fn(&Value, &Value) -> Outcome {
    move |lhs, rhs| apply_binary(op, lhs, rhs)
}

pub fn apply_unary(op: UnaryOp, operand: &Value) -> Outcome {
    if let Value::Host(host) = operand {
        if let Some(result) = host.overload().and_then(|o| o.unary(op)) {
            return result;
        }
    }
    match operand {
        Value::Array(items) => items
            .iter()
            .map(|v| apply_unary(op, v))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::from),
        Value::Object(entries) => entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), apply_unary(op, v)?)))
            .collect::<Result<Object, Throw>>()
            .map(|o| Value::Object(Rc::new(o))),
        _ => Ok(primitive_unary(op, operand)),
    }
}

pub fn apply_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Outcome {
    if let Value::Host(host) = lhs {
        if let Some(result) = host.overload().and_then(|o| o.binary(op, rhs, false)) {
            return result;
        }
    }
    if let Value::Host(host) = rhs {
        if let Some(result) = host.overload().and_then(|o| o.binary(op, lhs, true)) {
            return result;
        }
    }
    match (lhs, rhs) {
        (Value::Array(items), _) => items
            .iter()
            .enumerate()
            .map(|(i, v)| apply_binary(op, v, &element(rhs, i)))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::from),
        (Value::Object(entries), _) => entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), apply_binary(op, v, &field(rhs, k))?)))
            .collect::<Result<Object, Throw>>()
            .map(|o| Value::Object(Rc::new(o))),
        (_, Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, v)| apply_binary(op, &element(lhs, i), v))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::from),
        (_, Value::Object(entries)) => entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), apply_binary(op, &field(lhs, k), v)?)))
            .collect::<Result<Object, Throw>>()
            .map(|o| Value::Object(Rc::new(o))),
        _ => Ok(primitive_binary(op, lhs, rhs)),
    }
}

/// Element `i` of a container operand, or the operand itself (broadcast).
fn element(value: &Value, i: usize) -> Value {
    match value {
        Value::Array(items) => items.get(i).cloned().unwrap_or_default(),
        Value::Object(entries) => entries.get(&i.to_string()).cloned().unwrap_or_default(),
        other => other.clone(),
    }
}

fn field(value: &Value, key: &str) -> Value {
    match value {
        Value::Object(entries) => entries.get(key).cloned().unwrap_or_default(),
        Value::Array(items) => key
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned())
            .unwrap_or_default(),
        other => other.clone(),
    }
}

// ── Native semantics ──

fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc().rem_euclid(4_294_967_296.0) as u32) as i32
}

fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

/// Operand coerced to a primitive the way `+` and comparisons see it.
fn to_primitive(value: &Value) -> Value {
    if value.is_primitive() {
        value.clone()
    } else {
        Value::from(value.to_display())
    }
}

pub fn primitive_unary(op: UnaryOp, operand: &Value) -> Value {
    match op {
        UnaryOp::Neg => Value::Number(-operand.to_number()),
        UnaryOp::Plus => Value::Number(operand.to_number()),
        UnaryOp::Not => Value::Bool(!operand.truthy()),
        UnaryOp::BitNot => Value::Number(f64::from(!to_int32(operand.to_number()))),
        UnaryOp::Typeof => Value::str(operand.type_of()),
        UnaryOp::Void => Value::Undefined,
    }
}

pub fn primitive_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
    let num = |f: fn(f64, f64) -> f64| Value::Number(f(lhs.to_number(), rhs.to_number()));
    let int = |f: fn(i32, i32) -> i32| {
        Value::Number(f64::from(f(to_int32(lhs.to_number()), to_int32(rhs.to_number()))))
    };
    match op {
        BinaryOp::Add => {
            let (l, r) = (to_primitive(lhs), to_primitive(rhs));
            if matches!(l, Value::Str(_)) || matches!(r, Value::Str(_)) {
                Value::from(l.to_display() + &r.to_display())
            } else {
                Value::Number(l.to_number() + r.to_number())
            }
        }
        BinaryOp::Sub => num(|a, b| a - b),
        BinaryOp::Mul => num(|a, b| a * b),
        BinaryOp::Div => num(|a, b| a / b),
        BinaryOp::Rem => num(|a, b| a % b),
        BinaryOp::Pow => num(f64::powf),
        BinaryOp::BitAnd => int(|a, b| a & b),
        BinaryOp::BitOr => int(|a, b| a | b),
        BinaryOp::BitXor => int(|a, b| a ^ b),
        BinaryOp::Shl => int(|a, b| a.wrapping_shl(b as u32 & 31)),
        BinaryOp::Shr => int(|a, b| a.wrapping_shr(b as u32 & 31)),
        BinaryOp::UShr => Value::Number(f64::from(
            to_uint32(lhs.to_number()) >> (to_uint32(rhs.to_number()) & 31),
        )),
        BinaryOp::Lt => Value::Bool(compare(lhs, rhs, |o| o.is_lt())),
        BinaryOp::Gt => Value::Bool(compare(lhs, rhs, |o| o.is_gt())),
        BinaryOp::LtEq => Value::Bool(compare(lhs, rhs, |o| o.is_le())),
        BinaryOp::GtEq => Value::Bool(compare(lhs, rhs, |o| o.is_ge())),
        BinaryOp::Eq => Value::Bool(loose_equals(lhs, rhs)),
        BinaryOp::NotEq => Value::Bool(!loose_equals(lhs, rhs)),
        BinaryOp::StrictEq => Value::Bool(lhs.strict_equals(rhs)),
        BinaryOp::StrictNotEq => Value::Bool(!lhs.strict_equals(rhs)),
    }
}

fn compare(lhs: &Value, rhs: &Value, test: fn(std::cmp::Ordering) -> bool) -> bool {
    let (l, r) = (to_primitive(lhs), to_primitive(rhs));
    if let (Value::Str(a), Value::Str(b)) = (&l, &r) {
        return test(a.cmp(b));
    }
    l.to_number()
        .partial_cmp(&r.to_number())
        .is_some_and(test)
}

/// JavaScript `==`.
pub fn loose_equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (a, b) if a.is_nullish() || b.is_nullish() => a.is_nullish() && b.is_nullish(),
        (Value::Bool(_), _) => loose_equals(&Value::Number(lhs.to_number()), rhs),
        (_, Value::Bool(_)) => loose_equals(lhs, &Value::Number(rhs.to_number())),
        (Value::Number(a), Value::Str(_)) => *a == rhs.to_number(),
        (Value::Str(_), Value::Number(b)) => lhs.to_number() == *b,
        (a, b) if a.is_primitive() && b.is_primitive() => a.strict_equals(b),
        (a, b) if a.is_primitive() || b.is_primitive() => {
            loose_equals(&to_primitive(a), &to_primitive(b))
        }
        (a, b) => a.strict_equals(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ErrorKind;

    fn obj(entries: &[(&str, f64)]) -> Value {
        Value::object(entries.iter().map(|(k, v)| (*k, Value::from(*v))))
    }

    fn nums(items: &[f64]) -> Value {
        Value::array(items.iter().map(|v| Value::from(*v)))
    }

    #[test]
    fn unary_minus_maps_object_values() {
        let neg = unary_op(UnaryOp::Neg);
        assert_eq!(neg(&obj(&[("a", 10.0), ("b", 20.0)])).unwrap(), obj(&[("a", -10.0), ("b", -20.0)]));
    }

    #[test]
    fn binary_pairs_keys_of_first_container() {
        let sub = binary_op(BinaryOp::Sub);
        let result = sub(&obj(&[("a", 10.0), ("b", 20.0)]), &obj(&[("a", 15.0), ("b", 15.0), ("c", 999.0)]));
        assert_eq!(result.unwrap(), obj(&[("a", -5.0), ("b", 5.0)]));

        let lt = binary_op(BinaryOp::Lt);
        let result = lt(&obj(&[("a", 10.0), ("b", 20.0)]), &obj(&[("a", 15.0), ("b", 15.0)]));
        assert_eq!(
            result.unwrap(),
            Value::object([("a", Value::Bool(true)), ("b", Value::Bool(false))])
        );
    }

    #[test]
    fn scalars_broadcast_over_arrays() {
        let and = binary_op(BinaryOp::BitAnd);
        assert_eq!(
            and(&nums(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]), &Value::from(3)).unwrap(),
            nums(&[0.0, 1.0, 2.0, 3.0, 0.0, 1.0])
        );
        let sub = binary_op(BinaryOp::Sub);
        assert_eq!(sub(&Value::from(10), &nums(&[1.0, 2.0])).unwrap(), nums(&[9.0, 8.0]));
    }

    #[test]
    fn nested_containers_recurse() {
        let add = binary_op(BinaryOp::Add);
        let lhs = Value::array(vec![nums(&[1.0, 2.0]), obj(&[("x", 1.0)])]);
        let result = add(&lhs, &Value::from(1)).unwrap();
        assert_eq!(result, Value::array(vec![nums(&[2.0, 3.0]), obj(&[("x", 2.0)])]));
    }

    #[test]
    fn primitive_semantics() {
        let add = binary_op(BinaryOp::Add);
        assert_eq!(add(&"a".into(), &Value::from(1)).unwrap(), Value::from("a1"));
        assert_eq!(primitive_binary(BinaryOp::Pow, &2.into(), &10.into()), Value::from(1024));
        assert_eq!(primitive_binary(BinaryOp::UShr, &Value::from(-1), &0.into()), Value::from(4294967295.0));
        assert_eq!(primitive_unary(UnaryOp::BitNot, &5.into()), Value::from(-6));
        assert_eq!(primitive_binary(BinaryOp::Lt, &"a".into(), &"b".into()), Value::Bool(true));
        assert_eq!(primitive_binary(BinaryOp::Eq, &Value::Null, &Value::Undefined), Value::Bool(true));
        assert_eq!(primitive_binary(BinaryOp::Eq, &"1".into(), &1.into()), Value::Bool(true));
        assert_eq!(primitive_binary(BinaryOp::StrictEq, &"1".into(), &1.into()), Value::Bool(false));
    }

    struct Refuser;

    impl Overload for Refuser {
        fn binary(&self, op: BinaryOp, _other: &Value, reversed: bool) -> Option<Outcome> {
            (op == BinaryOp::Mul).then(|| {
                Err(Throw::error(
                    ErrorKind::Type,
                    format!("refused (reversed: {reversed})"),
                ))
            })
        }
    }

    struct Opaque;

    impl crate::value::HostObject for Opaque {
        fn type_name(&self) -> &str {
            "Opaque"
        }
        fn overload(&self) -> Option<&dyn Overload> {
            Some(&Refuser)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn right_operand_overload_sees_reversed() {
        let mul = binary_op(BinaryOp::Mul);
        let Err(Throw::Error(err)) = mul(&2.into(), &Value::host(Opaque)) else {
            panic!("expected the overload to throw");
        };
        assert_eq!(err.as_error().map(|e| e.message.as_str()), Some("refused (reversed: true)"));
        // Declined operators fall through to native semantics.
        let add = binary_op(BinaryOp::Add);
        assert_eq!(add(&Value::host(Opaque), &"!".into()).unwrap(), Value::from("[object Opaque]!"));
    }
}
