// evaluator.rs — Evaluator construction for compiled formulas
//
// Builds a closure tree per owner (root, arrow function or deferred
// argument) from the arena's current specialization states. Subexpressions
// are inlined into their owner; nested owners are reached through their
// own evaluator caches at call time.
//
// Preconditions: the `Compilation` passed in is the one the closures run
//   against (`Env::unit`).
// Postconditions: a `Generic` hook classifies its operands on its first run
//   and commits the verdict; later runs of the same closure follow it.
// Failure modes: evaluation failures are returned as `Throw` values with
//   messages in terms of the formula's source text.
// Side effects: specialization commits and evaluator cache invalidation.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::analyze::{Binder, Binding, Compilation, ElemSlot, Form, NodeKind, Param, PropSlot, Specialization};
use crate::ast::{BinaryOp, LogicalOp, UnaryOp};
use crate::builtins;
use crate::codegen;
use crate::flow;
use crate::overload::{apply_binary, apply_unary, primitive_binary, primitive_unary};
use crate::value::{arg, Function, Object, Outcome, Throw, Value};

/// Lexical bindings visible to an evaluation.
pub type Scope = Rc<IndexMap<String, Value>>;

/// Resolves free identifiers.
pub type Resolver = Rc<dyn Fn(&str) -> Outcome>;

/// An owner's executable form: scope, call arguments, result.
pub type Evaluator = Rc<dyn Fn(&Env, &Scope, &[Value]) -> Outcome>;

type Eval = Rc<dyn Fn(&Env, &Scope) -> Outcome>;

/// Evaluation environment shared by every closure of one compilation.
#[derive(Clone)]
pub struct Env {
    pub unit: Rc<Compilation>,
    pub resolver: Resolver,
}

// ── Arrow function values ──

/// A function value created by evaluating an arrow literal.
pub struct ArrowFn {
    env: Env,
    index: usize,
    closure: Scope,
}

impl ArrowFn {
    /// Call with whichever evaluator is current for this arrow.
    pub fn call(&self, args: &[Value]) -> Outcome {
        let evaluator = self.env.unit.evaluator(self.index);
        evaluator(&self.env, &self.closure, args)
    }

    /// Generated code of the arrow in its current state.
    pub fn signature(&self) -> String {
        codegen::generate(&self.env.unit, self.index, true)
    }

    /// Enclosing bindings captured when the arrow was created.
    pub fn closure(&self) -> Value {
        Value::Object(self.closure.clone())
    }

    pub fn compilation(&self) -> &Rc<Compilation> {
        &self.env.unit
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

pub(crate) fn arrow_value(env: &Env, index: usize, scope: &Scope) -> Value {
    Value::Function(Function::Arrow(Rc::new(ArrowFn {
        env: env.clone(),
        index,
        closure: scope.clone(),
    })))
}

// ── Owners ──

/// Build the evaluator of owner `index`.
pub(crate) fn build_owner(unit: &Compilation, index: usize) -> Evaluator {
    let node = unit.node(index);
    let NodeKind::Arrow { params, rest } = &node.kind else {
        let expr = build_expr(unit, index);
        return Rc::new(move |env, scope, _| expr(env, scope));
    };
    let Some((&body, defaults)) = node.children.split_last() else {
        return Rc::new(|_, _, _| Ok(Value::Undefined));
    };
    let defaults: Rc<[Eval]> = defaults.iter().map(|&c| build(unit, c)).collect();
    let body = build(unit, body);
    let params = params.clone();
    let rest = rest.clone();
    Rc::new(move |env, scope, args| {
        let mut frame = Frame {
            env,
            values: (**scope).clone(),
            defaults: &defaults,
        };
        for (i, param) in params.iter().enumerate() {
            frame.param(param, arg(args, i))?;
        }
        if let Some(rest) = &rest {
            frame.bind(rest, Value::array(args.iter().skip(params.len()).cloned()))?;
        }
        body(env, &Rc::new(frame.values))
    })
}

/// Parameter binding for one call.
struct Frame<'a> {
    env: &'a Env,
    values: IndexMap<String, Value>,
    defaults: &'a [Eval],
}

impl Frame<'_> {
    fn param(&mut self, param: &Param, value: Value) -> Result<(), Throw> {
        let value = match (value, param.default.and_then(|d| self.defaults.get(d))) {
            (Value::Undefined, Some(default)) => {
                // defaults see the parameters bound before them
                let scope = Rc::new(self.values.clone());
                default(self.env, &scope)?
            }
            (value, _) => value,
        };
        self.bind(&param.binder, value)
    }

    fn bind(&mut self, binder: &Binder, value: Value) -> Result<(), Throw> {
        match binder {
            Binder::Name(name) => {
                self.values.insert(name.clone(), value);
            }
            Binder::Array { elems, rest } => {
                let items = builtins::iterate(&value)?;
                for (i, elem) in elems.iter().enumerate() {
                    if let Some(param) = elem {
                        self.param(param, arg(&items, i))?;
                    }
                }
                if let Some(rest) = rest {
                    self.bind(rest, Value::array(items.iter().skip(elems.len()).cloned()))?;
                }
            }
            Binder::Object { props, rest } => {
                if value.is_nullish() {
                    return Err(Throw::type_error(format!(
                        "Cannot destructure '{value}' as it is {value}."
                    )));
                }
                for (key, param) in props {
                    let field = builtins::get_member(&value, &Value::str(key))?;
                    self.param(param, field)?;
                }
                if let Some(rest) = rest {
                    let remaining: Object = value
                        .as_object()
                        .map(|entries| {
                            entries
                                .iter()
                                .filter(|(k, _)| !props.iter().any(|(taken, _)| taken == *k))
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect()
                        })
                        .unwrap_or_default();
                    self.values.insert(rest.clone(), Value::Object(Rc::new(remaining)));
                }
            }
        }
        Ok(())
    }
}

// ── Inline expressions ──

/// Closure for a child of an owner: nested owners become thunks.
fn build(unit: &Compilation, index: usize) -> Eval {
    let node = unit.node(index);
    if node.is_function_boundary() {
        return Rc::new(move |env, scope| Ok(arrow_value(env, index, scope)));
    }
    if node.is_deferred {
        return Rc::new(move |env, scope| {
            let evaluator = env.unit.evaluator(index);
            evaluator(env, scope, &[])
        });
    }
    build_expr(unit, index)
}

fn build_all(unit: &Compilation, indices: &[usize]) -> Vec<Eval> {
    indices.iter().map(|&c| build(unit, c)).collect()
}

fn constant(value: Value) -> Eval {
    Rc::new(move |_, _| Ok(value.clone()))
}

fn build_expr(unit: &Compilation, index: usize) -> Eval {
    let node = unit.node(index);
    let children = &node.children;
    match &node.kind {
        NodeKind::Literal(value) => constant(value.clone()),
        NodeKind::Template { quasis } => {
            let quasis = quasis.clone();
            let parts = build_all(unit, children);
            Rc::new(move |env, scope| {
                let mut out = String::new();
                for (i, quasi) in quasis.iter().enumerate() {
                    out.push_str(quasi);
                    if let Some(part) = parts.get(i) {
                        out.push_str(&part(env, scope)?.to_display());
                    }
                }
                Ok(Value::from(out))
            })
        }
        NodeKind::Identifier { name, binding, .. } => identifier(name.clone(), binding.clone()),
        NodeKind::Paren => match children.first() {
            Some(&inner) => build(unit, inner),
            None => constant(Value::Undefined),
        },
        NodeKind::Arrow { .. } => Rc::new(move |env, scope| Ok(arrow_value(env, index, scope))),
        NodeKind::Call {
            form: Some(form), ..
        } => form_call(*form, build_all(unit, &children[1..])),
        NodeKind::Logical(op) => logical(*op, build(unit, children[0]), build(unit, children[1])),
        NodeKind::Conditional => {
            let [test, consequent, alternate] = [0, 1, 2].map(|i| build(unit, children[i]));
            Rc::new(move |env, scope| {
                if test(env, scope)?.truthy() {
                    consequent(env, scope)
                } else {
                    alternate(env, scope)
                }
            })
        }
        NodeKind::Sequence => {
            let exprs = build_all(unit, children);
            Rc::new(move |env, scope| {
                let mut last = Value::Undefined;
                for expr in &exprs {
                    last = expr(env, scope)?;
                }
                Ok(last)
            })
        }
        _ => operation(unit, index),
    }
}

fn identifier(name: String, binding: Binding) -> Eval {
    match binding {
        Binding::Local => Rc::new(move |_, scope| Ok(scope.get(&name).cloned().unwrap_or_default())),
        Binding::External => Rc::new(move |env, _| (env.resolver)(&name)),
        Binding::Global => Rc::new(move |_, _| Ok(builtins::global(&name))),
        Binding::Arguments(names) => Rc::new(move |_, scope| {
            Ok(Value::object(names.iter().map(|n| {
                (n.clone(), scope.get(n).cloned().unwrap_or_default())
            })))
        }),
        Binding::Form(form) => constant(builtins::form_function(form)),
    }
}

fn logical(op: LogicalOp, lhs: Eval, rhs: Eval) -> Eval {
    Rc::new(move |env, scope| {
        let left = lhs(env, scope)?;
        let short = match op {
            LogicalOp::And => !left.truthy(),
            LogicalOp::Or => left.truthy(),
            LogicalOp::Nullish => !left.is_nullish(),
        };
        if short {
            Ok(left)
        } else {
            rhs(env, scope)
        }
    })
}

/// `try(expr, onError?)`, `await(expr, onStale?)`, `throw(value)`; the
/// first argument of `try`/`await` is a deferred owner.
fn form_call(form: Form, args: Vec<Eval>) -> Eval {
    Rc::new(move |env, scope| {
        if form == Form::Throw {
            let value = match args.first() {
                Some(value) => value(env, scope)?,
                None => Value::Undefined,
            };
            return Err(Throw::Error(value));
        }
        let attempt = match args.first() {
            Some(attempt) => attempt(env, scope),
            None => Ok(Value::Undefined),
        };
        let handler = match args.get(1) {
            Some(handler) => builtins::handler(form.name(), handler(env, scope)?)?,
            None => None,
        };
        match form {
            Form::Try => flow::try_catch(attempt, handler),
            _ => flow::await_stale(attempt, handler),
        }
    })
}

// ── Hooked operations ──

/// What a value-dependent node does with its evaluated operands.
#[derive(Debug, Clone)]
enum Op {
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// Operands: object, key.
    Member { optional: bool },
    /// Operands: callee, arguments; or receiver, key, arguments.
    Call {
        method: bool,
        optional: bool,
        spreads: Rc<[bool]>,
        callee: Rc<str>,
    },
    /// Operands: constructor, arguments.
    New { spreads: Rc<[bool]>, callee: Rc<str> },
    /// Operands: the non-hole elements.
    Array(Rc<[ElemSlot]>),
    /// Operands: the children in property order.
    Object(Rc<[PropSlot]>),
}

impl Op {
    fn classify(&self, values: &[Value]) -> Specialization {
        if values.iter().any(Value::is_async) {
            return Specialization::Slow;
        }
        let overloadable = match self {
            Op::Unary(op) => op.is_overloadable(),
            Op::Binary(_) => true,
            _ => false,
        };
        if overloadable && values.iter().any(|v| !v.is_primitive()) {
            Specialization::Slow
        } else {
            Specialization::Fast
        }
    }

    /// Apply to concrete operands; `generic` selects overload dispatch for
    /// operators.
    fn apply(&self, values: &[Value], generic: bool) -> Outcome {
        match self {
            Op::Unary(op) if generic && op.is_overloadable() => apply_unary(*op, &arg(values, 0)),
            Op::Unary(op) => Ok(primitive_unary(*op, &arg(values, 0))),
            Op::Binary(op) if generic && op.is_overloadable() => apply_binary(*op, &arg(values, 0), &arg(values, 1)),
            Op::Binary(op) => Ok(primitive_binary(*op, &arg(values, 0), &arg(values, 1))),
            Op::Member { optional } => {
                let object = arg(values, 0);
                if *optional && object.is_nullish() {
                    return Ok(Value::Undefined);
                }
                builtins::get_member(&object, &arg(values, 1))
            }
            Op::Call {
                method: true,
                optional,
                spreads,
                callee,
            } => {
                let receiver = arg(values, 0);
                if *optional && receiver.is_nullish() {
                    return Ok(Value::Undefined);
                }
                let function = builtins::get_member(&receiver, &arg(values, 1))?;
                let args = spread_args(values.get(2..).unwrap_or_default(), spreads)?;
                builtins::call(&function, &receiver, &args, callee)
            }
            Op::Call { spreads, callee, .. } => {
                let args = spread_args(values.get(1..).unwrap_or_default(), spreads)?;
                builtins::call(&arg(values, 0), &Value::Undefined, &args, callee)
            }
            Op::New { spreads, callee } => {
                let args = spread_args(values.get(1..).unwrap_or_default(), spreads)?;
                builtins::construct(&arg(values, 0), &args, callee)
            }
            Op::Array(slots) => {
                let mut operands = values.iter();
                let mut items = Vec::with_capacity(slots.len());
                for slot in slots.iter() {
                    match slot {
                        ElemSlot::Hole => items.push(Value::Undefined),
                        ElemSlot::Item => items.push(operands.next().cloned().unwrap_or_default()),
                        ElemSlot::Spread => {
                            let source = operands.next().cloned().unwrap_or_default();
                            items.extend(builtins::iterate(&source)?);
                        }
                    }
                }
                Ok(Value::from(items))
            }
            Op::Object(slots) => {
                let mut operands = values.iter().cloned();
                let mut next = move || operands.next().unwrap_or_default();
                let mut entries = Object::new();
                for slot in slots.iter() {
                    match slot {
                        PropSlot::KeyValue(key) | PropSlot::Shorthand(key) => {
                            entries.insert(key.clone(), next());
                        }
                        PropSlot::Computed => {
                            let key = builtins::property_key(&next());
                            entries.insert(key, next());
                        }
                        PropSlot::Spread => builtins::spread_into(&mut entries, &next()),
                    }
                }
                Ok(Value::Object(Rc::new(entries)))
            }
        }
    }
}

fn spread_args(values: &[Value], spreads: &[bool]) -> Result<Vec<Value>, Throw> {
    let mut args = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        if spreads.get(i).copied().unwrap_or(false) {
            args.extend(builtins::iterate(value)?);
        } else {
            args.push(value.clone());
        }
    }
    Ok(args)
}

/// Slow path: compose over asynchronous operands, dispatch otherwise.
fn dispatch(op: &Rc<Op>, values: Vec<Value>) -> Outcome {
    if values.iter().any(Value::is_async) {
        let op = op.clone();
        return Ok(flow::compose(values, Rc::new(move |concrete: &[Value]| op.apply(concrete, true))));
    }
    op.apply(&values, true)
}

fn evaluate_all(operands: &[Eval], env: &Env, scope: &Scope) -> Result<Vec<Value>, Throw> {
    operands.iter().map(|operand| operand(env, scope)).collect()
}

/// Operand closures and the operation of a value-dependent node.
fn operation(unit: &Compilation, index: usize) -> Eval {
    let node = unit.node(index);
    let children = &node.children;
    let (op, operands) = match &node.kind {
        NodeKind::Unary(op) => (Op::Unary(*op), build_all(unit, children)),
        NodeKind::Binary(op) => (Op::Binary(*op), build_all(unit, children)),
        NodeKind::Member { property, optional } => {
            (Op::Member { optional: *optional }, member_operands(unit, index, property))
        }
        NodeKind::Call { spreads, .. } => {
            let callee = children[0];
            let mut operands = match &unit.node(callee).kind {
                NodeKind::Member { property, .. } if unit.node(callee).is_member_call_target => {
                    member_operands(unit, callee, property)
                }
                _ => vec![build(unit, callee)],
            };
            let method = operands.len() == 2;
            let optional = matches!(unit.node(callee).kind, NodeKind::Member { optional: true, .. });
            operands.extend(build_all(unit, &children[1..]));
            let op = Op::Call {
                method,
                optional,
                spreads: spreads.iter().copied().collect(),
                callee: unit.text(callee).into(),
            };
            (op, operands)
        }
        NodeKind::New { spreads } => {
            let op = Op::New {
                spreads: spreads.iter().copied().collect(),
                callee: unit.text(children[0]).into(),
            };
            (op, build_all(unit, children))
        }
        NodeKind::Array(slots) => (Op::Array(slots.iter().copied().collect()), build_all(unit, children)),
        NodeKind::Object(slots) => (Op::Object(slots.iter().cloned().collect()), build_all(unit, children)),
        _ => return constant(Value::Undefined),
    };
    let op = Rc::new(op);

    match node.specialization() {
        None | Some(Specialization::Fast) => {
            Rc::new(move |env, scope| op.apply(&evaluate_all(&operands, env, scope)?, false))
        }
        Some(Specialization::Slow) => {
            Rc::new(move |env, scope| dispatch(&op, evaluate_all(&operands, env, scope)?))
        }
        Some(Specialization::Generic) => Rc::new(move |env, scope| {
            let values = evaluate_all(&operands, env, scope)?;
            let verdict = match env.unit.node(index).specialization() {
                Some(Specialization::Generic) => {
                    let verdict = op.classify(&values);
                    env.unit.specialize(index, verdict);
                    verdict
                }
                state => state.unwrap_or(Specialization::Fast),
            };
            match verdict {
                Specialization::Slow => dispatch(&op, values),
                _ => op.apply(&values, false),
            }
        }),
    }
}

/// Object and key operands of a member expression.
fn member_operands(unit: &Compilation, index: usize, property: &Option<String>) -> Vec<Eval> {
    let children = &unit.node(index).children;
    let object = build(unit, children[0]);
    let key = match property {
        Some(name) => constant(Value::str(name)),
        None => build(unit, children[1]),
    };
    vec![object, key]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_code(name: &str) -> Outcome {
        Ok(Value::Number(name.chars().next().map_or(0, |c| c as u32) as f64))
    }

    fn eval(source: &str) -> Value {
        let unit = Compilation::new(source).unwrap();
        unit.evaluate(Rc::new(char_code)).unwrap()
    }

    fn call(f: &Value, args: &[Value]) -> Value {
        f.as_function().unwrap().call(&Value::Undefined, args).unwrap()
    }

    #[test]
    fn operators_and_literals() {
        assert_eq!(eval("a + 42"), Value::from(139));
        assert_eq!(eval("2 ** 3 ** 2"), Value::from(512));
        assert_eq!(eval("\"a\" + \"b\""), Value::from("ab"));
        assert_eq!(eval("typeof +\"42\""), Value::from("number"));
        assert_eq!(eval("`a + b is ${a + b}!`"), Value::from("a + b is 195!"));
    }

    #[test]
    fn arrows_capture_closures() {
        let outer = eval("a => (b = c) => a * x + b");
        assert_eq!(outer.as_arrow().unwrap().closure(), Value::object(Vec::<(String, Value)>::new()));
        let inner = call(&outer, &[5.into()]);
        assert_eq!(inner.as_arrow().unwrap().closure(), Value::object([("a", Value::from(5))]));
        assert_eq!(call(&inner, &[]), Value::from(5 * 120 + 99));
        assert_eq!(call(&inner, &[]), Value::from(699));
    }

    #[test]
    fn rest_spread_and_holes() {
        let f = eval("(a, ...z) => [...z, , a]");
        assert_eq!(
            call(&f, &[1.into(), 2.into(), 3.into()]),
            Value::array(vec![2.into(), 3.into(), Value::Undefined, 1.into()])
        );
    }

    #[test]
    fn destructuring_with_defaults() {
        let f = eval("([{y: {z1 = 5, ...z2} = {x:6}}, z3, ...z4]) => (z1 * z2.x) * z3 * z4.length");
        let arg = Value::array(vec![Value::object(Vec::<(String, Value)>::new()), 2.into(), Value::Null, Value::Null]);
        assert_eq!(call(&f, &[arg]), Value::from(120));
    }

    #[test]
    fn arguments_records_bound_names() {
        let f = eval("({a} = {a:42}, b = a * 2) => arguments");
        assert_eq!(call(&f, &[]), Value::object([("a", Value::from(42)), ("b", Value::from(84))]));

        let g = eval("a => b => arguments");
        let inner = call(&g, &[5.into()]);
        assert_eq!(call(&inner, &[6.into()]), Value::object([("b", Value::from(6))]));
    }

    #[test]
    fn member_calls_keep_receiver() {
        assert_eq!(eval("[1, 2].reduce((a, b) => a + b)"), Value::from(3));
        assert_eq!(eval("({x}).x"), Value::from(120));
        assert_eq!(eval("(o => o.x * o[\"y\"])({x,y})"), Value::from(120 * 121));
        assert_eq!(eval("((a, b, c) => a * x + b * c)(...[5, c], 2)"), Value::from(5 * 120 + 99 * 2));
    }

    #[test]
    fn errors_name_the_source_text() {
        let unit = Compilation::new("r.map(i => i + 1)").unwrap();
        let err = unit
            .evaluate(Rc::new(|_: &str| Ok(Value::object(Vec::<(String, Value)>::new()))))
            .err()
            .unwrap();
        match err {
            Throw::Error(e) => assert_eq!(e.as_error().unwrap().message, "r.map is not a function"),
            Throw::Stale(_) => panic!("unexpected stale"),
        }
    }

    #[test]
    fn slow_specialization_rebuilds_owner() {
        let unit = Compilation::new("x => x * 2").unwrap();
        let f = unit.evaluate(Rc::new(char_code)).unwrap();
        let cache = unit.node(unit.root()).evaluator_cache().unwrap();

        assert_eq!(call(&f, &[Value::array(vec![1.into(), 2.into()])]), Value::array(vec![2.into(), 4.into()]));
        assert_eq!(cache.builds(), 1);
        assert!(!cache.is_built());

        assert_eq!(call(&f, &[3.into()]), Value::from(6));
        assert_eq!(cache.builds(), 2);
    }
}
