// analyze.rs — Scope and dependency analysis for one formula
//
// Walks the syntax tree once and flattens it into an arena of compiled
// nodes: per node, the enclosing namespace, bound names, free dependencies,
// codegen flags and (for hooked operations) a specialization state. The
// arena plus its id table and evaluator caches form one `Compilation`.
//
// Preconditions: `source` parses as one expression.
// Postconditions: `deps(node)` is the union of the children's deps minus
//   names bound by enclosing arrows, reserved words and globals; every
//   hooked node starts `Generic`; every owner has an empty evaluator cache.
// Failure modes: parse errors, a reserved word used as a binding or a
//   dependency, `try`/`await` called without arguments.
// Side effects: none at analysis time. Evaluation mutates specialization
//   states and evaluator caches through `Cell`/`RefCell`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use indexmap::IndexSet;
use tracing::{debug, trace};

use crate::ast::*;
use crate::builtins;
use crate::codegen;
use crate::error::{Error, Result};
use crate::evaluator::{self, Env, Evaluator, Resolver, Scope};
use crate::id::{IdTable, NodeId};
use crate::parser;
use crate::value::{Outcome, Value};

/// Words that may be neither a binding name nor a dependency.
pub const RESERVED_WORDS: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete",
    "do", "else", "enum", "export", "extends", "finally", "for", "function", "if", "import",
    "in", "instanceof", "let", "return", "super", "switch", "this", "var", "while", "with",
    "yield", "implements", "interface", "package", "private", "protected", "public", "static",
];

/// Built-in names handled by the compiler itself.
const FORM_WORDS: &[&str] = &["try", "await", "throw", "arguments"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_WORDS.contains(&name)
}

// ── Compiled nodes ──────────────────────────────────────────────────────────

/// Per-node specialization state. Leaves `Generic` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Specialization {
    /// Not executed yet; the first run inspects its operands.
    Generic,
    /// Plain operands seen: native semantics from now on.
    Fast,
    /// Non-primitive or asynchronous operands seen: overload dispatch and
    /// flow composition.
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    Try,
    Await,
    Throw,
}

impl Form {
    fn from_name(name: &str) -> Option<Form> {
        match name {
            "try" => Some(Form::Try),
            "await" => Some(Form::Await),
            "throw" => Some(Form::Throw),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Form::Try => "try",
            Form::Await => "await",
            Form::Throw => "throw",
        }
    }
}

/// What an identifier refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Bound by an enclosing arrow function.
    Local,
    /// Free; resolved through the evaluation environment.
    External,
    /// A standard library global (`Math`, `NaN`, ...).
    Global,
    /// `arguments`: a record of the nearest arrow's bound names.
    Arguments(Rc<[String]>),
    /// `try`, `await` or `throw` outside of call position.
    Form(Form),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemSlot {
    Hole,
    Item,
    Spread,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropSlot {
    /// One child: the value.
    KeyValue(String),
    /// Two children: key, value.
    Computed,
    /// One child: the identifier.
    Shorthand(String),
    /// One child: the spread source.
    Spread,
}

/// A destructuring target; defaults are indices into the arrow's default
/// list (its leading children).
#[derive(Debug, Clone, PartialEq)]
pub enum Binder {
    Name(String),
    Array {
        elems: Vec<Option<Param>>,
        rest: Option<Box<Binder>>,
    },
    Object {
        props: Vec<(String, Param)>,
        rest: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub binder: Binder,
    pub default: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Literal(Value),
    Template {
        quasis: Vec<String>,
    },
    Identifier {
        name: String,
        binding: Binding,
        shorthand: bool,
    },
    Paren,
    Array(Vec<ElemSlot>),
    Object(Vec<PropSlot>),
    /// Children: parameter defaults, then the body.
    Arrow {
        params: Vec<Param>,
        rest: Option<Binder>,
    },
    /// Children: object, then the key when computed.
    Member {
        property: Option<String>,
        optional: bool,
    },
    /// Children: callee, then arguments.
    Call {
        spreads: Vec<bool>,
        form: Option<Form>,
    },
    New {
        spreads: Vec<bool>,
    },
    Unary(UnaryOp),
    Binary(BinaryOp),
    Logical(LogicalOp),
    Conditional,
    Sequence,
}

/// An explicit evaluator slot: built on first access, dropped on
/// invalidation, rebuilt on the next access.
#[derive(Default)]
pub struct EvaluatorCache {
    slot: RefCell<Option<Evaluator>>,
    builds: Cell<u32>,
}

impl EvaluatorCache {
    pub fn is_built(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// How many times the evaluator has been (re)built.
    pub fn builds(&self) -> u32 {
        self.builds.get()
    }

    fn invalidate(&self) {
        self.slot.borrow_mut().take();
    }
}

pub struct CompiledNode {
    pub kind: NodeKind,
    pub span: Span,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Names bound by enclosing arrows (an arrow's own parameters excluded).
    pub namespace: Rc<IndexSet<String>>,
    pub bound_names: Vec<String>,
    pub deps: BTreeSet<String>,
    pub is_constructor_target: bool,
    pub is_member_call_target: bool,
    pub is_deferred: bool,
    hook: Option<Cell<Specialization>>,
    cache: Option<EvaluatorCache>,
}

impl CompiledNode {
    pub fn is_function_boundary(&self) -> bool {
        matches!(self.kind, NodeKind::Arrow { .. })
    }

    pub fn specialization(&self) -> Option<Specialization> {
        self.hook.as_ref().map(Cell::get)
    }

    pub fn evaluator_cache(&self) -> Option<&EvaluatorCache> {
        self.cache.as_ref()
    }

    /// Owners are built into evaluators of their own.
    pub fn is_owner(&self) -> bool {
        self.cache.is_some()
    }
}

// ── Compilation unit ────────────────────────────────────────────────────────

/// One compiled formula: syntax tree, node arena, lazily interned ids and
/// evaluator caches.
pub struct Compilation {
    source: String,
    ast: Expr,
    nodes: Vec<CompiledNode>,
    root: usize,
    ids: IdTable,
}

impl Compilation {
    /// Parse and analyze `source`.
    pub fn new(source: &str) -> Result<Rc<Compilation>> {
        let parsed = parser::parse(source);
        let expr = match parsed.expr {
            Some(expr) if parsed.diagnostics.is_empty() => expr,
            _ => return Err(Error::Parse(parsed.diagnostics)),
        };
        let mut ctx = AnalyzeCtx { nodes: Vec::new() };
        let root = ctx.visit(&expr, None, &Rc::default(), &Rc::from(Vec::new()))?;
        ctx.finish(root);
        debug!(nodes = ctx.nodes.len(), formula = %source, "compiled formula");
        Ok(Rc::new(Compilation {
            source: source.to_string(),
            ast: expr,
            nodes: ctx.nodes,
            root,
            ids: IdTable::new(),
        }))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, index: usize) -> &CompiledNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Free dependencies of the whole formula.
    pub fn deps(&self) -> &BTreeSet<String> {
        &self.nodes[self.root].deps
    }

    /// Source text of node `index`.
    pub fn text(&self, index: usize) -> &str {
        let span = self.nodes[index].span;
        &self.source[span.start..span.end]
    }

    /// Generated code for the whole formula in its current state.
    pub fn generated(&self) -> String {
        codegen::generate(self, self.root, true)
    }

    /// The formula text with free identifiers renamed.
    pub fn renamed(&self, renames: &HashMap<String, String>) -> String {
        codegen::rename(self, renames)
    }

    pub fn id(&self, index: usize) -> NodeId {
        self.ids.intern(index)
    }

    /// Arena index of a node id that generated code has referenced.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.ids.resolve(id)
    }

    /// Evaluate the formula, resolving free identifiers with `resolver`.
    pub fn evaluate(self: &Rc<Self>, resolver: Resolver) -> Outcome {
        let env = Env {
            unit: self.clone(),
            resolver,
        };
        if self.nodes[self.root].is_function_boundary() {
            return Ok(evaluator::arrow_value(&env, self.root, &Scope::default()));
        }
        let evaluator = self.evaluator(self.root);
        evaluator(&env, &Scope::default(), &[])
    }

    /// Current evaluator of owner `index`, built if missing.
    pub(crate) fn evaluator(&self, index: usize) -> Evaluator {
        let Some(cache) = self.nodes[index].cache.as_ref() else {
            return evaluator::build_owner(self, index);
        };
        if let Some(built) = cache.slot.borrow().as_ref() {
            return built.clone();
        }
        let built = evaluator::build_owner(self, index);
        cache.builds.set(cache.builds.get() + 1);
        trace!(node = index, builds = cache.builds.get(), "built evaluator");
        *cache.slot.borrow_mut() = Some(built.clone());
        built
    }

    /// Commit the first-run verdict of hooked node `index`. A slow verdict
    /// invalidates the nearest owner so its next run uses dispatch code.
    pub(crate) fn specialize(&self, index: usize, verdict: Specialization) {
        let Some(hook) = &self.nodes[index].hook else {
            return;
        };
        if hook.get() != Specialization::Generic || verdict == Specialization::Generic {
            return;
        }
        hook.set(verdict);
        debug!(node = index, text = self.text(index), ?verdict, "specialized");
        if verdict == Specialization::Slow {
            if let Some(owner) = self.owner_of(index) {
                if let Some(cache) = &self.nodes[owner].cache {
                    cache.invalidate();
                }
            }
        }
    }

    /// Nearest node, `index` included, that owns an evaluator.
    pub fn owner_of(&self, index: usize) -> Option<usize> {
        let mut current = Some(index);
        while let Some(i) = current {
            if self.nodes[i].cache.is_some() {
                return Some(i);
            }
            current = self.nodes[i].parent;
        }
        None
    }
}

// ── Analysis ────────────────────────────────────────────────────────────────

struct AnalyzeCtx {
    nodes: Vec<CompiledNode>,
}

impl AnalyzeCtx {
    fn push(&mut self, span: Span, parent: Option<usize>, namespace: &Rc<IndexSet<String>>) -> usize {
        self.nodes.push(CompiledNode {
            kind: NodeKind::Sequence,
            span,
            parent,
            children: Vec::new(),
            namespace: namespace.clone(),
            bound_names: Vec::new(),
            deps: BTreeSet::new(),
            is_constructor_target: false,
            is_member_call_target: false,
            is_deferred: false,
            hook: None,
            cache: None,
        });
        self.nodes.len() - 1
    }

    /// Visit `expr`; `args` are the bound names of the nearest arrow.
    fn visit(
        &mut self,
        expr: &Expr,
        parent: Option<usize>,
        namespace: &Rc<IndexSet<String>>,
        args: &Rc<[String]>,
    ) -> Result<usize> {
        let index = self.push(expr.span, parent, namespace);
        let mut children = Vec::new();

        let kind = match &expr.kind {
            ExprKind::Number(n) => NodeKind::Literal(Value::Number(*n)),
            ExprKind::Str(s) => NodeKind::Literal(Value::str(s)),
            ExprKind::Bool(b) => NodeKind::Literal(Value::Bool(*b)),
            ExprKind::Null => NodeKind::Literal(Value::Null),
            ExprKind::Template { quasis, exprs } => {
                for e in exprs {
                    children.push(self.visit(e, Some(index), namespace, args)?);
                }
                NodeKind::Template {
                    quasis: quasis.clone(),
                }
            }
            ExprKind::Ident(name) => {
                let binding = Self::identifier(name, expr.span, namespace, args)?;
                if binding == Binding::External {
                    self.nodes[index].deps.insert(name.clone());
                }
                NodeKind::Identifier {
                    name: name.clone(),
                    binding,
                    shorthand: false,
                }
            }
            ExprKind::Paren(inner) => {
                children.push(self.visit(inner, Some(index), namespace, args)?);
                NodeKind::Paren
            }
            ExprKind::Array(elems) => {
                let mut slots = Vec::with_capacity(elems.len());
                for elem in elems {
                    match elem {
                        ArrayElem::Hole(_) => slots.push(ElemSlot::Hole),
                        ArrayElem::Item(e) => {
                            children.push(self.visit(e, Some(index), namespace, args)?);
                            slots.push(ElemSlot::Item);
                        }
                        ArrayElem::Spread(e) => {
                            children.push(self.visit(e, Some(index), namespace, args)?);
                            slots.push(ElemSlot::Spread);
                        }
                    }
                }
                NodeKind::Array(slots)
            }
            ExprKind::Object(props) => {
                let mut slots = Vec::with_capacity(props.len());
                for prop in props {
                    match &prop.kind {
                        PropKind::KeyValue { key, value } => {
                            children.push(self.visit(value, Some(index), namespace, args)?);
                            slots.push(PropSlot::KeyValue(key.clone()));
                        }
                        PropKind::Computed { key, value } => {
                            children.push(self.visit(key, Some(index), namespace, args)?);
                            children.push(self.visit(value, Some(index), namespace, args)?);
                            slots.push(PropSlot::Computed);
                        }
                        PropKind::Shorthand(e) => {
                            let child = self.visit(e, Some(index), namespace, args)?;
                            let mut key = String::new();
                            if let NodeKind::Identifier {
                                name, shorthand, ..
                            } = &mut self.nodes[child].kind
                            {
                                *shorthand = true;
                                key = name.clone();
                            }
                            children.push(child);
                            slots.push(PropSlot::Shorthand(key));
                        }
                        PropKind::Spread(e) => {
                            children.push(self.visit(e, Some(index), namespace, args)?);
                            slots.push(PropSlot::Spread);
                        }
                    }
                }
                NodeKind::Object(slots)
            }
            ExprKind::Arrow(arrow) => {
                let bound: Vec<String> = arrow.bound_names().iter().map(|i| i.name.clone()).collect();
                for ident in arrow.bound_names() {
                    if is_reserved(&ident.name) || FORM_WORDS.contains(&ident.name.as_str()) {
                        return Err(Error::ReservedWord {
                            name: ident.name.clone(),
                            binding: true,
                            span: ident.span,
                        });
                    }
                }
                let mut inner: IndexSet<String> = (**namespace).clone();
                inner.extend(bound.iter().cloned());
                let inner = Rc::new(inner);
                let inner_args: Rc<[String]> = bound.iter().cloned().collect();

                let mut scope = ParamScope {
                    parent: index,
                    namespace: &inner,
                    args: &inner_args,
                    defaults: &mut children,
                };
                let params = arrow
                    .params
                    .iter()
                    .map(|p| self.param(p, &mut scope))
                    .collect::<Result<Vec<_>>>()?;
                let rest = match &arrow.rest {
                    Some(rest) => Some(self.binder(rest, &mut scope)?),
                    None => None,
                };
                children.push(self.visit(&arrow.body, Some(index), &inner, &inner_args)?);

                self.nodes[index].bound_names = bound;
                self.nodes[index].cache = Some(EvaluatorCache::default());
                NodeKind::Arrow { params, rest }
            }
            ExprKind::Member {
                object,
                property,
                optional,
            } => {
                children.push(self.visit(object, Some(index), namespace, args)?);
                let property = match property {
                    MemberProp::Named(ident) => Some(ident.name.clone()),
                    MemberProp::Computed(key) => {
                        children.push(self.visit(key, Some(index), namespace, args)?);
                        None
                    }
                };
                NodeKind::Member {
                    property,
                    optional: *optional,
                }
            }
            ExprKind::Call { callee, args: call_args } => {
                let form = match &callee.kind {
                    ExprKind::Ident(name) if !namespace.contains(name) => Form::from_name(name)
                        .filter(|_| !call_args.first().is_some_and(|a| a.spread)),
                    _ => None,
                };
                if let Some(form) = form {
                    if form != Form::Throw && call_args.is_empty() {
                        return Err(Error::EmptyCall {
                            name: form.name().to_string(),
                            span: expr.span,
                        });
                    }
                }
                let callee_index = self.visit(callee, Some(index), namespace, args)?;
                if matches!(self.nodes[callee_index].kind, NodeKind::Member { .. }) && form.is_none() {
                    self.nodes[callee_index].is_member_call_target = true;
                }
                children.push(callee_index);
                for (i, arg) in call_args.iter().enumerate() {
                    let child = self.visit(&arg.expr, Some(index), namespace, args)?;
                    if i == 0 && matches!(form, Some(Form::Try | Form::Await)) {
                        self.nodes[child].is_deferred = true;
                        if self.nodes[child].cache.is_none() {
                            self.nodes[child].cache = Some(EvaluatorCache::default());
                        }
                    }
                    children.push(child);
                }
                NodeKind::Call {
                    spreads: call_args.iter().map(|a| a.spread).collect(),
                    form,
                }
            }
            ExprKind::New { callee, args: call_args } => {
                let callee_index = self.visit(callee, Some(index), namespace, args)?;
                self.nodes[callee_index].is_constructor_target = true;
                children.push(callee_index);
                for arg in call_args {
                    children.push(self.visit(&arg.expr, Some(index), namespace, args)?);
                }
                NodeKind::New {
                    spreads: call_args.iter().map(|a| a.spread).collect(),
                }
            }
            ExprKind::Unary { op, operand } => {
                children.push(self.visit(operand, Some(index), namespace, args)?);
                NodeKind::Unary(*op)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                children.push(self.visit(lhs, Some(index), namespace, args)?);
                children.push(self.visit(rhs, Some(index), namespace, args)?);
                NodeKind::Binary(*op)
            }
            ExprKind::Logical { op, lhs, rhs } => {
                children.push(self.visit(lhs, Some(index), namespace, args)?);
                children.push(self.visit(rhs, Some(index), namespace, args)?);
                NodeKind::Logical(*op)
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                for e in [test, consequent, alternate] {
                    children.push(self.visit(e, Some(index), namespace, args)?);
                }
                NodeKind::Conditional
            }
            ExprKind::Sequence(exprs) => {
                for e in exprs {
                    children.push(self.visit(e, Some(index), namespace, args)?);
                }
                NodeKind::Sequence
            }
        };

        let deps: BTreeSet<String> = children
            .iter()
            .flat_map(|&c| self.nodes[c].deps.iter().cloned())
            .collect();
        let node = &mut self.nodes[index];
        node.deps.extend(deps);
        node.kind = kind;
        node.children = children;
        Ok(index)
    }

    fn identifier(
        name: &str,
        span: Span,
        namespace: &IndexSet<String>,
        args: &Rc<[String]>,
    ) -> Result<Binding> {
        if namespace.contains(name) {
            return Ok(Binding::Local);
        }
        if name == "arguments" {
            return Ok(Binding::Arguments(args.clone()));
        }
        if let Some(form) = Form::from_name(name) {
            return Ok(Binding::Form(form));
        }
        if is_reserved(name) {
            return Err(Error::ReservedWord {
                name: name.to_string(),
                binding: false,
                span,
            });
        }
        if builtins::is_global(name) {
            return Ok(Binding::Global);
        }
        Ok(Binding::External)
    }

    fn param(&mut self, elem: &PatternElem, scope: &mut ParamScope<'_>) -> Result<Param> {
        let binder = self.binder(&elem.pattern, scope)?;
        let default = match &elem.default {
            Some(expr) => {
                let child = self.visit(expr, Some(scope.parent), scope.namespace, scope.args)?;
                scope.defaults.push(child);
                Some(scope.defaults.len() - 1)
            }
            None => None,
        };
        Ok(Param { binder, default })
    }

    fn binder(&mut self, pattern: &Pattern, scope: &mut ParamScope<'_>) -> Result<Binder> {
        Ok(match &pattern.kind {
            PatternKind::Ident(ident) => Binder::Name(ident.name.clone()),
            PatternKind::Array { elems, rest } => Binder::Array {
                elems: elems
                    .iter()
                    .map(|e| e.as_ref().map(|e| self.param(e, scope)).transpose())
                    .collect::<Result<_>>()?,
                rest: match rest {
                    Some(rest) => Some(Box::new(self.binder(rest, scope)?)),
                    None => None,
                },
            },
            PatternKind::Object { props, rest } => Binder::Object {
                props: props
                    .iter()
                    .map(|p| Ok((p.key.clone(), self.param(&p.value, scope)?)))
                    .collect::<Result<_>>()?,
                rest: rest.as_ref().map(|r| r.name.clone()),
            },
        })
    }

    /// Install hooks and the root evaluator once the tree is complete.
    fn finish(&mut self, root: usize) {
        for node in &mut self.nodes {
            if is_hooked(node) {
                node.hook = Some(Cell::new(Specialization::Generic));
            }
        }
        if self.nodes[root].cache.is_none() {
            self.nodes[root].cache = Some(EvaluatorCache::default());
        }
    }
}

/// Where arrow parameter defaults are collected while converting patterns.
struct ParamScope<'s> {
    parent: usize,
    namespace: &'s Rc<IndexSet<String>>,
    args: &'s Rc<[String]>,
    defaults: &'s mut Vec<usize>,
}

/// Operations whose behavior depends on operand values at runtime.
fn is_hooked(node: &CompiledNode) -> bool {
    match &node.kind {
        NodeKind::Member { .. } => !node.is_member_call_target,
        NodeKind::Call { form, .. } => form.is_none(),
        NodeKind::New { .. } | NodeKind::Unary(_) => true,
        NodeKind::Binary(op) => op.is_overloadable(),
        NodeKind::Array(slots) => slots.contains(&ElemSlot::Spread),
        NodeKind::Object(slots) => slots.contains(&PropSlot::Spread),
        _ => false,
    }
}
