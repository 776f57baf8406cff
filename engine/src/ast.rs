// AST node types for calcgraph formulas.
//
// One formula is one expression. Every node carries a `SimpleSpan` into the
// formula text; the compiler generates code by splicing child fragments into
// these ranges, so spans must nest and children must be listed in source order.
//
// Preconditions: produced by the parser from a valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use std::fmt;

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

/// An identifier with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    /// `quasis.len() == exprs.len() + 1`.
    Template {
        quasis: Vec<String>,
        exprs: Vec<Expr>,
    },
    Ident(String),
    Paren(Box<Expr>),
    Array(Vec<ArrayElem>),
    Object(Vec<Property>),
    Arrow(Box<Arrow>),
    Member {
        object: Box<Expr>,
        property: MemberProp,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Arg>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Sequence(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayElem {
    Hole(Span),
    Item(Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub kind: PropKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropKind {
    /// `key: value`, `"key": value`, `1: value`.
    KeyValue { key: String, value: Expr },
    /// `[expr]: value`.
    Computed { key: Expr, value: Expr },
    /// `{x}`; the expression is the identifier reference.
    Shorthand(Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemberProp {
    Named(Ident),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub expr: Expr,
    pub spread: bool,
}

// ── Arrow functions and binding patterns ──

#[derive(Debug, Clone, PartialEq)]
pub struct Arrow {
    pub params: Vec<PatternElem>,
    pub rest: Option<Pattern>,
    pub body: Expr,
}

/// A binding target with an optional default value.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternElem {
    pub pattern: Pattern,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub kind: PatternKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternKind {
    Ident(Ident),
    /// `[a, , b = 1, ...rest]`; `None` entries are holes.
    Array {
        elems: Vec<Option<PatternElem>>,
        rest: Option<Box<Pattern>>,
    },
    /// `{a, b: [c], d = 1, ...rest}`.
    Object {
        props: Vec<ObjectPatternProp>,
        rest: Option<Ident>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPatternProp {
    pub key: String,
    pub value: PatternElem,
}

// ── Operators ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
    Typeof,
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Pow,
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    UShr,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    BitAnd,
    BitXor,
    BitOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Plus => "+",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::Typeof => "typeof",
            UnaryOp::Void => "void",
        }
    }

    /// Operators that may be delegated to overloads and elementwise rules.
    pub fn is_overloadable(self) -> bool {
        matches!(self, UnaryOp::Neg | UnaryOp::Plus | UnaryOp::BitNot)
    }
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Pow => "**",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::UShr => ">>>",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::LtEq => "<=",
            BinaryOp::GtEq => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::StrictEq => "===",
            BinaryOp::StrictNotEq => "!==",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::BitOr => "|",
        }
    }

    /// Strict (in)equality compares identity and is never delegated.
    pub fn is_overloadable(self) -> bool {
        !matches!(self, BinaryOp::StrictEq | BinaryOp::StrictNotEq)
    }

    /// Parse an operator symbol as used by `binary_op("-")`.
    pub fn from_symbol(symbol: &str) -> Option<BinaryOp> {
        ALL_BINARY.iter().copied().find(|op| op.as_str() == symbol)
    }
}

const ALL_BINARY: [BinaryOp; 20] = [
    BinaryOp::Pow,
    BinaryOp::Mul,
    BinaryOp::Div,
    BinaryOp::Rem,
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Shl,
    BinaryOp::Shr,
    BinaryOp::UShr,
    BinaryOp::Lt,
    BinaryOp::Gt,
    BinaryOp::LtEq,
    BinaryOp::GtEq,
    BinaryOp::Eq,
    BinaryOp::NotEq,
    BinaryOp::StrictEq,
    BinaryOp::StrictNotEq,
    BinaryOp::BitAnd,
    BinaryOp::BitXor,
    BinaryOp::BitOr,
];

impl UnaryOp {
    pub fn from_symbol(symbol: &str) -> Option<UnaryOp> {
        [
            UnaryOp::Neg,
            UnaryOp::Plus,
            UnaryOp::Not,
            UnaryOp::BitNot,
            UnaryOp::Typeof,
            UnaryOp::Void,
        ]
        .into_iter()
        .find(|op| op.as_str() == symbol)
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Traversal ──

impl Expr {
    /// Direct subexpressions in source order.
    ///
    /// Binding names inside arrow parameters are not expressions; only their
    /// default values are listed.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Number(_)
            | ExprKind::Str(_)
            | ExprKind::Bool(_)
            | ExprKind::Null
            | ExprKind::Ident(_) => Vec::new(),
            ExprKind::Template { exprs, .. } => exprs.iter().collect(),
            ExprKind::Paren(inner) => vec![&**inner],
            ExprKind::Array(elems) => elems
                .iter()
                .filter_map(|e| match e {
                    ArrayElem::Hole(_) => None,
                    ArrayElem::Item(expr) | ArrayElem::Spread(expr) => Some(expr),
                })
                .collect(),
            ExprKind::Object(props) => props
                .iter()
                .flat_map(|p| match &p.kind {
                    PropKind::KeyValue { value, .. } => vec![value],
                    PropKind::Computed { key, value } => vec![key, value],
                    PropKind::Shorthand(expr) | PropKind::Spread(expr) => vec![expr],
                })
                .collect(),
            ExprKind::Arrow(arrow) => {
                let mut out = Vec::new();
                for param in &arrow.params {
                    param.collect_defaults(&mut out);
                }
                if let Some(rest) = &arrow.rest {
                    rest.collect_defaults(&mut out);
                }
                out.push(&arrow.body);
                out
            }
            ExprKind::Member {
                object, property, ..
            } => match property {
                MemberProp::Named(_) => vec![&**object],
                MemberProp::Computed(key) => vec![&**object, &**key],
            },
            ExprKind::Call { callee, args } | ExprKind::New { callee, args } => {
                let mut out = vec![&**callee];
                out.extend(args.iter().map(|a| &a.expr));
                out
            }
            ExprKind::Unary { operand, .. } => vec![&**operand],
            ExprKind::Binary { lhs, rhs, .. } | ExprKind::Logical { lhs, rhs, .. } => {
                vec![&**lhs, &**rhs]
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => vec![&**test, &**consequent, &**alternate],
            ExprKind::Sequence(exprs) => exprs.iter().collect(),
        }
    }
}

impl PatternElem {
    fn collect_defaults<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        self.pattern.collect_defaults(out);
        if let Some(default) = &self.default {
            out.push(default);
        }
    }
}

impl Pattern {
    /// Names bound by this pattern, in source order.
    pub fn bound_names(&self) -> Vec<&Ident> {
        let mut out = Vec::new();
        self.collect_names(&mut out);
        out
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a Ident>) {
        match &self.kind {
            PatternKind::Ident(ident) => out.push(ident),
            PatternKind::Array { elems, rest } => {
                for elem in elems.iter().flatten() {
                    elem.pattern.collect_names(out);
                }
                if let Some(rest) = rest {
                    rest.collect_names(out);
                }
            }
            PatternKind::Object { props, rest } => {
                for prop in props {
                    prop.value.pattern.collect_names(out);
                }
                if let Some(rest) = rest {
                    out.push(rest);
                }
            }
        }
    }

    fn collect_defaults<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        match &self.kind {
            PatternKind::Ident(_) => {}
            PatternKind::Array { elems, rest } => {
                for elem in elems.iter().flatten() {
                    elem.collect_defaults(out);
                }
                if let Some(rest) = rest {
                    rest.collect_defaults(out);
                }
            }
            PatternKind::Object { props, .. } => {
                for prop in props {
                    prop.value.collect_defaults(out);
                }
            }
        }
    }
}

impl Arrow {
    /// All names bound by the parameter list, in source order.
    pub fn bound_names(&self) -> Vec<&Ident> {
        let mut out = Vec::new();
        for param in &self.params {
            param.pattern.collect_names(&mut out);
        }
        if let Some(rest) = &self.rest {
            rest.collect_names(&mut out);
        }
        out
    }
}
