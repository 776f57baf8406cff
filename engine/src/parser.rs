// Parser for calcgraph formulas.
//
// Parses a token stream (from the lexer) into one expression tree using
// chumsky combinators. Precedence follows JavaScript: sequence, arrow /
// conditional, `|| ??`, `&&`, `|`, `^`, `&`, equality, relational, shift,
// additive, multiplicative, `**` (right-associative), prefix unary, then
// member / call / `new` chains over primaries.
//
// Preconditions: input is a valid token stream from `lexer::lex_range()`.
// Postconditions: returns the expression plus any diagnostics.
// Failure modes: lex and syntax errors produce `Diagnostic`s with codes
//   E0001 (lex) and E0002 (parse).
// Side effects: none.

use std::ops::Range;

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::lexer::{TemplatePart, Token};

/// Result of parsing: the expression (if any) plus diagnostics.
#[derive(Debug)]
pub struct ParseResult {
    pub expr: Option<Expr>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ParseResult {
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty() && self.expr.is_some()
    }
}

/// Parse one formula. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    parse_range(source, 0..source.len())
}

/// Parse `source[range]` as one expression. Spans stay absolute, which lets
/// template-literal holes be parsed in place.
pub fn parse_range(source: &str, range: Range<usize>) -> ParseResult {
    let lex_result = crate::lexer::lex_range(source, range.clone());
    let mut diagnostics: Vec<Diagnostic> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            Diagnostic::new(DiagLevel::Error, (e.span.start..e.span.end).into(), e.message)
                .with_code(codes::E0001)
        })
        .collect();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (range.end..range.end).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = expr_parser(source).then_ignore(end());
    let (expr, parse_errors) = parser.parse(stream).into_output_errors();

    diagnostics.extend(parse_errors.into_iter().map(|e| {
        Diagnostic::new(DiagLevel::Error, *e.span(), e.to_string()).with_code(codes::E0002)
    }));

    ParseResult { expr, diagnostics }
}

// ── Helpers ──

fn join(a: Span, b: Span) -> Span {
    (a.start()..b.end()).into()
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr {
        span: join(lhs.span, rhs.span),
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}

fn logical(op: LogicalOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr {
        span: join(lhs.span, rhs.span),
        kind: ExprKind::Logical {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}

fn ident_pattern(id: Ident) -> Pattern {
    Pattern {
        span: id.span,
        kind: PatternKind::Ident(id),
    }
}

/// Build a template expression, parsing each `${...}` hole in place.
fn template<'a>(
    source: &str,
    parts: Vec<TemplatePart>,
    span: SimpleSpan,
) -> Result<Expr, Rich<'a, Token, SimpleSpan>> {
    let mut quasis = vec![String::new()];
    let mut exprs = Vec::new();
    for part in parts {
        match part {
            TemplatePart::Text(text) => {
                if let Some(last) = quasis.last_mut() {
                    last.push_str(&text);
                }
            }
            TemplatePart::Hole { start, end } => {
                let range = span.start() + start..span.start() + end;
                let inner = parse_range(source, range);
                if let Some(diag) = inner.diagnostics.first() {
                    return Err(Rich::custom(
                        diag.span,
                        format!("in template literal: {}", diag.message),
                    ));
                }
                let Some(expr) = inner.expr else {
                    return Err(Rich::custom(span, "empty template literal hole"));
                };
                exprs.push(expr);
                quasis.push(String::new());
            }
        }
    }
    Ok(Expr {
        kind: ExprKind::Template { quasis, exprs },
        span,
    })
}

// ── Main parser builder ──
//
// All grammar rules are built inside `expr_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn expr_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Expr, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    // Object keys: identifiers, strings and numbers.
    let prop_key = select! {
        Token::Str(s) => s,
        Token::Number(n) => crate::value::format_number(n),
    }
    .or(ident.clone().map(|id| id.name));

    let assign = recursive(move |assign| {
        let sequence = assign
            .clone()
            .separated_by(just(Token::Comma))
            .at_least(1)
            .collect::<Vec<Expr>>()
            .map_with(|mut exprs, e| {
                if exprs.len() == 1 {
                    exprs.swap_remove(0)
                } else {
                    Expr {
                        kind: ExprKind::Sequence(exprs),
                        span: e.span(),
                    }
                }
            });

        // ── Binding patterns ──

        let pattern = recursive({
            let assign = assign.clone();
            let ident = ident.clone();
            let prop_key = prop_key.clone();
            move |pattern| {
                let elem = pattern
                    .clone()
                    .then(just(Token::Assign).ignore_then(assign.clone()).or_not())
                    .map(|(pattern, default)| PatternElem { pattern, default });

                let array_pat = elem
                    .clone()
                    .or_not()
                    .separated_by(just(Token::Comma))
                    .collect::<Vec<_>>()
                    .then(just(Token::Ellipsis).ignore_then(pattern.clone()).or_not())
                    .delimited_by(just(Token::LBracket), just(Token::RBracket))
                    .map_with(|(mut elems, rest), e| {
                        // A trailing comma (or `[]`) leaves one empty slot.
                        if matches!(elems.last(), Some(None)) {
                            elems.pop();
                        }
                        Pattern {
                            kind: PatternKind::Array {
                                elems,
                                rest: rest.map(Box::new),
                            },
                            span: e.span(),
                        }
                    });

                let prop_pat = choice((
                    prop_key
                        .clone()
                        .then_ignore(just(Token::Colon))
                        .then(elem.clone())
                        .map(|(key, value)| ObjectPatternProp { key, value }),
                    ident
                        .clone()
                        .then(just(Token::Assign).ignore_then(assign.clone()).or_not())
                        .map(|(id, default)| ObjectPatternProp {
                            key: id.name.clone(),
                            value: PatternElem {
                                pattern: ident_pattern(id),
                                default,
                            },
                        }),
                ));

                let object_pat = prop_pat
                    .separated_by(just(Token::Comma))
                    .allow_trailing()
                    .collect::<Vec<_>>()
                    .then(just(Token::Ellipsis).ignore_then(ident.clone()).or_not())
                    .delimited_by(just(Token::LBrace), just(Token::RBrace))
                    .map_with(|(props, rest), e| Pattern {
                        kind: PatternKind::Object { props, rest },
                        span: e.span(),
                    });

                choice((ident.clone().map(ident_pattern), array_pat, object_pat)).boxed()
            }
        });

        let pattern_elem = pattern
            .clone()
            .then(just(Token::Assign).ignore_then(assign.clone()).or_not())
            .map(|(pattern, default)| PatternElem { pattern, default });

        // ── Arrow functions ──

        let single_param = ident.clone().map(|id| {
            (
                vec![PatternElem {
                    pattern: ident_pattern(id),
                    default: None,
                }],
                None,
            )
        });

        let param_list = pattern_elem
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .then(just(Token::Ellipsis).ignore_then(pattern.clone()).or_not())
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let arrow = single_param
            .or(param_list)
            .then_ignore(just(Token::FatArrow))
            .then(assign.clone())
            .map_with(|((params, rest), body), e| Expr {
                kind: ExprKind::Arrow(Box::new(Arrow { params, rest, body })),
                span: e.span(),
            })
            .boxed();

        // ── Primaries ──

        let literal = select! {
            Token::Number(n) => ExprKind::Number(n),
            Token::Str(s) => ExprKind::Str(s),
            Token::True => ExprKind::Bool(true),
            Token::False => ExprKind::Bool(false),
            Token::Null => ExprKind::Null,
        }
        .map_with(|kind, e| Expr {
            kind,
            span: e.span(),
        });

        let template_lit = select! { Token::Template(parts) => parts }
            .try_map(move |parts, span| template(source, parts, span));

        let ident_expr = ident.clone().map(|id| Expr {
            kind: ExprKind::Ident(id.name),
            span: id.span,
        });

        let paren = sequence
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .map_with(|inner, e| Expr {
                kind: ExprKind::Paren(Box::new(inner)),
                span: e.span(),
            });

        let array_elem = choice((
            just(Token::Ellipsis)
                .ignore_then(assign.clone())
                .map(ArrayElem::Spread),
            assign.clone().map(ArrayElem::Item),
            empty().map_with(|_, e| ArrayElem::Hole(e.span())),
        ));

        let array = array_elem
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .map_with(|mut elems, e| {
                if matches!(elems.last(), Some(ArrayElem::Hole(_))) {
                    elems.pop();
                }
                Expr {
                    kind: ExprKind::Array(elems),
                    span: e.span(),
                }
            });

        let property = choice((
            just(Token::Ellipsis)
                .ignore_then(assign.clone())
                .map(PropKind::Spread),
            assign
                .clone()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .then_ignore(just(Token::Colon))
                .then(assign.clone())
                .map(|(key, value)| PropKind::Computed { key, value }),
            prop_key
                .clone()
                .then_ignore(just(Token::Colon))
                .then(assign.clone())
                .map(|(key, value)| PropKind::KeyValue { key, value }),
            ident_expr.clone().map(PropKind::Shorthand),
        ))
        .map_with(|kind, e| Property {
            kind,
            span: e.span(),
        });

        let object = property
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .map_with(|props, e| Expr {
                kind: ExprKind::Object(props),
                span: e.span(),
            });

        let primary = choice((literal, template_lit, ident_expr, paren, array, object)).boxed();

        // ── Member / call / new chains ──

        let args = just(Token::Ellipsis)
            .or_not()
            .then(assign.clone())
            .map(|(spread, expr)| Arg {
                expr,
                spread: spread.is_some(),
            })
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .map_with(|args, e| (args, e.span()));

        let member_suffix = choice((
            just(Token::Dot)
                .ignore_then(ident.clone())
                .map(|name| (MemberProp::Named(name), false)),
            just(Token::QuestionDot)
                .ignore_then(ident.clone())
                .map(|name| (MemberProp::Named(name), true)),
            sequence
                .clone()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .map(|key| (MemberProp::Computed(Box::new(key)), false)),
        ))
        .map_with(|(property, optional), e| (property, optional, e.span()));

        let member = |object: Expr, (property, optional, span): (MemberProp, bool, SimpleSpan)| Expr {
            span: join(object.span, span),
            kind: ExprKind::Member {
                object: Box::new(object),
                property,
                optional,
            },
        };

        // `new` binds to a member chain and an optional argument list.
        let new_expr = just(Token::New)
            .map_with(|_, e| e.span())
            .then(primary.clone().foldl(member_suffix.clone().repeated(), member))
            .then(args.clone().or_not())
            .map(|((new_span, callee), args)| {
                let (args, end) = match args {
                    Some((args, span)) => (args, span),
                    None => (Vec::new(), callee.span),
                };
                Expr {
                    span: join(new_span, end),
                    kind: ExprKind::New {
                        callee: Box::new(callee),
                        args,
                    },
                }
            });

        enum Suffix {
            Member((MemberProp, bool, SimpleSpan)),
            Call((Vec<Arg>, SimpleSpan)),
        }

        let postfix = new_expr
            .or(primary)
            .foldl(
                choice((
                    member_suffix.map(Suffix::Member),
                    args.map(Suffix::Call),
                ))
                .repeated(),
                move |lhs, suffix| match suffix {
                    Suffix::Member(m) => member(lhs, m),
                    Suffix::Call((args, span)) => Expr {
                        span: join(lhs.span, span),
                        kind: ExprKind::Call {
                            callee: Box::new(lhs),
                            args,
                        },
                    },
                },
            )
            .boxed();

        // ── Unary and exponent ──

        let unary = recursive(move |unary| {
            let exponent = postfix
                .clone()
                .then(just(Token::StarStar).ignore_then(unary.clone()).or_not())
                .map(|(lhs, rhs)| match rhs {
                    Some(rhs) => binary(BinaryOp::Pow, lhs, rhs),
                    None => lhs,
                });

            let prefix = select! {
                Token::Minus => UnaryOp::Neg,
                Token::Plus => UnaryOp::Plus,
                Token::Bang => UnaryOp::Not,
                Token::Tilde => UnaryOp::BitNot,
                Token::Typeof => UnaryOp::Typeof,
                Token::Void => UnaryOp::Void,
            }
            .map_with(|op, e| (op, e.span()));

            prefix
                .then(unary)
                .map(|((op, span), operand): ((UnaryOp, SimpleSpan), Expr)| Expr {
                    span: join(span, operand.span),
                    kind: ExprKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                })
                .or(exponent)
                .boxed()
        });

        // ── Binary precedence levels ──

        macro_rules! binary_level {
            ($prev:expr, $ops:expr) => {
                $prev
                    .clone()
                    .foldl($ops.then($prev.clone()).repeated(), |lhs, (op, rhs)| {
                        binary(op, lhs, rhs)
                    })
                    .boxed()
            };
        }

        let multiplicative = binary_level!(
            unary,
            select! {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
            }
        );
        let additive = binary_level!(
            multiplicative,
            select! {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
            }
        );
        let shift = binary_level!(
            additive,
            select! {
                Token::Shl => BinaryOp::Shl,
                Token::Shr => BinaryOp::Shr,
                Token::UShr => BinaryOp::UShr,
            }
        );
        let relational = binary_level!(
            shift,
            select! {
                Token::Lt => BinaryOp::Lt,
                Token::Gt => BinaryOp::Gt,
                Token::LtEq => BinaryOp::LtEq,
                Token::GtEq => BinaryOp::GtEq,
            }
        );
        let equality = binary_level!(
            relational,
            select! {
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                Token::EqEqEq => BinaryOp::StrictEq,
                Token::NotEqEq => BinaryOp::StrictNotEq,
            }
        );
        let bit_and = binary_level!(equality, just(Token::Amp).to(BinaryOp::BitAnd));
        let bit_xor = binary_level!(bit_and, just(Token::Caret).to(BinaryOp::BitXor));
        let bit_or = binary_level!(bit_xor, just(Token::Pipe).to(BinaryOp::BitOr));

        let logical_and = bit_or
            .clone()
            .foldl(
                just(Token::AmpAmp).ignore_then(bit_or).repeated(),
                |lhs, rhs| logical(LogicalOp::And, lhs, rhs),
            )
            .boxed();
        let logical_or = logical_and
            .clone()
            .foldl(
                select! {
                    Token::PipePipe => LogicalOp::Or,
                    Token::Nullish => LogicalOp::Nullish,
                }
                .then(logical_and)
                .repeated(),
                |lhs, (op, rhs)| logical(op, lhs, rhs),
            )
            .boxed();

        // ── Conditional ──

        let conditional = logical_or
            .then(
                just(Token::Question)
                    .ignore_then(assign.clone())
                    .then_ignore(just(Token::Colon))
                    .then(assign.clone())
                    .or_not(),
            )
            .map(|(test, branches)| match branches {
                Some((consequent, alternate)) => Expr {
                    span: join(test.span, alternate.span),
                    kind: ExprKind::Conditional {
                        test: Box::new(test),
                        consequent: Box::new(consequent),
                        alternate: Box::new(alternate),
                    },
                },
                None => test,
            });

        arrow.or(conditional).boxed()
    });

    assign
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<Expr>>()
        .map_with(|mut exprs, e| {
            if exprs.len() == 1 {
                exprs.swap_remove(0)
            } else {
                Expr {
                    kind: ExprKind::Sequence(exprs),
                    span: e.span(),
                }
            }
        })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Expr {
        let result = parse(source);
        assert!(
            result.diagnostics.is_empty(),
            "unexpected errors for {source:?}: {:?}",
            result.diagnostics
        );
        result.expr.expect("no expression produced")
    }

    fn text(source: &str, expr: &Expr) -> String {
        source[expr.span.start()..expr.span.end()].to_string()
    }

    #[test]
    fn literals() {
        assert_eq!(parse_ok("42").kind, ExprKind::Number(42.0));
        assert_eq!(parse_ok("'hi'").kind, ExprKind::Str("hi".into()));
        assert_eq!(parse_ok("true").kind, ExprKind::Bool(true));
        assert_eq!(parse_ok("null").kind, ExprKind::Null);
    }

    #[test]
    fn precedence_of_arithmetic() {
        let source = "1 + 2 * 3";
        let expr = parse_ok(source);
        let ExprKind::Binary { op, rhs, .. } = &expr.kind else {
            panic!("expected binary, got {expr:?}");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert_eq!(text(source, rhs), "2 * 3");
    }

    #[test]
    fn exponent_is_right_associative() {
        let source = "2 ** 3 ** 2";
        let expr = parse_ok(source);
        let ExprKind::Binary { op, lhs, rhs } = &expr.kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Pow);
        assert_eq!(text(source, lhs), "2");
        assert_eq!(text(source, rhs), "3 ** 2");
    }

    #[test]
    fn member_call_chain_spans() {
        let source = "r.map(i => i + 1)[0]";
        let expr = parse_ok(source);
        assert_eq!(text(source, &expr), source);
        let ExprKind::Member { object, .. } = &expr.kind else {
            panic!("expected member");
        };
        let ExprKind::Call { callee, args } = &object.kind else {
            panic!("expected call");
        };
        assert_eq!(text(source, callee), "r.map");
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0].expr.kind, ExprKind::Arrow(_)));
    }

    #[test]
    fn arrow_with_destructuring_defaults_and_rest() {
        let source = "([{y: {z1 = 5, ...z2} = {x: 6}}, z3, ...z4]) => z1 * z3";
        let expr = parse_ok(source);
        let ExprKind::Arrow(arrow) = &expr.kind else {
            panic!("expected arrow");
        };
        assert_eq!(arrow.params.len(), 1);
        let names: Vec<&str> = arrow.bound_names().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["z1", "z2", "z3", "z4"]);
        let defaults: Vec<String> = expr.children().iter().map(|c| text(source, c)).collect();
        assert_eq!(defaults, vec!["5", "{x: 6}", "z1 * z3"]);
    }

    #[test]
    fn parenthesized_expression_is_not_an_arrow() {
        let expr = parse_ok("(a, b)");
        let ExprKind::Paren(inner) = &expr.kind else {
            panic!("expected paren");
        };
        assert!(matches!(inner.kind, ExprKind::Sequence(ref items) if items.len() == 2));
    }

    #[test]
    fn array_holes_and_spread() {
        let expr = parse_ok("[...z, , a]");
        let ExprKind::Array(elems) = &expr.kind else {
            panic!("expected array");
        };
        assert_eq!(elems.len(), 3);
        assert!(matches!(elems[0], ArrayElem::Spread(_)));
        assert!(matches!(elems[1], ArrayElem::Hole(_)));
        assert!(matches!(elems[2], ArrayElem::Item(_)));
        let ExprKind::Array(empty) = parse_ok("[]").kind else {
            panic!("expected array");
        };
        assert!(empty.is_empty());
    }

    #[test]
    fn object_literal_forms() {
        let expr = parse_ok("{a: 1, 'b': 2, [c]: 3, d, ...e}");
        let ExprKind::Object(props) = &expr.kind else {
            panic!("expected object");
        };
        assert!(matches!(&props[0].kind, PropKind::KeyValue { key, .. } if key == "a"));
        assert!(matches!(&props[1].kind, PropKind::KeyValue { key, .. } if key == "b"));
        assert!(matches!(props[2].kind, PropKind::Computed { .. }));
        assert!(matches!(props[3].kind, PropKind::Shorthand(_)));
        assert!(matches!(props[4].kind, PropKind::Spread(_)));
    }

    #[test]
    fn new_with_and_without_arguments() {
        let expr = parse_ok("new Array(3)");
        assert!(matches!(&expr.kind, ExprKind::New { args, .. } if args.len() == 1));
        let expr = parse_ok("new Foo.Bar");
        assert!(matches!(&expr.kind, ExprKind::New { args, .. } if args.is_empty()));
    }

    #[test]
    fn template_holes_parse_with_absolute_spans() {
        let source = "`sum=${a + b}!`";
        let expr = parse_ok(source);
        let ExprKind::Template { quasis, exprs } = &expr.kind else {
            panic!("expected template");
        };
        assert_eq!(quasis, &vec!["sum=".to_string(), "!".to_string()]);
        assert_eq!(text(source, &exprs[0]), "a + b");
    }

    #[test]
    fn conditional_and_logical() {
        let source = "x > a ? x - a : a ?? 0";
        let expr = parse_ok(source);
        let ExprKind::Conditional { alternate, .. } = &expr.kind else {
            panic!("expected conditional");
        };
        assert!(matches!(alternate.kind, ExprKind::Logical { op: LogicalOp::Nullish, .. }));
    }

    #[test]
    fn syntax_error_reports_e0002() {
        let result = parse("a +");
        assert!(result.expr.is_none());
        assert_eq!(result.diagnostics[0].code, Some(codes::E0002));
    }

    #[test]
    fn lex_error_reports_e0001() {
        let result = parse("a # b");
        assert!(result.diagnostics.iter().any(|d| d.code == Some(codes::E0001)));
    }
}
