// Lexer for calcgraph formulas.
//
// Tokenizes one formula (an expression in a JavaScript-like syntax) using the
// `logos` crate. Template literals are scanned by a callback that records the
// byte ranges of their `${...}` holes; the parser lexes those ranges again.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;
use std::ops::Range;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// One piece of a template literal.
///
/// Hole offsets are relative to the start of the template token (the
/// opening backtick is offset 0).
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Hole { start: usize, end: usize },
}

/// Formula token types.
///
/// Identifiers carry no value; use the span to retrieve the text. Reserved
/// words that the grammar does not use lex as identifiers and are rejected
/// later by scope analysis.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+|//[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,
    #[token("new")]
    New,
    #[token("typeof")]
    Typeof,
    #[token("void")]
    Void,

    // ── Grouping ──
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("...")]
    Ellipsis,
    #[token("?")]
    Question,
    #[token("?.")]
    QuestionDot,
    #[token(":")]
    Colon,
    #[token("=>")]
    FatArrow,
    #[token("=")]
    Assign,

    // ── Operators ──
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    StarStar,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("!")]
    Bang,
    #[token("~")]
    Tilde,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("??")]
    Nullish,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token(">>>")]
    UShr,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("===")]
    EqEqEq,
    #[token("!==")]
    NotEqEq,

    // ── Literals ──
    /// Numeric literal: decimal, leading-dot decimal, exponent or hex.
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", parse_number)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", parse_number)]
    #[regex(r"0[xX][0-9a-fA-F]+", parse_hex)]
    Number(f64),

    /// Single- or double-quoted string with backslash escapes.
    #[regex(r#""([^"\\\n]|\\.)*""#, parse_string)]
    #[regex(r#"'([^'\\\n]|\\.)*'"#, parse_string)]
    Str(String),

    /// Template literal; the callback scans up to the closing backtick.
    #[token("`", scan_template)]
    Template(Vec<TemplatePart>),

    /// Identifier: `[A-Za-z_$][A-Za-z0-9_$]*`
    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*")]
    Ident,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            Token::New => "new",
            Token::Typeof => "typeof",
            Token::Void => "void",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Ellipsis => "...",
            Token::Question => "?",
            Token::QuestionDot => "?.",
            Token::Colon => ":",
            Token::FatArrow => "=>",
            Token::Assign => "=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::StarStar => "**",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Bang => "!",
            Token::Tilde => "~",
            Token::Amp => "&",
            Token::Pipe => "|",
            Token::Caret => "^",
            Token::AmpAmp => "&&",
            Token::PipePipe => "||",
            Token::Nullish => "??",
            Token::Shl => "<<",
            Token::Shr => ">>",
            Token::UShr => ">>>",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::LtEq => "<=",
            Token::GtEq => ">=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::EqEqEq => "===",
            Token::NotEqEq => "!==",
            Token::Number(v) => return write!(f, "{v}"),
            Token::Str(s) => return write!(f, "{s:?}"),
            Token::Template(_) => "<template>",
            Token::Ident => "<ident>",
        };
        f.write_str(text)
    }
}

// ── Callbacks ──

fn parse_number(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_hex(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    u64::from_str_radix(&lex.slice()[2..], 16)
        .ok()
        .map(|v| v as f64)
}

fn parse_string(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let slice = lex.slice();
    unescape(&slice[1..slice.len() - 1])
}

/// Resolve backslash escapes. Returns `None` on a malformed escape.
fn unescape(raw: &str) -> Option<String> {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next()? {
            'n' => result.push('\n'),
            't' => result.push('\t'),
            'r' => result.push('\r'),
            'b' => result.push('\u{8}'),
            'f' => result.push('\u{c}'),
            'v' => result.push('\u{b}'),
            '0' => result.push('\0'),
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                result.push(char::from_u32(u32::from_str_radix(&hex, 16).ok()?)?);
            }
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                result.push(char::from_u32(u32::from_str_radix(&hex, 16).ok()?)?);
            }
            '\n' => {}
            other => result.push(other),
        }
    }
    Some(result)
}

fn scan_template(lex: &mut logos::Lexer<'_, Token>) -> Option<Vec<TemplatePart>> {
    let rest = lex.remainder();
    let bytes = rest.as_bytes();
    let mut parts = Vec::new();
    let mut raw_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'`' => {
                if raw_start < i {
                    parts.push(TemplatePart::Text(unescape(&rest[raw_start..i])?));
                }
                lex.bump(i + 1);
                return Some(parts);
            }
            b'\\' => i += 2,
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                if raw_start < i {
                    parts.push(TemplatePart::Text(unescape(&rest[raw_start..i])?));
                }
                let close = matching_brace(bytes, i + 2)?;
                // +1 accounts for the opening backtick.
                parts.push(TemplatePart::Hole {
                    start: i + 3,
                    end: close + 1,
                });
                i = close + 1;
                raw_start = i;
            }
            _ => i += 1,
        }
    }
    None
}

/// Index of the `}` closing a hole whose body starts at `from`.
fn matching_brace(bytes: &[u8], from: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' if depth == 0 => return Some(i),
            b'}' => depth -= 1,
            quote @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            b'`' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'`' {
                    match bytes[i] {
                        b'\\' => i += 1,
                        b'$' if bytes.get(i + 1) == Some(&b'{') => {
                            i = matching_brace(bytes, i + 2)?;
                        }
                        _ => {}
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

// ── Public API ──

/// Lex a formula into tokens.
///
/// Returns all successfully lexed tokens together with any errors for
/// unrecognised characters. Lexing is non-fatal: errors are collected and
/// the lexer continues past bad characters.
pub fn lex(source: &str) -> LexResult {
    lex_range(source, 0..source.len())
}

/// Lex `source[range]`, reporting spans as offsets into the whole `source`.
pub fn lex_range(source: &str, range: Range<usize>) -> LexResult {
    let offset = range.start;
    let text = &source[range];
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in Token::lexer(text).spanned() {
        let span = Span {
            start: range.start + offset,
            end: range.end + offset,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: match text[range.clone()].chars().next() {
                    Some('`') => "unterminated template literal".to_string(),
                    Some('"') | Some('\'') => "unterminated string literal".to_string(),
                    _ => format!("unexpected character: {:?}", &text[range]),
                },
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_ok(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(
            result.errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.errors
        );
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn keywords_and_reserved_words() {
        let tokens = lex_ok("true false null new typeof void function this");
        assert_eq!(
            tokens,
            vec![
                Token::True,
                Token::False,
                Token::Null,
                Token::New,
                Token::Typeof,
                Token::Void,
                Token::Ident,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn longest_operator_wins() {
        let tokens = lex_ok("a >>> b !== c ** d ?? e ... f => g");
        let ops: Vec<Token> = tokens.into_iter().filter(|t| *t != Token::Ident).collect();
        assert_eq!(
            ops,
            vec![
                Token::UShr,
                Token::NotEqEq,
                Token::StarStar,
                Token::Nullish,
                Token::Ellipsis,
                Token::FatArrow,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(lex_ok("42"), vec![Token::Number(42.0)]);
        assert_eq!(lex_ok("3.5e2"), vec![Token::Number(350.0)]);
        assert_eq!(lex_ok(".25"), vec![Token::Number(0.25)]);
        assert_eq!(lex_ok("0xff"), vec![Token::Number(255.0)]);
    }

    #[test]
    fn strings_with_escapes() {
        assert_eq!(lex_ok(r#""a\"b""#), vec![Token::Str("a\"b".into())]);
        assert_eq!(lex_ok(r"'it\'s\n'"), vec![Token::Str("it's\n".into())]);
    }

    #[test]
    fn template_holes_are_located() {
        let source = "`x=${a + 1}, y=${ {b: 2}.b }`";
        let result = lex(source);
        assert!(result.errors.is_empty());
        let (token, span) = &result.tokens[0];
        let Token::Template(parts) = token else {
            panic!("expected template, got {token:?}");
        };
        assert_eq!(span.end, source.len());
        let holes: Vec<&str> = parts
            .iter()
            .filter_map(|p| match p {
                TemplatePart::Hole { start, end } => Some(&source[*start..*end]),
                TemplatePart::Text(_) => None,
            })
            .collect();
        assert_eq!(holes, vec!["a + 1", " {b: 2}.b "]);
        assert_eq!(parts[0], TemplatePart::Text("x=".into()));
    }

    #[test]
    fn unterminated_template_is_an_error() {
        let result = lex("`abc ${x}");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].message, "unterminated template literal");
    }

    #[test]
    fn range_spans_are_absolute() {
        let source = "`${foo}`";
        let result = lex_range(source, 3..6);
        assert_eq!(result.tokens, vec![(Token::Ident, Span { start: 3, end: 6 })]);
    }

    #[test]
    fn comments_skipped() {
        assert_eq!(lex_ok("a // trailing\n+ b"), vec![Token::Ident, Token::Plus, Token::Ident]);
    }

    #[test]
    fn error_recovery() {
        let result = lex("a # b");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.tokens.len(), 2);
    }
}
