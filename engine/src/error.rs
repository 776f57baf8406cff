//! Compile-time errors
//!
//! Failures raised synchronously by `Compilation::new`, `CalcNode::update`
//! and `Graph::update`. Evaluation failures are values, not `Error`s.

use thiserror::Error;

use crate::ast::Span;
use crate::diag::{codes, DiagLevel, Diagnostic};

/// Compile result type
pub type Result<T> = std::result::Result<T, Error>;

/// Compile errors
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("{}", render_all(.0))]
    Parse(Vec<Diagnostic>),

    #[error("{}", reserved_word_message(.name, .binding))]
    ReservedWord {
        name: String,
        binding: bool,
        span: Span,
    },

    #[error("{name} requires at least one argument")]
    EmptyCall { name: String, span: Span },
}

fn render_all(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn reserved_word_message(name: &str, binding: &bool) -> String {
    if *binding {
        format!("Cannot use a reserved word {name} as a parameter name")
    } else {
        format!("Cannot refer to a reserved word {name} as a dependency")
    }
}

impl Error {
    /// The error as positioned diagnostics.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Error::Parse(diagnostics) => diagnostics.clone(),
            Error::ReservedWord { span, .. } => {
                vec![Diagnostic::new(DiagLevel::Error, *span, self.to_string()).with_code(codes::E0100)]
            }
            Error::EmptyCall { name, span } => vec![Diagnostic::new(
                DiagLevel::Error,
                *span,
                self.to_string(),
            )
            .with_code(codes::E0101)
            .with_hint(format!("{name}(expression) evaluates its argument lazily"))],
        }
    }
}
