// src/errors/parser.rs
//! Recorded parse diagnostics.

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

use crate::frontend::Locus;

/// A diagnostic recorded while parsing a module. The rendered message
/// always carries the source line and column, so a log line is useful
/// even without the miette report.
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("{line}:{column}: {message}")]
#[diagnostic(code(marmot::parse))]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub column: u32,
    #[label("{message}")]
    pub span: SourceSpan,
}

impl ParseError {
    pub fn new(locus: Locus, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: locus.line,
            column: locus.column,
            span: SourceSpan::new((locus.offset as usize).into(), 1),
        }
    }

    /// The message text an `Error` AST node carries for this diagnostic.
    pub fn node_message(&self) -> String {
        format!("{}:{}: {}", self.line, self.column, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_contains_line_and_column() {
        let err = ParseError::new(
            Locus {
                line: 3,
                column: 14,
                offset: 40,
            },
            "expected type",
        );
        let text = err.to_string();
        assert!(text.contains("3:14"));
        assert!(text.contains("expected type"));
    }
}
