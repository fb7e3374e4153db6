/// Diagnostic engine: KES_nnn error codes and miette-rendered reports with
/// source context.
///
/// Taxonomy:
///   KES_1xx lexical   KES_2xx semantic   KES_3xx compiler limits
///   KES_4xx runtime   KES_5xx system     KES_6xx module

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::errors::FrontendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // KES_1xx: lexical
    LexError = 100,
    // KES_2xx: semantic
    ParseError = 200,
    ResolveError = 210,
    // KES_3xx: compiler limits
    CompileError = 300,
    // KES_4xx: runtime
    RuntimeError = 400,
    // KES_5xx: system
    IoError = 500,
    // KES_6xx: module
    ModuleError = 600,
}

impl ErrorCode {
    pub fn prefix(self) -> String {
        format!("KES_{:03}", self as u32)
    }
}

/// A rendered diagnostic carrying the offending source region.
#[derive(Debug, Error, Diagnostic)]
#[error("[{code_label}] {message}")]
pub struct KesDiagnostic {
    pub code_label: String,
    pub message: String,
    #[source_code]
    pub src: NamedSource,
    #[label("here")]
    pub span: SourceSpan,
    #[help]
    pub help: Option<String>,
}

pub struct DiagnosticEngine {
    path: String,
    source: String,
}

impl DiagnosticEngine {
    pub fn new(path: impl Into<String>, source: impl Into<String>) -> DiagnosticEngine {
        DiagnosticEngine {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Byte span covering the given 1-based source line.
    fn line_span(&self, line: u32) -> SourceSpan {
        if line == 0 {
            return SourceSpan::from(0..0);
        }
        let mut start = 0usize;
        let mut current = 1u32;
        for (offset, ch) in self.source.char_indices() {
            if current == line {
                start = offset;
                break;
            }
            if ch == '\n' {
                current += 1;
                start = offset + 1;
            }
        }
        let end = self.source[start..]
            .find('\n')
            .map(|pos| start + pos)
            .unwrap_or(self.source.len());
        SourceSpan::from(start..end)
    }

    pub fn from_frontend(&self, error: &FrontendError) -> KesDiagnostic {
        let code = match error {
            FrontendError::Lex(_) => ErrorCode::LexError,
            FrontendError::Parse(_) => ErrorCode::ParseError,
            FrontendError::Resolve(_) => ErrorCode::ResolveError,
            FrontendError::Compile(_) => ErrorCode::CompileError,
        };
        let help = match error {
            FrontendError::Resolve(_) => {
                Some("Check declarations and scopes around this line.".to_string())
            }
            FrontendError::Compile(_) => {
                Some("The construct exceeds a compiler limit; split it up.".to_string())
            }
            _ => None,
        };
        KesDiagnostic {
            code_label: code.prefix(),
            message: error.to_string(),
            src: NamedSource::new(self.path.clone(), self.source.clone()),
            span: self.line_span(error.line()),
            help,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ParseError, Span};

    #[test]
    fn test_line_span_targets_the_right_line() {
        let engine = DiagnosticEngine::new("test.kes", "one\ntwo\nthree\n");
        let span = engine.line_span(2);
        assert_eq!(span.offset(), 4);
        assert_eq!(span.len(), 3);
    }

    #[test]
    fn test_frontend_error_maps_to_code() {
        let engine = DiagnosticEngine::new("test.kes", "val = 1;\n");
        let error = FrontendError::Parse(ParseError {
            message: "Expect variable name.".into(),
            span: Span::new(0, 0, 1),
        });
        let diagnostic = engine.from_frontend(&error);
        assert_eq!(diagnostic.code_label, "KES_200");
        assert!(diagnostic.message.contains("Expect variable name."));
    }
}
