/// Error types for every phase of the pipeline.
///
/// Front-end errors (lex, parse, resolve, compile) abort compilation and map
/// to exit code 65. Runtime failures surface as catchable exceptions inside
/// the VM; the ones that escape every handler unwind to the host as a
/// `RuntimeFatal` and map to exit code 70.

use std::fmt;

/// A line/byte position inside a single source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: u32,
}

impl Span {
    pub fn new(start: usize, end: usize, line: u32) -> Self {
        Span { start, end, line }
    }
}

// ---------------------------------------------------------------------------
// Lex errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum LexError {
    UnexpectedCharacter { ch: char, span: Span },
    UnterminatedString { span: Span },
    UnterminatedComment { span: Span },
    InvalidEscape { text: String, span: Span },
    InterpolationTooDeep { span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnexpectedCharacter { span, .. }
            | LexError::UnterminatedString { span }
            | LexError::UnterminatedComment { span }
            | LexError::InvalidEscape { span, .. }
            | LexError::InterpolationTooDeep { span } => *span,
        }
    }
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::UnexpectedCharacter { ch, .. } => {
                write!(f, "Unexpected character '{}'", ch)
            }
            LexError::UnterminatedString { .. } => write!(f, "Unterminated string literal"),
            LexError::UnterminatedComment { .. } => write!(f, "Unterminated block comment"),
            LexError::InvalidEscape { text, .. } => {
                write!(f, "Invalid escape sequence '\\{}'", text)
            }
            LexError::InterpolationTooDeep { .. } => {
                write!(f, "String interpolation nested too deeply (limit is 15)")
            }
        }
    }
}

impl std::error::Error for LexError {}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseError {}

// ---------------------------------------------------------------------------
// Resolve errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResolveError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ResolveError {}

// ---------------------------------------------------------------------------
// Compile errors (emitter limits and unrepresentable constructs)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

// ---------------------------------------------------------------------------
// Runtime fatal — an error that escaped every exception handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RuntimeFatal {
    /// `<full class name>: <message>` for unhandled exceptions.
    pub message: String,
    /// One `in <function> from <module> at line <n>` entry per live frame,
    /// innermost first, captured at throw time.
    pub stack_trace: Vec<String>,
}

impl fmt::Display for RuntimeFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Unhandled {}", self.message)?;
        for entry in &self.stack_trace {
            writeln!(f, "    {}.", entry)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeFatal {}

// ---------------------------------------------------------------------------
// Top-level aggregate
// ---------------------------------------------------------------------------

/// One failed phase of a front-end run. The driver turns a non-empty list of
/// these into exit code 65.
#[derive(Debug, Clone)]
pub enum FrontendError {
    Lex(LexError),
    Parse(ParseError),
    Resolve(ResolveError),
    Compile(CompileError),
}

impl FrontendError {
    pub fn line(&self) -> u32 {
        match self {
            FrontendError::Lex(e) => e.span().line,
            FrontendError::Parse(e) => e.span.line,
            FrontendError::Resolve(e) => e.span.line,
            FrontendError::Compile(e) => e.line,
        }
    }
}

impl fmt::Display for FrontendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontendError::Lex(e) => write!(f, "[line {}] Lex Error: {}", e.span().line, e),
            FrontendError::Parse(e) => write!(f, "[line {}] Parse Error: {}", e.span.line, e),
            FrontendError::Resolve(e) => {
                write!(f, "[line {}] Resolve Error: {}", e.span.line, e)
            }
            FrontendError::Compile(e) => write!(f, "Compile Error: {}", e),
        }
    }
}

impl std::error::Error for FrontendError {}

/// Outcome of interpreting a source unit, as seen by the host.
#[derive(Debug)]
pub enum KesError {
    /// One or more front-end errors; compilation produced no function.
    Compile(Vec<FrontendError>),
    /// An exception escaped every handler at runtime.
    Runtime(RuntimeFatal),
    /// Host-side I/O failure (unreadable script, bad module path).
    Io(String),
}

impl fmt::Display for KesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KesError::Compile(errors) => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
            KesError::Runtime(e) => write!(f, "{}", e),
            KesError::Io(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for KesError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontend_error_display_carries_line() {
        let err = FrontendError::Parse(ParseError {
            message: "Expect ';' after expression.".into(),
            span: Span::new(10, 11, 4),
        });
        assert_eq!(
            err.to_string(),
            "[line 4] Parse Error: Expect ';' after expression."
        );
    }

    #[test]
    fn test_runtime_fatal_formats_trace() {
        let fatal = RuntimeFatal {
            message: "kestrel.lang.TypeException: bad operand".into(),
            stack_trace: vec!["in f() from main.kes at line 3".into()],
        };
        let text = fatal.to_string();
        assert!(text.contains("Unhandled kestrel.lang.TypeException"));
        assert!(text.contains("in f() from main.kes at line 3"));
    }
}
