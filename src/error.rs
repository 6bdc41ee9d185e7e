//! Compile failures and the diagnostics that explain them.
//!
//! Diagnostics are printed to stderr the moment they are discovered (so a
//! batch run shows everything), but they are *also* collected and handed back
//! inside [CompileError], so embedders and tests can inspect them without
//! scraping stderr.

use std::fmt;

use thiserror::Error;

/// Where in the source a [Diagnostic] points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    /// At a particular lexeme.
    Lexeme(String),
    /// At the end of the file.
    EndOfFile,
    /// Nowhere in particular; the scanner already baked the position into
    /// the message.
    Scanner,
}

/// A single compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub location: ErrorLocation,
    pub message: String,
}

/// Compilation failed. Carries every [Diagnostic] reported along the way;
/// there is always at least one.
#[derive(Debug, Error)]
#[error("compilation failed with {} error(s)", .diagnostics.len())]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            ErrorLocation::Lexeme(text) => write!(f, " at '{text}'")?,
            ErrorLocation::EndOfFile => write!(f, " at end")?,
            ErrorLocation::Scanner => {}
        }
        write!(f, ": {}", self.message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn diagnostic_formats() {
        let at_lexeme = Diagnostic {
            line: 3,
            location: ErrorLocation::Lexeme("=".to_owned()),
            message: "Invalid assignment target.".to_owned(),
        };
        assert_eq!(
            "[line 3] Error at '=': Invalid assignment target.",
            at_lexeme.to_string()
        );

        let at_end = Diagnostic {
            line: 7,
            location: ErrorLocation::EndOfFile,
            message: "Expect '}' after block.".to_owned(),
        };
        assert_eq!(
            "[line 7] Error at end: Expect '}' after block.",
            at_end.to_string()
        );

        let from_scanner = Diagnostic {
            line: 1,
            location: ErrorLocation::Scanner,
            message: "Unterminated string.".to_owned(),
        };
        assert_eq!(
            "[line 1] Error: Unterminated string.",
            from_scanner.to_string()
        );
    }

    #[test]
    fn compile_error_counts_diagnostics() {
        let error = CompileError {
            diagnostics: vec![
                Diagnostic {
                    line: 1,
                    location: ErrorLocation::Scanner,
                    message: "first".to_owned(),
                },
                Diagnostic {
                    line: 2,
                    location: ErrorLocation::Scanner,
                    message: "second".to_owned(),
                },
            ],
        };
        assert_eq!("compilation failed with 2 error(s)", error.to_string());
    }
}
