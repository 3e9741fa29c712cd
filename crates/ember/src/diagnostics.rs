//! Out-of-band parse/compile diagnostics.
//!
//! Parse and compile failures are reported via callback and never become a
//! runtime exception — the first of the three error domains in the error
//! handling design.

use std::fmt;

/// A single parse or compile failure: `(file, line, message)`, exactly the
/// shape the error callback in the embedding surface receives.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl CompileError {
    #[must_use]
    pub fn new(file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self { file: file.into(), line, message: message.into() }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file, self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Callback signature the parser and compiler report diagnostics through.
///
/// The parser synchronizes at the next statement boundary after reporting
/// and keeps parsing, so multiple errors from one source may be reported
/// through a single callback before compilation is abandoned.
pub trait DiagnosticSink {
    fn report(&mut self, error: CompileError);
}

/// Collects every reported diagnostic into a `Vec`, for hosts (and tests)
/// that want them all rather than handling each as it is reported.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub errors: Vec<CompileError>,
}

impl DiagnosticSink for CollectingSink {
    fn report(&mut self, error: CompileError) {
        self.errors.push(error);
    }
}

impl CollectingSink {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
