//! Diagnostic reporting infrastructure.
//!
//! The compiler front end never aborts on the first problem; it pushes every
//! diagnostic into a [`Handler`] and keeps parsing in panic mode. The handler
//! owns the canonical rendering of a diagnostic, which downstream consumers
//! (the VM, the CLI, tests) rely on being stable:
//!
//! ```text
//! [line 4] Error at 'foo': Expect ';' after value.
//! [line 9] Error at end: Expect '}' after block.
//! [line 2] Error: Unterminated string.
//! ```

use std::cell::RefCell;
use std::fmt;

/// Diagnostic severity level.
///
/// # Examples
///
/// ```
/// use ember_util::Level;
///
/// assert_eq!(format!("{}", Level::Error), "Error");
/// assert!(Level::Error.is_error());
/// assert!(!Level::Warning.is_error());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// A problem that makes the source invalid; compilation fails.
    Error,
    /// Suspicious but valid code; compilation proceeds.
    Warning,
    /// Extra context attached to a preceding diagnostic.
    Note,
}

impl Level {
    /// Whether this level fails the compilation.
    pub fn is_error(self) -> bool {
        matches!(self, Level::Error)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Error => write!(f, "Error"),
            Level::Warning => write!(f, "Warning"),
            Level::Note => write!(f, "Note"),
        }
    }
}

/// Where in the token stream a diagnostic points.
///
/// Scanner error tokens already carry their message as the lexeme, so they
/// render without a location fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorLocation {
    /// A regular token; renders as `at '<lexeme>'`.
    At(String),
    /// End of input; renders as `at end`.
    AtEnd,
    /// A scanner error token; no location fragment.
    Bare,
}

/// A single diagnostic message with its source line.
///
/// # Examples
///
/// ```
/// use ember_util::{Diagnostic, ErrorLocation};
///
/// let diag = Diagnostic::error(3, ErrorLocation::At("x".into()), "Invalid assignment target.");
/// assert_eq!(diag.to_string(), "[line 3] Error at 'x': Invalid assignment target.");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: Level,
    pub line: u32,
    pub location: ErrorLocation,
    pub message: String,
}

impl Diagnostic {
    /// Create an error-level diagnostic.
    pub fn error(line: u32, location: ErrorLocation, message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            line,
            location,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] {}", self.line, self.level)?;
        match &self.location {
            ErrorLocation::At(lexeme) => write!(f, " at '{lexeme}'")?,
            ErrorLocation::AtEnd => write!(f, " at end")?,
            ErrorLocation::Bare => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Sink that accumulates diagnostics for one compilation.
///
/// Reporting goes through a shared reference, so the handler uses interior
/// mutability; the engine is single-threaded by contract.
///
/// # Examples
///
/// ```
/// use ember_util::{Diagnostic, ErrorLocation, Handler};
///
/// let handler = Handler::new();
/// assert!(!handler.has_errors());
///
/// handler.report(Diagnostic::error(1, ErrorLocation::AtEnd, "Expect expression."));
/// assert!(handler.has_errors());
/// assert_eq!(handler.error_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Handler {
    diagnostics: RefCell<Vec<Diagnostic>>,
    mirror_stderr: bool,
}

impl Handler {
    /// Create a handler that only collects.
    pub fn new() -> Self {
        Self {
            diagnostics: RefCell::new(Vec::new()),
            mirror_stderr: false,
        }
    }

    /// Create a handler that also prints each diagnostic to stderr as it is
    /// reported, which is how an embedding host sees compile errors.
    pub fn with_stderr() -> Self {
        Self {
            diagnostics: RefCell::new(Vec::new()),
            mirror_stderr: true,
        }
    }

    /// Report a diagnostic.
    pub fn report(&self, diagnostic: Diagnostic) {
        if self.mirror_stderr {
            eprintln!("{diagnostic}");
        }
        self.diagnostics.borrow_mut().push(diagnostic);
    }

    /// Whether any error-level diagnostic has been reported.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .borrow()
            .iter()
            .any(|d| d.level.is_error())
    }

    /// Number of error-level diagnostics reported so far.
    pub fn error_count(&self) -> usize {
        self.diagnostics
            .borrow()
            .iter()
            .filter(|d| d.level.is_error())
            .count()
    }

    /// Take every reported diagnostic out of the handler.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics.borrow_mut())
    }
}
