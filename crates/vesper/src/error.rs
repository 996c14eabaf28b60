//! Compile-time error types.
//!
//! All compilation failures funnel into [`CompileError`]. Errors are raised
//! synchronously from the offending pass handler and unwind the whole
//! pipeline; partially built IR is discarded with the arena.

use std::fmt;

use strum::IntoStaticStr;

use crate::value::Value;

/// Result type alias for operations that can fail during compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Discriminates the failure classes reported by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum ErrorKind {
    /// Malformed special form: wrong shape, wrong arity, or a toplevel-only
    /// form in expression position.
    #[strum(serialize = "syntax-error")]
    Syntax,
    /// An inlined or embedded call with the wrong number of arguments,
    /// detected at compile time.
    #[strum(serialize = "arity-error")]
    Arity,
    /// Any other failure during compilation.
    #[strum(serialize = "compile-error")]
    Compile,
    /// Invariant violation inside the compiler. Indicates a bug.
    #[strum(serialize = "internal-error")]
    Internal,
}

/// A compilation failure with its offending source form attached when one
/// is available.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    kind: ErrorKind,
    message: String,
    /// The source form the error is about. `None` for internal errors and
    /// failures with no specific form.
    form: Option<Value>,
}

impl CompileError {
    #[must_use]
    pub fn syntax(message: impl Into<String>, form: &Value) -> Self {
        Self {
            kind: ErrorKind::Syntax,
            message: message.into(),
            form: Some(form.clone()),
        }
    }

    #[must_use]
    pub fn arity(name: impl fmt::Display, expected: impl fmt::Display, got: usize, form: Option<&Value>) -> Self {
        Self {
            kind: ErrorKind::Arity,
            message: format!("wrong number of arguments for {name} (required {expected}, got {got})"),
            form: form.cloned(),
        }
    }

    #[must_use]
    pub fn compile(message: impl Into<String>, form: Option<&Value>) -> Self {
        Self {
            kind: ErrorKind::Compile,
            message: message.into(),
            form: form.cloned(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
            form: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn form(&self) -> Option<&Value> {
        self.form.as_ref()
    }

    /// Attaches a source form if the error does not already carry one.
    ///
    /// The toplevel pipeline uses this to enrich errors raised deep inside
    /// a pass with the form being compiled.
    #[must_use]
    pub fn with_form(mut self, form: &Value) -> Self {
        if self.form.is_none() {
            self.form = Some(form.clone());
        }
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind: &'static str = self.kind.into();
        write!(f, "{kind}: {}", self.message)?;
        if let Some(form) = &self.form {
            write!(f, ": {form}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_form() {
        let err = CompileError::syntax("malformed if", &Value::list(&[Value::Int(1)]));
        assert_eq!(err.to_string(), "syntax-error: malformed if: (1)");
    }

    #[test]
    fn test_with_form_does_not_overwrite() {
        let err = CompileError::syntax("bad", &Value::Int(1)).with_form(&Value::Int(2));
        assert_eq!(err.form(), Some(&Value::Int(1)));
    }
}
