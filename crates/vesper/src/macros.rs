//! Macro transformer objects.
//!
//! A macro binds a name to a transformer invoked by pass 1 when the name
//! appears in head position. Transformers are native functions from source
//! form to source form; the expansion is recursively compiled by pass 1.

use crate::compiler::cenv::Cenv;
use crate::error::CompileResult;
use crate::intern::Symbol;
use crate::value::Value;

/// Transformer signature: receives the whole macro-use form and the
/// compile-time environment of the use site; returns the replacement form.
pub type MacroTransformer = fn(&Value, &Cenv) -> CompileResult<Value>;

/// A macro object, stored in module bindings and syntactic frames.
pub struct Macro {
    pub name: Symbol,
    transformer: MacroTransformer,
}

impl Macro {
    #[must_use]
    pub fn new(name: Symbol, transformer: MacroTransformer) -> Self {
        Self { name, transformer }
    }
}

impl std::fmt::Debug for Macro {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<macro {}>", self.name)
    }
}

/// Invokes the macro's transformer on `form` in `cenv`.
///
/// Errors from the transformer propagate unchanged; pass 1 does not wrap
/// them.
pub fn call_macro_expander(mac: &Macro, form: &Value, cenv: &Cenv) -> CompileResult<Value> {
    (mac.transformer)(form, cenv)
}
