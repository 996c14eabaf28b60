//! Wrapped identifiers.
//!
//! An identifier pairs a symbol with the module and lexical frames that were
//! current when it was created. Global references in the IR carry
//! identifiers so that pass 3 can emit module-qualified `GREF`/`GSET`
//! operands, and macro transformers can inject names that resolve in the
//! macro's own module rather than the use site's.

use std::rc::Rc;

use crate::compiler::cenv::Frame;
use crate::intern::Symbol;
use crate::module::ModuleId;
use crate::value::Value;

/// A symbol closed over its resolution context.
///
/// The captured frames are only meaningful within the compilation that
/// created the identifier; they are never consulted after the pipeline
/// finishes.
#[derive(Debug)]
pub struct Identifier {
    pub name: Symbol,
    pub module: ModuleId,
    pub frames: Vec<Frame>,
}

/// Creates an identifier value closed over `frames` and `module`.
#[must_use]
pub fn make_identifier(name: Symbol, module: ModuleId, frames: Vec<Frame>) -> Value {
    Value::Identifier(Rc::new(Identifier { name, module, frames }))
}

/// True if the value is a wrapped identifier.
#[must_use]
pub fn identifier_p(v: &Value) -> bool {
    matches!(v, Value::Identifier(_))
}
