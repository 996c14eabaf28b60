//! Compile-time environment.
//!
//! A `Cenv` snapshots everything pass 1 needs to resolve a name: the
//! current module, the stack of binding frames, and the expression-name
//! hint used to name anonymous closures. Every "mutator" returns a new
//! `Cenv`; sibling expressions never observe each other's extensions.

use std::rc::Rc;

use crate::identifier::make_identifier;
use crate::intern::Symbol;
use crate::macros::Macro;
use crate::compiler::iform::LVarId;
use crate::module::ModuleId;
use crate::value::Value;

/// Frame classification. Lookup can be restricted to frames of a minimum
/// kind; pattern frames exist for the benefit of syntax-rules expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameKind {
    Lexical = 0,
    Syntactic = 1,
    Pattern = 2,
}

/// What a frame entry binds a name to.
#[derive(Debug, Clone)]
pub enum Binding {
    LVar(LVarId),
    Macro(Rc<Macro>),
}

/// One binding frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub binds: Vec<(Symbol, Binding)>,
}

impl Frame {
    #[must_use]
    pub fn lexical(binds: Vec<(Symbol, Binding)>) -> Self {
        Self {
            kind: FrameKind::Lexical,
            binds,
        }
    }
}

/// Result of resolving a name.
#[derive(Debug, Clone)]
pub enum Lookup {
    LVar(LVarId),
    Macro(Rc<Macro>),
    /// Unresolved locally: a global identifier carrying the module to
    /// search for the binding.
    Global(Value),
}

/// The compile-time environment threaded through pass 1.
#[derive(Debug, Clone)]
pub struct Cenv {
    pub module: ModuleId,
    /// Binding frames, innermost last.
    pub frames: Vec<Frame>,
    /// Name hint for the value being computed, used to name closures.
    pub expr_name: Option<Value>,
}

impl Cenv {
    #[must_use]
    pub fn toplevel(module: ModuleId) -> Self {
        Self {
            module,
            frames: Vec::new(),
            expr_name: None,
        }
    }

    /// Resolves `name` (a symbol or identifier) against the environment.
    ///
    /// Frames are searched innermost first; only frames of kind >=
    /// `min_kind` participate. A miss produces a global identifier: for a
    /// plain symbol, one closed over this environment; a wrapped
    /// identifier resolves in the environment it captured at creation.
    #[must_use]
    pub fn lookup(&self, name: &Value, min_kind: FrameKind) -> Lookup {
        match name {
            Value::Sym(sym) => match search_frames(&self.frames, *sym, min_kind) {
                Some(binding) => binding,
                None => Lookup::Global(make_identifier(*sym, self.module, self.frames.clone())),
            },
            Value::Identifier(id) => match search_frames(&id.frames, id.name, min_kind) {
                Some(binding) => binding,
                None => Lookup::Global(name.clone()),
            },
            _ => Lookup::Global(name.clone()),
        }
    }

    /// Pushes a frame, producing the extended environment.
    #[must_use]
    pub fn extend(&self, frame: Frame) -> Self {
        let mut next = self.clone();
        next.frames.push(frame);
        next
    }

    /// Replaces the expression-name hint.
    #[must_use]
    pub fn add_name(&self, name: Value) -> Self {
        let mut next = self.clone();
        next.expr_name = Some(name);
        next
    }

    /// Drops the name hint; used for sub-expressions that are not the
    /// value of the binding being compiled.
    #[must_use]
    pub fn sans_name(&self) -> Self {
        if self.expr_name.is_none() {
            return self.clone();
        }
        let mut next = self.clone();
        next.expr_name = None;
        next
    }

    /// True iff no lexical frame is present.
    #[must_use]
    pub fn is_toplevel(&self) -> bool {
        !self.frames.iter().any(|f| f.kind == FrameKind::Lexical)
    }

    /// Switches the module, keeping frames (used by `with-module` forms).
    #[must_use]
    pub fn in_module(&self, module: ModuleId) -> Self {
        let mut next = self.clone();
        next.module = module;
        next
    }
}

fn search_frames(frames: &[Frame], sym: Symbol, min_kind: FrameKind) -> Option<Lookup> {
    for frame in frames.iter().rev() {
        if frame.kind < min_kind {
            continue;
        }
        for (name, binding) in frame.binds.iter().rev() {
            if *name == sym {
                return Some(match binding {
                    Binding::LVar(lv) => Lookup::LVar(*lv),
                    Binding::Macro(m) => Lookup::Macro(Rc::clone(m)),
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::iform::IrPool;
    use crate::intern::intern;
    use crate::module::ModuleRegistry;

    #[test]
    fn test_lookup_shadowing() {
        let registry = ModuleRegistry::new();
        let mut pool = IrPool::new();
        let x = intern("x");
        let outer = pool.new_lvar(x);
        let inner = pool.new_lvar(x);
        let cenv = Cenv::toplevel(registry.user())
            .extend(Frame::lexical(vec![(x, Binding::LVar(outer))]))
            .extend(Frame::lexical(vec![(x, Binding::LVar(inner))]));
        match cenv.lookup(&Value::Sym(x), FrameKind::Lexical) {
            Lookup::LVar(lv) => assert_eq!(lv, inner),
            other => panic!("expected inner lvar, got {other:?}"),
        }
    }

    #[test]
    fn test_lookup_miss_makes_identifier() {
        let registry = ModuleRegistry::new();
        let cenv = Cenv::toplevel(registry.user());
        match cenv.lookup(&Value::Sym(intern("unbound-name")), FrameKind::Lexical) {
            Lookup::Global(Value::Identifier(id)) => {
                assert_eq!(id.name, intern("unbound-name"));
                assert_eq!(id.module, registry.user());
            }
            other => panic!("expected identifier, got {other:?}"),
        }
    }

    #[test]
    fn test_toplevel_tracking() {
        let registry = ModuleRegistry::new();
        let mut pool = IrPool::new();
        let cenv = Cenv::toplevel(registry.user());
        assert!(cenv.is_toplevel());
        let x = intern("x");
        let lv = pool.new_lvar(x);
        let extended = cenv.extend(Frame::lexical(vec![(x, Binding::LVar(lv))]));
        assert!(!extended.is_toplevel());
        // The original is unchanged.
        assert!(cenv.is_toplevel());
    }
}
