//! Compile-time VM state.
//!
//! The compiler queries a small slice of VM state while it runs: the
//! current module, the evaluation situation (for `eval-when`), and the
//! compiler flag bits. Execution itself is out of scope; [`Vm`] owns the
//! module registry and records compile-time-evaluated forms instead of
//! running them.

use std::rc::Rc;

use crate::error::CompileResult;
use crate::intern::Symbol;
use crate::macros::{Macro, MacroTransformer};
use crate::module::{ModuleId, ModuleRegistry};
use crate::value::Value;

/// Host-provided syntax-rules compiler: receives the rules form of a
/// `define-syntax` and produces a transformer. The engine itself lives
/// outside this crate.
pub type SyntaxRulesHook = fn(&Value) -> CompileResult<MacroTransformer>;

/// Compiler flag bits, queried by the passes through
/// [`Vm::flag_is_set`]. Each bit disables the corresponding optimization.
pub mod flags {
    /// Do not substitute `define-constant` bindings at reference sites.
    pub const NOINLINE_CONSTS: u32 = 1 << 0;
    /// Do not expand inlinable global procedures.
    pub const NOINLINE_GLOBALS: u32 = 1 << 1;
    /// Do not inline or embed locally bound procedures in pass 2.
    pub const NOINLINE_LOCALS: u32 = 1 << 2;
}

/// Where the emitted code will run, consulted by `eval-when`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalSituation {
    /// Ordinary evaluation of a compiled form.
    #[default]
    Execute,
    /// Loading a compiled file at run time.
    LoadToplevel,
    /// Compiling a file (compile-time side effects are recorded).
    CompileToplevel,
}

/// The host state one compilation thread sees.
pub struct Vm {
    modules: ModuleRegistry,
    current_module: ModuleId,
    situation: EvalSituation,
    flags: u32,
    /// Forms that `eval-when` requested be evaluated at compile time.
    /// Execution is the host's job; the compiler only records them, in
    /// order.
    pub compile_time_evals: Vec<Value>,
    syntax_rules_hook: Option<SyntaxRulesHook>,
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        let modules = ModuleRegistry::new();
        let current_module = modules.user();
        Self {
            modules,
            current_module,
            situation: EvalSituation::default(),
            flags: 0,
            compile_time_evals: Vec::new(),
            syntax_rules_hook: None,
        }
    }

    #[must_use]
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.modules
    }

    #[must_use]
    pub fn current_module(&self) -> ModuleId {
        self.current_module
    }

    pub fn set_current_module(&mut self, module: ModuleId) {
        self.current_module = module;
    }

    #[must_use]
    pub fn eval_situation(&self) -> EvalSituation {
        self.situation
    }

    pub fn set_eval_situation(&mut self, situation: EvalSituation) {
        self.situation = situation;
    }

    #[must_use]
    pub fn flag_is_set(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    #[must_use]
    pub fn syntax_rules_hook(&self) -> Option<SyntaxRulesHook> {
        self.syntax_rules_hook
    }

    /// Installs the host's syntax-rules compiler, enabling `define-syntax`.
    pub fn set_syntax_rules_hook(&mut self, hook: SyntaxRulesHook) {
        self.syntax_rules_hook = Some(hook);
    }

    /// Binds a native macro transformer in `module`. This is how hosts and
    /// tests register macros; compiling transformer bodies from source
    /// would need the evaluator.
    pub fn define_macro(&mut self, module: ModuleId, name: Symbol, transformer: MacroTransformer) {
        let mac = Value::Macro(Rc::new(Macro::new(name, transformer)));
        self.modules.insert_binding(module, name, mac, false);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
