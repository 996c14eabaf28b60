//! Modules and global bindings.
//!
//! A module owns an insertion-ordered table of binding cells ([`Gloc`]) and
//! a list of imported modules. Binding lookup searches the module's own
//! table first, then the exported names of its imports in import order.
//!
//! The registry always contains two modules: `core`, which exports every
//! binding and is seeded with the special forms and inlinable builtins, and
//! `user`, the default compilation module, which imports `core`.

use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::compiler::pass1::SyntaxKind;
use crate::intern::{StaticSym, Symbol, intern};
use crate::procedure::{Inliner, NumCmpOp, NumOp, Procedure};
use crate::value::Value;

use crate::compiler::op::Opcode;

/// Index of a module in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u32);

impl ModuleId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A global binding cell.
#[derive(Debug)]
pub struct Gloc {
    value: Value,
    /// Set by `define-constant`; allows pass 1 to substitute the value at
    /// reference sites.
    constant: bool,
}

impl Gloc {
    /// The bound value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether the binding was made with `define-constant`.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.constant
    }
}

/// Which names a module exposes to importers.
#[derive(Debug)]
pub enum Exports {
    /// Every binding is visible (the `core` module).
    All,
    /// Only the listed names are visible.
    List(Vec<Symbol>),
}

/// A module: named binding table plus import chain.
#[derive(Debug)]
pub struct Module {
    pub name: Symbol,
    imports: Vec<ModuleId>,
    exports: Exports,
    table: IndexMap<Symbol, Gloc>,
}

impl Module {
    fn exports_name(&self, name: Symbol) -> bool {
        match &self.exports {
            Exports::All => true,
            Exports::List(names) => names.contains(&name),
        }
    }
}

/// The process-wide module table, owned by the compile-time VM state.
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: Vec<Module>,
    by_name: AHashMap<Symbol, ModuleId>,
    core: ModuleId,
    user: ModuleId,
}

impl ModuleRegistry {
    /// Creates a registry with `core` seeded and `user` importing it.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            modules: Vec::new(),
            by_name: AHashMap::new(),
            core: ModuleId(0),
            user: ModuleId(0),
        };
        let core = registry.add_module(StaticSym::CoreModule.sym(), Vec::new(), Exports::All);
        let user = registry.add_module(StaticSym::UserModule.sym(), vec![core], Exports::List(Vec::new()));
        registry.core = core;
        registry.user = user;
        seed_core(&mut registry, core);
        registry
    }

    fn add_module(&mut self, name: Symbol, imports: Vec<ModuleId>, exports: Exports) -> ModuleId {
        let id = ModuleId(u32::try_from(self.modules.len()).expect("module table exceeds u32 range"));
        self.modules.push(Module {
            name,
            imports,
            exports,
            table: IndexMap::new(),
        });
        self.by_name.insert(name, id);
        id
    }

    /// The seeded `core` module.
    #[must_use]
    pub fn core(&self) -> ModuleId {
        self.core
    }

    /// The default compilation module.
    #[must_use]
    pub fn user(&self) -> ModuleId {
        self.user
    }

    /// Looks up a module by name.
    #[must_use]
    pub fn find_module(&self, name: Symbol) -> Option<ModuleId> {
        self.by_name.get(&name).copied()
    }

    /// Finds or creates a module. New modules import `core` and export
    /// nothing until `export` forms add names.
    pub fn make_module(&mut self, name: Symbol) -> ModuleId {
        if let Some(id) = self.find_module(name) {
            return id;
        }
        let core = self.core;
        self.add_module(name, vec![core], Exports::List(Vec::new()))
    }

    #[must_use]
    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.index()]
    }

    /// Inserts or overwrites a binding in `module`'s own table.
    pub fn insert_binding(&mut self, module: ModuleId, name: Symbol, value: Value, constant: bool) {
        self.modules[module.index()].table.insert(name, Gloc { value, constant });
    }

    /// Adds names to `module`'s export list.
    pub fn export_symbols(&mut self, module: ModuleId, names: &[Symbol]) {
        if let Exports::List(list) = &mut self.modules[module.index()].exports {
            for &name in names {
                if !list.contains(&name) {
                    list.push(name);
                }
            }
        }
    }

    /// Appends `imported` to `module`'s import chain.
    pub fn import_module(&mut self, module: ModuleId, imported: ModuleId) {
        let imports = &mut self.modules[module.index()].imports;
        if !imports.contains(&imported) {
            imports.push(imported);
        }
    }

    /// Resolves `name` starting from `module`: the module's own table, then
    /// exported names of its imports, depth first in import order.
    #[must_use]
    pub fn find_binding(&self, module: ModuleId, name: Symbol) -> Option<&Gloc> {
        let mut visited = AHashSet::new();
        self.find_binding_rec(module, name, true, &mut visited)
    }

    fn find_binding_rec(
        &self,
        module: ModuleId,
        name: Symbol,
        own: bool,
        visited: &mut AHashSet<ModuleId>,
    ) -> Option<&Gloc> {
        if !visited.insert(module) {
            return None;
        }
        let m = self.module(module);
        if (own || m.exports_name(name))
            && let Some(gloc) = m.table.get(&name)
        {
            return Some(gloc);
        }
        for &import in &m.imports {
            if let Some(gloc) = self.find_binding_rec(import, name, false, visited) {
                return Some(gloc);
            }
        }
        None
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Seeds `core` with the special forms and inlinable builtins.
fn seed_core(registry: &mut ModuleRegistry, core: ModuleId) {
    use SyntaxKind as K;
    let syntax: &[(StaticSym, K)] = &[
        (StaticSym::Define, K::Define),
        (StaticSym::DefineConstant, K::DefineConstant),
        (StaticSym::DefineInModule, K::DefineInModule),
        (StaticSym::DefineInline, K::DefineInline),
        (StaticSym::DefineSyntax, K::DefineSyntax),
        (StaticSym::DefineMacro, K::DefineMacro),
        (StaticSym::DefineModule, K::DefineModule),
        (StaticSym::WithModule, K::WithModule),
        (StaticSym::SelectModule, K::SelectModule),
        (StaticSym::Export, K::Export),
        (StaticSym::Import, K::Import),
        (StaticSym::Begin, K::Begin),
        (StaticSym::If, K::If),
        (StaticSym::And, K::And),
        (StaticSym::Or, K::Or),
        (StaticSym::When, K::When),
        (StaticSym::Unless, K::Unless),
        (StaticSym::Cond, K::Cond),
        (StaticSym::Case, K::Case),
        (StaticSym::Lambda, K::Lambda),
        (StaticSym::Receive, K::Receive),
        (StaticSym::Let, K::Let),
        (StaticSym::LetStar, K::LetStar),
        (StaticSym::Letrec, K::Letrec),
        (StaticSym::Do, K::Do),
        (StaticSym::AndLetStar, K::AndLetStar),
        (StaticSym::SetBang, K::Set),
        (StaticSym::Quote, K::Quote),
        (StaticSym::Quasiquote, K::Quasiquote),
        (StaticSym::Unquote, K::Unquote),
        (StaticSym::UnquoteSplicing, K::UnquoteSplicing),
        (StaticSym::Delay, K::Delay),
        (StaticSym::EvalWhen, K::EvalWhen),
    ];
    for &(name, kind) in syntax {
        registry.insert_binding(core, name.sym(), Value::Syntax(kind), false);
    }

    // Fixed-arity instruction inliners.
    let insns: &[(StaticSym, u32, Opcode)] = &[
        (StaticSym::Car, 1, Opcode::Car),
        (StaticSym::Cdr, 1, Opcode::Cdr),
        (StaticSym::Caar, 1, Opcode::Caar),
        (StaticSym::Cadr, 1, Opcode::Cadr),
        (StaticSym::Cdar, 1, Opcode::Cdar),
        (StaticSym::Cddr, 1, Opcode::Cddr),
        (StaticSym::Cons, 2, Opcode::Cons),
        (StaticSym::Memv, 2, Opcode::Memv),
        (StaticSym::EqP, 2, Opcode::Eq),
        (StaticSym::EqvP, 2, Opcode::Eqv),
        (StaticSym::NullP, 1, Opcode::NullP),
        (StaticSym::Not, 1, Opcode::Not),
        (StaticSym::ListToVector, 1, Opcode::ListToVec),
    ];
    for &(name, req, op) in insns {
        bind_procedure(registry, core, name.sym(), req, false, Some(Inliner::Insn { op, variadic: false }));
    }

    // Variadic instruction inliners: the instruction takes the argument
    // count as an immediate.
    let variadic: &[(StaticSym, u32, Opcode)] = &[
        (StaticSym::List, 0, Opcode::List),
        (StaticSym::ListStar, 1, Opcode::ListStar),
        (StaticSym::Append, 0, Opcode::Append),
        (StaticSym::Vector, 0, Opcode::VecBuild),
    ];
    for &(name, req, op) in variadic {
        bind_procedure(registry, core, name.sym(), req, true, Some(Inliner::Insn { op, variadic: true }));
    }

    // Arithmetic folds.
    let calcs: &[(StaticSym, u32, NumOp)] = &[
        (StaticSym::Add, 0, NumOp::Add),
        (StaticSym::Sub, 1, NumOp::Sub),
        (StaticSym::Mul, 0, NumOp::Mul),
        (StaticSym::Div, 1, NumOp::Div),
    ];
    for &(name, req, op) in calcs {
        bind_procedure(registry, core, name.sym(), req, true, Some(Inliner::NumCalc(op)));
    }

    // Numeric comparisons: binary instructions, variadic at the language
    // level (more than two arguments fall back to a generic call).
    let cmps: &[(StaticSym, NumCmpOp)] = &[
        (StaticSym::NumEq, NumCmpOp::Eq),
        (StaticSym::NumLt, NumCmpOp::Lt),
        (StaticSym::NumLe, NumCmpOp::Le),
        (StaticSym::NumGt, NumCmpOp::Gt),
        (StaticSym::NumGe, NumCmpOp::Ge),
    ];
    for &(name, op) in cmps {
        bind_procedure(registry, core, name.sym(), 2, true, Some(Inliner::NumCmp(op)));
    }

    // Generic procedures without inliners.
    bind_procedure(registry, core, StaticSym::Setter.sym(), 1, false, None);
}

fn bind_procedure(
    registry: &mut ModuleRegistry,
    module: ModuleId,
    name: Symbol,
    reqargs: u32,
    optarg: bool,
    inliner: Option<Inliner>,
) {
    let proc = Procedure::new(name, reqargs, optarg, inliner);
    registry.insert_binding(module, name, Value::Procedure(proc), false);
}

/// Registers an inlinable procedure binding; exposed for tests and hosts
/// extending the builtin set.
pub fn define_builtin(
    registry: &mut ModuleRegistry,
    module: ModuleId,
    name: &str,
    reqargs: u32,
    optarg: bool,
    inliner: Option<Inliner>,
) -> Rc<Procedure> {
    let sym = intern(name);
    let proc = Procedure::new(sym, reqargs, optarg, inliner);
    registry.insert_binding(module, sym, Value::Procedure(Rc::clone(&proc)), false);
    proc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_bindings_visible_from_user() {
        let registry = ModuleRegistry::new();
        let user = registry.user();
        let gloc = registry.find_binding(user, StaticSym::If.sym()).expect("if bound");
        assert!(matches!(gloc.value(), Value::Syntax(SyntaxKind::If)));
    }

    #[test]
    fn test_unexported_names_are_hidden() {
        let mut registry = ModuleRegistry::new();
        let m = registry.make_module(intern("hidden-test-module"));
        let name = intern("secret");
        registry.insert_binding(m, name, Value::Int(1), false);
        let user = registry.user();
        registry.import_module(user, m);
        assert!(registry.find_binding(user, name).is_none());
        registry.export_symbols(m, &[name]);
        assert!(registry.find_binding(user, name).is_some());
    }

    #[test]
    fn test_own_bindings_shadow_imports() {
        let mut registry = ModuleRegistry::new();
        let user = registry.user();
        let name = StaticSym::Car.sym();
        registry.insert_binding(user, name, Value::Int(99), false);
        let gloc = registry.find_binding(user, name).expect("bound");
        assert_eq!(gloc.value(), &Value::Int(99));
    }
}
