//! Symbol interning for efficient storage and comparison of identifiers.
//!
//! Symbols are stored once in a process-wide table and handed around as
//! `Symbol(u32)` indices. The table has two regions:
//! * 0 to count(StaticSym) - symbols known at compile time (special form
//!   heads, builtin procedure names, situation keywords)
//! * everything after - symbols interned at runtime by the reader, macro
//!   expanders, and `gensym`
//!
//! The static region is seeded on first access so that `StaticSym` variants
//! can be converted to `Symbol` with no locking.

use std::sync::{LazyLock, Mutex};

use ahash::AHashMap;
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};

/// Index into the symbol interner's storage.
///
/// Uses `u32` to save space. Two symbols are the same identifier iff their
/// indices are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the symbol's name.
    ///
    /// Clones out of the interner; intended for diagnostics and display,
    /// not hot paths.
    #[must_use]
    pub fn name(self) -> String {
        INTERNER.lock().expect("symbol interner poisoned").name(self)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Symbols baked into the static region of the interner.
///
/// The discriminant of each variant is its `Symbol` index, so conversion is
/// a cast. Serialized names are the Scheme spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, EnumIter)]
#[repr(u32)]
pub enum StaticSym {
    #[strum(serialize = "define")]
    Define,
    #[strum(serialize = "define-constant")]
    DefineConstant,
    #[strum(serialize = "define-in-module")]
    DefineInModule,
    #[strum(serialize = "define-inline")]
    DefineInline,
    #[strum(serialize = "define-syntax")]
    DefineSyntax,
    #[strum(serialize = "define-macro")]
    DefineMacro,
    #[strum(serialize = "define-module")]
    DefineModule,
    #[strum(serialize = "with-module")]
    WithModule,
    #[strum(serialize = "select-module")]
    SelectModule,
    #[strum(serialize = "export")]
    Export,
    #[strum(serialize = "import")]
    Import,
    #[strum(serialize = "begin")]
    Begin,
    #[strum(serialize = "if")]
    If,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
    #[strum(serialize = "when")]
    When,
    #[strum(serialize = "unless")]
    Unless,
    #[strum(serialize = "cond")]
    Cond,
    #[strum(serialize = "case")]
    Case,
    #[strum(serialize = "else")]
    Else,
    #[strum(serialize = "=>")]
    Arrow,
    #[strum(serialize = "lambda")]
    Lambda,
    #[strum(serialize = "receive")]
    Receive,
    #[strum(serialize = "let")]
    Let,
    #[strum(serialize = "let*")]
    LetStar,
    #[strum(serialize = "letrec")]
    Letrec,
    #[strum(serialize = "do")]
    Do,
    #[strum(serialize = "and-let*")]
    AndLetStar,
    #[strum(serialize = "set!")]
    SetBang,
    #[strum(serialize = "quote")]
    Quote,
    #[strum(serialize = "quasiquote")]
    Quasiquote,
    #[strum(serialize = "unquote")]
    Unquote,
    #[strum(serialize = "unquote-splicing")]
    UnquoteSplicing,
    #[strum(serialize = "delay")]
    Delay,
    #[strum(serialize = "eval-when")]
    EvalWhen,
    #[strum(serialize = "setter")]
    Setter,
    #[strum(serialize = "car")]
    Car,
    #[strum(serialize = "cdr")]
    Cdr,
    #[strum(serialize = "caar")]
    Caar,
    #[strum(serialize = "cadr")]
    Cadr,
    #[strum(serialize = "cdar")]
    Cdar,
    #[strum(serialize = "cddr")]
    Cddr,
    #[strum(serialize = "cons")]
    Cons,
    #[strum(serialize = "list")]
    List,
    #[strum(serialize = "list*")]
    ListStar,
    #[strum(serialize = "append")]
    Append,
    #[strum(serialize = "memv")]
    Memv,
    #[strum(serialize = "eq?")]
    EqP,
    #[strum(serialize = "eqv?")]
    EqvP,
    #[strum(serialize = "null?")]
    NullP,
    #[strum(serialize = "not")]
    Not,
    #[strum(serialize = "vector")]
    Vector,
    #[strum(serialize = "list->vector")]
    ListToVector,
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "=")]
    NumEq,
    #[strum(serialize = "<")]
    NumLt,
    #[strum(serialize = "<=")]
    NumLe,
    #[strum(serialize = ">")]
    NumGt,
    #[strum(serialize = ">=")]
    NumGe,
    #[strum(serialize = "compile-toplevel")]
    CompileToplevel,
    #[strum(serialize = "load-toplevel")]
    LoadToplevel,
    #[strum(serialize = "execute")]
    Execute,
    #[strum(serialize = "core")]
    CoreModule,
    #[strum(serialize = "user")]
    UserModule,
    #[strum(serialize = "%toplevel")]
    Toplevel,
}

impl StaticSym {
    /// Converts this static symbol to its interned `Symbol`.
    #[inline]
    #[must_use]
    pub fn sym(self) -> Symbol {
        Symbol(self as u32)
    }
}

impl From<StaticSym> for Symbol {
    fn from(s: StaticSym) -> Self {
        s.sym()
    }
}

struct Interner {
    names: Vec<String>,
    by_name: AHashMap<String, Symbol>,
    gensym_counter: u64,
}

impl Interner {
    fn new() -> Self {
        let mut interner = Self {
            names: Vec::new(),
            by_name: AHashMap::new(),
            gensym_counter: 0,
        };
        // Seed the static region. StaticSym discriminants are assigned in
        // declaration order, matching the indices produced here.
        for s in StaticSym::iter() {
            let name: &'static str = s.into();
            let sym = interner.intern(name);
            debug_assert_eq!(sym.0, s as u32, "static symbol region out of sync");
        }
        interner
    }

    fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&sym) = self.by_name.get(name) {
            return sym;
        }
        let idx = u32::try_from(self.names.len()).expect("symbol table exceeds u32 range");
        let sym = Symbol(idx);
        self.names.push(name.to_owned());
        self.by_name.insert(name.to_owned(), sym);
        sym
    }

    fn name(&self, sym: Symbol) -> String {
        self.names
            .get(sym.index())
            .cloned()
            .unwrap_or_else(|| format!("#<symbol {}>", sym.0))
    }

    fn gensym(&mut self, prefix: &str) -> Symbol {
        loop {
            let candidate = format!("{prefix}.{}", self.gensym_counter);
            self.gensym_counter += 1;
            if !self.by_name.contains_key(&candidate) {
                return self.intern(&candidate);
            }
        }
    }
}

static INTERNER: LazyLock<Mutex<Interner>> = LazyLock::new(|| Mutex::new(Interner::new()));

/// Interns a name, returning its `Symbol`.
#[must_use]
pub fn intern(name: &str) -> Symbol {
    INTERNER.lock().expect("symbol interner poisoned").intern(name)
}

/// Creates a fresh symbol guaranteed not to collide with any interned name.
///
/// Used by pass 1 rewrites that introduce temporaries (`cond` with `=>`,
/// `do` loop variables).
#[must_use]
pub fn gensym(prefix: &str) -> Symbol {
    INTERNER.lock().expect("symbol interner poisoned").gensym(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_region_is_stable() {
        assert_eq!(intern("define"), StaticSym::Define.sym());
        assert_eq!(intern("set!"), StaticSym::SetBang.sym());
        assert_eq!(intern("=>"), StaticSym::Arrow.sym());
        assert_eq!(intern("list->vector"), StaticSym::ListToVector.sym());
    }

    #[test]
    fn test_intern_dedup() {
        let a = intern("a-very-unlikely-name");
        let b = intern("a-very-unlikely-name");
        assert_eq!(a, b);
        assert_eq!(a.name(), "a-very-unlikely-name");
    }

    #[test]
    fn test_gensym_unique() {
        let a = gensym("tmp");
        let b = gensym("tmp");
        assert_ne!(a, b);
    }
}
