//! Intermediate representation.
//!
//! The currency between the three passes: a closed set of tagged tree
//! nodes held in a per-compilation arena. Node references are `IFormId`
//! indices; children are ids, so the representation is a tree by
//! construction. The only sharing ever introduced is `Label` nodes, which
//! pass 2 creates when it embeds a local procedure and redirects tail
//! self-calls to it.
//!
//! Pass 2 rewrites nodes in place through the arena; the arena is owned by
//! a single compilation and never published between passes.

use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;

use crate::compiler::code::CodeLabel;
use crate::compiler::op::Opcode;
use crate::intern::Symbol;
use crate::value::Value;

/// Index of an IR node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IFormId(u32);

impl IFormId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a local-variable record in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LVarId(u32);

impl LVarId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A lexical binding site with usage counters.
///
/// Created when a binding frame is introduced, mutated by passes 1 and 2
/// as they discover uses, never destroyed (its lifetime is the arena's).
#[derive(Debug)]
pub struct LVar {
    pub name: Symbol,
    /// The binding's init expression, set when the binding is created.
    pub init: Option<IFormId>,
    /// Number of live `LRef` nodes naming this variable.
    pub ref_count: u32,
    /// Number of live `LSet` nodes naming this variable.
    pub set_count: u32,
}

/// `Let` binding discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetKind {
    /// Inits see the outer environment.
    Let,
    /// Inits see the new frame (`letrec`, named `let`).
    Rec,
}

/// State of a `Lambda` node with respect to pass-2 rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LambdaFlag {
    None,
    /// Body was packed for cross-compilation by `define-inline`.
    Inlined,
    /// Body was embedded at its single local call site.
    Dissolved,
}

/// Call-site classification assigned by pass 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFlag {
    None,
    /// Call to a locally bound procedure, frame layout known.
    Local,
    /// The procedure body is inlined right here, wrapped in a label.
    Embed,
    /// Tail self-call redirected to an embedded body's label.
    Jump,
    /// Non-tail self-recursion.
    Rec,
    /// Tail self-recursion, candidate for jump redirection.
    TailRec,
}

/// A VM instruction template carried by `Asm` nodes: the opcode plus any
/// immediate arguments computed by pass 1.
#[derive(Debug, Clone, PartialEq)]
pub struct AsmInsn {
    pub op: Opcode,
    pub args: SmallVec<[i32; 2]>,
}

impl AsmInsn {
    #[must_use]
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            args: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn with_arg(op: Opcode, arg: i32) -> Self {
        let mut args = SmallVec::new();
        args.push(arg);
        Self { op, args }
    }
}

/// A call site recorded on its callee `Lambda` during pass 2: the `Call`
/// node and the innermost lambda enclosing the call site (`None` at
/// toplevel).
pub type CallSite = (IFormId, Option<IFormId>);

/// An IR node. The enum discriminant is the dispatch tag; every traversal
/// in passes 2 and 3 matches on it.
#[derive(Debug)]
pub enum IForm {
    Define {
        src: Option<Value>,
        constant: bool,
        id: Value,
        expr: IFormId,
    },
    LRef {
        lvar: LVarId,
    },
    LSet {
        lvar: LVarId,
        expr: IFormId,
    },
    GRef {
        id: Value,
    },
    GSet {
        id: Value,
        expr: IFormId,
    },
    Const {
        value: Value,
    },
    If {
        src: Option<Value>,
        test: IFormId,
        then_br: IFormId,
        else_br: IFormId,
    },
    Let {
        src: Option<Value>,
        kind: LetKind,
        lvars: Vec<LVarId>,
        inits: Vec<IFormId>,
        body: IFormId,
    },
    Receive {
        src: Option<Value>,
        reqargs: u32,
        optarg: bool,
        lvars: Vec<LVarId>,
        expr: IFormId,
        body: IFormId,
    },
    Lambda {
        src: Option<Value>,
        name: Option<Value>,
        reqargs: u32,
        optarg: bool,
        lvars: Vec<LVarId>,
        body: IFormId,
        flag: LambdaFlag,
        /// Call sites discovered by pass 2; accurate when pass 2 leaves the
        /// defining `Let`, cleared afterwards.
        calls: Vec<CallSite>,
    },
    Label {
        /// Filled by pass 3 when the label is placed.
        label: Option<CodeLabel>,
        body: IFormId,
    },
    Seq {
        body: Vec<IFormId>,
    },
    Call {
        src: Option<Value>,
        proc: IFormId,
        args: Vec<IFormId>,
        flag: CallFlag,
    },
    Asm {
        src: Option<Value>,
        insn: AsmInsn,
        args: Vec<IFormId>,
    },
    Promise {
        src: Option<Value>,
        expr: IFormId,
    },
    Cons {
        src: Option<Value>,
        a: IFormId,
        b: IFormId,
    },
    Append {
        src: Option<Value>,
        a: IFormId,
        b: IFormId,
    },
    Memv {
        src: Option<Value>,
        a: IFormId,
        b: IFormId,
    },
    Eq {
        src: Option<Value>,
        a: IFormId,
        b: IFormId,
    },
    Eqv {
        src: Option<Value>,
        a: IFormId,
        b: IFormId,
    },
    List {
        src: Option<Value>,
        elts: Vec<IFormId>,
    },
    ListStar {
        src: Option<Value>,
        elts: Vec<IFormId>,
    },
    Vector {
        src: Option<Value>,
        elts: Vec<IFormId>,
    },
    ListToVec {
        src: Option<Value>,
        arg: IFormId,
    },
    /// Placeholder for "the value of the most recent test clause", used
    /// inside `If` branches built by `and`, `or`, and `cond`.
    It,
}

/// The per-compilation IR arena: nodes, local variables, and allocation
/// helpers.
#[derive(Debug, Default)]
pub struct IrPool {
    nodes: Vec<IForm>,
    lvars: Vec<LVar>,
}

impl IrPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, node: IForm) -> IFormId {
        let id = IFormId(u32::try_from(self.nodes.len()).expect("IR arena exceeds u32 range"));
        self.nodes.push(node);
        id
    }

    #[must_use]
    pub fn get(&self, id: IFormId) -> &IForm {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: IFormId) -> &mut IForm {
        &mut self.nodes[id.index()]
    }

    pub fn set(&mut self, id: IFormId, node: IForm) {
        self.nodes[id.index()] = node;
    }

    pub fn new_lvar(&mut self, name: Symbol) -> LVarId {
        let id = LVarId(u32::try_from(self.lvars.len()).expect("lvar arena exceeds u32 range"));
        self.lvars.push(LVar {
            name,
            init: None,
            ref_count: 0,
            set_count: 0,
        });
        id
    }

    #[must_use]
    pub fn lvar(&self, id: LVarId) -> &LVar {
        &self.lvars[id.index()]
    }

    pub fn lvar_mut(&mut self, id: LVarId) -> &mut LVar {
        &mut self.lvars[id.index()]
    }

    pub fn ref_inc(&mut self, id: LVarId) {
        self.lvars[id.index()].ref_count += 1;
    }

    pub fn ref_dec(&mut self, id: LVarId) {
        let lv = &mut self.lvars[id.index()];
        debug_assert!(lv.ref_count > 0, "lvar ref-count underflow");
        lv.ref_count = lv.ref_count.saturating_sub(1);
    }

    pub fn set_inc(&mut self, id: LVarId) {
        self.lvars[id.index()].set_count += 1;
    }

    // --- constant constructors ---

    pub fn const_node(&mut self, value: Value) -> IFormId {
        self.alloc(IForm::Const { value })
    }

    pub fn const_nil(&mut self) -> IFormId {
        self.const_node(Value::Nil)
    }

    pub fn const_undef(&mut self) -> IFormId {
        self.const_node(Value::Undefined)
    }

    pub fn const_bool(&mut self, b: bool) -> IFormId {
        self.const_node(Value::Bool(b))
    }

    /// The constant payload of a node, if it is a `Const`.
    #[must_use]
    pub fn as_const(&self, id: IFormId) -> Option<&Value> {
        match self.get(id) {
            IForm::Const { value } => Some(value),
            _ => None,
        }
    }

    /// Counts nodes in the subtree, stopping once the count reaches
    /// `limit`. The result never exceeds `limit`.
    #[must_use]
    pub fn count_size_upto(&self, id: IFormId, limit: usize) -> usize {
        let mut seen_labels = AHashSet::new();
        let mut count = 0usize;
        self.count_rec(id, limit, &mut count, &mut seen_labels);
        count
    }

    fn count_rec(&self, id: IFormId, limit: usize, count: &mut usize, seen: &mut AHashSet<IFormId>) {
        if *count >= limit {
            return;
        }
        *count += 1;
        let mut children: SmallVec<[IFormId; 4]> = SmallVec::new();
        self.collect_children(id, &mut children, seen);
        for child in children {
            self.count_rec(child, limit, count, seen);
        }
    }

    /// Appends the node's direct children. A `Label` already counted is
    /// skipped so shared labels are visited once.
    pub(crate) fn collect_children(&self, id: IFormId, out: &mut SmallVec<[IFormId; 4]>, seen_labels: &mut AHashSet<IFormId>) {
        match self.get(id) {
            IForm::Define { expr, .. } | IForm::GSet { expr, .. } | IForm::Promise { expr, .. } => out.push(*expr),
            IForm::LSet { expr, .. } => out.push(*expr),
            IForm::If {
                test,
                then_br,
                else_br,
                ..
            } => {
                out.push(*test);
                out.push(*then_br);
                out.push(*else_br);
            }
            IForm::Let { inits, body, .. } => {
                out.extend(inits.iter().copied());
                out.push(*body);
            }
            IForm::Receive { expr, body, .. } => {
                out.push(*expr);
                out.push(*body);
            }
            IForm::Lambda { body, .. } => out.push(*body),
            IForm::Label { body, .. } => {
                if seen_labels.insert(id) {
                    out.push(*body);
                }
            }
            IForm::Seq { body } => out.extend(body.iter().copied()),
            IForm::Call { proc, args, flag, .. } => {
                // A jump call's operator is the embedded body's label; the
                // label is reached through the embed site, so following it
                // here would revisit the body.
                if *flag != CallFlag::Jump {
                    out.push(*proc);
                }
                out.extend(args.iter().copied());
            }
            IForm::Asm { args, .. } => out.extend(args.iter().copied()),
            IForm::Cons { a, b, .. }
            | IForm::Append { a, b, .. }
            | IForm::Memv { a, b, .. }
            | IForm::Eq { a, b, .. }
            | IForm::Eqv { a, b, .. } => {
                out.push(*a);
                out.push(*b);
            }
            IForm::List { elts, .. } | IForm::ListStar { elts, .. } | IForm::Vector { elts, .. } => {
                out.extend(elts.iter().copied());
            }
            IForm::ListToVec { arg, .. } => out.push(*arg),
            IForm::LRef { .. } | IForm::GRef { .. } | IForm::Const { .. } | IForm::It => {}
        }
    }

    /// Produces a structural clone of the subtree at `id`.
    ///
    /// LVars bound inside the subtree are rewritten to fresh ones through
    /// `lvar_map`; LVars bound outside are kept, with their counters
    /// adjusted for the cloned references. Nodes are memoized by identity,
    /// so the sharing pass 2 introduces (labels, and jump operators that
    /// reference them) becomes the same sharing in the clone.
    pub fn copy(&mut self, id: IFormId, lvar_map: &mut AHashMap<LVarId, LVarId>) -> IFormId {
        let mut node_map = AHashMap::new();
        self.copy_rec(id, lvar_map, &mut node_map)
    }

    fn copy_lvar_binders(&mut self, lvars: &[LVarId], lvar_map: &mut AHashMap<LVarId, LVarId>) -> Vec<LVarId> {
        lvars
            .iter()
            .map(|&lv| {
                let fresh = self.new_lvar(self.lvar(lv).name);
                lvar_map.insert(lv, fresh);
                fresh
            })
            .collect()
    }

    fn copy_rec(
        &mut self,
        id: IFormId,
        lvar_map: &mut AHashMap<LVarId, LVarId>,
        node_map: &mut AHashMap<IFormId, IFormId>,
    ) -> IFormId {
        if let Some(&copied) = node_map.get(&id) {
            return copied;
        }
        macro_rules! node {
            ($n:expr) => {{
                let copied = self.alloc($n);
                node_map.insert(id, copied);
                copied
            }};
        }
        match self.get(id) {
            IForm::Define { src, constant, id: defid, expr } => {
                let (src, constant, defid, expr) = (src.clone(), *constant, defid.clone(), *expr);
                let expr = self.copy_rec(expr, lvar_map, node_map);
                node!(IForm::Define { src, constant, id: defid, expr })
            }
            IForm::LRef { lvar } => {
                let lvar = *lvar;
                let target = lvar_map.get(&lvar).copied().unwrap_or(lvar);
                self.ref_inc(target);
                node!(IForm::LRef { lvar: target })
            }
            IForm::LSet { lvar, expr } => {
                let (lvar, expr) = (*lvar, *expr);
                let target = lvar_map.get(&lvar).copied().unwrap_or(lvar);
                self.set_inc(target);
                let expr = self.copy_rec(expr, lvar_map, node_map);
                node!(IForm::LSet { lvar: target, expr })
            }
            IForm::GRef { id: gid } => {
                let gid = gid.clone();
                node!(IForm::GRef { id: gid })
            }
            IForm::GSet { id: gid, expr } => {
                let (gid, expr) = (gid.clone(), *expr);
                let expr = self.copy_rec(expr, lvar_map, node_map);
                node!(IForm::GSet { id: gid, expr })
            }
            IForm::Const { value } => {
                let value = value.clone();
                node!(IForm::Const { value })
            }
            IForm::If {
                src,
                test,
                then_br,
                else_br,
            } => {
                let (src, test, then_br, else_br) = (src.clone(), *test, *then_br, *else_br);
                let test = self.copy_rec(test, lvar_map, node_map);
                let then_br = self.copy_rec(then_br, lvar_map, node_map);
                let else_br = self.copy_rec(else_br, lvar_map, node_map);
                node!(IForm::If {
                    src,
                    test,
                    then_br,
                    else_br
                })
            }
            IForm::Let {
                src,
                kind,
                lvars,
                inits,
                body,
            } => {
                let (src, kind, lvars, inits, body) = (src.clone(), *kind, lvars.clone(), inits.clone(), *body);
                let new_lvars = self.copy_lvar_binders(&lvars, lvar_map);
                let new_inits: Vec<_> = inits.iter().map(|&i| self.copy_rec(i, lvar_map, node_map)).collect();
                for (lv, init) in new_lvars.iter().zip(&new_inits) {
                    self.lvar_mut(*lv).init = Some(*init);
                }
                let body = self.copy_rec(body, lvar_map, node_map);
                node!(IForm::Let {
                    src,
                    kind,
                    lvars: new_lvars,
                    inits: new_inits,
                    body
                })
            }
            IForm::Receive {
                src,
                reqargs,
                optarg,
                lvars,
                expr,
                body,
            } => {
                let (src, reqargs, optarg, lvars, expr, body) =
                    (src.clone(), *reqargs, *optarg, lvars.clone(), *expr, *body);
                let expr = self.copy_rec(expr, lvar_map, node_map);
                let new_lvars = self.copy_lvar_binders(&lvars, lvar_map);
                let body = self.copy_rec(body, lvar_map, node_map);
                node!(IForm::Receive {
                    src,
                    reqargs,
                    optarg,
                    lvars: new_lvars,
                    expr,
                    body
                })
            }
            IForm::Lambda {
                src,
                name,
                reqargs,
                optarg,
                lvars,
                body,
                flag,
                ..
            } => {
                let (src, name, reqargs, optarg, lvars, body, flag) =
                    (src.clone(), name.clone(), *reqargs, *optarg, lvars.clone(), *body, *flag);
                let new_lvars = self.copy_lvar_binders(&lvars, lvar_map);
                let body = self.copy_rec(body, lvar_map, node_map);
                node!(IForm::Lambda {
                    src,
                    name,
                    reqargs,
                    optarg,
                    lvars: new_lvars,
                    body,
                    flag,
                    calls: Vec::new()
                })
            }
            IForm::Label { body, .. } => {
                if let Some(&copied) = node_map.get(&id) {
                    return copied;
                }
                let body = *body;
                let copied = self.alloc(IForm::Label {
                    label: None,
                    body: IFormId(0),
                });
                node_map.insert(id, copied);
                let new_body = self.copy_rec(body, lvar_map, node_map);
                if let IForm::Label { body, .. } = self.get_mut(copied) {
                    *body = new_body;
                }
                copied
            }
            IForm::Seq { body } => {
                let body = body.clone();
                let body: Vec<_> = body.iter().map(|&b| self.copy_rec(b, lvar_map, node_map)).collect();
                node!(IForm::Seq { body })
            }
            IForm::Call { src, proc, args, flag } => {
                let (src, proc, args, flag) = (src.clone(), *proc, args.clone(), *flag);
                // Reserve the slot first: a jump inside an embedded body
                // refers back to its embed call.
                let copied = self.alloc(IForm::It);
                node_map.insert(id, copied);
                let proc = self.copy_rec(proc, lvar_map, node_map);
                let args: Vec<_> = args.iter().map(|&a| self.copy_rec(a, lvar_map, node_map)).collect();
                self.set(copied, IForm::Call { src, proc, args, flag });
                copied
            }
            IForm::Asm { src, insn, args } => {
                let (src, insn, args) = (src.clone(), insn.clone(), args.clone());
                let args: Vec<_> = args.iter().map(|&a| self.copy_rec(a, lvar_map, node_map)).collect();
                node!(IForm::Asm { src, insn, args })
            }
            IForm::Promise { src, expr } => {
                let (src, expr) = (src.clone(), *expr);
                let expr = self.copy_rec(expr, lvar_map, node_map);
                node!(IForm::Promise { src, expr })
            }
            IForm::Cons { src, a, b } => {
                let (src, a, b) = (src.clone(), *a, *b);
                let a = self.copy_rec(a, lvar_map, node_map);
                let b = self.copy_rec(b, lvar_map, node_map);
                node!(IForm::Cons { src, a, b })
            }
            IForm::Append { src, a, b } => {
                let (src, a, b) = (src.clone(), *a, *b);
                let a = self.copy_rec(a, lvar_map, node_map);
                let b = self.copy_rec(b, lvar_map, node_map);
                node!(IForm::Append { src, a, b })
            }
            IForm::Memv { src, a, b } => {
                let (src, a, b) = (src.clone(), *a, *b);
                let a = self.copy_rec(a, lvar_map, node_map);
                let b = self.copy_rec(b, lvar_map, node_map);
                node!(IForm::Memv { src, a, b })
            }
            IForm::Eq { src, a, b } => {
                let (src, a, b) = (src.clone(), *a, *b);
                let a = self.copy_rec(a, lvar_map, node_map);
                let b = self.copy_rec(b, lvar_map, node_map);
                node!(IForm::Eq { src, a, b })
            }
            IForm::Eqv { src, a, b } => {
                let (src, a, b) = (src.clone(), *a, *b);
                let a = self.copy_rec(a, lvar_map, node_map);
                let b = self.copy_rec(b, lvar_map, node_map);
                node!(IForm::Eqv { src, a, b })
            }
            IForm::List { src, elts } => {
                let (src, elts) = (src.clone(), elts.clone());
                let elts: Vec<_> = elts.iter().map(|&e| self.copy_rec(e, lvar_map, node_map)).collect();
                node!(IForm::List { src, elts })
            }
            IForm::ListStar { src, elts } => {
                let (src, elts) = (src.clone(), elts.clone());
                let elts: Vec<_> = elts.iter().map(|&e| self.copy_rec(e, lvar_map, node_map)).collect();
                node!(IForm::ListStar { src, elts })
            }
            IForm::Vector { src, elts } => {
                let (src, elts) = (src.clone(), elts.clone());
                let elts: Vec<_> = elts.iter().map(|&e| self.copy_rec(e, lvar_map, node_map)).collect();
                node!(IForm::Vector { src, elts })
            }
            IForm::ListToVec { src, arg } => {
                let (src, arg) = (src.clone(), *arg);
                let arg = self.copy_rec(arg, lvar_map, node_map);
                node!(IForm::ListToVec { src, arg })
            }
            IForm::It => node!(IForm::It),
        }
    }

    // --- packing ---

    /// Serializes the subtree at `id` into a flat, self-contained vector.
    ///
    /// Node references become indices into the vector; LVar references
    /// become indices into a name table. Source-form handles and pass-2
    /// bookkeeping (`calls`) are not part of the packed form.
    #[must_use]
    pub fn pack(&self, id: IFormId) -> PackedIr {
        let mut packed = PackedIr {
            lvar_names: Vec::new(),
            nodes: Vec::new(),
            root: 0,
        };
        let mut node_memo = AHashMap::new();
        let mut lvar_memo = AHashMap::new();
        packed.root = self.pack_rec(id, &mut packed, &mut node_memo, &mut lvar_memo);
        packed
    }

    fn pack_lvar(&self, lv: LVarId, packed: &mut PackedIr, lvar_memo: &mut AHashMap<LVarId, u32>) -> u32 {
        if let Some(&idx) = lvar_memo.get(&lv) {
            return idx;
        }
        let idx = u32::try_from(packed.lvar_names.len()).expect("packed lvar table exceeds u32 range");
        packed.lvar_names.push(self.lvar(lv).name);
        lvar_memo.insert(lv, idx);
        idx
    }

    fn pack_rec(
        &self,
        id: IFormId,
        packed: &mut PackedIr,
        node_memo: &mut AHashMap<IFormId, u32>,
        lvar_memo: &mut AHashMap<LVarId, u32>,
    ) -> u32 {
        if let Some(&idx) = node_memo.get(&id) {
            return idx;
        }
        let idx = u32::try_from(packed.nodes.len()).expect("packed node table exceeds u32 range");
        packed.nodes.push(PackedNode::It); // placeholder until children exist
        node_memo.insert(id, idx);
        let node = match self.get(id) {
            IForm::Define {
                constant, id: defid, expr, ..
            } => PackedNode::Define {
                constant: *constant,
                id: defid.clone(),
                expr: self.pack_rec(*expr, packed, node_memo, lvar_memo),
            },
            IForm::LRef { lvar } => PackedNode::LRef {
                lvar: self.pack_lvar(*lvar, packed, lvar_memo),
            },
            IForm::LSet { lvar, expr } => PackedNode::LSet {
                lvar: self.pack_lvar(*lvar, packed, lvar_memo),
                expr: self.pack_rec(*expr, packed, node_memo, lvar_memo),
            },
            IForm::GRef { id: gid } => PackedNode::GRef { id: gid.clone() },
            IForm::GSet { id: gid, expr } => PackedNode::GSet {
                id: gid.clone(),
                expr: self.pack_rec(*expr, packed, node_memo, lvar_memo),
            },
            IForm::Const { value } => PackedNode::Const { value: value.clone() },
            IForm::If {
                test, then_br, else_br, ..
            } => PackedNode::If {
                test: self.pack_rec(*test, packed, node_memo, lvar_memo),
                then_br: self.pack_rec(*then_br, packed, node_memo, lvar_memo),
                else_br: self.pack_rec(*else_br, packed, node_memo, lvar_memo),
            },
            IForm::Let {
                kind, lvars, inits, body, ..
            } => PackedNode::Let {
                kind: *kind,
                lvars: lvars.iter().map(|&lv| self.pack_lvar(lv, packed, lvar_memo)).collect(),
                inits: inits
                    .iter()
                    .map(|&i| self.pack_rec(i, packed, node_memo, lvar_memo))
                    .collect(),
                body: self.pack_rec(*body, packed, node_memo, lvar_memo),
            },
            IForm::Receive {
                reqargs,
                optarg,
                lvars,
                expr,
                body,
                ..
            } => PackedNode::Receive {
                reqargs: *reqargs,
                optarg: *optarg,
                lvars: lvars.iter().map(|&lv| self.pack_lvar(lv, packed, lvar_memo)).collect(),
                expr: self.pack_rec(*expr, packed, node_memo, lvar_memo),
                body: self.pack_rec(*body, packed, node_memo, lvar_memo),
            },
            IForm::Lambda {
                name,
                reqargs,
                optarg,
                lvars,
                body,
                flag,
                ..
            } => PackedNode::Lambda {
                name: name.clone(),
                reqargs: *reqargs,
                optarg: *optarg,
                flag: *flag,
                lvars: lvars.iter().map(|&lv| self.pack_lvar(lv, packed, lvar_memo)).collect(),
                body: self.pack_rec(*body, packed, node_memo, lvar_memo),
            },
            IForm::Label { body, .. } => PackedNode::Label {
                body: self.pack_rec(*body, packed, node_memo, lvar_memo),
            },
            IForm::Seq { body } => PackedNode::Seq {
                body: body
                    .iter()
                    .map(|&b| self.pack_rec(b, packed, node_memo, lvar_memo))
                    .collect(),
            },
            IForm::Call { proc, args, flag, .. } => PackedNode::Call {
                proc: self.pack_rec(*proc, packed, node_memo, lvar_memo),
                args: args
                    .iter()
                    .map(|&a| self.pack_rec(a, packed, node_memo, lvar_memo))
                    .collect(),
                flag: *flag,
            },
            IForm::Asm { insn, args, .. } => PackedNode::Asm {
                insn: insn.clone(),
                args: args
                    .iter()
                    .map(|&a| self.pack_rec(a, packed, node_memo, lvar_memo))
                    .collect(),
            },
            IForm::Promise { expr, .. } => PackedNode::Promise {
                expr: self.pack_rec(*expr, packed, node_memo, lvar_memo),
            },
            IForm::Cons { a, b, .. } => PackedNode::Cons {
                a: self.pack_rec(*a, packed, node_memo, lvar_memo),
                b: self.pack_rec(*b, packed, node_memo, lvar_memo),
            },
            IForm::Append { a, b, .. } => PackedNode::Append {
                a: self.pack_rec(*a, packed, node_memo, lvar_memo),
                b: self.pack_rec(*b, packed, node_memo, lvar_memo),
            },
            IForm::Memv { a, b, .. } => PackedNode::Memv {
                a: self.pack_rec(*a, packed, node_memo, lvar_memo),
                b: self.pack_rec(*b, packed, node_memo, lvar_memo),
            },
            IForm::Eq { a, b, .. } => PackedNode::Eq {
                a: self.pack_rec(*a, packed, node_memo, lvar_memo),
                b: self.pack_rec(*b, packed, node_memo, lvar_memo),
            },
            IForm::Eqv { a, b, .. } => PackedNode::Eqv {
                a: self.pack_rec(*a, packed, node_memo, lvar_memo),
                b: self.pack_rec(*b, packed, node_memo, lvar_memo),
            },
            IForm::List { elts, .. } => PackedNode::List {
                elts: elts
                    .iter()
                    .map(|&e| self.pack_rec(e, packed, node_memo, lvar_memo))
                    .collect(),
            },
            IForm::ListStar { elts, .. } => PackedNode::ListStar {
                elts: elts
                    .iter()
                    .map(|&e| self.pack_rec(e, packed, node_memo, lvar_memo))
                    .collect(),
            },
            IForm::Vector { elts, .. } => PackedNode::Vector {
                elts: elts
                    .iter()
                    .map(|&e| self.pack_rec(e, packed, node_memo, lvar_memo))
                    .collect(),
            },
            IForm::ListToVec { arg, .. } => PackedNode::ListToVec {
                arg: self.pack_rec(*arg, packed, node_memo, lvar_memo),
            },
            IForm::It => PackedNode::It,
        };
        packed.nodes[idx as usize] = node;
        idx
    }

    /// Reconstructs a packed subtree into this arena.
    ///
    /// Every LVar in the packed form gets a fresh record so each expansion
    /// of a `define-inline` body is independent; `Label` sharing is
    /// preserved through the node memo table.
    pub fn unpack(&mut self, packed: &PackedIr) -> IFormId {
        let lvars: Vec<LVarId> = packed.lvar_names.iter().map(|&name| self.new_lvar(name)).collect();
        let mut node_memo = AHashMap::new();
        self.unpack_rec(packed, packed.root, &lvars, &mut node_memo)
    }

    fn unpack_rec(
        &mut self,
        packed: &PackedIr,
        idx: u32,
        lvars: &[LVarId],
        node_memo: &mut AHashMap<u32, IFormId>,
    ) -> IFormId {
        if let Some(&id) = node_memo.get(&idx) {
            return id;
        }
        // Reserve the slot first so shared references (labels) resolve to
        // the same node.
        let id = self.alloc(IForm::It);
        node_memo.insert(idx, id);
        let node = match &packed.nodes[idx as usize] {
            PackedNode::Define { constant, id: defid, expr } => IForm::Define {
                src: None,
                constant: *constant,
                id: defid.clone(),
                expr: self.unpack_rec(packed, *expr, lvars, node_memo),
            },
            PackedNode::LRef { lvar } => {
                let lvar = lvars[*lvar as usize];
                self.ref_inc(lvar);
                IForm::LRef { lvar }
            }
            PackedNode::LSet { lvar, expr } => {
                let lvar = lvars[*lvar as usize];
                self.set_inc(lvar);
                IForm::LSet {
                    lvar,
                    expr: self.unpack_rec(packed, *expr, lvars, node_memo),
                }
            }
            PackedNode::GRef { id: gid } => IForm::GRef { id: gid.clone() },
            PackedNode::GSet { id: gid, expr } => IForm::GSet {
                id: gid.clone(),
                expr: self.unpack_rec(packed, *expr, lvars, node_memo),
            },
            PackedNode::Const { value } => IForm::Const { value: value.clone() },
            PackedNode::If { test, then_br, else_br } => IForm::If {
                src: None,
                test: self.unpack_rec(packed, *test, lvars, node_memo),
                then_br: self.unpack_rec(packed, *then_br, lvars, node_memo),
                else_br: self.unpack_rec(packed, *else_br, lvars, node_memo),
            },
            PackedNode::Let { kind, lvars: lvs, inits, body } => {
                let new_lvars: Vec<LVarId> = lvs.iter().map(|&lv| lvars[lv as usize]).collect();
                let new_inits: Vec<IFormId> = inits
                    .iter()
                    .map(|&i| self.unpack_rec(packed, i, lvars, node_memo))
                    .collect();
                for (lv, init) in new_lvars.iter().zip(&new_inits) {
                    self.lvar_mut(*lv).init = Some(*init);
                }
                IForm::Let {
                    src: None,
                    kind: *kind,
                    lvars: new_lvars,
                    inits: new_inits,
                    body: self.unpack_rec(packed, *body, lvars, node_memo),
                }
            }
            PackedNode::Receive {
                reqargs,
                optarg,
                lvars: lvs,
                expr,
                body,
            } => IForm::Receive {
                src: None,
                reqargs: *reqargs,
                optarg: *optarg,
                lvars: lvs.iter().map(|&lv| lvars[lv as usize]).collect(),
                expr: self.unpack_rec(packed, *expr, lvars, node_memo),
                body: self.unpack_rec(packed, *body, lvars, node_memo),
            },
            PackedNode::Lambda {
                name,
                reqargs,
                optarg,
                lvars: lvs,
                body,
                flag,
            } => IForm::Lambda {
                src: None,
                name: name.clone(),
                reqargs: *reqargs,
                optarg: *optarg,
                lvars: lvs.iter().map(|&lv| lvars[lv as usize]).collect(),
                body: self.unpack_rec(packed, *body, lvars, node_memo),
                flag: *flag,
                calls: Vec::new(),
            },
            PackedNode::Label { body } => IForm::Label {
                label: None,
                body: self.unpack_rec(packed, *body, lvars, node_memo),
            },
            PackedNode::Seq { body } => IForm::Seq {
                body: body
                    .iter()
                    .map(|&b| self.unpack_rec(packed, b, lvars, node_memo))
                    .collect(),
            },
            PackedNode::Call { proc, args, flag } => IForm::Call {
                src: None,
                proc: self.unpack_rec(packed, *proc, lvars, node_memo),
                args: args
                    .iter()
                    .map(|&a| self.unpack_rec(packed, a, lvars, node_memo))
                    .collect(),
                flag: *flag,
            },
            PackedNode::Asm { insn, args } => IForm::Asm {
                src: None,
                insn: insn.clone(),
                args: args
                    .iter()
                    .map(|&a| self.unpack_rec(packed, a, lvars, node_memo))
                    .collect(),
            },
            PackedNode::Promise { expr } => IForm::Promise {
                src: None,
                expr: self.unpack_rec(packed, *expr, lvars, node_memo),
            },
            PackedNode::Cons { a, b } => IForm::Cons {
                src: None,
                a: self.unpack_rec(packed, *a, lvars, node_memo),
                b: self.unpack_rec(packed, *b, lvars, node_memo),
            },
            PackedNode::Append { a, b } => IForm::Append {
                src: None,
                a: self.unpack_rec(packed, *a, lvars, node_memo),
                b: self.unpack_rec(packed, *b, lvars, node_memo),
            },
            PackedNode::Memv { a, b } => IForm::Memv {
                src: None,
                a: self.unpack_rec(packed, *a, lvars, node_memo),
                b: self.unpack_rec(packed, *b, lvars, node_memo),
            },
            PackedNode::Eq { a, b } => IForm::Eq {
                src: None,
                a: self.unpack_rec(packed, *a, lvars, node_memo),
                b: self.unpack_rec(packed, *b, lvars, node_memo),
            },
            PackedNode::Eqv { a, b } => IForm::Eqv {
                src: None,
                a: self.unpack_rec(packed, *a, lvars, node_memo),
                b: self.unpack_rec(packed, *b, lvars, node_memo),
            },
            PackedNode::List { elts } => IForm::List {
                src: None,
                elts: elts
                    .iter()
                    .map(|&e| self.unpack_rec(packed, e, lvars, node_memo))
                    .collect(),
            },
            PackedNode::ListStar { elts } => IForm::ListStar {
                src: None,
                elts: elts
                    .iter()
                    .map(|&e| self.unpack_rec(packed, e, lvars, node_memo))
                    .collect(),
            },
            PackedNode::Vector { elts } => IForm::Vector {
                src: None,
                elts: elts
                    .iter()
                    .map(|&e| self.unpack_rec(packed, e, lvars, node_memo))
                    .collect(),
            },
            PackedNode::ListToVec { arg } => IForm::ListToVec {
                src: None,
                arg: self.unpack_rec(packed, *arg, lvars, node_memo),
            },
            PackedNode::It => IForm::It,
        };
        self.set(id, node);
        id
    }

    // --- structural equality ---

    /// Structural comparison of two subtrees in this arena, modulo LVar
    /// identity (a bijection between the two sides is built as the walk
    /// proceeds) and source-form handles.
    #[must_use]
    pub fn structurally_equal(&self, a: IFormId, b: IFormId) -> bool {
        let mut lvar_map = AHashMap::new();
        let mut label_map = AHashMap::new();
        self.eq_rec(a, b, &mut lvar_map, &mut label_map)
    }

    fn eq_lvars(&self, a: &[LVarId], b: &[LVarId], map: &mut AHashMap<LVarId, LVarId>) -> bool {
        a.len() == b.len()
            && a.iter().zip(b).all(|(&la, &lb)| {
                if self.lvar(la).name != self.lvar(lb).name {
                    return false;
                }
                map.insert(la, lb);
                true
            })
    }

    fn eq_ids(
        &self,
        a: &[IFormId],
        b: &[IFormId],
        lvar_map: &mut AHashMap<LVarId, LVarId>,
        label_map: &mut AHashMap<IFormId, IFormId>,
    ) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(&xa, &xb)| self.eq_rec(xa, xb, lvar_map, label_map))
    }

    fn eq_rec(
        &self,
        a: IFormId,
        b: IFormId,
        lvar_map: &mut AHashMap<LVarId, LVarId>,
        label_map: &mut AHashMap<IFormId, IFormId>,
    ) -> bool {
        match (self.get(a), self.get(b)) {
            (
                IForm::Define {
                    constant: ca, id: ia, expr: ea, ..
                },
                IForm::Define {
                    constant: cb, id: ib, expr: eb, ..
                },
            ) => ca == cb && ia == ib && self.eq_rec(*ea, *eb, lvar_map, label_map),
            (IForm::LRef { lvar: la }, IForm::LRef { lvar: lb }) => {
                lvar_map.get(la).copied().unwrap_or(*la) == *lb
            }
            (IForm::LSet { lvar: la, expr: ea }, IForm::LSet { lvar: lb, expr: eb }) => {
                lvar_map.get(la).copied().unwrap_or(*la) == *lb && self.eq_rec(*ea, *eb, lvar_map, label_map)
            }
            (IForm::GRef { id: ia }, IForm::GRef { id: ib }) => {
                gref_target_eq(ia, ib)
            }
            (IForm::GSet { id: ia, expr: ea }, IForm::GSet { id: ib, expr: eb }) => {
                gref_target_eq(ia, ib) && self.eq_rec(*ea, *eb, lvar_map, label_map)
            }
            (IForm::Const { value: va }, IForm::Const { value: vb }) => va == vb,
            (
                IForm::If {
                    test: ta,
                    then_br: tha,
                    else_br: ela,
                    ..
                },
                IForm::If {
                    test: tb,
                    then_br: thb,
                    else_br: elb,
                    ..
                },
            ) => {
                self.eq_rec(*ta, *tb, lvar_map, label_map)
                    && self.eq_rec(*tha, *thb, lvar_map, label_map)
                    && self.eq_rec(*ela, *elb, lvar_map, label_map)
            }
            (
                IForm::Let {
                    kind: ka,
                    lvars: la,
                    inits: ia,
                    body: ba,
                    ..
                },
                IForm::Let {
                    kind: kb,
                    lvars: lb,
                    inits: ib,
                    body: bb,
                    ..
                },
            ) => {
                ka == kb
                    && self.eq_lvars(la, lb, lvar_map)
                    && self.eq_ids(ia, ib, lvar_map, label_map)
                    && self.eq_rec(*ba, *bb, lvar_map, label_map)
            }
            (
                IForm::Receive {
                    reqargs: ra,
                    optarg: oa,
                    lvars: la,
                    expr: ea,
                    body: ba,
                    ..
                },
                IForm::Receive {
                    reqargs: rb,
                    optarg: ob,
                    lvars: lb,
                    expr: eb,
                    body: bb,
                    ..
                },
            ) => {
                ra == rb
                    && oa == ob
                    && self.eq_rec(*ea, *eb, lvar_map, label_map)
                    && self.eq_lvars(la, lb, lvar_map)
                    && self.eq_rec(*ba, *bb, lvar_map, label_map)
            }
            (
                IForm::Lambda {
                    name: na,
                    reqargs: ra,
                    optarg: oa,
                    lvars: la,
                    body: ba,
                    flag: fa,
                    ..
                },
                IForm::Lambda {
                    name: nb,
                    reqargs: rb,
                    optarg: ob,
                    lvars: lb,
                    body: bb,
                    flag: fb,
                    ..
                },
            ) => {
                na == nb
                    && ra == rb
                    && oa == ob
                    && fa == fb
                    && self.eq_lvars(la, lb, lvar_map)
                    && self.eq_rec(*ba, *bb, lvar_map, label_map)
            }
            (IForm::Label { body: ba, .. }, IForm::Label { body: bb, .. }) => {
                if let Some(&mapped) = label_map.get(&a) {
                    return mapped == b;
                }
                label_map.insert(a, b);
                self.eq_rec(*ba, *bb, lvar_map, label_map)
            }
            (IForm::Seq { body: ba }, IForm::Seq { body: bb }) => self.eq_ids(ba, bb, lvar_map, label_map),
            (
                IForm::Call {
                    proc: pa,
                    args: aa,
                    flag: fa,
                    ..
                },
                IForm::Call {
                    proc: pb,
                    args: ab,
                    flag: fb,
                    ..
                },
            ) => {
                // Jump operators point back at their embed call; comparing
                // them would recurse through the cycle.
                fa == fb
                    && (*fa == CallFlag::Jump || self.eq_rec(*pa, *pb, lvar_map, label_map))
                    && self.eq_ids(aa, ab, lvar_map, label_map)
            }
            (IForm::Asm { insn: ia, args: aa, .. }, IForm::Asm { insn: ib, args: ab, .. }) => {
                ia == ib && self.eq_ids(aa, ab, lvar_map, label_map)
            }
            (IForm::Promise { expr: ea, .. }, IForm::Promise { expr: eb, .. }) => {
                self.eq_rec(*ea, *eb, lvar_map, label_map)
            }
            (IForm::Cons { a: xa, b: ya, .. }, IForm::Cons { a: xb, b: yb, .. })
            | (IForm::Append { a: xa, b: ya, .. }, IForm::Append { a: xb, b: yb, .. })
            | (IForm::Memv { a: xa, b: ya, .. }, IForm::Memv { a: xb, b: yb, .. })
            | (IForm::Eq { a: xa, b: ya, .. }, IForm::Eq { a: xb, b: yb, .. })
            | (IForm::Eqv { a: xa, b: ya, .. }, IForm::Eqv { a: xb, b: yb, .. }) => {
                self.eq_rec(*xa, *xb, lvar_map, label_map) && self.eq_rec(*ya, *yb, lvar_map, label_map)
            }
            (IForm::List { elts: ea, .. }, IForm::List { elts: eb, .. })
            | (IForm::ListStar { elts: ea, .. }, IForm::ListStar { elts: eb, .. })
            | (IForm::Vector { elts: ea, .. }, IForm::Vector { elts: eb, .. }) => {
                self.eq_ids(ea, eb, lvar_map, label_map)
            }
            (IForm::ListToVec { arg: xa, .. }, IForm::ListToVec { arg: xb, .. }) => {
                self.eq_rec(*xa, *xb, lvar_map, label_map)
            }
            (IForm::It, IForm::It) => true,
            _ => false,
        }
    }

    // --- diagnostics ---

    /// Renders the subtree at `id` as an indented tree, one node per line.
    #[must_use]
    pub fn dump(&self, id: IFormId) -> String {
        let mut out = String::new();
        let mut seen_labels = AHashMap::new();
        self.dump_rec(id, 0, &mut out, &mut seen_labels);
        out
    }

    fn lvar_text(&self, lv: LVarId) -> String {
        let v = self.lvar(lv);
        format!("{}.{}[{};{}]", v.name, lv.index(), v.ref_count, v.set_count)
    }

    fn dump_rec(&self, id: IFormId, indent: usize, out: &mut String, seen_labels: &mut AHashMap<IFormId, usize>) {
        use std::fmt::Write as _;
        let pad = "  ".repeat(indent);
        macro_rules! line {
            ($($t:tt)*) => {{ let _ = write!(out, "{pad}"); let _ = writeln!(out, $($t)*); }};
        }
        match self.get(id) {
            IForm::Define { constant, id: defid, expr, .. } => {
                line!("($define{} {defid}", if *constant { " const" } else { "" });
                self.dump_rec(*expr, indent + 1, out, seen_labels);
                line!(")");
            }
            IForm::LRef { lvar } => line!("($lref {})", self.lvar_text(*lvar)),
            IForm::LSet { lvar, expr } => {
                line!("($lset {}", self.lvar_text(*lvar));
                self.dump_rec(*expr, indent + 1, out, seen_labels);
                line!(")");
            }
            IForm::GRef { id: gid } => line!("($gref {gid})"),
            IForm::GSet { id: gid, expr } => {
                line!("($gset {gid}");
                self.dump_rec(*expr, indent + 1, out, seen_labels);
                line!(")");
            }
            IForm::Const { value } => line!("($const {value})"),
            IForm::If { test, then_br, else_br, .. } => {
                line!("($if");
                self.dump_rec(*test, indent + 1, out, seen_labels);
                self.dump_rec(*then_br, indent + 1, out, seen_labels);
                self.dump_rec(*else_br, indent + 1, out, seen_labels);
                line!(")");
            }
            IForm::Let { kind, lvars, inits, body, .. } => {
                let kind = match kind {
                    LetKind::Let => "let",
                    LetKind::Rec => "rec",
                };
                line!("($let {kind} ({})", lvars.iter().map(|&lv| self.lvar_text(lv)).collect::<Vec<_>>().join(" "));
                for init in inits {
                    self.dump_rec(*init, indent + 1, out, seen_labels);
                }
                line!(" =>");
                self.dump_rec(*body, indent + 1, out, seen_labels);
                line!(")");
            }
            IForm::Receive { reqargs, optarg, lvars, expr, body, .. } => {
                line!(
                    "($receive {reqargs}{} ({})",
                    if *optarg { "+" } else { "" },
                    lvars.iter().map(|&lv| self.lvar_text(lv)).collect::<Vec<_>>().join(" ")
                );
                self.dump_rec(*expr, indent + 1, out, seen_labels);
                self.dump_rec(*body, indent + 1, out, seen_labels);
                line!(")");
            }
            IForm::Lambda { name, reqargs, optarg, lvars, body, flag, .. } => {
                let name = name.as_ref().map_or_else(|| "#f".to_owned(), ToString::to_string);
                line!(
                    "($lambda[{flag:?}] {name} {reqargs}{} ({})",
                    if *optarg { "+" } else { "" },
                    lvars.iter().map(|&lv| self.lvar_text(lv)).collect::<Vec<_>>().join(" ")
                );
                self.dump_rec(*body, indent + 1, out, seen_labels);
                line!(")");
            }
            IForm::Label { body, .. } => {
                let n = seen_labels.len();
                if let Some(&prev) = seen_labels.get(&id) {
                    line!("($label #{prev})");
                } else {
                    seen_labels.insert(id, n);
                    line!("($label #{n}");
                    self.dump_rec(*body, indent + 1, out, seen_labels);
                    line!(")");
                }
            }
            IForm::Seq { body } => {
                line!("($seq");
                for b in body {
                    self.dump_rec(*b, indent + 1, out, seen_labels);
                }
                line!(")");
            }
            IForm::Call { proc, args, flag, .. } => {
                line!("($call[{flag:?}]");
                if *flag == CallFlag::Jump {
                    line!("  (-> embedded label)");
                } else {
                    self.dump_rec(*proc, indent + 1, out, seen_labels);
                }
                for a in args {
                    self.dump_rec(*a, indent + 1, out, seen_labels);
                }
                line!(")");
            }
            IForm::Asm { insn, args, .. } => {
                line!("($asm {}{:?}", insn.op.name(), insn.args.as_slice());
                for a in args {
                    self.dump_rec(*a, indent + 1, out, seen_labels);
                }
                line!(")");
            }
            IForm::Promise { expr, .. } => {
                line!("($promise");
                self.dump_rec(*expr, indent + 1, out, seen_labels);
                line!(")");
            }
            IForm::Cons { a, b, .. } => self.dump_two("$cons", *a, *b, indent, out, seen_labels),
            IForm::Append { a, b, .. } => self.dump_two("$append", *a, *b, indent, out, seen_labels),
            IForm::Memv { a, b, .. } => self.dump_two("$memv", *a, *b, indent, out, seen_labels),
            IForm::Eq { a, b, .. } => self.dump_two("$eq?", *a, *b, indent, out, seen_labels),
            IForm::Eqv { a, b, .. } => self.dump_two("$eqv?", *a, *b, indent, out, seen_labels),
            IForm::List { elts, .. } => self.dump_many("$list", elts, indent, out, seen_labels),
            IForm::ListStar { elts, .. } => self.dump_many("$list*", elts, indent, out, seen_labels),
            IForm::Vector { elts, .. } => self.dump_many("$vector", elts, indent, out, seen_labels),
            IForm::ListToVec { arg, .. } => {
                line!("($list->vector");
                self.dump_rec(*arg, indent + 1, out, seen_labels);
                line!(")");
            }
            IForm::It => line!("($it)"),
        }
    }

    fn dump_two(
        &self,
        tag: &str,
        a: IFormId,
        b: IFormId,
        indent: usize,
        out: &mut String,
        seen_labels: &mut AHashMap<IFormId, usize>,
    ) {
        use std::fmt::Write as _;
        let pad = "  ".repeat(indent);
        let _ = writeln!(out, "{pad}({tag}");
        self.dump_rec(a, indent + 1, out, seen_labels);
        self.dump_rec(b, indent + 1, out, seen_labels);
        let _ = writeln!(out, "{pad})");
    }

    fn dump_many(
        &self,
        tag: &str,
        elts: &[IFormId],
        indent: usize,
        out: &mut String,
        seen_labels: &mut AHashMap<IFormId, usize>,
    ) {
        use std::fmt::Write as _;
        let pad = "  ".repeat(indent);
        let _ = writeln!(out, "{pad}({tag}");
        for e in elts {
            self.dump_rec(*e, indent + 1, out, seen_labels);
        }
        let _ = writeln!(out, "{pad})");
    }
}

/// Global references created by different compilations wrap the same name
/// in distinct identifier objects; compare them by name.
fn gref_target_eq(a: &Value, b: &Value) -> bool {
    match (a.variable_name(), b.variable_name()) {
        (Some(na), Some(nb)) => na == nb,
        _ => a == b,
    }
}

/// A flat, self-contained encoding of an IR subtree, used by
/// `define-inline` to persist procedure bodies for later call-site
/// expansion.
#[derive(Debug, Clone)]
pub struct PackedIr {
    lvar_names: Vec<Symbol>,
    nodes: Vec<PackedNode>,
    root: u32,
}

impl PackedIr {
    /// Number of nodes in the packed form.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone)]
enum PackedNode {
    Define { constant: bool, id: Value, expr: u32 },
    LRef { lvar: u32 },
    LSet { lvar: u32, expr: u32 },
    GRef { id: Value },
    GSet { id: Value, expr: u32 },
    Const { value: Value },
    If { test: u32, then_br: u32, else_br: u32 },
    Let { kind: LetKind, lvars: Vec<u32>, inits: Vec<u32>, body: u32 },
    Receive { reqargs: u32, optarg: bool, lvars: Vec<u32>, expr: u32, body: u32 },
    Lambda { name: Option<Value>, reqargs: u32, optarg: bool, lvars: Vec<u32>, body: u32, flag: LambdaFlag },
    Label { body: u32 },
    Seq { body: Vec<u32> },
    Call { proc: u32, args: Vec<u32>, flag: CallFlag },
    Asm { insn: AsmInsn, args: Vec<u32> },
    Promise { expr: u32 },
    Cons { a: u32, b: u32 },
    Append { a: u32, b: u32 },
    Memv { a: u32, b: u32 },
    Eq { a: u32, b: u32 },
    Eqv { a: u32, b: u32 },
    List { elts: Vec<u32> },
    ListStar { elts: Vec<u32> },
    Vector { elts: Vec<u32> },
    ListToVec { arg: u32 },
    It,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::intern;

    /// Builds `($let ((x 1)) ($if ($lref x) ($lref x) ($const 2)))`.
    fn sample_let(pool: &mut IrPool) -> IFormId {
        let x = pool.new_lvar(intern("x"));
        let one = pool.const_node(Value::Int(1));
        pool.lvar_mut(x).init = Some(one);
        let r1 = pool.alloc(IForm::LRef { lvar: x });
        pool.ref_inc(x);
        let r2 = pool.alloc(IForm::LRef { lvar: x });
        pool.ref_inc(x);
        let two = pool.const_node(Value::Int(2));
        let iff = pool.alloc(IForm::If {
            src: None,
            test: r1,
            then_br: r2,
            else_br: two,
        });
        pool.alloc(IForm::Let {
            src: None,
            kind: LetKind::Let,
            lvars: vec![x],
            inits: vec![one],
            body: iff,
        })
    }

    #[test]
    fn test_count_size_upto() {
        let mut pool = IrPool::new();
        let id = sample_let(&mut pool);
        // let + const-init + if + lref + lref + const = 6 nodes
        assert_eq!(pool.count_size_upto(id, 100), 6);
        assert_eq!(pool.count_size_upto(id, 3), 3);
        assert!(pool.count_size_upto(id, 100) >= pool.count_size_upto(id, 3));
    }

    #[test]
    fn test_copy_rebinds_lvars_and_counts() {
        let mut pool = IrPool::new();
        let id = sample_let(&mut pool);
        let mut lvar_map = AHashMap::new();
        let copy = pool.copy(id, &mut lvar_map);
        assert!(pool.structurally_equal(id, copy));
        assert_eq!(lvar_map.len(), 1);
        let (&orig, &fresh) = lvar_map.iter().next().unwrap();
        assert_ne!(orig, fresh);
        assert_eq!(pool.lvar(orig).ref_count, 2);
        assert_eq!(pool.lvar(fresh).ref_count, 2);
    }

    #[test]
    fn test_copy_keeps_outer_lvars() {
        let mut pool = IrPool::new();
        let outer = pool.new_lvar(intern("outer"));
        let r = pool.alloc(IForm::LRef { lvar: outer });
        pool.ref_inc(outer);
        let mut lvar_map = AHashMap::new();
        let copy = pool.copy(r, &mut lvar_map);
        match pool.get(copy) {
            IForm::LRef { lvar } => assert_eq!(*lvar, outer),
            other => panic!("expected LRef, got {other:?}"),
        }
        assert_eq!(pool.lvar(outer).ref_count, 2);
    }

    #[test]
    fn test_pack_unpack_matches_copy() {
        let mut pool = IrPool::new();
        let id = sample_let(&mut pool);
        let packed = pool.pack(id);
        let unpacked = pool.unpack(&packed);
        let mut lvar_map = AHashMap::new();
        let copied = pool.copy(id, &mut lvar_map);
        assert!(pool.structurally_equal(unpacked, copied));
        assert!(pool.structurally_equal(id, unpacked));
    }

    #[test]
    fn test_label_sharing_survives_copy_and_pack() {
        let mut pool = IrPool::new();
        let body = pool.const_node(Value::Int(1));
        let label = pool.alloc(IForm::Label { label: None, body });
        // Two references to the same label, as embed+jump would create.
        let seq = pool.alloc(IForm::Seq { body: vec![label, label] });

        let mut lvar_map = AHashMap::new();
        let copy = pool.copy(seq, &mut lvar_map);
        match pool.get(copy) {
            IForm::Seq { body } => assert_eq!(body[0], body[1], "label sharing lost in copy"),
            other => panic!("expected Seq, got {other:?}"),
        }

        let packed = pool.pack(seq);
        let unpacked = pool.unpack(&packed);
        match pool.get(unpacked) {
            IForm::Seq { body } => assert_eq!(body[0], body[1], "label sharing lost in pack/unpack"),
            other => panic!("expected Seq, got {other:?}"),
        }
    }

    #[test]
    fn test_dump_contains_tags() {
        let mut pool = IrPool::new();
        let id = sample_let(&mut pool);
        let text = pool.dump(id);
        assert!(text.contains("($let let"));
        assert!(text.contains("($const 1)"));
        assert!(text.contains("($lref x."));
    }
}
