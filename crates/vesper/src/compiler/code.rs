//! Compiled-code objects.
//!
//! The output of pass 3: a vector of word-coded instructions plus the
//! metadata the VM needs to run them (arity, maximum stack depth, name).
//! Literals are carried inline in instruction operand slots; nested
//! procedure bodies appear as `Code` operands.

use std::fmt::Write as _;
use std::rc::Rc;

use crate::compiler::iform::PackedIr;
use crate::compiler::op::{Opcode, OperandKind};
use crate::value::Value;

/// A forward-reference token allocated by the instruction builder.
///
/// Labels are opaque; they resolve to instruction offsets when the builder
/// finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLabel(pub(crate) u32);

/// One slot of a `LOCAL-ENV-CLOSURES` operand: either a pre-computed
/// constant or a closure body to allocate in the new frame.
#[derive(Debug, Clone)]
pub enum ClosureSlot {
    Const(Value),
    Code(Rc<CompiledCode>),
}

impl PartialEq for ClosureSlot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ClosureSlot::Const(a), ClosureSlot::Const(b)) => a == b,
            (ClosureSlot::Code(a), ClosureSlot::Code(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The out-of-line operand of an instruction.
#[derive(Debug, Clone, Default)]
pub enum Operand {
    #[default]
    None,
    /// A literal value.
    Obj(Value),
    /// An unresolved jump target; only present while building.
    Label(CodeLabel),
    /// A resolved jump target: an instruction offset.
    Addr(u32),
    /// A literal plus an unresolved target (`BNEQC`, `BNEQVC`).
    ObjLabel(Value, CodeLabel),
    /// A literal plus a resolved target.
    ObjAddr(Value, u32),
    /// A nested compiled-code object.
    Code(Rc<CompiledCode>),
    /// Closure slots for `LOCAL-ENV-CLOSURES`.
    Codes(Vec<ClosureSlot>),
}

impl PartialEq for Operand {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Operand::None, Operand::None) => true,
            (Operand::Obj(a), Operand::Obj(b)) => a == b,
            (Operand::Label(a), Operand::Label(b)) => a == b,
            (Operand::Addr(a), Operand::Addr(b)) => a == b,
            (Operand::ObjLabel(va, la), Operand::ObjLabel(vb, lb)) => va == vb && la == lb,
            (Operand::ObjAddr(va, aa), Operand::ObjAddr(vb, ab)) => va == vb && aa == ab,
            (Operand::Code(a), Operand::Code(b)) => Rc::ptr_eq(a, b),
            (Operand::Codes(a), Operand::Codes(b)) => a == b,
            _ => false,
        }
    }
}

/// A single word-coded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Insn {
    pub op: Opcode,
    pub arg0: i32,
    pub arg1: i32,
    pub operand: Operand,
}

impl Insn {
    #[must_use]
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            arg0: 0,
            arg1: 0,
            operand: Operand::None,
        }
    }

    #[must_use]
    pub fn arg(op: Opcode, arg0: i32) -> Self {
        Self {
            op,
            arg0,
            arg1: 0,
            operand: Operand::None,
        }
    }

    #[must_use]
    pub fn args(op: Opcode, arg0: i32, arg1: i32) -> Self {
        Self {
            op,
            arg0,
            arg1,
            operand: Operand::None,
        }
    }

    #[must_use]
    pub fn obj(op: Opcode, value: Value) -> Self {
        Self {
            op,
            arg0: 0,
            arg1: 0,
            operand: Operand::Obj(value),
        }
    }

    #[must_use]
    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operand = operand;
        self
    }
}

impl std::fmt::Display for Insn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.op.name())?;
        match self.op.num_args() {
            1 => write!(f, "({})", self.arg0)?,
            2 => write!(f, "({},{})", self.arg0, self.arg1)?,
            _ => {}
        }
        match &self.operand {
            Operand::None => {}
            Operand::Obj(v) => write!(f, " {v}")?,
            Operand::Label(l) => write!(f, " label#{}", l.0)?,
            Operand::Addr(a) => write!(f, " >{a}")?,
            Operand::ObjLabel(v, l) => write!(f, " {v} label#{}", l.0)?,
            Operand::ObjAddr(v, a) => write!(f, " {v} >{a}")?,
            Operand::Code(c) => write!(f, " #<code {}>", c.name())?,
            Operand::Codes(slots) => write!(f, " #<closures {}>", slots.len())?,
        }
        Ok(())
    }
}

/// A finalized code object.
#[derive(Debug)]
pub struct CompiledCode {
    name: Value,
    reqargs: u32,
    optarg: bool,
    code: Vec<Insn>,
    max_stack: u32,
    parent_name: Option<Value>,
    /// Packed IR snapshot attached by `define-inline`.
    intform: Option<Rc<PackedIr>>,
}

impl CompiledCode {
    pub(crate) fn new(
        name: Value,
        reqargs: u32,
        optarg: bool,
        code: Vec<Insn>,
        max_stack: u32,
        parent_name: Option<Value>,
        intform: Option<Rc<PackedIr>>,
    ) -> Self {
        Self {
            name,
            reqargs,
            optarg,
            code,
            max_stack,
            parent_name,
            intform,
        }
    }

    #[must_use]
    pub fn name(&self) -> &Value {
        &self.name
    }

    #[must_use]
    pub fn reqargs(&self) -> u32 {
        self.reqargs
    }

    #[must_use]
    pub fn optarg(&self) -> bool {
        self.optarg
    }

    #[must_use]
    pub fn code(&self) -> &[Insn] {
        &self.code
    }

    /// Upper bound on the operand-stack depth any execution of this code
    /// can reach, used by the VM for stack checks.
    #[must_use]
    pub fn max_stack(&self) -> u32 {
        self.max_stack
    }

    #[must_use]
    pub fn parent_name(&self) -> Option<&Value> {
        self.parent_name.as_ref()
    }

    #[must_use]
    pub fn intform(&self) -> Option<&Rc<PackedIr>> {
        self.intform.as_ref()
    }

    /// The literal pool: every `Obj` operand, in instruction order.
    #[must_use]
    pub fn constants(&self) -> Vec<Value> {
        self.code
            .iter()
            .filter_map(|insn| match &insn.operand {
                Operand::Obj(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    /// Renders the instruction vector, recursing into nested code objects.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, 0);
        out
    }

    fn disassemble_into(&self, out: &mut String, indent: usize) {
        let pad = "  ".repeat(indent);
        let _ = writeln!(
            out,
            "{pad};; code {} (req {}, opt {}, maxstack {})",
            self.name,
            self.reqargs,
            if self.optarg { "#t" } else { "#f" },
            self.max_stack
        );
        let mut nested: Vec<Rc<CompiledCode>> = Vec::new();
        for (idx, insn) in self.code.iter().enumerate() {
            let _ = writeln!(out, "{pad}{idx:>4}  {insn}");
            match &insn.operand {
                Operand::Code(c) => nested.push(Rc::clone(c)),
                Operand::Codes(slots) => {
                    for slot in slots {
                        if let ClosureSlot::Code(c) = slot {
                            nested.push(Rc::clone(c));
                        }
                    }
                }
                _ => {}
            }
        }
        for c in nested {
            c.disassemble_into(out, indent + 1);
        }
    }

    /// True when every label operand was resolved to an address.
    #[must_use]
    pub fn labels_resolved(&self) -> bool {
        !self
            .code
            .iter()
            .any(|insn| matches!(insn.operand, Operand::Label(_)) && insn.op.operand_kind() == OperandKind::Addr)
    }
}
