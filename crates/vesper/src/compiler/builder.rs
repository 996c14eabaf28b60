//! Builder for emitting instructions during pass 3.
//!
//! `CodeBuilder` provides methods for appending instructions, allocating
//! and resolving labels, and inspecting the previously appended
//! instruction so adjacent pairs can be fused into specialized forms at
//! the emit boundary.
//!
//! # Usage
//!
//! ```ignore
//! let mut b = CodeBuilder::new(0, false, name, None, None);
//! let l = b.new_label();
//! b.emit_branch(Opcode::BF, l);
//! b.emit_obj(Opcode::Const, Value::Int(1));
//! b.set_label(l);
//! b.emit(Opcode::Ret);
//! let code = b.finish(max_stack)?;
//! ```

use std::rc::Rc;

use crate::compiler::code::{CodeLabel, CompiledCode, Insn, Operand};
use crate::compiler::iform::PackedIr;
use crate::compiler::op::Opcode;
use crate::error::{CompileError, CompileResult};
use crate::value::Value;

/// Append-only instruction buffer with label patching and a one-back
/// peephole combiner.
pub struct CodeBuilder {
    name: Value,
    reqargs: u32,
    optarg: bool,
    parent_name: Option<Value>,
    intform: Option<Rc<PackedIr>>,

    code: Vec<Insn>,
    /// Label table: offset once set, `None` while pending.
    labels: Vec<Option<u32>>,
    /// Fusion barrier. The last instruction may only be rewritten when its
    /// index is at or past this; `set_label` advances it so a fusion can
    /// never swallow a jump target.
    barrier: usize,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(
        reqargs: u32,
        optarg: bool,
        name: Value,
        parent_name: Option<Value>,
        intform: Option<Rc<PackedIr>>,
    ) -> Self {
        Self {
            name,
            reqargs,
            optarg,
            parent_name,
            intform,
            code: Vec::new(),
            labels: Vec::new(),
            barrier: 0,
        }
    }

    /// Allocates a fresh, unresolved label.
    #[must_use]
    pub fn new_label(&mut self) -> CodeLabel {
        let id = u32::try_from(self.labels.len()).expect("label table exceeds u32 range");
        self.labels.push(None);
        CodeLabel(id)
    }

    /// Binds `label` to the current emit offset.
    pub fn set_label(&mut self, label: CodeLabel) {
        let here = u32::try_from(self.code.len()).expect("code vector exceeds u32 range");
        self.labels[label.0 as usize] = Some(here);
        self.barrier = self.code.len();
    }

    /// The most recently appended instruction, if any.
    #[must_use]
    pub fn current_insn(&self) -> Option<&Insn> {
        self.code.last()
    }

    /// Replaces the most recently appended instruction.
    pub fn replace_insn(&mut self, insn: Insn) {
        let last = self.code.last_mut().expect("replace_insn on empty code");
        *last = insn;
    }

    /// Current emit offset, used by tests and diagnostics.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Appends an instruction, fusing with the previous one when a
    /// combination rule applies.
    pub fn put(&mut self, insn: Insn) {
        if self.try_fuse(&insn) {
            return;
        }
        self.code.push(insn);
    }

    /// One-back combination. Returns true when `insn` was absorbed into
    /// the previous instruction.
    fn try_fuse(&mut self, insn: &Insn) -> bool {
        if self.code.len() <= self.barrier {
            return false;
        }
        let Some(prev) = self.code.last() else {
            return false;
        };
        use Opcode as Op;
        let fused = match (prev.op, insn.op) {
            (p, Op::Push) => match p {
                Op::Gref => Some(Insn::new(Op::PushGref).with_operand(prev.operand.clone())),
                Op::Const => Some(Insn::new(Op::ConstPush).with_operand(prev.operand.clone())),
                Op::ConstI => Some(Insn::arg(Op::ConstIPush, prev.arg0)),
                Op::ConstN => Some(Insn::new(Op::ConstNPush)),
                Op::ConstF => Some(Insn::new(Op::ConstFPush)),
                Op::ConstU => Some(Insn::new(Op::ConstUPush)),
                p => p
                    .lref_push_fusion()
                    .map(|op| Insn::args(op, prev.arg0, prev.arg1)),
            },
            (Op::Gref, Op::Call) => Some(Insn::arg(Op::GrefCall, insn.arg0).with_operand(prev.operand.clone())),
            (Op::Gref, Op::TailCall) => Some(Insn::arg(Op::GrefTailCall, insn.arg0).with_operand(prev.operand.clone())),
            (Op::Push, Op::PreCall) => Some(Insn::arg(Op::PushPreCall, insn.arg0).with_operand(insn.operand.clone())),
            (Op::Const, Op::Ret) => Some(Insn::new(Op::ConstRet).with_operand(prev.operand.clone())),
            (p, n) => p.car_cdr_fusion(n).map(Insn::new),
        };
        match fused {
            Some(f) => {
                self.replace_insn(f);
                true
            }
            None => false,
        }
    }

    /// Emits a no-argument instruction.
    pub fn emit(&mut self, op: Opcode) {
        self.put(Insn::new(op));
    }

    /// Emits an instruction with one integer argument.
    pub fn emit1(&mut self, op: Opcode, arg0: i32) {
        self.put(Insn::arg(op, arg0));
    }

    /// Emits an instruction with two integer arguments.
    pub fn emit2(&mut self, op: Opcode, arg0: i32, arg1: i32) {
        self.put(Insn::args(op, arg0, arg1));
    }

    /// Emits an instruction carrying a literal operand.
    pub fn emit_obj(&mut self, op: Opcode, value: Value) {
        self.put(Insn::obj(op, value));
    }

    /// Emits a branch or jump targeting `label`.
    pub fn emit_branch(&mut self, op: Opcode, label: CodeLabel) {
        self.put(Insn::new(op).with_operand(Operand::Label(label)));
    }

    /// Emits a branch with one integer argument (`BNUMNEI imm`).
    pub fn emit_branch1(&mut self, op: Opcode, arg0: i32, label: CodeLabel) {
        self.put(Insn::arg(op, arg0).with_operand(Operand::Label(label)));
    }

    /// Emits a branch comparing against a literal (`BNEQC`, `BNEQVC`).
    pub fn emit_branch_obj(&mut self, op: Opcode, value: Value, label: CodeLabel) {
        self.put(Insn::new(op).with_operand(Operand::ObjLabel(value, label)));
    }

    /// The procedure name this builder is compiling.
    #[must_use]
    pub fn name(&self) -> &Value {
        &self.name
    }

    /// True when the last emitted instruction already transfers control,
    /// making a trailing `RET` unreachable.
    pub fn just_returned(&self) -> bool {
        matches!(
            self.current_insn().map(|i| i.op),
            Some(
                Opcode::Ret
                    | Opcode::ConstRet
                    | Opcode::TailCall
                    | Opcode::GrefTailCall
                    | Opcode::LocalEnvTailCall
                    | Opcode::LocalEnvJump
            )
        )
    }

    /// Emits `LREF depth offset`, choosing a short form when one exists.
    pub fn emit_lref(&mut self, depth: i32, offset: i32) {
        match Opcode::lref_short(depth, offset) {
            Some(op) => self.emit(op),
            None => self.emit2(Opcode::Lref, depth, offset),
        }
    }

    /// Emits `RET`, fusing a preceding `CONST`. Skipped when control
    /// already left (a tail call or an earlier return).
    pub fn emit_ret(&mut self) {
        if self.just_returned() {
            return;
        }
        self.put(Insn::new(Opcode::Ret));
    }

    /// Finalizes the builder: resolves every label operand to its offset
    /// and records the maximum stack depth.
    pub fn finish(self, max_stack: u32) -> CompileResult<CompiledCode> {
        let Self {
            name,
            reqargs,
            optarg,
            parent_name,
            intform,
            mut code,
            labels,
            ..
        } = self;
        for insn in &mut code {
            match &insn.operand {
                Operand::Label(l) => {
                    let offset = labels
                        .get(l.0 as usize)
                        .copied()
                        .flatten()
                        .ok_or_else(|| CompileError::internal(format!("unresolved label #{} in {name}", l.0)))?;
                    insn.operand = Operand::Addr(offset);
                }
                Operand::ObjLabel(v, l) => {
                    let offset = labels
                        .get(l.0 as usize)
                        .copied()
                        .flatten()
                        .ok_or_else(|| CompileError::internal(format!("unresolved label #{} in {name}", l.0)))?;
                    insn.operand = Operand::ObjAddr(v.clone(), offset);
                }
                _ => {}
            }
        }
        Ok(CompiledCode::new(name, reqargs, optarg, code, max_stack, parent_name, intform))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::intern;
    use pretty_assertions::assert_eq;

    fn builder() -> CodeBuilder {
        CodeBuilder::new(0, false, Value::Sym(intern("test")), None, None)
    }

    #[test]
    fn test_emit_basic() {
        let mut b = builder();
        b.emit(Opcode::ConstN);
        b.emit(Opcode::Ret);
        let code = b.finish(0).unwrap();
        assert_eq!(code.code(), &[Insn::new(Opcode::ConstN), Insn::new(Opcode::Ret)]);
    }

    #[test]
    fn test_const_ret_fusion() {
        let mut b = builder();
        b.emit_obj(Opcode::Const, Value::Int(4));
        b.emit_ret();
        let code = b.finish(0).unwrap();
        assert_eq!(code.code(), &[Insn::obj(Opcode::ConstRet, Value::Int(4))]);
    }

    #[test]
    fn test_lref_push_fusion_uses_short_forms() {
        let mut b = builder();
        b.emit_lref(0, 2);
        b.emit(Opcode::Push);
        b.emit_lref(1, 4);
        b.emit(Opcode::Push);
        b.emit_lref(3, 7);
        b.emit(Opcode::Push);
        let code = b.finish(0).unwrap();
        assert_eq!(
            code.code(),
            &[
                Insn::new(Opcode::Lref2Push),
                Insn::new(Opcode::Lref14Push),
                Insn::args(Opcode::LrefPush, 3, 7),
            ]
        );
    }

    #[test]
    fn test_gref_call_fusion() {
        let mut b = builder();
        let id = Value::Sym(intern("f"));
        b.emit_obj(Opcode::Gref, id.clone());
        b.emit1(Opcode::Call, 2);
        let code = b.finish(0).unwrap();
        assert_eq!(code.code(), &[Insn::arg(Opcode::GrefCall, 2).with_operand(Operand::Obj(id))]);
    }

    #[test]
    fn test_push_pre_call_fusion() {
        let mut b = builder();
        let l = b.new_label();
        b.emit(Opcode::Push);
        b.put(Insn::arg(Opcode::PreCall, 1).with_operand(Operand::Label(l)));
        b.set_label(l);
        let code = b.finish(0).unwrap();
        assert_eq!(
            code.code(),
            &[Insn::arg(Opcode::PushPreCall, 1).with_operand(Operand::Addr(1))]
        );
    }

    #[test]
    fn test_car_cdr_chains() {
        let mut b = builder();
        b.emit(Opcode::Car);
        b.emit(Opcode::Car);
        let code = b.finish(0).unwrap();
        assert_eq!(code.code(), &[Insn::new(Opcode::Caar)]);

        let mut b = builder();
        b.emit(Opcode::Cdr);
        b.emit(Opcode::Car);
        let code = b.finish(0).unwrap();
        assert_eq!(code.code(), &[Insn::new(Opcode::Cadr)]);
    }

    #[test]
    fn test_label_blocks_fusion() {
        // A label set between CONST and RET marks a jump target; the pair
        // must stay two instructions.
        let mut b = builder();
        b.emit_obj(Opcode::Const, Value::Int(1));
        let l = b.new_label();
        b.set_label(l);
        b.emit_ret();
        let code = b.finish(0).unwrap();
        assert_eq!(
            code.code(),
            &[Insn::obj(Opcode::Const, Value::Int(1)), Insn::new(Opcode::Ret)]
        );
    }

    #[test]
    fn test_forward_label_resolution() {
        let mut b = builder();
        let l = b.new_label();
        b.emit_branch(Opcode::BF, l);
        b.emit_obj(Opcode::Const, Value::Int(1));
        b.emit_ret();
        b.set_label(l);
        b.emit(Opcode::ConstF);
        b.emit_ret();
        let code = b.finish(0).unwrap();
        assert_eq!(code.code()[0], Insn::new(Opcode::BF).with_operand(Operand::Addr(2)));
        // CONST 1 + RET fused, so the else branch starts at offset 2.
        assert_eq!(code.code()[2], Insn::new(Opcode::ConstF));
    }

    #[test]
    fn test_unresolved_label_is_an_error() {
        let mut b = builder();
        let l = b.new_label();
        b.emit_branch(Opcode::BF, l);
        assert!(b.finish(0).is_err());
    }

    #[test]
    fn test_max_stack_recorded() {
        let mut b = builder();
        b.emit(Opcode::ConstN);
        let code = b.finish(7).unwrap();
        assert_eq!(code.max_stack(), 7);
    }
}
