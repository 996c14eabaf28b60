//! Pass 3: instruction emission.
//!
//! Context-directed tree walk over the optimized IR. The context tracks
//! whether the value being computed is the procedure's result (`Tail`),
//! whether it is discarded (`Stmt`), and whether the operand stack holds
//! pending arguments (`Top` vs `Bottom`) that a captured continuation
//! would clobber. Non-tail calls and lets in top context are protected
//! with `PRE-CALL` frames.
//!
//! Every handler returns the maximum additional operand-stack depth its
//! subtree needs; the entry point records the maximum on the finished
//! code object.

use std::rc::Rc;

use crate::compiler::builder::CodeBuilder;
use crate::compiler::code::{ClosureSlot, CompiledCode, Insn, Operand};
use crate::compiler::iform::{CallFlag, IForm, IFormId, IrPool, LVarId, LambdaFlag, LetKind};
use crate::compiler::op::{Opcode, fits_signed_imm};
use crate::error::{CompileError, CompileResult};
use crate::value::Value;

/// Stack slots a continuation frame occupies.
const CONT_FRAME_SIZE: u32 = 3;
/// Stack slots an environment frame header occupies.
const ENV_HEADER_SIZE: u32 = 2;

/// Compilation context of the expression being emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    Tail,
    NormalBottom,
    NormalTop,
    StmtBottom,
    StmtTop,
}

impl Ctx {
    fn is_tail(self) -> bool {
        self == Ctx::Tail
    }

    fn is_stmt(self) -> bool {
        matches!(self, Ctx::StmtBottom | Ctx::StmtTop)
    }

    /// Whether the operand stack has no pending argument slots.
    fn is_bottom(self) -> bool {
        matches!(self, Ctx::Tail | Ctx::NormalBottom | Ctx::StmtBottom)
    }

    /// Context for a sub-expression whose value is needed.
    fn normal(self) -> Ctx {
        if self.is_bottom() { Ctx::NormalBottom } else { Ctx::NormalTop }
    }

    /// Context for a sub-expression whose value is discarded.
    fn stmt(self) -> Ctx {
        if self.is_bottom() { Ctx::StmtBottom } else { Ctx::StmtTop }
    }
}

/// Compiles the tree rooted at `top` into a finished code object.
///
/// `args_frame` is the frame of procedure arguments the code runs under
/// (empty for a toplevel thunk); `intform` is the packed-IR snapshot
/// attached by `define-inline`.
pub(crate) fn pass3(
    pool: &mut IrPool,
    top: IFormId,
    reqargs: u32,
    optarg: bool,
    name: Value,
    args_frame: Vec<LVarId>,
    parent_name: Option<Value>,
    intform: Option<Rc<crate::compiler::iform::PackedIr>>,
) -> CompileResult<CompiledCode> {
    let mut cx = Pass3 { pool };
    let mut b = CodeBuilder::new(reqargs, optarg, name, parent_name, intform);
    let mut renv: Vec<Vec<LVarId>> = Vec::new();
    if !args_frame.is_empty() {
        renv.push(args_frame);
    }
    let depth = cx.rec(top, &mut b, &mut renv, Ctx::Tail)?;
    b.emit_ret();
    b.finish(depth)
}

struct Pass3<'a> {
    pool: &'a mut IrPool,
}

impl Pass3<'_> {
    fn rec(&mut self, id: IFormId, b: &mut CodeBuilder, renv: &mut Vec<Vec<LVarId>>, ctx: Ctx) -> CompileResult<u32> {
        match self.pool.get(id) {
            IForm::Define { constant, id: defid, expr, .. } => {
                let (constant, defid, expr) = (*constant, defid.clone(), *expr);
                let d = self.rec(expr, b, renv, ctx.normal())?;
                b.put(Insn::arg(Opcode::Define, i32::from(constant)).with_operand(Operand::Obj(defid)));
                Ok(d)
            }
            IForm::LRef { lvar } => {
                if ctx.is_stmt() {
                    return Ok(0);
                }
                let (depth, offset) = self.lookup_lvar(renv, *lvar)?;
                b.emit_lref(depth, offset);
                Ok(0)
            }
            IForm::LSet { lvar, expr } => {
                let (lvar, expr) = (*lvar, *expr);
                let d = self.rec(expr, b, renv, ctx.normal())?;
                let (depth, offset) = self.lookup_lvar(renv, lvar)?;
                b.emit2(Opcode::Lset, depth, offset);
                Ok(d)
            }
            IForm::GRef { id: gid } => {
                let gid = gid.clone();
                b.emit_obj(Opcode::Gref, gid);
                Ok(0)
            }
            IForm::GSet { id: gid, expr } => {
                let (gid, expr) = (gid.clone(), *expr);
                let d = self.rec(expr, b, renv, ctx.normal())?;
                b.emit_obj(Opcode::Gset, gid);
                Ok(d)
            }
            IForm::Const { value } => {
                if ctx.is_stmt() {
                    return Ok(0);
                }
                let value = value.clone();
                emit_const(b, &value);
                Ok(0)
            }
            IForm::If { .. } => self.compile_if(id, b, renv, ctx),
            IForm::Let { .. } => self.compile_let(id, b, renv, ctx),
            IForm::Receive { .. } => self.compile_receive(id, b, renv, ctx),
            IForm::Lambda { .. } => {
                let code = self.compile_lambda(id, b, renv)?;
                b.put(Insn::new(Opcode::Closure).with_operand(Operand::Code(code)));
                Ok(0)
            }
            IForm::Label { label, body } => {
                let body = *body;
                if let Some(placed) = label {
                    // Shared continuation already emitted once; join it.
                    let placed = *placed;
                    b.emit_branch(Opcode::Jump, placed);
                    return Ok(0);
                }
                let l = b.new_label();
                if let IForm::Label { label, .. } = self.pool.get_mut(id) {
                    *label = Some(l);
                }
                b.set_label(l);
                self.rec(body, b, renv, ctx)
            }
            IForm::Seq { body } => {
                let body = body.clone();
                let mut depth = 0;
                for (i, &e) in body.iter().enumerate() {
                    let last = i + 1 == body.len();
                    let ectx = if last { ctx } else { ctx.stmt() };
                    depth = depth.max(self.rec(e, b, renv, ectx)?);
                }
                Ok(depth)
            }
            IForm::Call { .. } => self.compile_call(id, b, renv, ctx),
            IForm::Asm { insn, args, .. } => {
                let (insn, args) = (insn.clone(), args.clone());
                let d = self.emit_operands(&args, b, renv, ctx)?;
                let mut out = Insn::new(insn.op);
                if let Some(&a0) = insn.args.first() {
                    out.arg0 = a0;
                }
                if let Some(&a1) = insn.args.get(1) {
                    out.arg1 = a1;
                }
                b.put(out);
                Ok(d)
            }
            IForm::Promise { expr, .. } => {
                let expr = *expr;
                let d = self.rec(expr, b, renv, ctx.normal())?;
                b.emit(Opcode::Promise);
                Ok(d)
            }
            IForm::Cons { a, b: y, .. } => self.compile_two(Opcode::Cons, *a, *y, b, renv, ctx),
            IForm::Append { a, b: y, .. } => {
                let (a, y) = (*a, *y);
                let d = self.compile_pushed_pair(a, y, b, renv, ctx)?;
                b.emit1(Opcode::Append, 2);
                Ok(d)
            }
            IForm::Memv { a, b: y, .. } => self.compile_two(Opcode::Memv, *a, *y, b, renv, ctx),
            IForm::Eq { a, b: y, .. } => self.compile_two(Opcode::Eq, *a, *y, b, renv, ctx),
            IForm::Eqv { a, b: y, .. } => self.compile_two(Opcode::Eqv, *a, *y, b, renv, ctx),
            IForm::List { elts, .. } => {
                let elts = elts.clone();
                let n = i32::try_from(elts.len()).expect("list length exceeds i32");
                let d = self.emit_operands(&elts, b, renv, ctx)?;
                b.emit1(Opcode::List, n);
                Ok(d)
            }
            IForm::ListStar { elts, .. } => {
                let elts = elts.clone();
                let n = i32::try_from(elts.len()).expect("list length exceeds i32");
                let d = self.emit_operands(&elts, b, renv, ctx)?;
                b.emit1(Opcode::ListStar, n);
                Ok(d)
            }
            IForm::Vector { elts, .. } => {
                let elts = elts.clone();
                let n = i32::try_from(elts.len()).expect("vector length exceeds i32");
                let d = self.emit_operands(&elts, b, renv, ctx)?;
                b.emit1(Opcode::VecBuild, n);
                Ok(d)
            }
            IForm::ListToVec { arg, .. } => {
                let arg = *arg;
                let d = self.rec(arg, b, renv, ctx.normal())?;
                b.emit(Opcode::ListToVec);
                Ok(d)
            }
            IForm::It => Ok(0),
        }
    }

    fn lookup_lvar(&self, renv: &[Vec<LVarId>], lvar: LVarId) -> CompileResult<(i32, i32)> {
        for (depth, frame) in renv.iter().rev().enumerate() {
            if let Some(offset) = frame.iter().position(|&lv| lv == lvar) {
                return Ok((
                    i32::try_from(depth).expect("env depth exceeds i32"),
                    i32::try_from(offset).expect("env offset exceeds i32"),
                ));
            }
        }
        Err(CompileError::internal(format!(
            "unbound local variable {} in code generation",
            self.pool.lvar(lvar).name
        )))
    }

    /// Emits instruction operands: all but the last are pushed, the last
    /// stays in the value register.
    fn emit_operands(
        &mut self,
        args: &[IFormId],
        b: &mut CodeBuilder,
        renv: &mut Vec<Vec<LVarId>>,
        ctx: Ctx,
    ) -> CompileResult<u32> {
        let mut depth = 0u32;
        for (i, &a) in args.iter().enumerate() {
            let actx = if i == 0 { ctx.normal() } else { Ctx::NormalTop };
            let d = self.rec(a, b, renv, actx)?;
            depth = depth.max(u32::try_from(i).expect("operand count") + d);
            if i + 1 != args.len() {
                b.emit(Opcode::Push);
            }
        }
        Ok(depth.max(u32::try_from(args.len().saturating_sub(1)).expect("operand count")))
    }

    fn compile_two(
        &mut self,
        op: Opcode,
        a: IFormId,
        y: IFormId,
        b: &mut CodeBuilder,
        renv: &mut Vec<Vec<LVarId>>,
        ctx: Ctx,
    ) -> CompileResult<u32> {
        let d = self.compile_pushed_pair(a, y, b, renv, ctx)?;
        b.emit(op);
        Ok(d)
    }

    fn compile_pushed_pair(
        &mut self,
        a: IFormId,
        y: IFormId,
        b: &mut CodeBuilder,
        renv: &mut Vec<Vec<LVarId>>,
        ctx: Ctx,
    ) -> CompileResult<u32> {
        let da = self.rec(a, b, renv, ctx.normal())?;
        b.emit(Opcode::Push);
        let dy = self.rec(y, b, renv, Ctx::NormalTop)?;
        Ok(da.max(1 + dy))
    }

    // ----- branches -----

    fn compile_if(&mut self, id: IFormId, b: &mut CodeBuilder, renv: &mut Vec<Vec<LVarId>>, ctx: Ctx) -> CompileResult<u32> {
        let IForm::If { test, then_br, else_br, .. } = self.pool.get(id) else {
            unreachable!("compile_if on non-if");
        };
        let (mut test, mut then_br, mut else_br) = (*test, *then_br, *else_br);

        // (if (not x) a b) compiles as (if x b a) unless a branch needs
        // the test's own value.
        loop {
            let IForm::Asm { insn, args, .. } = self.pool.get(test) else {
                break;
            };
            if insn.op != Opcode::Not || args.len() != 1 {
                break;
            }
            if matches!(self.pool.get(then_br), IForm::It) || matches!(self.pool.get(else_br), IForm::It) {
                break;
            }
            test = args[0];
            std::mem::swap(&mut then_br, &mut else_br);
        }

        // In tail position a branch that just returns the test value
        // becomes a conditional return.
        if ctx.is_tail() {
            if matches!(self.pool.get(then_br), IForm::It) {
                let d = self.rec(test, b, renv, ctx.normal())?;
                b.emit(Opcode::RT);
                let de = self.rec(else_br, b, renv, Ctx::Tail)?;
                return Ok(d.max(de));
            }
            if matches!(self.pool.get(else_br), IForm::It) {
                let d = self.rec(test, b, renv, ctx.normal())?;
                b.emit(Opcode::RF);
                let dt = self.rec(then_br, b, renv, Ctx::Tail)?;
                return Ok(d.max(dt));
            }
        }

        let else_label = b.new_label();
        let d_test = self.compile_branch(test, b, renv, ctx, else_label)?;

        if ctx.is_tail() {
            let d_then = self.rec(then_br, b, renv, Ctx::Tail)?;
            b.emit_ret();
            b.set_label(else_label);
            let d_else = self.rec(else_br, b, renv, Ctx::Tail)?;
            return Ok(d_test.max(d_then).max(d_else));
        }

        let merge = b.new_label();
        let d_then = self.rec(then_br, b, renv, ctx)?;
        b.emit_branch(Opcode::Jump, merge);
        b.set_label(else_label);
        let d_else = self.rec(else_br, b, renv, ctx)?;
        b.set_label(merge);
        Ok(d_test.max(d_then).max(d_else))
    }

    /// Lowers a test to the branch instruction best matching its shape,
    /// jumping to `target` when the test fails.
    fn compile_branch(
        &mut self,
        test: IFormId,
        b: &mut CodeBuilder,
        renv: &mut Vec<Vec<LVarId>>,
        ctx: Ctx,
        target: crate::compiler::code::CodeLabel,
    ) -> CompileResult<u32> {
        enum Shape {
            Null(IFormId),
            EqShape(Opcode, Opcode, IFormId, IFormId),
            NumCmp(Opcode, IFormId, IFormId),
            NumEq(IFormId, IFormId),
            Plain,
        }
        let shape = match self.pool.get(test) {
            IForm::Asm { insn, args, .. } => match (insn.op, args.as_slice()) {
                (Opcode::NullP, [x]) => Shape::Null(*x),
                (Opcode::Eq, [x, y]) => Shape::EqShape(Opcode::BNEq, Opcode::BNEqC, *x, *y),
                (Opcode::Eqv, [x, y]) => Shape::EqShape(Opcode::BNEqv, Opcode::BNEqvC, *x, *y),
                (Opcode::NumEq2, [x, y]) => Shape::NumEq(*x, *y),
                (Opcode::NumLt2, [x, y]) => Shape::NumCmp(Opcode::BNLt, *x, *y),
                (Opcode::NumLe2, [x, y]) => Shape::NumCmp(Opcode::BNLe, *x, *y),
                (Opcode::NumGt2, [x, y]) => Shape::NumCmp(Opcode::BNGt, *x, *y),
                (Opcode::NumGe2, [x, y]) => Shape::NumCmp(Opcode::BNGe, *x, *y),
                _ => Shape::Plain,
            },
            IForm::Eq { a, b: y, .. } => Shape::EqShape(Opcode::BNEq, Opcode::BNEqC, *a, *y),
            IForm::Eqv { a, b: y, .. } => Shape::EqShape(Opcode::BNEqv, Opcode::BNEqvC, *a, *y),
            _ => Shape::Plain,
        };
        match shape {
            Shape::Null(x) => {
                let d = self.rec(x, b, renv, ctx.normal())?;
                b.emit_branch(Opcode::BNNull, target);
                Ok(d)
            }
            Shape::EqShape(push_op, const_op, x, y) => {
                // A constant side turns into an immediate-compare branch.
                if let Some(c) = self.pool.as_const(y).cloned() {
                    let d = self.rec(x, b, renv, ctx.normal())?;
                    b.emit_branch_obj(const_op, c, target);
                    return Ok(d);
                }
                if let Some(c) = self.pool.as_const(x).cloned() {
                    let d = self.rec(y, b, renv, ctx.normal())?;
                    b.emit_branch_obj(const_op, c, target);
                    return Ok(d);
                }
                let d = self.compile_branch_pair(x, y, b, renv, ctx)?;
                b.emit_branch(push_op, target);
                Ok(d)
            }
            Shape::NumEq(x, y) => {
                if let Some(Value::Int(n)) = self.pool.as_const(y)
                    && fits_signed_imm(*n)
                {
                    let n = i32::try_from(*n).expect("imm fits i32");
                    let d = self.rec(x, b, renv, ctx.normal())?;
                    b.emit_branch1(Opcode::BNumNeI, n, target);
                    return Ok(d);
                }
                if let Some(Value::Int(n)) = self.pool.as_const(x)
                    && fits_signed_imm(*n)
                {
                    let n = i32::try_from(*n).expect("imm fits i32");
                    let d = self.rec(y, b, renv, ctx.normal())?;
                    b.emit_branch1(Opcode::BNumNeI, n, target);
                    return Ok(d);
                }
                let d = self.compile_branch_pair(x, y, b, renv, ctx)?;
                b.emit_branch(Opcode::BNumNe, target);
                Ok(d)
            }
            Shape::NumCmp(op, x, y) => {
                let d = self.compile_branch_pair(x, y, b, renv, ctx)?;
                b.emit_branch(op, target);
                Ok(d)
            }
            Shape::Plain => {
                let d = self.rec(test, b, renv, ctx.normal())?;
                b.emit_branch(Opcode::BF, target);
                Ok(d)
            }
        }
    }

    fn compile_branch_pair(
        &mut self,
        x: IFormId,
        y: IFormId,
        b: &mut CodeBuilder,
        renv: &mut Vec<Vec<LVarId>>,
        ctx: Ctx,
    ) -> CompileResult<u32> {
        let dx = self.rec(x, b, renv, ctx.normal())?;
        b.emit(Opcode::Push);
        let dy = self.rec(y, b, renv, Ctx::NormalTop)?;
        Ok(dx.max(1 + dy))
    }

    // ----- binding forms -----

    fn compile_let(&mut self, id: IFormId, b: &mut CodeBuilder, renv: &mut Vec<Vec<LVarId>>, ctx: Ctx) -> CompileResult<u32> {
        if !ctx.is_bottom() {
            // Pending arguments would be clobbered by the frame: protect
            // with a continuation frame and return into it.
            let merge = b.new_label();
            b.put(Insn::arg(Opcode::PreCall, 0).with_operand(Operand::Label(merge)));
            let d = self.compile_let_core(id, b, renv, Ctx::Tail)?;
            b.emit_ret();
            b.set_label(merge);
            return Ok(d + CONT_FRAME_SIZE);
        }
        self.compile_let_core(id, b, renv, ctx)
    }

    fn compile_let_core(
        &mut self,
        id: IFormId,
        b: &mut CodeBuilder,
        renv: &mut Vec<Vec<LVarId>>,
        ctx: Ctx,
    ) -> CompileResult<u32> {
        let IForm::Let { kind, lvars, inits, body, .. } = self.pool.get(id) else {
            unreachable!("compile_let on non-let");
        };
        let (kind, lvars, inits, body) = (*kind, lvars.clone(), inits.clone(), *body);
        let nlocals = u32::try_from(lvars.len()).expect("frame size exceeds u32");
        let n = i32::try_from(lvars.len()).expect("frame size exceeds i32");

        match kind {
            LetKind::Let => {
                let mut d_inits = 0u32;
                for (i, &init) in inits.iter().enumerate() {
                    let ictx = if i == 0 { ctx.normal() } else { Ctx::NormalTop };
                    let d = self.rec(init, b, renv, ictx)?;
                    d_inits = d_inits.max(u32::try_from(i).expect("init count") + d);
                    b.emit(Opcode::Push);
                }
                b.emit1(Opcode::LocalEnv, n);
                renv.push(lvars);
                let bctx = if ctx.is_tail() { Ctx::Tail } else { ctx };
                let d_body = self.rec(body, b, renv, bctx)?;
                renv.pop();
                if !ctx.is_tail() {
                    b.emit(Opcode::PopLocalEnv);
                }
                Ok(d_inits
                    .max(nlocals)
                    .max(ENV_HEADER_SIZE + nlocals + d_body))
            }
            LetKind::Rec => {
                // Constants and closures are materialized by the frame
                // instruction itself; everything else is filled in with
                // LSET afterwards.
                renv.push(lvars.clone());
                let mut slots = Vec::with_capacity(inits.len());
                let mut others: Vec<(i32, IFormId)> = Vec::new();
                for (i, &init) in inits.iter().enumerate() {
                    match self.pool.get(init) {
                        IForm::Const { value } => slots.push(ClosureSlot::Const(value.clone())),
                        IForm::Lambda { .. } => {
                            let code = self.compile_lambda(init, b, renv)?;
                            slots.push(ClosureSlot::Code(code));
                        }
                        _ => {
                            slots.push(ClosureSlot::Const(Value::Undefined));
                            others.push((i32::try_from(i).expect("offset fits i32"), init));
                        }
                    }
                }
                b.put(Insn::arg(Opcode::LocalEnvClosures, n).with_operand(Operand::Codes(slots)));
                let mut d_others = 0u32;
                for (offset, init) in others {
                    let d = self.rec(init, b, renv, Ctx::NormalBottom)?;
                    d_others = d_others.max(d);
                    b.emit2(Opcode::Lset, 0, offset);
                }
                let bctx = if ctx.is_tail() { Ctx::Tail } else { ctx };
                let d_body = self.rec(body, b, renv, bctx)?;
                renv.pop();
                if !ctx.is_tail() {
                    b.emit(Opcode::PopLocalEnv);
                }
                Ok(ENV_HEADER_SIZE + nlocals + d_others.max(d_body))
            }
        }
    }

    fn compile_receive(
        &mut self,
        id: IFormId,
        b: &mut CodeBuilder,
        renv: &mut Vec<Vec<LVarId>>,
        ctx: Ctx,
    ) -> CompileResult<u32> {
        if !ctx.is_bottom() {
            let merge = b.new_label();
            b.put(Insn::arg(Opcode::PreCall, 0).with_operand(Operand::Label(merge)));
            let d = self.compile_receive_core(id, b, renv, Ctx::Tail)?;
            b.emit_ret();
            b.set_label(merge);
            return Ok(d + CONT_FRAME_SIZE);
        }
        self.compile_receive_core(id, b, renv, ctx)
    }

    fn compile_receive_core(
        &mut self,
        id: IFormId,
        b: &mut CodeBuilder,
        renv: &mut Vec<Vec<LVarId>>,
        ctx: Ctx,
    ) -> CompileResult<u32> {
        let IForm::Receive {
            reqargs,
            optarg,
            lvars,
            expr,
            body,
            ..
        } = self.pool.get(id)
        else {
            unreachable!("compile_receive on non-receive");
        };
        let (reqargs, optarg, lvars, expr, body) = (*reqargs, *optarg, lvars.clone(), *expr, *body);
        let nlocals = u32::try_from(lvars.len()).expect("frame size exceeds u32");
        let d_expr = self.rec(expr, b, renv, ctx.normal())?;
        let op = if ctx.is_tail() { Opcode::TailReceive } else { Opcode::Receive };
        b.emit2(
            op,
            i32::try_from(reqargs).expect("reqargs fits i32"),
            i32::from(optarg),
        );
        renv.push(lvars);
        let d_body = self.rec(body, b, renv, if ctx.is_tail() { Ctx::Tail } else { ctx })?;
        renv.pop();
        if !ctx.is_tail() {
            b.emit(Opcode::PopLocalEnv);
        }
        Ok(d_expr.max(ENV_HEADER_SIZE + nlocals + d_body))
    }

    fn compile_lambda(
        &mut self,
        id: IFormId,
        parent: &CodeBuilder,
        renv: &[Vec<LVarId>],
    ) -> CompileResult<Rc<CompiledCode>> {
        let IForm::Lambda {
            name,
            reqargs,
            optarg,
            lvars,
            body,
            flag,
            ..
        } = self.pool.get(id)
        else {
            unreachable!("compile_lambda on non-lambda");
        };
        let (name, reqargs, optarg, lvars, body, flag) =
            (name.clone(), *reqargs, *optarg, lvars.clone(), *body, *flag);
        let name_value = name.unwrap_or(Value::Bool(false));
        let intform = if flag == LambdaFlag::Inlined {
            Some(Rc::new(self.pool.pack(id)))
        } else {
            None
        };
        let mut child = CodeBuilder::new(reqargs, optarg, name_value, Some(parent.name().clone()), intform);
        let mut child_renv = renv.to_vec();
        child_renv.push(lvars);
        let depth = self.rec(body, &mut child, &mut child_renv, Ctx::Tail)?;
        child.emit_ret();
        child.finish(depth).map(Rc::new)
    }

    // ----- calls -----

    fn compile_call(&mut self, id: IFormId, b: &mut CodeBuilder, renv: &mut Vec<Vec<LVarId>>, ctx: Ctx) -> CompileResult<u32> {
        let IForm::Call { proc, args, flag, .. } = self.pool.get(id) else {
            unreachable!("compile_call on non-call");
        };
        let (proc, args, flag) = (*proc, args.clone(), *flag);
        let nargs = i32::try_from(args.len()).expect("argument count exceeds i32");
        let n = u32::try_from(args.len()).expect("argument count exceeds u32");
        let tail = ctx.is_tail();

        match flag {
            CallFlag::Local => {
                if tail {
                    let d_args = self.push_args(&args, b, renv, true)?;
                    let d_proc = self.rec(proc, b, renv, Ctx::NormalTop)?;
                    b.emit1(Opcode::LocalEnvTailCall, nargs);
                    Ok(d_args.max(n + d_proc))
                } else {
                    let merge = b.new_label();
                    b.put(Insn::arg(Opcode::PreCall, nargs).with_operand(Operand::Label(merge)));
                    let d_args = self.push_args(&args, b, renv, true)?;
                    let d_proc = self.rec(proc, b, renv, Ctx::NormalTop)?;
                    b.emit1(Opcode::LocalEnvCall, nargs);
                    b.set_label(merge);
                    Ok(d_args.max(n + d_proc) + CONT_FRAME_SIZE)
                }
            }
            CallFlag::Embed => {
                // The operator is the dissolved lambda; its binder list is
                // the frame the embedded body runs under, and its body is
                // the shared label.
                let IForm::Lambda { lvars, body, .. } = self.pool.get(proc) else {
                    return Err(CompileError::internal("embed call operator is not a dissolved lambda"));
                };
                let (frame, label_node) = (lvars.clone(), *body);
                let merge = if tail {
                    None
                } else {
                    let merge = b.new_label();
                    b.put(Insn::arg(Opcode::PreCall, nargs).with_operand(Operand::Label(merge)));
                    Some(merge)
                };
                let d_args = self.push_args(&args, b, renv, true)?;
                b.emit1(Opcode::LocalEnv, nargs);
                renv.push(frame);
                let d_body = self.rec(label_node, b, renv, Ctx::Tail)?;
                renv.pop();
                b.emit_ret();
                let mut depth = d_args.max(ENV_HEADER_SIZE + n + d_body);
                if let Some(merge) = merge {
                    b.set_label(merge);
                    depth += CONT_FRAME_SIZE;
                }
                Ok(depth)
            }
            CallFlag::Jump => {
                let label = self.jump_target(proc)?;
                if tail {
                    let d_args = self.push_args(&args, b, renv, true)?;
                    b.put(Insn::arg(Opcode::LocalEnvJump, nargs).with_operand(Operand::Label(label)));
                    Ok(d_args)
                } else {
                    let merge = b.new_label();
                    b.put(Insn::arg(Opcode::PreCall, nargs).with_operand(Operand::Label(merge)));
                    let d_args = self.push_args(&args, b, renv, true)?;
                    b.put(Insn::arg(Opcode::LocalEnvJump, nargs).with_operand(Operand::Label(label)));
                    b.set_label(merge);
                    Ok(d_args + CONT_FRAME_SIZE)
                }
            }
            _ => {
                // Head-heavy reordering: a let operator with simple
                // arguments sinks the call into the let body, avoiding a
                // continuation frame around the operator.
                if matches!(self.pool.get(proc), IForm::Let { .. }) && self.all_args_simple(&args) {
                    let IForm::Let { body, .. } = self.pool.get(proc) else {
                        unreachable!();
                    };
                    let inner_body = *body;
                    let sunk = self.pool.alloc(IForm::Call {
                        src: None,
                        proc: inner_body,
                        args,
                        flag: CallFlag::None,
                    });
                    if let IForm::Let { body, .. } = self.pool.get_mut(proc) {
                        *body = sunk;
                    }
                    return self.rec(proc, b, renv, ctx);
                }
                if tail {
                    let d_args = self.push_args(&args, b, renv, true)?;
                    let d_proc = self.rec(proc, b, renv, Ctx::NormalTop)?;
                    b.emit1(Opcode::TailCall, nargs);
                    Ok(d_args.max(n + d_proc))
                } else {
                    let merge = b.new_label();
                    b.put(Insn::arg(Opcode::PreCall, nargs).with_operand(Operand::Label(merge)));
                    let d_args = self.push_args(&args, b, renv, true)?;
                    let d_proc = self.rec(proc, b, renv, Ctx::NormalTop)?;
                    b.emit1(Opcode::Call, nargs);
                    b.set_label(merge);
                    Ok(d_args.max(n + d_proc) + CONT_FRAME_SIZE)
                }
            }
        }
    }

    /// Resolves a jump call's target label: through the embed call it was
    /// redirected to, then the dissolved lambda's label body. The label
    /// is always placed before any jump to it is compiled, because jumps
    /// only occur inside the embedded body.
    fn jump_target(&self, embed_call: IFormId) -> CompileResult<crate::compiler::code::CodeLabel> {
        let IForm::Call { proc, .. } = self.pool.get(embed_call) else {
            return Err(CompileError::internal("jump call does not target an embed call"));
        };
        let IForm::Lambda { body, .. } = self.pool.get(*proc) else {
            return Err(CompileError::internal("embed call operator is not a dissolved lambda"));
        };
        let IForm::Label { label, .. } = self.pool.get(*body) else {
            return Err(CompileError::internal("dissolved lambda body is not a label"));
        };
        label.ok_or_else(|| CompileError::internal("jump to an unplaced label"))
    }

    fn all_args_simple(&self, args: &[IFormId]) -> bool {
        args.iter()
            .all(|&a| matches!(self.pool.get(a), IForm::LRef { .. } | IForm::Const { .. }))
    }

    fn push_args(
        &mut self,
        args: &[IFormId],
        b: &mut CodeBuilder,
        renv: &mut Vec<Vec<LVarId>>,
        base_bottom: bool,
    ) -> CompileResult<u32> {
        let mut depth = 0u32;
        for (i, &a) in args.iter().enumerate() {
            let actx = if i == 0 && base_bottom { Ctx::NormalBottom } else { Ctx::NormalTop };
            let d = self.rec(a, b, renv, actx)?;
            depth = depth.max(u32::try_from(i).expect("argument count") + d);
            b.emit(Opcode::Push);
        }
        Ok(depth.max(u32::try_from(args.len()).expect("argument count")))
    }
}

/// Emits a constant, picking the specialized instruction for common
/// literals.
fn emit_const(b: &mut CodeBuilder, value: &Value) {
    match value {
        Value::Nil => b.emit(Opcode::ConstN),
        Value::Bool(false) => b.emit(Opcode::ConstF),
        Value::Undefined => b.emit(Opcode::ConstU),
        Value::Int(n) if fits_signed_imm(*n) => {
            b.emit1(Opcode::ConstI, i32::try_from(*n).expect("imm fits i32"));
        }
        other => b.emit_obj(Opcode::Const, other.clone()),
    }
}
