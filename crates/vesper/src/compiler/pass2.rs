//! Pass 2: IR-to-IR optimization.
//!
//! A tag-dispatched recursive walker over the arena. Handlers receive the
//! stack of enclosing `Lambda` nodes (for self-recursion detection) and a
//! tail-position flag. The pass rewrites destructively:
//!
//! * `LRef` folding: constant propagation and reference-chain redirection
//! * `If` restructuring: `if`-of-`if` with `IT` branches becomes a DAG
//!   whose shared continuation is duplicated when small or labelled
//! * dead `Let` bindings are dropped, side-effecting inits hoisted
//! * locally bound procedures are classified from their recorded call
//!   sites and embedded, inlined, or downgraded to local calls
//!
//! Running the pass a second time on its own output leaves the structure
//! unchanged, except inside freshly inlined bodies, which settle on the
//! next run.

use ahash::AHashSet;

use crate::compiler::iform::{CallFlag, CallSite, IForm, IFormId, IrPool, LVarId, LambdaFlag};
use crate::compiler::op::Opcode;
use crate::compiler::pass1::{NumLit, expand_inlined_procedure, fold_const_num, value_num};
use crate::error::{CompileError, CompileResult};
use crate::procedure::NumOp;
use crate::value::Value;
use crate::vmstate::{Vm, flags};

/// Bodies at or above this node count are not worth copying into every
/// call site.
pub(crate) const SMALL_LAMBDA_SIZE: usize = 12;

/// Runs pass 2 over the tree rooted at `top`, returning the new root.
pub(crate) fn pass2(pool: &mut IrPool, vm: &Vm, top: IFormId) -> CompileResult<IFormId> {
    let mut cx = Pass2 {
        pool,
        noinline_locals: vm.flag_is_set(flags::NOINLINE_LOCALS),
        visited_labels: AHashSet::new(),
    };
    cx.rec(top, &mut Vec::new(), true)
}

struct Pass2<'a> {
    pool: &'a mut IrPool,
    noinline_locals: bool,
    visited_labels: AHashSet<IFormId>,
}

impl Pass2<'_> {
    fn rec(&mut self, id: IFormId, penv: &mut Vec<IFormId>, tail: bool) -> CompileResult<IFormId> {
        match self.pool.get(id) {
            IForm::Define { expr, .. } => {
                let expr = *expr;
                let new = self.rec(expr, penv, false)?;
                if let IForm::Define { expr, .. } = self.pool.get_mut(id) {
                    *expr = new;
                }
                Ok(id)
            }
            IForm::LRef { .. } => Ok(self.lref_fold(id)),
            IForm::LSet { expr, .. } => {
                let expr = *expr;
                let new = self.rec(expr, penv, false)?;
                if let IForm::LSet { expr, .. } = self.pool.get_mut(id) {
                    *expr = new;
                }
                Ok(id)
            }
            IForm::GRef { .. } | IForm::Const { .. } | IForm::It => Ok(id),
            IForm::GSet { expr, .. } => {
                let expr = *expr;
                let new = self.rec(expr, penv, false)?;
                if let IForm::GSet { expr, .. } = self.pool.get_mut(id) {
                    *expr = new;
                }
                Ok(id)
            }
            IForm::If { .. } => self.if_handler(id, penv, tail),
            IForm::Let { .. } => self.let_handler(id, penv, tail),
            IForm::Receive { expr, body, .. } => {
                let (expr, body) = (*expr, *body);
                let new_expr = self.rec(expr, penv, false)?;
                let new_body = self.rec(body, penv, tail)?;
                if let IForm::Receive { expr, body, .. } = self.pool.get_mut(id) {
                    *expr = new_expr;
                    *body = new_body;
                }
                Ok(id)
            }
            IForm::Lambda { body, .. } => {
                let body = *body;
                penv.push(id);
                let new_body = self.rec(body, penv, true);
                penv.pop();
                let new_body = new_body?;
                if let IForm::Lambda { body, .. } = self.pool.get_mut(id) {
                    *body = new_body;
                }
                Ok(id)
            }
            IForm::Label { body, .. } => {
                let body = *body;
                if self.visited_labels.insert(id) {
                    let new_body = self.rec(body, penv, tail)?;
                    if let IForm::Label { body, .. } = self.pool.get_mut(id) {
                        *body = new_body;
                    }
                }
                Ok(id)
            }
            IForm::Seq { body } => {
                let body = body.clone();
                let mut new_body = Vec::with_capacity(body.len());
                for (i, &b) in body.iter().enumerate() {
                    let last = i + 1 == body.len();
                    new_body.push(self.rec(b, penv, tail && last)?);
                }
                if let IForm::Seq { body } = self.pool.get_mut(id) {
                    *body = new_body;
                }
                Ok(id)
            }
            IForm::Call { .. } => self.call_handler(id, penv, tail),
            IForm::Asm { args, .. } => {
                let args = args.clone();
                let mut new_args = Vec::with_capacity(args.len());
                for a in args {
                    new_args.push(self.rec(a, penv, false)?);
                }
                if let IForm::Asm { args, .. } = self.pool.get_mut(id) {
                    *args = new_args;
                }
                self.asm_fold(id);
                Ok(id)
            }
            IForm::Promise { expr, .. } => {
                let expr = *expr;
                let new = self.rec(expr, penv, false)?;
                if let IForm::Promise { expr, .. } = self.pool.get_mut(id) {
                    *expr = new;
                }
                Ok(id)
            }
            IForm::Cons { a, b, .. }
            | IForm::Append { a, b, .. }
            | IForm::Memv { a, b, .. }
            | IForm::Eq { a, b, .. }
            | IForm::Eqv { a, b, .. } => {
                let (a, b) = (*a, *b);
                let new_a = self.rec(a, penv, false)?;
                let new_b = self.rec(b, penv, false)?;
                match self.pool.get_mut(id) {
                    IForm::Cons { a, b, .. }
                    | IForm::Append { a, b, .. }
                    | IForm::Memv { a, b, .. }
                    | IForm::Eq { a, b, .. }
                    | IForm::Eqv { a, b, .. } => {
                        *a = new_a;
                        *b = new_b;
                    }
                    _ => {}
                }
                Ok(id)
            }
            IForm::List { elts, .. } | IForm::ListStar { elts, .. } | IForm::Vector { elts, .. } => {
                let elts = elts.clone();
                let mut new_elts = Vec::with_capacity(elts.len());
                for e in elts {
                    new_elts.push(self.rec(e, penv, false)?);
                }
                match self.pool.get_mut(id) {
                    IForm::List { elts, .. } | IForm::ListStar { elts, .. } | IForm::Vector { elts, .. } => {
                        *elts = new_elts;
                    }
                    _ => {}
                }
                Ok(id)
            }
            IForm::ListToVec { arg, .. } => {
                let arg = *arg;
                let new = self.rec(arg, penv, false)?;
                if let IForm::ListToVec { arg, .. } = self.pool.get_mut(id) {
                    *arg = new;
                }
                Ok(id)
            }
        }
    }

    /// Constant propagation through local references.
    ///
    /// An unassigned variable whose init is a constant becomes that
    /// constant; one whose init is another unassigned variable's reference
    /// is redirected to the ultimate variable.
    fn lref_fold(&mut self, id: IFormId) -> IFormId {
        loop {
            let IForm::LRef { lvar } = self.pool.get(id) else {
                return id;
            };
            let lv = *lvar;
            if self.pool.lvar(lv).set_count != 0 {
                return id;
            }
            let Some(init) = self.pool.lvar(lv).init else {
                return id;
            };
            match self.pool.get(init) {
                IForm::Const { value } => {
                    let value = value.clone();
                    self.pool.ref_dec(lv);
                    self.pool.set(id, IForm::Const { value });
                    return id;
                }
                IForm::LRef { lvar: inner } => {
                    let inner = *inner;
                    if self.pool.lvar(inner).set_count != 0 {
                        return id;
                    }
                    self.pool.ref_dec(lv);
                    self.pool.ref_inc(inner);
                    self.pool.set(id, IForm::LRef { lvar: inner });
                    // Chase the chain to the ultimate variable.
                }
                _ => return id,
            }
        }
    }

    fn if_handler(&mut self, id: IFormId, penv: &mut Vec<IFormId>, tail: bool) -> CompileResult<IFormId> {
        let IForm::If { test, then_br, else_br, .. } = self.pool.get(id) else {
            unreachable!("if_handler on non-if");
        };
        let (test, then_br, else_br) = (*test, *then_br, *else_br);
        let test = self.rec(test, penv, false)?;

        // A literal test selects its branch at compile time.
        if let IForm::Const { value } = self.pool.get(test) {
            let (taken, dropped) = if value.is_false() {
                (else_br, then_br)
            } else {
                (then_br, else_br)
            };
            self.deref_subtree(dropped);
            return self.rec(taken, penv, tail);
        }

        // if-of-if with an IT arm: pull the inner test out and share the
        // duplicated continuation.
        if let IForm::If {
            test: inner_test,
            then_br: inner_then,
            else_br: inner_else,
            ..
        } = self.pool.get(test)
        {
            let (inner_test, inner_then, inner_else) = (*inner_test, *inner_then, *inner_else);
            let then_is_it = matches!(self.pool.get(inner_then), IForm::It);
            let else_is_it = matches!(self.pool.get(inner_else), IForm::It);
            if then_is_it && else_is_it {
                // The inner if always yields its own test value.
                let new_then = self.rec(then_br, penv, tail)?;
                let new_else = self.rec(else_br, penv, tail)?;
                self.pool.set(
                    id,
                    IForm::If {
                        src: None,
                        test: inner_test,
                        then_br: new_then,
                        else_br: new_else,
                    },
                );
                return Ok(id);
            }
            if then_is_it {
                // IF(IF(t, IT, e0), then, else)
                //   => IF(t, then', IF(e0, then'', else))
                let new_then = self.rec(then_br, penv, tail)?;
                let (then0, then1) = self.label_or_dup(new_then);
                let new_else = self.rec(else_br, penv, tail)?;
                let inner = self.pool.alloc(IForm::If {
                    src: None,
                    test: inner_else,
                    then_br: then1,
                    else_br: new_else,
                });
                self.pool.set(
                    id,
                    IForm::If {
                        src: None,
                        test: inner_test,
                        then_br: then0,
                        else_br: inner,
                    },
                );
                return Ok(id);
            }
            if else_is_it {
                // IF(IF(t, e0, IT), then, else)
                //   => IF(t, IF(e0, then, else'), else'')
                let new_then = self.rec(then_br, penv, tail)?;
                let new_else = self.rec(else_br, penv, tail)?;
                let (else0, else1) = self.label_or_dup(new_else);
                let inner = self.pool.alloc(IForm::If {
                    src: None,
                    test: inner_then,
                    then_br: new_then,
                    else_br: else0,
                });
                self.pool.set(
                    id,
                    IForm::If {
                        src: None,
                        test: inner_test,
                        then_br: inner,
                        else_br: else1,
                    },
                );
                return Ok(id);
            }
        }

        let new_then = self.rec(then_br, penv, tail)?;
        let new_else = self.rec(else_br, penv, tail)?;
        if let IForm::If { test: t, then_br, else_br, .. } = self.pool.get_mut(id) {
            *t = test;
            *then_br = new_then;
            *else_br = new_else;
        }
        Ok(id)
    }

    /// A continuation that is about to gain a second reference: duplicate
    /// it when trivially small, otherwise wrap it in a shared label.
    fn label_or_dup(&mut self, id: IFormId) -> (IFormId, IFormId) {
        match self.pool.get(id) {
            IForm::Const { value } => {
                let value = value.clone();
                (id, self.pool.const_node(value))
            }
            IForm::LRef { lvar } => {
                let lvar = *lvar;
                self.pool.ref_inc(lvar);
                (id, self.pool.alloc(IForm::LRef { lvar }))
            }
            IForm::It => (id, self.pool.alloc(IForm::It)),
            IForm::Label { .. } => (id, id),
            _ => {
                let label = self.pool.alloc(IForm::Label { label: None, body: id });
                self.visited_labels.insert(label);
                (label, label)
            }
        }
    }

    fn let_handler(&mut self, id: IFormId, penv: &mut Vec<IFormId>, tail: bool) -> CompileResult<IFormId> {
        let IForm::Let {
            src,
            kind,
            lvars,
            inits,
            body,
        } = self.pool.get(id)
        else {
            unreachable!("let_handler on non-let");
        };
        let (src, kind, lvars, mut inits, body) = (src.clone(), *kind, lvars.clone(), inits.clone(), *body);

        for (i, init) in inits.clone().into_iter().enumerate() {
            let new = self.rec(init, penv, false)?;
            inits[i] = new;
            self.pool.lvar_mut(lvars[i]).init = Some(new);
        }
        let mut body = self.rec(body, penv, tail)?;

        // Classify the recorded call sites of every locally bound
        // procedure and pick embed / inline / local for each.
        if !self.noinline_locals {
            for (&lv, &init) in lvars.iter().zip(&inits) {
                self.optimize_closure(lv, init)?;
            }
        }

        // Dead-binding elimination.
        let mut kept_lvars = Vec::with_capacity(lvars.len());
        let mut kept_inits = Vec::with_capacity(inits.len());
        let mut hoisted: Vec<IFormId> = Vec::new();
        for (&lv, &init) in lvars.iter().zip(&inits) {
            let record = self.pool.lvar(lv);
            if record.ref_count == 0 && record.set_count == 0 {
                if record.init.is_none() {
                    // Consumed by inlining; nothing left to discard.
                    continue;
                }
                if matches!(
                    self.pool.get(init),
                    IForm::Const { .. } | IForm::LRef { .. } | IForm::Lambda { .. } | IForm::It
                ) {
                    self.deref_subtree(init);
                } else {
                    hoisted.push(init);
                }
            } else {
                kept_lvars.push(lv);
                kept_inits.push(init);
            }
        }

        if !hoisted.is_empty() {
            hoisted.push(body);
            body = self.pool.alloc(IForm::Seq { body: hoisted });
        }
        if kept_lvars.is_empty() {
            return Ok(body);
        }
        self.pool.set(
            id,
            IForm::Let {
                src,
                kind,
                lvars: kept_lvars,
                inits: kept_inits,
                body,
            },
        );
        Ok(id)
    }

    /// Closure classification for one `Let` binding.
    fn optimize_closure(&mut self, lv: LVarId, init: IFormId) -> CompileResult<()> {
        if self.pool.lvar(lv).set_count != 0 || self.pool.lvar(lv).ref_count == 0 {
            return Ok(());
        }
        let IForm::Lambda { flag, .. } = self.pool.get(init) else {
            return Ok(());
        };
        if *flag != LambdaFlag::None {
            return Ok(());
        }
        let calls = match self.pool.get_mut(init) {
            IForm::Lambda { calls, .. } => std::mem::take(calls),
            _ => unreachable!(),
        };
        if calls.is_empty() {
            return Ok(());
        }

        let (locals, recs, tail_recs) = self.classify_calls(&calls, init);

        let all_refs_are_calls = self.pool.lvar(lv).ref_count as usize == calls.len();
        if all_refs_are_calls && recs.is_empty() && !locals.is_empty() {
            if locals.len() == 1 {
                return self.embed_calls(lv, init, locals[0], &tail_recs);
            }
            if tail_recs.is_empty() && self.pool.count_size_upto(init, SMALL_LAMBDA_SIZE) < SMALL_LAMBDA_SIZE {
                return self.inline_calls(lv, init, &locals);
            }
        }
        // Ordinary local calls: known frame layout, argument lists
        // normalized to the procedure's arity.
        for &(call, _) in &calls {
            if let IForm::Call { flag, .. } = self.pool.get_mut(call) {
                *flag = CallFlag::Local;
            }
            self.adjust_call_args(call, init)?;
        }
        Ok(())
    }

    fn classify_calls(&self, calls: &[CallSite], lambda: IFormId) -> (Vec<IFormId>, Vec<IFormId>, Vec<IFormId>) {
        let mut locals = Vec::new();
        let mut recs = Vec::new();
        let mut tail_recs = Vec::new();
        for &(call, innermost) in calls {
            match self.pool.get(call) {
                IForm::Call {
                    flag: CallFlag::TailRec, ..
                } => {
                    // A tail self-call through an intermediate closure
                    // cannot become a jump.
                    if innermost == Some(lambda) {
                        tail_recs.push(call);
                    } else {
                        recs.push(call);
                    }
                }
                IForm::Call { flag: CallFlag::Rec, .. } => recs.push(call),
                _ => locals.push(call),
            }
        }
        (locals, recs, tail_recs)
    }

    /// Embeds the procedure body at its single local call site and turns
    /// every direct tail self-call into a jump to the body's label.
    ///
    /// The embed call keeps the dissolved lambda as its operator: pass 3
    /// reads the frame layout from its binder list. Jump calls point at
    /// the embed call so they can reach the same label.
    fn embed_calls(&mut self, lv: LVarId, lambda: IFormId, embed_call: IFormId, tail_recs: &[IFormId]) -> CompileResult<()> {
        let IForm::Lambda { body, .. } = self.pool.get(lambda) else {
            unreachable!("embed on non-lambda");
        };
        let body = *body;
        let label = self.pool.alloc(IForm::Label { label: None, body });
        self.visited_labels.insert(label);
        if let IForm::Lambda { body, flag, .. } = self.pool.get_mut(lambda) {
            *body = label;
            *flag = LambdaFlag::Dissolved;
        }

        self.adjust_call_args(embed_call, lambda)?;
        if let IForm::Call { proc, flag, .. } = self.pool.get_mut(embed_call) {
            *proc = lambda;
            *flag = CallFlag::Embed;
        }
        self.pool.ref_dec(lv);
        for &jump in tail_recs {
            self.adjust_call_args(jump, lambda)?;
            if let IForm::Call { proc, flag, .. } = self.pool.get_mut(jump) {
                *proc = embed_call;
                *flag = CallFlag::Jump;
            }
            self.pool.ref_dec(lv);
        }
        // The body now lives at the call site; the lambda shell must not
        // be discarded as an ordinary dead init.
        self.pool.lvar_mut(lv).init = None;
        Ok(())
    }

    /// Replaces every call with a fresh copy of the (small) body.
    fn inline_calls(&mut self, lv: LVarId, lambda: IFormId, locals: &[IFormId]) -> CompileResult<()> {
        for &call in locals {
            let IForm::Call { src, args, .. } = self.pool.get(call) else {
                unreachable!("inline on non-call");
            };
            let (src, args) = (src.clone(), args.clone());
            let mut lvar_map = ahash::AHashMap::new();
            let copy = self.pool.copy(lambda, &mut lvar_map);
            let expanded = expand_inlined_procedure(self.pool, src, copy, args)?;
            let node = std::mem::replace(self.pool.get_mut(expanded), IForm::It);
            self.pool.set(call, node);
            self.pool.ref_dec(lv);
        }
        Ok(())
    }

    /// Normalizes a local call's argument list to the callee's arity,
    /// packing surplus arguments into a rest list.
    fn adjust_call_args(&mut self, call: IFormId, lambda: IFormId) -> CompileResult<()> {
        let IForm::Lambda {
            name, reqargs, optarg, ..
        } = self.pool.get(lambda)
        else {
            unreachable!("adjust_call_args on non-lambda");
        };
        let name = name.as_ref().map_or_else(|| "#f".to_owned(), ToString::to_string);
        let (req, optarg) = (*reqargs as usize, *optarg);
        let IForm::Call { src, args, .. } = self.pool.get(call) else {
            unreachable!("adjust_call_args on non-call");
        };
        let src = src.clone();
        let mut args = args.clone();
        if optarg {
            if args.len() < req {
                return Err(CompileError::arity(name, format!("at least {req}"), args.len(), src.as_ref()));
            }
            let rest = args.split_off(req);
            let rest_node = self.pool.alloc(IForm::List { src: None, elts: rest });
            args.push(rest_node);
        } else if args.len() != req {
            return Err(CompileError::arity(name, req, args.len(), src.as_ref()));
        }
        if let IForm::Call { args: slot, .. } = self.pool.get_mut(call) {
            *slot = args;
        }
        Ok(())
    }

    fn call_handler(&mut self, id: IFormId, penv: &mut Vec<IFormId>, tail: bool) -> CompileResult<IFormId> {
        let IForm::Call { proc, args, flag, .. } = self.pool.get(id) else {
            unreachable!("call_handler on non-call");
        };
        let (proc, args, flag) = (*proc, args.clone(), *flag);

        match flag {
            CallFlag::Jump => {
                // The operator is the embedded body's label; only the
                // arguments are open for rewriting.
                self.rec_args(id, &args, penv)?;
                return Ok(id);
            }
            CallFlag::Embed => {
                let new_proc = self.rec(proc, penv, tail)?;
                if let IForm::Call { proc, .. } = self.pool.get_mut(id) {
                    *proc = new_proc;
                }
                self.rec_args(id, &args, penv)?;
                return Ok(id);
            }
            CallFlag::Local | CallFlag::Rec | CallFlag::TailRec => {
                // Already classified by an earlier visit (a shared body or
                // a previous run); re-recording would double-count the
                // site and re-normalize its arguments.
                self.rec_args(id, &args, penv)?;
                return Ok(id);
            }
            CallFlag::None => {}
        }

        // Scan the operator first so reference folding can expose a
        // lambda.
        let proc = self.rec(proc, penv, false)?;
        if let IForm::Call { proc: slot, .. } = self.pool.get_mut(id) {
            *slot = proc;
        }

        if !self.noinline_locals {
            // ((lambda ...) args...): direct beta-reduction.
            if matches!(self.pool.get(proc), IForm::Lambda { flag: LambdaFlag::None, .. }) {
                let src = match self.pool.get(id) {
                    IForm::Call { src, .. } => src.clone(),
                    _ => None,
                };
                let expanded = expand_inlined_procedure(self.pool, src, proc, args)?;
                let node = std::mem::replace(self.pool.get_mut(expanded), IForm::It);
                self.pool.set(id, node);
                return self.rec(id, penv, tail);
            }

            if let IForm::LRef { lvar } = self.pool.get(proc) {
                let lv = *lvar;
                if self.pool.lvar(lv).set_count == 0
                    && let Some(init) = self.pool.lvar(lv).init
                    && matches!(self.pool.get(init), IForm::Lambda { flag: LambdaFlag::None, .. })
                {
                    if penv.contains(&init) {
                        // Self-recursion across the defining lambda.
                        let new_flag = if tail { CallFlag::TailRec } else { CallFlag::Rec };
                        if let IForm::Call { flag, .. } = self.pool.get_mut(id) {
                            *flag = new_flag;
                        }
                        let site = (id, penv.last().copied());
                        if let IForm::Lambda { calls, .. } = self.pool.get_mut(init) {
                            calls.push(site);
                        }
                        self.rec_args(id, &args, penv)?;
                        return Ok(id);
                    }
                    if self.pool.lvar(lv).ref_count == 1 {
                        // The only reference is this call: inline the body
                        // directly, consuming it.
                        let src = match self.pool.get(id) {
                            IForm::Call { src, .. } => src.clone(),
                            _ => None,
                        };
                        self.pool.ref_dec(lv);
                        self.pool.lvar_mut(lv).init = None;
                        let expanded = expand_inlined_procedure(self.pool, src, init, args)?;
                        let node = std::mem::replace(self.pool.get_mut(expanded), IForm::It);
                        self.pool.set(id, node);
                        return self.rec(id, penv, tail);
                    }
                    // Candidate local call; the defining let decides.
                    if let IForm::Call { flag, .. } = self.pool.get_mut(id) {
                        *flag = CallFlag::Local;
                    }
                    let site = (id, penv.last().copied());
                    if let IForm::Lambda { calls, .. } = self.pool.get_mut(init) {
                        calls.push(site);
                    }
                    self.rec_args(id, &args, penv)?;
                    return Ok(id);
                }
            }
        }

        self.rec_args(id, &args, penv)?;
        Ok(id)
    }

    fn rec_args(&mut self, id: IFormId, args: &[IFormId], penv: &mut Vec<IFormId>) -> CompileResult<()> {
        let mut new_args = Vec::with_capacity(args.len());
        for &a in args {
            new_args.push(self.rec(a, penv, false)?);
        }
        if let IForm::Call { args, .. } = self.pool.get_mut(id) {
            *args = new_args;
        }
        Ok(())
    }

    /// Constant folding over `Asm` nodes whose arguments settled into
    /// literals: arithmetic, numeric comparisons, pair accessors, and the
    /// boolean predicates.
    fn asm_fold(&mut self, id: IFormId) {
        let IForm::Asm { insn, args, .. } = self.pool.get(id) else {
            return;
        };
        let (op, iargs, args) = (insn.op, insn.args.clone(), args.clone());
        let consts: Vec<Option<Value>> = args
            .iter()
            .map(|&a| self.pool.as_const(a).cloned())
            .collect();
        let folded = match op {
            Opcode::NumAddI | Opcode::NumSubI => {
                let [Some(v)] = consts.as_slice() else { return };
                let imm = NumLit::I(i64::from(iargs[0]));
                let Some(n) = value_num(v) else { return };
                let op = if op == Opcode::NumAddI { NumOp::Add } else { NumOp::Sub };
                fold_const_num(op, &imm, &n)
            }
            Opcode::Negate => {
                let [Some(v)] = consts.as_slice() else { return };
                let Some(n) = value_num(v) else { return };
                fold_const_num(NumOp::Sub, &NumLit::I(0), &n)
            }
            Opcode::NumAdd2 | Opcode::NumSub2 | Opcode::NumMul2 | Opcode::NumDiv2 => {
                let [Some(a), Some(b)] = consts.as_slice() else { return };
                let (Some(x), Some(y)) = (value_num(a), value_num(b)) else { return };
                let op = match op {
                    Opcode::NumAdd2 => NumOp::Add,
                    Opcode::NumSub2 => NumOp::Sub,
                    Opcode::NumMul2 => NumOp::Mul,
                    _ => NumOp::Div,
                };
                fold_const_num(op, &x, &y)
            }
            Opcode::NumEq2 | Opcode::NumLt2 | Opcode::NumLe2 | Opcode::NumGt2 | Opcode::NumGe2 => {
                let [Some(a), Some(b)] = consts.as_slice() else { return };
                compare_const_nums(op, a, b)
            }
            Opcode::Car | Opcode::Cdr | Opcode::Caar | Opcode::Cadr | Opcode::Cdar | Opcode::Cddr => {
                let [Some(v)] = consts.as_slice() else { return };
                fold_pair_access(op, v)
            }
            Opcode::Not => {
                let [Some(v)] = consts.as_slice() else { return };
                Some(Value::Bool(v.is_false()))
            }
            Opcode::NullP => {
                let [Some(v)] = consts.as_slice() else { return };
                Some(Value::Bool(v.is_nil()))
            }
            Opcode::Eq | Opcode::Eqv => {
                let [Some(a), Some(b)] = consts.as_slice() else { return };
                eqv_const(a, b).map(Value::Bool)
            }
            _ => None,
        };
        if let Some(value) = folded {
            self.pool.set(id, IForm::Const { value });
        }
    }

    /// Walks a subtree being discarded, releasing its variable-use counts.
    fn deref_subtree(&mut self, id: IFormId) {
        let mut visited = AHashSet::new();
        self.deref_rec(id, &mut visited);
    }

    fn deref_rec(&mut self, id: IFormId, visited: &mut AHashSet<IFormId>) {
        match self.pool.get(id) {
            IForm::LRef { lvar } => {
                let lv = *lvar;
                self.pool.ref_dec(lv);
            }
            IForm::LSet { lvar, expr } => {
                let (lv, expr) = (*lvar, *expr);
                let record = self.pool.lvar_mut(lv);
                record.set_count = record.set_count.saturating_sub(1);
                self.deref_rec(expr, visited);
            }
            IForm::Label { body, .. } => {
                let body = *body;
                if visited.insert(id) {
                    self.deref_rec(body, visited);
                }
            }
            _ => {
                let mut children: smallvec::SmallVec<[IFormId; 4]> = smallvec::SmallVec::new();
                self.pool.collect_children(id, &mut children, visited);
                for c in children {
                    self.deref_rec(c, visited);
                }
            }
        }
    }
}

/// Compile-time `eqv?` on literals. Values whose identity is not decided
/// until runtime (pairs, strings, vectors) return `None`.
fn eqv_const(a: &Value, b: &Value) -> Option<bool> {
    match (a, b) {
        (Value::Nil, Value::Nil) | (Value::Undefined, Value::Undefined) => Some(true),
        (Value::Bool(x), Value::Bool(y)) => Some(x == y),
        (Value::Int(x), Value::Int(y)) => Some(x == y),
        (Value::Big(x), Value::Big(y)) => Some(x == y),
        (Value::Real(x), Value::Real(y)) => Some(x == y),
        (Value::Char(x), Value::Char(y)) => Some(x == y),
        (Value::Sym(x), Value::Sym(y)) | (Value::Keyword(x), Value::Keyword(y)) => Some(x == y),
        (Value::Pair(_) | Value::Str(_) | Value::Vector(_), _) | (_, Value::Pair(_) | Value::Str(_) | Value::Vector(_)) => {
            None
        }
        _ => Some(false),
    }
}

fn compare_const_nums(op: Opcode, a: &Value, b: &Value) -> Option<Value> {
    let (x, y) = (value_num(a)?, value_num(b)?);
    let ord = num_order(&x, &y)?;
    let result = match op {
        Opcode::NumEq2 => ord == std::cmp::Ordering::Equal,
        Opcode::NumLt2 => ord == std::cmp::Ordering::Less,
        Opcode::NumLe2 => ord != std::cmp::Ordering::Greater,
        Opcode::NumGt2 => ord == std::cmp::Ordering::Greater,
        Opcode::NumGe2 => ord != std::cmp::Ordering::Less,
        _ => return None,
    };
    Some(Value::Bool(result))
}

fn num_order(a: &NumLit, b: &NumLit) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (NumLit::I(x), NumLit::I(y)) => Some(x.cmp(y)),
        (NumLit::F(_), _) | (_, NumLit::F(_)) => a.to_f64().partial_cmp(&b.to_f64()),
        _ => Some(a.to_bigint()?.cmp(&b.to_bigint()?)),
    }
}

fn fold_pair_access(op: Opcode, v: &Value) -> Option<Value> {
    let car = |v: &Value| v.car().cloned();
    let cdr = |v: &Value| v.cdr().cloned();
    match op {
        Opcode::Car => car(v),
        Opcode::Cdr => cdr(v),
        Opcode::Caar => car(&car(v)?),
        Opcode::Cadr => car(&cdr(v)?),
        Opcode::Cdar => cdr(&car(v)?),
        Opcode::Cddr => cdr(&cdr(v)?),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::cenv::Cenv;
    use crate::compiler::pass1::Pass1;
    use crate::reader::read_one;
    use crate::vmstate::Vm;
    use pretty_assertions::assert_eq;

    fn optimize(src: &str) -> (IrPool, Vm, IFormId) {
        let mut pool = IrPool::new();
        let mut vm = Vm::new();
        let form = read_one(src).unwrap();
        let cenv = Cenv::toplevel(vm.current_module());
        let top = Pass1 {
            pool: &mut pool,
            vm: &mut vm,
        }
        .pass1(&form, &cenv)
        .unwrap();
        let top = pass2(&mut pool, &vm, top).unwrap();
        (pool, vm, top)
    }

    #[test]
    fn test_beta_reduction_folds_to_constant() {
        let (pool, _, top) = optimize("((lambda (x) (+ x 1)) 3)");
        assert_eq!(pool.as_const(top), Some(&Value::Int(4)));
    }

    #[test]
    fn test_single_use_lambda_inlined() {
        let (pool, _, top) = optimize("(let ((f (lambda (x) (* x x)))) (f 3))");
        assert_eq!(pool.as_const(top), Some(&Value::Int(9)));
    }

    #[test]
    fn test_named_let_becomes_embed_and_jump() {
        let (pool, _, top) = optimize("(let loop ((i 0)) (if (= i 10) i (loop (+ i 1))))");
        let text = pool.dump(top);
        assert!(text.contains("($call[Embed]"), "no embed call in:\n{text}");
        assert!(text.contains("($call[Jump]"), "no jump call in:\n{text}");
        assert!(text.contains("($label"), "no label in:\n{text}");
    }

    #[test]
    fn test_constant_if_folds() {
        let (pool, _, top) = optimize("(if #t 'a 'b)");
        assert_eq!(pool.as_const(top), Some(&Value::Sym(crate::intern::intern("a"))));
        let (pool, _, top) = optimize("(if #f 'a 'b)");
        assert_eq!(pool.as_const(top), Some(&Value::Sym(crate::intern::intern("b"))));
    }

    #[test]
    fn test_dead_pure_binding_dropped() {
        let (pool, _, top) = optimize("(let ((x 1)) 2)");
        assert_eq!(pool.as_const(top), Some(&Value::Int(2)));
    }

    #[test]
    fn test_empty_let_is_transparent() {
        let (pool, _, top) = optimize("(let () 5)");
        assert_eq!(pool.as_const(top), Some(&Value::Int(5)));
    }

    #[test]
    fn test_side_effecting_init_hoisted() {
        // `emit-event` is an unknown global, so the init is a call that
        // must be kept for its effects.
        let (pool, _, top) = optimize("(let ((x (emit-event))) 2)");
        let IForm::Seq { body } = pool.get(top) else {
            panic!("expected hoisted seq, got {}", pool.dump(top));
        };
        assert_eq!(body.len(), 2);
        assert!(matches!(pool.get(body[0]), IForm::Call { .. }));
        assert_eq!(pool.as_const(body[1]), Some(&Value::Int(2)));
    }

    #[test]
    fn test_or_test_restructured_with_duplicated_constant() {
        let (pool, _, top) = optimize("(if (or a b) 1 2)");
        let text = pool.dump(top);
        // The shared then-continuation is a constant, so it is duplicated
        // rather than labelled.
        assert_eq!(text.matches("($const 1)").count(), 2, "dump:\n{text}");
        assert!(!text.contains("($label"), "dump:\n{text}");
        assert!(!text.contains("($it)"), "dump:\n{text}");
    }

    #[test]
    fn test_large_shared_continuation_gets_label() {
        let (pool, _, top) = optimize("(if (or a b) (f 1 2 3 4) 2)");
        let text = pool.dump(top);
        assert!(text.contains("($label"), "dump:\n{text}");
    }

    #[test]
    fn test_lref_chain_redirected() {
        let (pool, _, top) = optimize("(let ((x (g))) (let ((y x)) (h y y)))");
        // y folds into x; the call sees x directly.
        let text = pool.dump(top);
        assert!(text.contains("($lref x."), "dump:\n{text}");
        assert!(!text.contains("($lref y."), "dump:\n{text}");
    }

    #[test]
    fn test_asm_folding_settles_inlined_copies_on_second_run() {
        let (mut pool, vm, top) = optimize("(let ((f (lambda (x) (* x x)))) (+ (f 2) (f 3)))");
        // After one run both call sites are inlined lets; the arithmetic
        // over them folds on the next run.
        let text = pool.dump(top);
        assert!(text.contains("($let"), "dump:\n{text}");
        let top = pass2(&mut pool, &vm, top).unwrap();
        assert_eq!(pool.as_const(top), Some(&Value::Int(13)));
    }

    #[test]
    fn test_pass2_idempotent_on_embed_output() {
        let (mut pool, vm, top) = optimize("(let loop ((i 0)) (if (= i 10) i (loop (+ i 1))))");
        let before = pool.dump(top);
        let top = pass2(&mut pool, &vm, top).unwrap();
        assert_eq!(before, pool.dump(top));
        let top2 = pass2(&mut pool, &vm, top).unwrap();
        assert_eq!(before, pool.dump(top2));
    }

    #[test]
    fn test_noinline_locals_flag_disables_embedding() {
        let mut pool = IrPool::new();
        let mut vm = Vm::new();
        vm.set_flag(flags::NOINLINE_LOCALS);
        let form = read_one("(let loop ((i 0)) (if (= i 10) i (loop (+ i 1))))").unwrap();
        let cenv = Cenv::toplevel(vm.current_module());
        let top = Pass1 {
            pool: &mut pool,
            vm: &mut vm,
        }
        .pass1(&form, &cenv)
        .unwrap();
        let top = pass2(&mut pool, &vm, top).unwrap();
        let text = pool.dump(top);
        assert!(!text.contains("[Embed]"), "dump:\n{text}");
        assert!(text.contains("($lambda"), "dump:\n{text}");
    }

    /// Walks the reachable tree counting LRef/LSet nodes per variable and
    /// checks the counters on every reachable binder.
    fn check_lvar_counts(pool: &IrPool, top: IFormId) {
        use ahash::AHashMap;
        let mut refs: AHashMap<LVarId, u32> = AHashMap::new();
        let mut sets: AHashMap<LVarId, u32> = AHashMap::new();
        let mut binders: Vec<LVarId> = Vec::new();
        let mut seen = AHashSet::new();
        let mut stack = vec![top];
        let mut visited_nodes = AHashSet::new();
        while let Some(id) = stack.pop() {
            if !visited_nodes.insert(id) {
                continue;
            }
            match pool.get(id) {
                IForm::LRef { lvar } => *refs.entry(*lvar).or_insert(0) += 1,
                IForm::LSet { lvar, .. } => *sets.entry(*lvar).or_insert(0) += 1,
                IForm::Let { lvars, .. } | IForm::Lambda { lvars, .. } | IForm::Receive { lvars, .. } => {
                    binders.extend(lvars.iter().copied());
                }
                _ => {}
            }
            let mut children: smallvec::SmallVec<[IFormId; 4]> = smallvec::SmallVec::new();
            pool.collect_children(id, &mut children, &mut seen);
            stack.extend(children);
        }
        for lv in binders {
            assert_eq!(
                pool.lvar(lv).ref_count,
                refs.get(&lv).copied().unwrap_or(0),
                "ref count mismatch for {}",
                pool.lvar(lv).name
            );
            assert_eq!(
                pool.lvar(lv).set_count,
                sets.get(&lv).copied().unwrap_or(0),
                "set count mismatch for {}",
                pool.lvar(lv).name
            );
        }
    }

    #[test]
    fn test_lvar_counts_stay_accurate() {
        for src in [
            "((lambda (x) (+ x 1)) 3)",
            "(let loop ((i 0)) (if (= i 10) i (loop (+ i 1))))",
            "(let ((x 1) (y (g))) (if #t x y))",
            "(let ((f (lambda (x) (* x x)))) (+ (f 2) (f 3)))",
            "(let ((x (g))) (let ((y x)) (h y y)))",
            "(lambda (a b) (set! a b) a)",
            "(do ((i 0 (+ i 1)) (acc '() (cons i acc))) ((= i 3) acc))",
        ] {
            let (pool, _, top) = optimize(src);
            check_lvar_counts(&pool, top);
        }
    }
}
