//! Pass 1: parse and resolve.
//!
//! Dispatches on the head of each form, resolving names to lexical
//! variables, macros, special forms, inlinable procedures, or generic
//! global references, and produces IR. Binding forms introduce LVars and
//! extend the compile-time environment; macro uses are expanded and
//! re-entered.

use std::collections::VecDeque;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use smallvec::SmallVec;

use crate::compiler::cenv::{Binding, Cenv, Frame, FrameKind, Lookup};
use crate::compiler::iform::{AsmInsn, IForm, IFormId, IrPool, LVarId, LambdaFlag, LetKind};
use crate::compiler::op::{Opcode, fits_signed_imm};
use crate::error::{CompileError, CompileResult};
use crate::identifier::make_identifier;
use crate::intern::{StaticSym, Symbol, gensym};
use crate::macros::{Macro, call_macro_expander};
use crate::module::ModuleId;
use crate::procedure::{Inliner, NumOp, Procedure};
use crate::value::Value;
use crate::vmstate::{EvalSituation, Vm, flags};

/// The special forms compiled directly by pass 1. Bound in the core module
/// as `Value::Syntax` so lexical bindings can shadow them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SyntaxKind {
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
    Set,
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
}

/// Pass-1 state: the IR arena under construction plus the host VM surface
/// (module table, compiler flags, eval situation).
pub(crate) struct Pass1<'a> {
    pub pool: &'a mut IrPool,
    pub vm: &'a mut Vm,
}

impl Pass1<'_> {
    /// Compiles one form in `cenv` to IR.
    pub fn pass1(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        if form.is_pair() {
            return self.pass1_pair(form, cenv);
        }
        if form.is_variable() {
            return self.pass1_variable(form, cenv);
        }
        Ok(self.pool.const_node(form.clone()))
    }

    fn pass1_variable(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        match cenv.lookup(form, FrameKind::Lexical) {
            Lookup::LVar(lv) => Ok(self.lref(lv)),
            Lookup::Macro(_) => Err(CompileError::syntax("macro used as a variable", form)),
            Lookup::Global(id) => {
                let (module, name) = global_target(&id, cenv);
                if let Some(gloc) = self.vm.modules().find_binding(module, name)
                    && gloc.is_constant()
                    && !self.vm.flag_is_set(flags::NOINLINE_CONSTS)
                {
                    let value = gloc.value().clone();
                    return Ok(self.pool.const_node(value));
                }
                Ok(self.pool.alloc(IForm::GRef { id }))
            }
        }
    }

    fn pass1_pair(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let pair = form.as_pair().expect("pass1_pair on non-pair");
        let head = pair.car.clone();
        if !head.is_variable() {
            // Head is itself an expression: compile it and emit a call.
            let proc = self.pass1(&head, &cenv.sans_name())?;
            return self.compile_call(form, proc, cenv);
        }
        match cenv.lookup(&head, FrameKind::Syntactic) {
            Lookup::LVar(lv) => {
                let proc = self.lref(lv);
                self.compile_call(form, proc, cenv)
            }
            Lookup::Macro(mac) => {
                let expanded = call_macro_expander(&mac, form, cenv)?;
                self.pass1(&expanded, cenv)
            }
            Lookup::Global(id) => {
                let (module, name) = global_target(&id, cenv);
                let bound = self
                    .vm
                    .modules()
                    .find_binding(module, name)
                    .map(|gloc| gloc.value().clone());
                match bound {
                    Some(Value::Syntax(kind)) => self.syntax(kind, form, cenv),
                    Some(Value::Macro(mac)) => {
                        let expanded = call_macro_expander(&mac, form, cenv)?;
                        self.pass1(&expanded, cenv)
                    }
                    Some(Value::Procedure(proc))
                        if proc.inliner.is_some() && !self.vm.flag_is_set(flags::NOINLINE_GLOBALS) =>
                    {
                        match self.try_inline(&proc, form, cenv)? {
                            Some(iform) => Ok(iform),
                            None => {
                                let gref = self.pool.alloc(IForm::GRef { id });
                                self.compile_call(form, gref, cenv)
                            }
                        }
                    }
                    _ => {
                        let gref = self.pool.alloc(IForm::GRef { id });
                        self.compile_call(form, gref, cenv)
                    }
                }
            }
        }
    }

    /// Generic call: compile each argument and emit an unclassified `Call`.
    fn compile_call(&mut self, form: &Value, proc: IFormId, cenv: &Cenv) -> CompileResult<IFormId> {
        let argforms = call_args(form)?;
        let sans = cenv.sans_name();
        let mut args = Vec::with_capacity(argforms.len());
        for a in &argforms {
            args.push(self.pass1(a, &sans)?);
        }
        Ok(self.pool.alloc(IForm::Call {
            src: Some(form.clone()),
            proc,
            args,
            flag: crate::compiler::iform::CallFlag::None,
        }))
    }

    fn lref(&mut self, lvar: LVarId) -> IFormId {
        self.pool.ref_inc(lvar);
        self.pool.alloc(IForm::LRef { lvar })
    }

    // ----- special forms -----

    fn syntax(&mut self, kind: SyntaxKind, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        use SyntaxKind as K;
        match kind {
            K::Quote => self.syn_quote(form),
            K::If => self.syn_if(form, cenv),
            K::Begin => self.syn_begin(form, cenv),
            K::Lambda => self.syn_lambda(form, cenv),
            K::Let => self.syn_let(form, cenv),
            K::LetStar => self.syn_let_star(form, cenv),
            K::Letrec => self.syn_letrec(form, cenv),
            K::Do => self.syn_do(form, cenv),
            K::AndLetStar => self.syn_and_let_star(form, cenv),
            K::Receive => self.syn_receive(form, cenv),
            K::And => self.syn_and(form, cenv),
            K::Or => self.syn_or(form, cenv),
            K::When => self.syn_when(form, cenv, true),
            K::Unless => self.syn_when(form, cenv, false),
            K::Cond => self.syn_cond(form, cenv),
            K::Case => self.syn_case(form, cenv),
            K::Set => self.syn_set(form, cenv),
            K::Quasiquote => self.syn_quasiquote(form, cenv),
            K::Unquote => Err(CompileError::syntax("unquote outside quasiquote", form)),
            K::UnquoteSplicing => Err(CompileError::syntax("unquote-splicing outside quasiquote", form)),
            K::Delay => self.syn_delay(form, cenv),
            K::Define => self.syn_define(form, cenv, false, None),
            K::DefineConstant => self.syn_define(form, cenv, true, None),
            K::DefineInModule => self.syn_define_in_module(form, cenv),
            K::DefineInline => self.syn_define_inline(form, cenv),
            K::DefineSyntax => self.syn_define_syntax(form, cenv),
            K::DefineMacro => self.syn_define_macro(form, cenv),
            K::DefineModule => self.syn_define_module(form, cenv),
            K::WithModule => self.syn_with_module(form, cenv),
            K::SelectModule => self.syn_select_module(form, cenv),
            K::Export => self.syn_export(form, cenv),
            K::Import => self.syn_import(form, cenv),
            K::EvalWhen => self.syn_eval_when(form, cenv),
        }
    }

    fn syn_quote(&mut self, form: &Value) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        if args.len() != 1 {
            return Err(CompileError::syntax("malformed quote", form));
        }
        Ok(self.pool.const_node(args[0].clone()))
    }

    fn syn_if(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        if !(args.len() == 2 || args.len() == 3) {
            return Err(CompileError::syntax("malformed if", form));
        }
        let sans = cenv.sans_name();
        let test = self.pass1(&args[0], &sans)?;
        let then_br = self.pass1(&args[1], &sans)?;
        let else_br = match args.get(2) {
            Some(e) => self.pass1(e, &sans)?,
            None => self.pool.const_undef(),
        };
        Ok(self.pool.alloc(IForm::If {
            src: Some(form.clone()),
            test,
            then_br,
            else_br,
        }))
    }

    fn syn_begin(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        self.compile_seq(&args, cenv)
    }

    /// Compiles a sequence of expressions (no internal defines) into a
    /// `Seq`, keeping the name hint only for the last.
    fn compile_seq(&mut self, forms: &[Value], cenv: &Cenv) -> CompileResult<IFormId> {
        match forms {
            [] => Ok(self.pool.const_undef()),
            [only] => self.pass1(only, cenv),
            [init @ .., last] => {
                let sans = cenv.sans_name();
                let mut body = Vec::with_capacity(forms.len());
                for f in init {
                    body.push(self.pass1(f, &sans)?);
                }
                body.push(self.pass1(last, cenv)?);
                Ok(self.pool.alloc(IForm::Seq { body }))
            }
        }
    }

    fn syn_lambda(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [formals, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed lambda", form));
        };
        if body.is_empty() {
            return Err(CompileError::syntax("lambda body is empty", form));
        }
        let name = cenv.expr_name.clone();
        self.make_lambda(form, formals, body, name, cenv)
    }

    /// Shared by `lambda`, named `let`, `do`, and `delay`: builds a
    /// `Lambda` node whose body is compiled in the extended environment.
    fn make_lambda(
        &mut self,
        form: &Value,
        formals: &Value,
        body: &[Value],
        name: Option<Value>,
        cenv: &Cenv,
    ) -> CompileResult<IFormId> {
        let (syms, reqargs, optarg) = parse_formals(formals, form)?;
        let lvars: Vec<LVarId> = syms.iter().map(|&s| self.pool.new_lvar(s)).collect();
        let frame = Frame::lexical(syms.iter().copied().zip(lvars.iter().map(|&lv| Binding::LVar(lv))).collect());
        let inner = cenv.extend(frame).sans_name();
        let body = self.pass1_body(body, &inner)?;
        Ok(self.pool.alloc(IForm::Lambda {
            src: Some(form.clone()),
            name,
            reqargs,
            optarg,
            lvars,
            body,
            flag: LambdaFlag::None,
            calls: Vec::new(),
        }))
    }

    /// Compiles a body with internal-definition scanning.
    ///
    /// Leading forms are scanned for `define`s, splicing `begin`s and
    /// expanding macros as needed. Pending definitions become an implicit
    /// `letrec`; the first non-definition form ends the scan. A name
    /// already collected shadows further special-form recognition.
    fn pass1_body(&mut self, forms: &[Value], cenv: &Cenv) -> CompileResult<IFormId> {
        let mut queue: VecDeque<Value> = forms.iter().cloned().collect();
        let mut pending: Vec<(Symbol, Value)> = Vec::new();
        let mut rest: Vec<Value> = Vec::new();

        'scan: while let Some(form) = queue.pop_front() {
            let Some(pair) = form.as_pair() else {
                rest.push(form);
                break;
            };
            let head = pair.car.clone();
            let Some(head_name) = head.variable_name() else {
                rest.push(form);
                break;
            };
            if pending.iter().any(|(n, _)| *n == head_name) {
                rest.push(form);
                break;
            }
            match cenv.lookup(&head, FrameKind::Syntactic) {
                Lookup::Macro(mac) => {
                    let expanded = call_macro_expander(&mac, &form, cenv)?;
                    queue.push_front(expanded);
                }
                Lookup::Global(id) => {
                    let (module, name) = global_target(&id, cenv);
                    let bound = self
                        .vm
                        .modules()
                        .find_binding(module, name)
                        .map(|gloc| gloc.value().clone());
                    match bound {
                        Some(Value::Syntax(SyntaxKind::Define)) => {
                            let (name, expr) = parse_define_parts(&form)?;
                            pending.push((name, expr));
                        }
                        Some(Value::Syntax(SyntaxKind::Begin)) => {
                            for spliced in call_args(&form)?.into_iter().rev() {
                                queue.push_front(spliced);
                            }
                        }
                        Some(Value::Macro(mac)) => {
                            let expanded = call_macro_expander(&mac, &form, cenv)?;
                            queue.push_front(expanded);
                        }
                        _ => {
                            rest.push(form);
                            break 'scan;
                        }
                    }
                }
                Lookup::LVar(_) => {
                    rest.push(form);
                    break;
                }
            }
        }
        rest.extend(queue);

        if pending.is_empty() {
            return self.compile_seq(&rest, cenv);
        }
        let lvars: Vec<LVarId> = pending.iter().map(|(n, _)| self.pool.new_lvar(*n)).collect();
        let frame = Frame::lexical(
            pending
                .iter()
                .map(|(n, _)| *n)
                .zip(lvars.iter().map(|&lv| Binding::LVar(lv)))
                .collect(),
        );
        let inner = cenv.extend(frame);
        let mut inits = Vec::with_capacity(pending.len());
        for ((name, expr), &lv) in pending.iter().zip(&lvars) {
            let init = self.pass1(expr, &inner.add_name(Value::Sym(*name)))?;
            self.pool.lvar_mut(lv).init = Some(init);
            inits.push(init);
        }
        let body = self.compile_seq(&rest, &inner)?;
        Ok(self.pool.alloc(IForm::Let {
            src: None,
            kind: LetKind::Rec,
            lvars,
            inits,
            body,
        }))
    }

    fn syn_let(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        if let [Value::Sym(_) | Value::Identifier(_), ..] = args.as_slice() {
            return self.syn_named_let(form, &args, cenv);
        }
        let [bindings, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed let", form));
        };
        if body.is_empty() {
            return Err(CompileError::syntax("let body is empty", form));
        }
        let parsed = parse_bindings(bindings, form)?;
        let mut lvars = Vec::with_capacity(parsed.len());
        let mut inits = Vec::with_capacity(parsed.len());
        for (name, init_form) in &parsed {
            // Inits see the outer environment.
            let init = self.pass1(init_form, &cenv.add_name(Value::Sym(*name)))?;
            let lv = self.pool.new_lvar(*name);
            self.pool.lvar_mut(lv).init = Some(init);
            lvars.push(lv);
            inits.push(init);
        }
        let frame = Frame::lexical(
            parsed
                .iter()
                .map(|(n, _)| *n)
                .zip(lvars.iter().map(|&lv| Binding::LVar(lv)))
                .collect(),
        );
        let inner = cenv.extend(frame);
        let body = self.pass1_body(body, &inner)?;
        Ok(self.pool.alloc(IForm::Let {
            src: Some(form.clone()),
            kind: LetKind::Let,
            lvars,
            inits,
            body,
        }))
    }

    /// Named let: `(let name ((v init)...) body...)` becomes a rec-bound
    /// procedure applied to the inits. The procedure sees itself; the
    /// inits see the outer environment.
    fn syn_named_let(&mut self, form: &Value, args: &[Value], cenv: &Cenv) -> CompileResult<IFormId> {
        let [name_form, bindings, body @ ..] = args else {
            return Err(CompileError::syntax("malformed named let", form));
        };
        if body.is_empty() {
            return Err(CompileError::syntax("let body is empty", form));
        }
        let name = name_form.variable_name().expect("checked by caller");
        let parsed = parse_bindings(bindings, form)?;

        let mut inits = Vec::with_capacity(parsed.len());
        for (var, init_form) in &parsed {
            inits.push(self.pass1(init_form, &cenv.add_name(Value::Sym(*var)))?);
        }

        let loop_lv = self.pool.new_lvar(name);
        let name_frame = Frame::lexical(vec![(name, Binding::LVar(loop_lv))]);
        let inner = cenv.extend(name_frame);
        let formals = Value::list(&parsed.iter().map(|(n, _)| Value::Sym(*n)).collect::<Vec<_>>());
        let lambda = self.make_lambda(form, &formals, body, Some(Value::Sym(name)), &inner)?;
        self.pool.lvar_mut(loop_lv).init = Some(lambda);

        let proc = self.lref(loop_lv);
        let call = self.pool.alloc(IForm::Call {
            src: Some(form.clone()),
            proc,
            args: inits,
            flag: crate::compiler::iform::CallFlag::None,
        });
        Ok(self.pool.alloc(IForm::Let {
            src: Some(form.clone()),
            kind: LetKind::Rec,
            lvars: vec![loop_lv],
            inits: vec![lambda],
            body: call,
        }))
    }

    fn syn_let_star(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [bindings, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed let*", form));
        };
        if body.is_empty() {
            return Err(CompileError::syntax("let* body is empty", form));
        }
        let parsed = parse_bindings(bindings, form)?;
        self.let_star_rec(form, &parsed, body, cenv)
    }

    fn let_star_rec(
        &mut self,
        form: &Value,
        bindings: &[(Symbol, Value)],
        body: &[Value],
        cenv: &Cenv,
    ) -> CompileResult<IFormId> {
        let Some(((name, init_form), remaining)) = bindings.split_first() else {
            return self.pass1_body(body, cenv);
        };
        // Each init sees the environment extended with the preceding
        // bindings.
        let init = self.pass1(init_form, &cenv.add_name(Value::Sym(*name)))?;
        let lv = self.pool.new_lvar(*name);
        self.pool.lvar_mut(lv).init = Some(init);
        let inner = cenv.extend(Frame::lexical(vec![(*name, Binding::LVar(lv))]));
        let inner_body = self.let_star_rec(form, remaining, body, &inner)?;
        Ok(self.pool.alloc(IForm::Let {
            src: Some(form.clone()),
            kind: LetKind::Let,
            lvars: vec![lv],
            inits: vec![init],
            body: inner_body,
        }))
    }

    fn syn_letrec(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [bindings, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed letrec", form));
        };
        if body.is_empty() {
            return Err(CompileError::syntax("letrec body is empty", form));
        }
        let parsed = parse_bindings(bindings, form)?;
        let lvars: Vec<LVarId> = parsed.iter().map(|(n, _)| self.pool.new_lvar(*n)).collect();
        let frame = Frame::lexical(
            parsed
                .iter()
                .map(|(n, _)| *n)
                .zip(lvars.iter().map(|&lv| Binding::LVar(lv)))
                .collect(),
        );
        let inner = cenv.extend(frame);
        let mut inits = Vec::with_capacity(parsed.len());
        for ((name, init_form), &lv) in parsed.iter().zip(&lvars) {
            // Inits see the inner environment.
            let init = self.pass1(init_form, &inner.add_name(Value::Sym(*name)))?;
            self.pool.lvar_mut(lv).init = Some(init);
            inits.push(init);
        }
        let body = self.pass1_body(body, &inner)?;
        Ok(self.pool.alloc(IForm::Let {
            src: Some(form.clone()),
            kind: LetKind::Rec,
            lvars,
            inits,
            body,
        }))
    }

    fn syn_do(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [specs_form, termination, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed do", form));
        };
        let specs = specs_form
            .list_to_vec()
            .ok_or_else(|| CompileError::syntax("malformed do bindings", form))?;
        let mut vars = Vec::with_capacity(specs.len());
        for spec in &specs {
            let parts = spec
                .list_to_vec()
                .filter(|p| p.len() == 2 || p.len() == 3)
                .ok_or_else(|| CompileError::syntax("malformed do binding", form))?;
            let name = parts[0]
                .variable_name()
                .ok_or_else(|| CompileError::syntax("do variable must be an identifier", form))?;
            vars.push((name, parts[1].clone(), parts.get(2).cloned()));
        }
        let term = termination
            .list_to_vec()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CompileError::syntax("malformed do termination clause", form))?;

        // Inits see the outer environment.
        let mut inits = Vec::with_capacity(vars.len());
        for (name, init_form, _) in &vars {
            inits.push(self.pass1(init_form, &cenv.add_name(Value::Sym(*name)))?);
        }

        let loop_lv = self.pool.new_lvar(gensym("do-loop"));
        let var_lvars: Vec<LVarId> = vars.iter().map(|(n, _, _)| self.pool.new_lvar(*n)).collect();
        let frame = Frame::lexical(
            vars.iter()
                .map(|(n, _, _)| *n)
                .zip(var_lvars.iter().map(|&lv| Binding::LVar(lv)))
                .collect(),
        );
        let inner = cenv.extend(frame).sans_name();

        let test = self.pass1(&term[0], &inner)?;
        let result = self.compile_seq(&term[1..], &inner)?;
        let mut steps = Vec::with_capacity(vars.len());
        for ((_, _, step), &lv) in vars.iter().zip(&var_lvars) {
            steps.push(match step {
                Some(step_form) => self.pass1(step_form, &inner)?,
                None => self.lref(lv),
            });
        }
        let proc = self.lref(loop_lv);
        let recall = self.pool.alloc(IForm::Call {
            src: Some(form.clone()),
            proc,
            args: steps,
            flag: crate::compiler::iform::CallFlag::None,
        });
        let mut loop_body = Vec::with_capacity(body.len() + 1);
        for b in body {
            loop_body.push(self.pass1(b, &inner)?);
        }
        loop_body.push(recall);
        let loop_seq = self.pool.alloc(IForm::Seq { body: loop_body });
        let lambda_body = self.pool.alloc(IForm::If {
            src: Some(form.clone()),
            test,
            then_br: result,
            else_br: loop_seq,
        });
        let nvars = u32::try_from(var_lvars.len()).expect("do variable count exceeds u32");
        let lambda = self.pool.alloc(IForm::Lambda {
            src: Some(form.clone()),
            name: Some(Value::Sym(self.pool.lvar(loop_lv).name)),
            reqargs: nvars,
            optarg: false,
            lvars: var_lvars,
            body: lambda_body,
            flag: LambdaFlag::None,
            calls: Vec::new(),
        });
        self.pool.lvar_mut(loop_lv).init = Some(lambda);
        let entry_proc = self.lref(loop_lv);
        let entry = self.pool.alloc(IForm::Call {
            src: Some(form.clone()),
            proc: entry_proc,
            args: inits,
            flag: crate::compiler::iform::CallFlag::None,
        });
        Ok(self.pool.alloc(IForm::Let {
            src: Some(form.clone()),
            kind: LetKind::Rec,
            lvars: vec![loop_lv],
            inits: vec![lambda],
            body: entry,
        }))
    }

    fn syn_and_let_star(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [clauses_form, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed and-let*", form));
        };
        let clauses = clauses_form
            .list_to_vec()
            .ok_or_else(|| CompileError::syntax("malformed and-let* clauses", form))?;
        self.and_let_rec(form, &clauses, body, cenv)
    }

    fn and_let_rec(&mut self, form: &Value, clauses: &[Value], body: &[Value], cenv: &Cenv) -> CompileResult<IFormId> {
        let Some((clause, remaining)) = clauses.split_first() else {
            if body.is_empty() {
                return Ok(self.pool.const_bool(true));
            }
            return self.pass1_body(body, cenv);
        };
        match clause {
            // (var expr): bind, then continue only when truthy.
            Value::Pair(p) if p.car.is_variable() && p.cdr.is_pair() => {
                let name = p.car.variable_name().expect("variable checked");
                let expr_form = p
                    .cdr
                    .list_to_vec()
                    .filter(|v| v.len() == 1)
                    .ok_or_else(|| CompileError::syntax("malformed and-let* clause", form))?
                    .remove(0);
                let init = self.pass1(&expr_form, &cenv.add_name(Value::Sym(name)))?;
                let lv = self.pool.new_lvar(name);
                self.pool.lvar_mut(lv).init = Some(init);
                let inner = cenv.extend(Frame::lexical(vec![(name, Binding::LVar(lv))]));
                let test = self.lref(lv);
                let then_br = self.and_let_rec(form, remaining, body, &inner)?;
                let fail = self.pool.const_bool(false);
                let cond = self.pool.alloc(IForm::If {
                    src: None,
                    test,
                    then_br,
                    else_br: fail,
                });
                Ok(self.pool.alloc(IForm::Let {
                    src: Some(form.clone()),
                    kind: LetKind::Let,
                    lvars: vec![lv],
                    inits: vec![init],
                    body: cond,
                }))
            }
            // (expr): test without binding.
            Value::Pair(p) if p.cdr.is_nil() => {
                let test = self.pass1(&p.car, &cenv.sans_name())?;
                let then_br = self.and_let_rec(form, remaining, body, cenv)?;
                let fail = self.pool.const_bool(false);
                Ok(self.pool.alloc(IForm::If {
                    src: None,
                    test,
                    then_br,
                    else_br: fail,
                }))
            }
            // var: test an existing binding.
            v if v.is_variable() => {
                let test = self.pass1(v, &cenv.sans_name())?;
                let then_br = self.and_let_rec(form, remaining, body, cenv)?;
                let fail = self.pool.const_bool(false);
                Ok(self.pool.alloc(IForm::If {
                    src: None,
                    test,
                    then_br,
                    else_br: fail,
                }))
            }
            _ => Err(CompileError::syntax("malformed and-let* clause", form)),
        }
    }

    fn syn_receive(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [formals, producer, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed receive", form));
        };
        if body.is_empty() {
            return Err(CompileError::syntax("receive body is empty", form));
        }
        let (syms, reqargs, optarg) = parse_formals(formals, form)?;
        let expr = self.pass1(producer, &cenv.sans_name())?;
        let lvars: Vec<LVarId> = syms.iter().map(|&s| self.pool.new_lvar(s)).collect();
        let frame = Frame::lexical(syms.iter().copied().zip(lvars.iter().map(|&lv| Binding::LVar(lv))).collect());
        let inner = cenv.extend(frame);
        let body = self.pass1_body(body, &inner)?;
        Ok(self.pool.alloc(IForm::Receive {
            src: Some(form.clone()),
            reqargs,
            optarg,
            lvars,
            expr,
            body,
        }))
    }

    fn syn_and(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        match args.as_slice() {
            [] => Ok(self.pool.const_bool(true)),
            [only] => self.pass1(only, cenv),
            [first, rest @ ..] => {
                let test = self.pass1(first, &cenv.sans_name())?;
                let rest_form = Value::cons(Value::Sym(StaticSym::And.sym()), Value::list(rest));
                let then_br = self.syn_and(&rest_form, cenv)?;
                let else_br = self.pool.alloc(IForm::It);
                Ok(self.pool.alloc(IForm::If {
                    src: Some(form.clone()),
                    test,
                    then_br,
                    else_br,
                }))
            }
        }
    }

    fn syn_or(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        match args.as_slice() {
            [] => Ok(self.pool.const_bool(false)),
            [only] => self.pass1(only, cenv),
            [first, rest @ ..] => {
                let test = self.pass1(first, &cenv.sans_name())?;
                let then_br = self.pool.alloc(IForm::It);
                let rest_form = Value::cons(Value::Sym(StaticSym::Or.sym()), Value::list(rest));
                let else_br = self.syn_or(&rest_form, cenv)?;
                Ok(self.pool.alloc(IForm::If {
                    src: Some(form.clone()),
                    test,
                    then_br,
                    else_br,
                }))
            }
        }
    }

    fn syn_when(&mut self, form: &Value, cenv: &Cenv, on_true: bool) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [test, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed when/unless", form));
        };
        if body.is_empty() {
            return Err(CompileError::syntax("when/unless body is empty", form));
        }
        let test = self.pass1(test, &cenv.sans_name())?;
        let taken = self.compile_seq(body, cenv)?;
        let skipped = self.pool.const_undef();
        let (then_br, else_br) = if on_true { (taken, skipped) } else { (skipped, taken) };
        Ok(self.pool.alloc(IForm::If {
            src: Some(form.clone()),
            test,
            then_br,
            else_br,
        }))
    }

    fn syn_cond(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let clauses = call_args(form)?;
        if clauses.is_empty() {
            return Err(CompileError::syntax("cond requires at least one clause", form));
        }
        self.cond_clauses(form, &clauses, cenv)
    }

    fn cond_clauses(&mut self, form: &Value, clauses: &[Value], cenv: &Cenv) -> CompileResult<IFormId> {
        let Some((clause, remaining)) = clauses.split_first() else {
            return Ok(self.pool.const_undef());
        };
        let parts = clause
            .list_to_vec()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CompileError::syntax("malformed cond clause", form))?;

        if is_symbol(&parts[0], StaticSym::Else) {
            if !remaining.is_empty() {
                return Err(CompileError::syntax("else clause must be last in cond", form));
            }
            if parts.len() < 2 {
                return Err(CompileError::syntax("malformed else clause", form));
            }
            return self.compile_seq(&parts[1..], cenv);
        }

        // (test => receiver): bind the test result so the receiver is
        // called only when it is truthy.
        if parts.len() == 3 && is_symbol(&parts[1], StaticSym::Arrow) {
            let init = self.pass1(&parts[0], &cenv.sans_name())?;
            let lv = self.pool.new_lvar(gensym("tmp"));
            self.pool.lvar_mut(lv).init = Some(init);
            let receiver = self.pass1(&parts[2], &cenv.sans_name())?;
            let test = self.lref(lv);
            let arg = self.lref(lv);
            let call = self.pool.alloc(IForm::Call {
                src: Some(clause.clone()),
                proc: receiver,
                args: vec![arg],
                flag: crate::compiler::iform::CallFlag::None,
            });
            let else_br = self.cond_clauses(form, remaining, cenv)?;
            let cond = self.pool.alloc(IForm::If {
                src: Some(clause.clone()),
                test,
                then_br: call,
                else_br,
            });
            return Ok(self.pool.alloc(IForm::Let {
                src: Some(clause.clone()),
                kind: LetKind::Let,
                lvars: vec![lv],
                inits: vec![init],
                body: cond,
            }));
        }

        let test = self.pass1(&parts[0], &cenv.sans_name())?;
        let then_br = if parts.len() == 1 {
            // (test): the clause value is the test value itself.
            self.pool.alloc(IForm::It)
        } else {
            self.compile_seq(&parts[1..], cenv)?
        };
        let else_br = self.cond_clauses(form, remaining, cenv)?;
        Ok(self.pool.alloc(IForm::If {
            src: Some(clause.clone()),
            test,
            then_br,
            else_br,
        }))
    }

    fn syn_case(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [key, clauses @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed case", form));
        };
        if clauses.is_empty() {
            return Err(CompileError::syntax("case requires at least one clause", form));
        }
        let init = self.pass1(key, &cenv.sans_name())?;
        let lv = self.pool.new_lvar(gensym("tmp"));
        self.pool.lvar_mut(lv).init = Some(init);
        let body = self.case_clauses(form, clauses, lv, cenv)?;
        Ok(self.pool.alloc(IForm::Let {
            src: Some(form.clone()),
            kind: LetKind::Let,
            lvars: vec![lv],
            inits: vec![init],
            body,
        }))
    }

    fn case_clauses(&mut self, form: &Value, clauses: &[Value], key: LVarId, cenv: &Cenv) -> CompileResult<IFormId> {
        let Some((clause, remaining)) = clauses.split_first() else {
            return Ok(self.pool.const_undef());
        };
        let parts = clause
            .list_to_vec()
            .filter(|p| p.len() >= 2)
            .ok_or_else(|| CompileError::syntax("malformed case clause", form))?;

        if is_symbol(&parts[0], StaticSym::Else) {
            if !remaining.is_empty() {
                return Err(CompileError::syntax("else clause must be last in case", form));
            }
            return self.compile_seq(&parts[1..], cenv);
        }
        let datums = parts[0]
            .list_to_vec()
            .ok_or_else(|| CompileError::syntax("malformed case datum list", form))?;
        if datums.is_empty() {
            return Err(CompileError::syntax("empty case datum list", form));
        }
        // Single symbol compares with eq?, single non-symbol with eqv?,
        // multiple keys search with memv.
        let keyref = self.lref(key);
        let test = if datums.len() == 1 {
            let datum = self.pool.const_node(datums[0].clone());
            if matches!(datums[0], Value::Sym(_)) {
                self.pool.alloc(IForm::Eq {
                    src: Some(clause.clone()),
                    a: keyref,
                    b: datum,
                })
            } else {
                self.pool.alloc(IForm::Eqv {
                    src: Some(clause.clone()),
                    a: keyref,
                    b: datum,
                })
            }
        } else {
            let list = self.pool.const_node(Value::list(&datums));
            self.pool.alloc(IForm::Memv {
                src: Some(clause.clone()),
                a: keyref,
                b: list,
            })
        };
        let then_br = self.compile_seq(&parts[1..], cenv)?;
        let else_br = self.case_clauses(form, remaining, key, cenv)?;
        Ok(self.pool.alloc(IForm::If {
            src: Some(clause.clone()),
            test,
            then_br,
            else_br,
        }))
    }

    fn syn_set(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [target, value] = args.as_slice() else {
            return Err(CompileError::syntax("malformed set!", form));
        };
        if target.is_pair() {
            // Generalized set!: rewrite ((setter op) args... value).
            let inner = target.list_to_vec().ok_or_else(|| CompileError::syntax("malformed set! target", form))?;
            let setter = make_identifier(StaticSym::Setter.sym(), self.vm.modules().core(), Vec::new());
            let setter_call = Value::list(&[setter, inner[0].clone()]);
            let mut rewritten = vec![setter_call];
            rewritten.extend_from_slice(&inner[1..]);
            rewritten.push(value.clone());
            return self.pass1(&Value::list(&rewritten), cenv);
        }
        if !target.is_variable() {
            return Err(CompileError::syntax("set! target must be a variable", form));
        }
        match cenv.lookup(target, FrameKind::Lexical) {
            Lookup::LVar(lv) => {
                let expr = self.pass1(value, &cenv.add_name(target.clone()))?;
                self.pool.set_inc(lv);
                Ok(self.pool.alloc(IForm::LSet { lvar: lv, expr }))
            }
            Lookup::Macro(_) => Err(CompileError::syntax("cannot set! a macro", form)),
            Lookup::Global(id) => {
                let expr = self.pass1(value, &cenv.add_name(target.clone()))?;
                Ok(self.pool.alloc(IForm::GSet { id, expr }))
            }
        }
    }

    fn syn_quasiquote(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        if args.len() != 1 {
            return Err(CompileError::syntax("malformed quasiquote", form));
        }
        self.quasi(&args[0], 0, cenv)
    }

    /// Quasiquote walker. `depth` counts nested quasiquotes; unquotes are
    /// active only at depth zero. Whenever every piece of a constructed
    /// node is constant the construction is folded at compile time.
    fn quasi(&mut self, form: &Value, depth: u32, cenv: &Cenv) -> CompileResult<IFormId> {
        match form {
            Value::Pair(p) => {
                // (unquote x)
                if let Some(inner) = unquote_payload(form, StaticSym::Unquote) {
                    if depth == 0 {
                        return self.pass1(&inner, &cenv.sans_name());
                    }
                    let tag = self.pool.const_node(Value::Sym(StaticSym::Unquote.sym()));
                    let rebuilt = self.quasi(&inner, depth - 1, cenv)?;
                    return Ok(self.fold_list(form, vec![tag, rebuilt]));
                }
                // (quasiquote x)
                if let Some(inner) = unquote_payload(form, StaticSym::Quasiquote) {
                    let tag = self.pool.const_node(Value::Sym(StaticSym::Quasiquote.sym()));
                    let rebuilt = self.quasi(&inner, depth + 1, cenv)?;
                    return Ok(self.fold_list(form, vec![tag, rebuilt]));
                }
                // ((unquote-splicing x) . rest)
                if let Some(spliced) = unquote_payload(&p.car, StaticSym::UnquoteSplicing) {
                    if depth == 0 {
                        let head = self.pass1(&spliced, &cenv.sans_name())?;
                        let tail = self.quasi(&p.cdr, depth, cenv)?;
                        return Ok(self.fold_append(form, head, tail));
                    }
                    let tag = self.pool.const_node(Value::Sym(StaticSym::UnquoteSplicing.sym()));
                    let rebuilt = self.quasi(&spliced, depth - 1, cenv)?;
                    let head = self.fold_list(&p.car, vec![tag, rebuilt]);
                    let tail = self.quasi(&p.cdr, depth, cenv)?;
                    return Ok(self.fold_cons(form, head, tail));
                }
                let car = self.quasi(&p.car, depth, cenv)?;
                let cdr = self.quasi(&p.cdr, depth, cenv)?;
                Ok(self.fold_cons(form, car, cdr))
            }
            Value::Vector(elts) => {
                let as_list = Value::list(elts);
                let list_id = self.quasi(&as_list, depth, cenv)?;
                if let IForm::Const { value } = self.pool.get(list_id) {
                    let folded = value
                        .list_to_vec()
                        .map(|v| Value::Vector(Rc::new(v)))
                        .expect("quasi folded list is proper");
                    return Ok(self.pool.const_node(folded));
                }
                Ok(self.pool.alloc(IForm::ListToVec {
                    src: Some(form.clone()),
                    arg: list_id,
                }))
            }
            _ => Ok(self.pool.const_node(form.clone())),
        }
    }

    fn fold_cons(&mut self, src: &Value, a: IFormId, b: IFormId) -> IFormId {
        if let (Some(va), Some(vb)) = (self.pool.as_const(a), self.pool.as_const(b)) {
            let folded = Value::cons(va.clone(), vb.clone());
            return self.pool.const_node(folded);
        }
        self.pool.alloc(IForm::Cons {
            src: Some(src.clone()),
            a,
            b,
        })
    }

    fn fold_append(&mut self, src: &Value, a: IFormId, b: IFormId) -> IFormId {
        if let (Some(va), Some(vb)) = (self.pool.as_const(a), self.pool.as_const(b))
            && let Some(elts) = va.list_to_vec()
        {
            let folded = Value::list_star(&elts, vb.clone());
            return self.pool.const_node(folded);
        }
        self.pool.alloc(IForm::Append {
            src: Some(src.clone()),
            a,
            b,
        })
    }

    fn fold_list(&mut self, src: &Value, elts: Vec<IFormId>) -> IFormId {
        if elts.iter().all(|&e| self.pool.as_const(e).is_some()) {
            let values: Vec<Value> = elts
                .iter()
                .map(|&e| self.pool.as_const(e).expect("checked const").clone())
                .collect();
            return self.pool.const_node(Value::list(&values));
        }
        self.pool.alloc(IForm::List {
            src: Some(src.clone()),
            elts,
        })
    }

    fn syn_delay(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        if args.len() != 1 {
            return Err(CompileError::syntax("malformed delay", form));
        }
        // The body becomes a zero-argument procedure forced later.
        let lambda = self.make_lambda(form, &Value::Nil, &args, cenv.expr_name.clone(), cenv)?;
        Ok(self.pool.alloc(IForm::Promise {
            src: Some(form.clone()),
            expr: lambda,
        }))
    }

    // ----- toplevel-only forms -----

    fn require_toplevel(&self, form: &Value, cenv: &Cenv) -> CompileResult<()> {
        if cenv.is_toplevel() {
            Ok(())
        } else {
            Err(CompileError::syntax("form is only allowed at toplevel", form))
        }
    }

    fn syn_define(
        &mut self,
        form: &Value,
        cenv: &Cenv,
        constant: bool,
        module_override: Option<ModuleId>,
    ) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        let (name, expr_form) = parse_define_parts(form)?;
        let module = module_override.unwrap_or(cenv.module);
        let id = make_identifier(name, module, Vec::new());
        let defcenv = cenv.in_module(module).add_name(Value::Sym(name));
        let expr = self.pass1(&expr_form, &defcenv)?;
        if constant && let Some(value) = self.pool.as_const(expr) {
            // Make the constant visible to the rest of the compilation unit.
            let value = value.clone();
            self.vm.modules_mut().insert_binding(module, name, value, true);
        }
        Ok(self.pool.alloc(IForm::Define {
            src: Some(form.clone()),
            constant,
            id,
            expr,
        }))
    }

    fn syn_define_in_module(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        let args = call_args(form)?;
        let [module_form, rest @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed define-in-module", form));
        };
        let module_name = module_form
            .variable_name()
            .ok_or_else(|| CompileError::syntax("define-in-module requires a module name", form))?;
        let module = self
            .vm
            .modules()
            .find_module(module_name)
            .ok_or_else(|| CompileError::compile(format!("unknown module {module_name}"), Some(form)))?;
        // Re-shape into a define form and compile against the target module.
        let inner = Value::cons(Value::Sym(StaticSym::Define.sym()), Value::list(rest));
        self.syn_define(&inner, cenv, false, Some(module))
    }

    fn syn_define_inline(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        let (name, expr_form) = parse_define_parts(form)?;
        let module = cenv.module;
        let id = make_identifier(name, module, Vec::new());
        let expr = self.pass1(&expr_form, &cenv.add_name(Value::Sym(name)))?;
        let IForm::Lambda { reqargs, optarg, .. } = self.pool.get(expr) else {
            return Err(CompileError::syntax("define-inline requires a procedure", form));
        };
        let (reqargs, optarg) = (*reqargs, *optarg);
        if let IForm::Lambda { flag, .. } = self.pool.get_mut(expr) {
            *flag = LambdaFlag::Inlined;
        }
        // Pack the body and make the inlinable binding visible to later
        // call sites in the same compilation unit.
        let packed = Rc::new(self.pool.pack(expr));
        let proc = Procedure::new(name, reqargs, optarg, Some(Inliner::Packed(packed)));
        self.vm
            .modules_mut()
            .insert_binding(module, name, Value::Procedure(proc), false);
        Ok(self.pool.alloc(IForm::Define {
            src: Some(form.clone()),
            constant: false,
            id,
            expr,
        }))
    }

    fn syn_define_syntax(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        let args = call_args(form)?;
        let [name_form, rules] = args.as_slice() else {
            return Err(CompileError::syntax("malformed define-syntax", form));
        };
        let name = name_form
            .variable_name()
            .ok_or_else(|| CompileError::syntax("define-syntax requires an identifier", form))?;
        let Some(hook) = self.vm.syntax_rules_hook() else {
            return Err(CompileError::compile(
                "no syntax-rules engine is installed in this host",
                Some(form),
            ));
        };
        let transformer = hook(rules)?;
        let mac = Value::Macro(Rc::new(Macro::new(name, transformer)));
        self.vm.modules_mut().insert_binding(cenv.module, name, mac, false);
        Ok(self.pool.const_undef())
    }

    fn syn_define_macro(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        Err(CompileError::compile(
            "define-macro transformer bodies require the evaluator; register a native transformer instead",
            Some(form),
        ))
    }

    fn syn_define_module(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        let args = call_args(form)?;
        let [name_form, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed define-module", form));
        };
        let name = name_form
            .variable_name()
            .ok_or_else(|| CompileError::syntax("define-module requires a module name", form))?;
        let module = self.vm.modules_mut().make_module(name);
        let inner = cenv.in_module(module);
        let mut compiled = Vec::with_capacity(body.len());
        for b in body {
            compiled.push(self.pass1(b, &inner)?);
        }
        if compiled.is_empty() {
            return Ok(self.pool.const_undef());
        }
        Ok(self.pool.alloc(IForm::Seq { body: compiled }))
    }

    fn syn_with_module(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        let args = call_args(form)?;
        let [name_form, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed with-module", form));
        };
        let name = name_form
            .variable_name()
            .ok_or_else(|| CompileError::syntax("with-module requires a module name", form))?;
        let module = self
            .vm
            .modules()
            .find_module(name)
            .ok_or_else(|| CompileError::compile(format!("unknown module {name}"), Some(form)))?;
        let inner = cenv.in_module(module);
        let mut compiled = Vec::with_capacity(body.len());
        for b in body {
            compiled.push(self.pass1(b, &inner)?);
        }
        if compiled.is_empty() {
            return Ok(self.pool.const_undef());
        }
        Ok(self.pool.alloc(IForm::Seq { body: compiled }))
    }

    fn syn_select_module(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        let args = call_args(form)?;
        let [name_form] = args.as_slice() else {
            return Err(CompileError::syntax("malformed select-module", form));
        };
        let name = name_form
            .variable_name()
            .ok_or_else(|| CompileError::syntax("select-module requires a module name", form))?;
        let module = self
            .vm
            .modules()
            .find_module(name)
            .ok_or_else(|| CompileError::compile(format!("unknown module {name}"), Some(form)))?;
        self.vm.set_current_module(module);
        Ok(self.pool.const_undef())
    }

    fn syn_export(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        let args = call_args(form)?;
        let mut names = Vec::with_capacity(args.len());
        for a in &args {
            names.push(
                a.variable_name()
                    .ok_or_else(|| CompileError::syntax("export requires identifiers", form))?,
            );
        }
        self.vm.modules_mut().export_symbols(cenv.module, &names);
        Ok(self.pool.const_undef())
    }

    fn syn_import(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        self.require_toplevel(form, cenv)?;
        let args = call_args(form)?;
        for a in &args {
            let name = a
                .variable_name()
                .ok_or_else(|| CompileError::syntax("import requires module names", form))?;
            let module = self
                .vm
                .modules()
                .find_module(name)
                .ok_or_else(|| CompileError::compile(format!("unknown module {name}"), Some(form)))?;
            self.vm.modules_mut().import_module(cenv.module, module);
        }
        Ok(self.pool.const_undef())
    }

    fn syn_eval_when(&mut self, form: &Value, cenv: &Cenv) -> CompileResult<IFormId> {
        let args = call_args(form)?;
        let [situations_form, body @ ..] = args.as_slice() else {
            return Err(CompileError::syntax("malformed eval-when", form));
        };
        let situations = situations_form
            .list_to_vec()
            .ok_or_else(|| CompileError::syntax("malformed eval-when situations", form))?;
        let mut compile_tl = false;
        let mut load_tl = false;
        let mut execute = false;
        for s in &situations {
            match s {
                Value::Keyword(k) if *k == StaticSym::CompileToplevel.sym() => compile_tl = true,
                Value::Keyword(k) if *k == StaticSym::LoadToplevel.sym() => load_tl = true,
                Value::Keyword(k) if *k == StaticSym::Execute.sym() => execute = true,
                _ => return Err(CompileError::syntax("unknown eval-when situation", form)),
            }
        }
        if !cenv.is_toplevel() {
            // Falls through: compiled like begin.
            return self.compile_seq(body, cenv);
        }
        if self.vm.eval_situation() == EvalSituation::CompileToplevel && compile_tl {
            // Side effect: hand the forms to the host for immediate
            // compile-time evaluation.
            self.vm.compile_time_evals.extend(body.iter().cloned());
        }
        let emit = match self.vm.eval_situation() {
            EvalSituation::Execute => execute,
            EvalSituation::LoadToplevel => load_tl,
            EvalSituation::CompileToplevel => compile_tl,
        };
        if emit {
            self.compile_seq(body, cenv)
        } else {
            Ok(self.pool.const_undef())
        }
    }

    // ----- inlinable procedures -----

    /// Expands a call to an inlinable procedure, or declines with `None`.
    fn try_inline(&mut self, proc: &Procedure, form: &Value, cenv: &Cenv) -> CompileResult<Option<IFormId>> {
        let argforms = call_args(form)?;
        match proc.inliner.as_ref().expect("caller checked inliner") {
            Inliner::Insn { op, variadic } => {
                let (op, variadic) = (*op, *variadic);
                if !proc.accepts(argforms.len()) {
                    return Err(CompileError::arity(
                        proc.name,
                        proc.arity_description(),
                        argforms.len(),
                        Some(form),
                    ));
                }
                let sans = cenv.sans_name();
                let mut args = Vec::with_capacity(argforms.len());
                for a in &argforms {
                    args.push(self.pass1(a, &sans)?);
                }
                let insn = if variadic {
                    AsmInsn::with_arg(op, i32::try_from(args.len()).expect("argument count exceeds i32"))
                } else {
                    AsmInsn::new(op)
                };
                Ok(Some(self.pool.alloc(IForm::Asm {
                    src: Some(form.clone()),
                    insn,
                    args,
                })))
            }
            Inliner::NumCalc(op) => {
                let op = *op;
                if !proc.accepts(argforms.len()) {
                    return Err(CompileError::arity(
                        proc.name,
                        proc.arity_description(),
                        argforms.len(),
                        Some(form),
                    ));
                }
                self.fold_numeric(op, form, &argforms, cenv).map(Some)
            }
            Inliner::NumCmp(op) => {
                let op = *op;
                if argforms.len() != 2 {
                    // Variadic comparisons fall back to a generic call.
                    return Ok(None);
                }
                let sans = cenv.sans_name();
                let a = self.pass1(&argforms[0], &sans)?;
                let b = self.pass1(&argforms[1], &sans)?;
                Ok(Some(self.pool.alloc(IForm::Asm {
                    src: Some(form.clone()),
                    insn: AsmInsn::new(op.insn()),
                    args: vec![a, b],
                })))
            }
            Inliner::Packed(packed) => {
                let packed = Rc::clone(packed);
                let sans = cenv.sans_name();
                let mut args = Vec::with_capacity(argforms.len());
                for a in &argforms {
                    args.push(self.pass1(a, &sans)?);
                }
                let lambda = self.pool.unpack(&packed);
                expand_inlined_procedure(self.pool, Some(form.clone()), lambda, args).map(Some)
            }
            Inliner::Native(f) => match f(form, cenv) {
                Some(rewritten) => self.pass1(&rewritten, cenv).map(Some),
                None => Ok(None),
            },
        }
    }

    /// Left-associating arithmetic fold with eager constant folding
    /// (`+`, `-`, `*`, `/`).
    fn fold_numeric(&mut self, op: NumOp, form: &Value, argforms: &[Value], cenv: &Cenv) -> CompileResult<IFormId> {
        let sans = cenv.sans_name();
        let mut args = Vec::with_capacity(argforms.len());
        for a in argforms {
            args.push(self.pass1(a, &sans)?);
        }
        match (op, args.len()) {
            (NumOp::Add, 0) => return Ok(self.pool.const_node(Value::Int(0))),
            (NumOp::Mul, 0) => return Ok(self.pool.const_node(Value::Int(1))),
            (NumOp::Add | NumOp::Mul, 1) => return Ok(args[0]),
            (NumOp::Sub, 1) => {
                if let Some(n) = self.const_num(args[0])
                    && let Some(folded) = fold_const_num(NumOp::Sub, &NumLit::I(0), &n)
                {
                    return Ok(self.pool.const_node(folded));
                }
                return Ok(self.pool.alloc(IForm::Asm {
                    src: Some(form.clone()),
                    insn: AsmInsn::new(Opcode::Negate),
                    args,
                }));
            }
            (NumOp::Div, 1) => {
                // (/ x) is 1/x.
                let one = self.pool.const_node(Value::Int(1));
                let mut with_one = vec![one];
                with_one.extend(args);
                args = with_one;
            }
            _ => {}
        }
        let mut acc = args[0];
        for &next in &args[1..] {
            acc = self.combine_numeric(op, form, acc, next);
        }
        Ok(acc)
    }

    fn combine_numeric(&mut self, op: NumOp, form: &Value, acc: IFormId, next: IFormId) -> IFormId {
        let lhs = self.const_num(acc);
        let rhs = self.const_num(next);
        if let (Some(a), Some(b)) = (&lhs, &rhs)
            && let Some(folded) = fold_const_num(op, a, b)
        {
            return self.pool.const_node(folded);
        }
        // Immediate forms for small exact-integer operands of + and -.
        if let Some(imm_op) = op.immediate_insn() {
            if let Some(NumLit::I(n)) = rhs {
                let imm = if op == NumOp::Sub { n.checked_neg() } else { Some(n) };
                if let Some(imm) = imm
                    && fits_signed_imm(imm)
                {
                    return self.pool.alloc(IForm::Asm {
                        src: Some(form.clone()),
                        insn: AsmInsn::with_arg(Opcode::NumAddI, i32::try_from(imm).expect("imm fits i32")),
                        args: vec![acc],
                    });
                }
            }
            if let Some(NumLit::I(n)) = lhs
                && fits_signed_imm(n)
            {
                let n = i32::try_from(n).expect("imm fits i32");
                let insn = if op == NumOp::Sub {
                    // (- imm x) subtracts from the immediate.
                    AsmInsn::with_arg(Opcode::NumSubI, n)
                } else {
                    AsmInsn::with_arg(imm_op, n)
                };
                return self.pool.alloc(IForm::Asm {
                    src: Some(form.clone()),
                    insn,
                    args: vec![next],
                });
            }
        }
        self.pool.alloc(IForm::Asm {
            src: Some(form.clone()),
            insn: AsmInsn::new(op.insn()),
            args: vec![acc, next],
        })
    }

    fn const_num(&self, id: IFormId) -> Option<NumLit> {
        self.pool.as_const(id).and_then(value_num)
    }
}

/// Numeric literal classification for the constant folder.
pub(crate) enum NumLit {
    I(i64),
    B(Rc<BigInt>),
    F(f64),
}

/// Classifies a constant value for numeric folding.
pub(crate) fn value_num(v: &Value) -> Option<NumLit> {
    match v {
        Value::Int(n) => Some(NumLit::I(*n)),
        Value::Big(n) => Some(NumLit::B(Rc::clone(n))),
        Value::Real(x) => Some(NumLit::F(*x)),
        _ => None,
    }
}

impl NumLit {
    pub(crate) fn to_f64(&self) -> f64 {
        match self {
            NumLit::I(n) => *n as f64,
            NumLit::B(n) => n.to_f64().unwrap_or(f64::INFINITY),
            NumLit::F(x) => *x,
        }
    }

    pub(crate) fn to_bigint(&self) -> Option<BigInt> {
        match self {
            NumLit::I(n) => Some(BigInt::from(*n)),
            NumLit::B(n) => Some((**n).clone()),
            NumLit::F(_) => None,
        }
    }
}

/// Folds one binary arithmetic step over constants, or declines when the
/// result is not exactly representable (inexact division by zero, exact
/// division with a remainder).
pub(crate) fn fold_const_num(op: NumOp, a: &NumLit, b: &NumLit) -> Option<Value> {
    // Flonum contagion.
    if matches!(a, NumLit::F(_)) || matches!(b, NumLit::F(_)) {
        let (x, y) = (a.to_f64(), b.to_f64());
        let folded = match op {
            NumOp::Add => x + y,
            NumOp::Sub => x - y,
            NumOp::Mul => x * y,
            NumOp::Div => x / y,
        };
        return Some(Value::Real(folded));
    }
    if let (NumLit::I(x), NumLit::I(y)) = (a, b) {
        let (x, y) = (*x, *y);
        let folded = match op {
            NumOp::Add => x.checked_add(y),
            NumOp::Sub => x.checked_sub(y),
            NumOp::Mul => x.checked_mul(y),
            NumOp::Div => {
                if y == 0 || x % y != 0 {
                    return None;
                }
                Some(x / y)
            }
        };
        if let Some(n) = folded {
            return Some(Value::Int(n));
        }
        // i64 overflow promotes to bignum.
    }
    let (x, y) = (a.to_bigint()?, b.to_bigint()?);
    let folded = match op {
        NumOp::Add => x + y,
        NumOp::Sub => x - y,
        NumOp::Mul => x * y,
        NumOp::Div => {
            use num_integer::Integer;
            use num_traits::Zero;
            if y.is_zero() {
                return None;
            }
            let (q, r) = x.div_rem(&y);
            if !r.is_zero() {
                return None;
            }
            q
        }
    };
    Some(Value::from_bigint(folded))
}

/// Beta-expansion of a `Lambda` node with the given argument list.
///
/// Adjusts the arguments to the lambda's arity (collecting surplus into a
/// rest list when the lambda is variadic), wires each LVar's init, and
/// produces a `Let`. The lambda's body is consumed: the caller must pass a
/// fresh copy if the lambda is referenced elsewhere.
pub(crate) fn expand_inlined_procedure(
    pool: &mut IrPool,
    src: Option<Value>,
    lambda: IFormId,
    mut args: Vec<IFormId>,
) -> CompileResult<IFormId> {
    let IForm::Lambda {
        name,
        reqargs,
        optarg,
        lvars,
        body,
        ..
    } = pool.get(lambda)
    else {
        return Err(CompileError::internal("expand_inlined_procedure on a non-lambda node"));
    };
    let name_text = name.as_ref().map_or_else(|| "#f".to_owned(), ToString::to_string);
    let (reqargs, optarg, lvars, body) = (*reqargs as usize, *optarg, lvars.clone(), *body);
    if optarg {
        if args.len() < reqargs {
            return Err(CompileError::arity(
                name_text,
                format!("at least {reqargs}"),
                args.len(),
                src.as_ref(),
            ));
        }
        let rest = args.split_off(reqargs);
        let rest_node = pool.alloc(IForm::List { src: None, elts: rest });
        args.push(rest_node);
    } else if args.len() != reqargs {
        return Err(CompileError::arity(name_text, reqargs, args.len(), src.as_ref()));
    }
    for (&lv, &arg) in lvars.iter().zip(&args) {
        pool.lvar_mut(lv).init = Some(arg);
    }
    Ok(pool.alloc(IForm::Let {
        src,
        kind: LetKind::Let,
        lvars,
        inits: args,
        body,
    }))
}

// ----- form helpers -----

/// The argument list of a form: its cdr as a proper list.
fn call_args(form: &Value) -> CompileResult<Vec<Value>> {
    form.cdr()
        .and_then(Value::list_to_vec)
        .ok_or_else(|| CompileError::syntax("improper argument list", form))
}

fn is_symbol(v: &Value, sym: StaticSym) -> bool {
    v.variable_name() == Some(sym.sym())
}

/// Resolution target of a global identifier: its module and name.
fn global_target(id: &Value, cenv: &Cenv) -> (ModuleId, Symbol) {
    match id {
        Value::Identifier(ident) => (ident.module, ident.name),
        other => (
            cenv.module,
            other.variable_name().expect("global lookup returned a non-variable"),
        ),
    }
}

/// The payload of `(tag x)` when `tag` matches, for the quasiquote walker.
fn unquote_payload(form: &Value, tag: StaticSym) -> Option<Value> {
    let p = form.as_pair()?;
    if p.car.variable_name() != Some(tag.sym()) {
        return None;
    }
    let rest = p.cdr.list_to_vec()?;
    if rest.len() == 1 { Some(rest[0].clone()) } else { None }
}

/// Splits a define form into `(name, expression-form)`.
///
/// `(define (f . formals) body...)` produces a lambda expression;
/// `(define v)` produces the undefined value.
fn parse_define_parts(form: &Value) -> CompileResult<(Symbol, Value)> {
    let args = call_args(form)?;
    match args.as_slice() {
        [target, rest @ ..] if target.is_pair() => {
            let p = target.as_pair().expect("checked pair");
            let name = p
                .car
                .variable_name()
                .ok_or_else(|| CompileError::syntax("malformed define", form))?;
            if rest.is_empty() {
                return Err(CompileError::syntax("define procedure body is empty", form));
            }
            let lambda = Value::cons(
                Value::Sym(StaticSym::Lambda.sym()),
                Value::cons(p.cdr.clone(), Value::list(rest)),
            );
            Ok((name, lambda))
        }
        [target] => {
            let name = target
                .variable_name()
                .ok_or_else(|| CompileError::syntax("malformed define", form))?;
            Ok((name, Value::Undefined))
        }
        [target, expr] => {
            let name = target
                .variable_name()
                .ok_or_else(|| CompileError::syntax("malformed define", form))?;
            Ok((name, expr.clone()))
        }
        _ => Err(CompileError::syntax("malformed define", form)),
    }
}

/// Parses a lambda list into `(names, reqargs, optarg)`.
fn parse_formals(formals: &Value, form: &Value) -> CompileResult<(Vec<Symbol>, u32, bool)> {
    let mut names: Vec<Symbol> = Vec::new();
    let mut cur = formals.clone();
    let (reqargs, optarg);
    loop {
        match cur {
            Value::Nil => {
                reqargs = names.len();
                optarg = false;
                break;
            }
            Value::Pair(p) => {
                let name = p
                    .car
                    .variable_name()
                    .ok_or_else(|| CompileError::syntax("formal parameter must be an identifier", form))?;
                names.push(name);
                cur = p.cdr.clone();
            }
            tail => {
                let name = tail
                    .variable_name()
                    .ok_or_else(|| CompileError::syntax("formal parameter must be an identifier", form))?;
                reqargs = names.len();
                names.push(name);
                optarg = true;
                break;
            }
        }
    }
    let mut dedup: SmallVec<[Symbol; 8]> = SmallVec::new();
    for &n in &names {
        if dedup.contains(&n) {
            return Err(CompileError::syntax("duplicate formal parameter", form));
        }
        dedup.push(n);
    }
    Ok((
        names,
        u32::try_from(reqargs).expect("formal count exceeds u32 range"),
        optarg,
    ))
}

/// Parses `((var init)...)` binding specs.
fn parse_bindings(bindings: &Value, form: &Value) -> CompileResult<Vec<(Symbol, Value)>> {
    let specs = bindings
        .list_to_vec()
        .ok_or_else(|| CompileError::syntax("malformed binding list", form))?;
    let mut out = Vec::with_capacity(specs.len());
    for spec in &specs {
        let parts = spec
            .list_to_vec()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| CompileError::syntax("malformed binding", form))?;
        let name = parts[0]
            .variable_name()
            .ok_or_else(|| CompileError::syntax("binding name must be an identifier", form))?;
        out.push((name, parts[1].clone()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_one;

    fn p1(src: &str) -> (IrPool, Vm, IFormId) {
        let mut pool = IrPool::new();
        let mut vm = Vm::new();
        let form = read_one(src).unwrap();
        let cenv = Cenv::toplevel(vm.current_module());
        let id = Pass1 {
            pool: &mut pool,
            vm: &mut vm,
        }
        .pass1(&form, &cenv)
        .unwrap();
        (pool, vm, id)
    }

    fn p1_err(src: &str) -> CompileError {
        let mut pool = IrPool::new();
        let mut vm = Vm::new();
        let form = read_one(src).unwrap();
        let cenv = Cenv::toplevel(vm.current_module());
        Pass1 {
            pool: &mut pool,
            vm: &mut vm,
        }
        .pass1(&form, &cenv)
        .unwrap_err()
    }

    #[test]
    fn test_self_evaluating() {
        let (pool, _, id) = p1("42");
        assert_eq!(pool.as_const(id), Some(&Value::Int(42)));
    }

    #[test]
    fn test_unbound_variable_is_gref() {
        let (pool, _, id) = p1("some-unbound-var");
        assert!(matches!(pool.get(id), IForm::GRef { .. }));
    }

    #[test]
    fn test_constant_arith_folds() {
        let (pool, _, id) = p1("(+ 1 2 3)");
        assert_eq!(pool.as_const(id), Some(&Value::Int(6)));
        let (pool, _, id) = p1("(* 2.5 4)");
        assert_eq!(pool.as_const(id), Some(&Value::Real(10.0)));
        // Inexact division folds only when exact.
        let (pool, _, id) = p1("(/ 7 2)");
        assert!(matches!(pool.get(id), IForm::Asm { .. }));
        let (pool, _, id) = p1("(/ 6 2)");
        assert_eq!(pool.as_const(id), Some(&Value::Int(3)));
    }

    #[test]
    fn test_overflow_promotes_to_bignum() {
        let (pool, _, id) = p1("(* 4611686018427387904 4)");
        assert!(matches!(pool.as_const(id), Some(Value::Big(_))));
    }

    #[test]
    fn test_numaddi_selection() {
        let (pool, _, id) = p1("(+ x 1)");
        match pool.get(id) {
            IForm::Asm { insn, args, .. } => {
                assert_eq!(insn.op, Opcode::NumAddI);
                assert_eq!(insn.args.as_slice(), &[1]);
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected Asm, got {other:?}"),
        }
        // (- 1 x) keeps the immediate on the left via NUMSUBI.
        let (pool, _, id) = p1("(- 1 x)");
        match pool.get(id) {
            IForm::Asm { insn, .. } => assert_eq!(insn.op, Opcode::NumSubI),
            other => panic!("expected Asm, got {other:?}"),
        }
    }

    #[test]
    fn test_comparison_arity_fallback() {
        let (pool, _, id) = p1("(< a b c)");
        assert!(matches!(pool.get(id), IForm::Call { .. }));
        let (pool, _, id) = p1("(< a b)");
        assert!(matches!(pool.get(id), IForm::Asm { .. }));
    }

    #[test]
    fn test_car_arity_error() {
        let err = p1_err("(car '(1) '(2))");
        assert_eq!(err.kind(), crate::error::ErrorKind::Arity);
    }

    #[test]
    fn test_quasiquote_constant_folds() {
        let (pool, _, id) = p1("`(1 2 3)");
        assert_eq!(pool.as_const(id), Some(&read_one("(1 2 3)").unwrap()));
        let (pool, _, id) = p1("`(1 ,(+ 2 3) 6)");
        assert_eq!(pool.as_const(id), Some(&read_one("(1 5 6)").unwrap()));
    }

    #[test]
    fn test_quasiquote_splicing_builds_append() {
        let (pool, _, id) = p1("`(1 ,(+ 2 3) ,@xs 6)");
        // The spine up to the splice is CONS nodes; the splice point is
        // APPEND.
        fn find_append(pool: &IrPool, id: IFormId) -> bool {
            match pool.get(id) {
                IForm::Append { .. } => true,
                IForm::Cons { a, b, .. } => find_append(pool, *a) || find_append(pool, *b),
                _ => false,
            }
        }
        assert!(find_append(&pool, id));
    }

    #[test]
    fn test_nested_quasiquote_depth() {
        // The inner unquote is not active at depth 1.
        let (pool, _, id) = p1("``(a ,(b))");
        assert!(pool.as_const(id).is_some());
    }

    #[test]
    fn test_define_requires_toplevel() {
        let err = p1_err("(lambda (x) (set! define 1) (define y 2))");
        // The internal define after an expression is a non-definition
        // context; it reaches the toplevel check.
        assert_eq!(err.kind(), crate::error::ErrorKind::Syntax);
    }

    #[test]
    fn test_define_constant_then_reference() {
        let mut pool = IrPool::new();
        let mut vm = Vm::new();
        let cenv = Cenv::toplevel(vm.current_module());
        let def = read_one("(define-constant K 42)").unwrap();
        Pass1 {
            pool: &mut pool,
            vm: &mut vm,
        }
        .pass1(&def, &cenv)
        .unwrap();
        let use_k = read_one("K").unwrap();
        let id = Pass1 {
            pool: &mut pool,
            vm: &mut vm,
        }
        .pass1(&use_k, &cenv)
        .unwrap();
        assert_eq!(pool.as_const(id), Some(&Value::Int(42)));
    }

    #[test]
    fn test_noinline_consts_flag() {
        let mut pool = IrPool::new();
        let mut vm = Vm::new();
        vm.set_flag(flags::NOINLINE_CONSTS);
        let cenv = Cenv::toplevel(vm.current_module());
        let def = read_one("(define-constant K 42)").unwrap();
        Pass1 {
            pool: &mut pool,
            vm: &mut vm,
        }
        .pass1(&def, &cenv)
        .unwrap();
        let id = Pass1 {
            pool: &mut pool,
            vm: &mut vm,
        }
        .pass1(&read_one("K").unwrap(), &cenv)
        .unwrap();
        assert!(matches!(pool.get(id), IForm::GRef { .. }));
    }

    #[test]
    fn test_set_on_accessor_rewrites_to_setter() {
        let (pool, _, id) = p1("(set! (car p) v)");
        match pool.get(id) {
            IForm::Call { proc, .. } => match pool.get(*proc) {
                IForm::Call { proc: inner, args, .. } => {
                    assert!(matches!(pool.get(*inner), IForm::GRef { .. }));
                    assert_eq!(args.len(), 1);
                }
                other => panic!("expected (setter car) call, got {other:?}"),
            },
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn test_case_lowering_shapes() {
        let (pool, _, id) = p1("(case x ((a) 1) ((b c) 2) (else 3))");
        let IForm::Let { body, .. } = pool.get(id) else {
            panic!("expected let around case");
        };
        let IForm::If { test, else_br, .. } = pool.get(*body) else {
            panic!("expected if chain");
        };
        assert!(matches!(pool.get(*test), IForm::Eq { .. }));
        let IForm::If { test: test2, .. } = pool.get(*else_br) else {
            panic!("expected nested if");
        };
        assert!(matches!(pool.get(*test2), IForm::Memv { .. }));
    }

    #[test]
    fn test_internal_defines_wrap_in_letrec() {
        let (pool, _, id) = p1("(lambda () (define a 1) (define (b) a) (b))");
        let IForm::Lambda { body, .. } = pool.get(id) else {
            panic!("expected lambda");
        };
        match pool.get(*body) {
            IForm::Let { kind, lvars, .. } => {
                assert_eq!(*kind, LetKind::Rec);
                assert_eq!(lvars.len(), 2);
            }
            other => panic!("expected letrec body, got {other:?}"),
        }
    }

    #[test]
    fn test_lambda_shadows_syntax() {
        // `if` bound as a parameter is an ordinary variable.
        let (pool, _, id) = p1("(lambda (if) (if 1 2))");
        let IForm::Lambda { body, .. } = pool.get(id) else {
            panic!("expected lambda");
        };
        assert!(matches!(pool.get(*body), IForm::Call { .. }));
    }

    #[test]
    fn test_eval_when_records_compile_time_forms() {
        let mut pool = IrPool::new();
        let mut vm = Vm::new();
        vm.set_eval_situation(EvalSituation::CompileToplevel);
        let cenv = Cenv::toplevel(vm.current_module());
        let form = read_one("(eval-when (:compile-toplevel :load-toplevel) (define x 1))").unwrap();
        Pass1 {
            pool: &mut pool,
            vm: &mut vm,
        }
        .pass1(&form, &cenv)
        .unwrap();
        assert_eq!(vm.compile_time_evals.len(), 1);
    }

    #[test]
    fn test_delay_wraps_in_promise_thunk() {
        let (pool, _, id) = p1("(delay (+ 1 x))");
        let IForm::Promise { expr, .. } = pool.get(id) else {
            panic!("expected promise");
        };
        match pool.get(*expr) {
            IForm::Lambda { reqargs, optarg, .. } => {
                assert_eq!(*reqargs, 0);
                assert!(!optarg);
            }
            other => panic!("expected thunk, got {other:?}"),
        }
    }
}
