//! The compilation pipeline.
//!
//! One toplevel form at a time: pass 1 parses and resolves the form into
//! IR, pass 2 rewrites the IR in place, pass 3 emits instructions into a
//! code builder. The arena lives for exactly one compilation.
//!
//! `compile_p1`/`compile_p2`/`compile_p3` are diagnostic entry points
//! that stop after the named pass and render its output.

pub mod builder;
pub mod cenv;
pub mod code;
pub mod iform;
pub mod op;
pub mod pass1;
mod pass2;
mod pass3;

use std::rc::Rc;

use crate::compiler::cenv::Cenv;
use crate::compiler::code::CompiledCode;
use crate::compiler::iform::{IForm, IFormId, IrPool};
use crate::compiler::pass1::Pass1;
use crate::error::{CompileError, CompileResult};
use crate::intern::{StaticSym, Symbol};
use crate::module::ModuleId;
use crate::value::Value;
use crate::vmstate::Vm;

/// Compiles one toplevel form into a code object.
///
/// When `module` is given it overrides the VM's current module for the
/// duration of this compilation. Errors are enriched with the offending
/// form when the failing handler did not attach one itself.
pub fn compile(vm: &mut Vm, form: &Value, module: Option<ModuleId>) -> CompileResult<CompiledCode> {
    let saved = vm.current_module();
    if let Some(m) = module {
        vm.set_current_module(m);
    }
    let result = compile_pipeline(vm, form);
    // select-module changes the current module on purpose; an explicit
    // override is scoped to this call.
    if module.is_some() {
        vm.set_current_module(saved);
    }
    result.map_err(|e| e.with_form(form))
}

fn compile_pipeline(vm: &mut Vm, form: &Value) -> CompileResult<CompiledCode> {
    let mut pool = IrPool::new();
    let top = run_pass1(vm, &mut pool, form)?;
    let top = pass2::pass2(&mut pool, vm, top)?;
    pass3::pass3(
        &mut pool,
        top,
        0,
        false,
        Value::Sym(StaticSym::Toplevel.sym()),
        Vec::new(),
        None,
        None,
    )
}

/// Compiles a named toplevel procedure directly to its code object,
/// skipping the closure-allocation instruction a `(define (name ...))`
/// form would emit around it.
pub fn compile_toplevel_lambda(
    vm: &mut Vm,
    src: &Value,
    name: Symbol,
    formals: &Value,
    body: &Value,
    module: ModuleId,
) -> CompileResult<Rc<CompiledCode>> {
    let saved = vm.current_module();
    vm.set_current_module(module);
    let result = compile_toplevel_lambda_in(vm, src, name, formals, body);
    vm.set_current_module(saved);
    result.map_err(|e| e.with_form(src))
}

fn compile_toplevel_lambda_in(
    vm: &mut Vm,
    src: &Value,
    name: Symbol,
    formals: &Value,
    body: &Value,
) -> CompileResult<Rc<CompiledCode>> {
    let lambda_form = Value::cons(Value::Sym(StaticSym::Lambda.sym()), Value::cons(formals.clone(), body.clone()));
    let mut pool = IrPool::new();
    let cenv = Cenv::toplevel(vm.current_module()).add_name(Value::Sym(name));
    let top = Pass1 {
        pool: &mut pool,
        vm: &mut *vm,
    }
    .pass1(&lambda_form, &cenv)?;
    let top = pass2::pass2(&mut pool, vm, top)?;
    let IForm::Lambda {
        reqargs,
        optarg,
        lvars,
        body,
        ..
    } = pool.get(top)
    else {
        return Err(CompileError::compile("toplevel lambda did not compile to a procedure", Some(src)));
    };
    let (reqargs, optarg, lvars, body) = (*reqargs, *optarg, lvars.clone(), *body);
    pass3::pass3(&mut pool, body, reqargs, optarg, Value::Sym(name), lvars, None, None).map(Rc::new)
}

/// Diagnostic entry: parse and resolve only, rendering the raw IR.
pub fn compile_p1(vm: &mut Vm, form: &Value) -> CompileResult<String> {
    let mut pool = IrPool::new();
    let top = run_pass1(vm, &mut pool, form)?;
    Ok(pool.dump(top))
}

/// Diagnostic entry: stop after optimization, rendering the rewritten IR.
pub fn compile_p2(vm: &mut Vm, form: &Value) -> CompileResult<String> {
    let mut pool = IrPool::new();
    let top = run_pass1(vm, &mut pool, form)?;
    let top = pass2::pass2(&mut pool, vm, top)?;
    Ok(pool.dump(top))
}

/// Diagnostic entry: full pipeline, rendering the disassembly.
pub fn compile_p3(vm: &mut Vm, form: &Value) -> CompileResult<String> {
    compile(vm, form, None).map(|code| code.disassemble())
}

fn run_pass1(vm: &mut Vm, pool: &mut IrPool, form: &Value) -> CompileResult<IFormId> {
    let cenv = Cenv::toplevel(vm.current_module());
    Pass1 { pool, vm }.pass1(form, &cenv)
}
