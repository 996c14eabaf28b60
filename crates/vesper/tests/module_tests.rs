//! Module system, compile-time bindings, and eval-when behavior through
//! the public entry points.

use pretty_assertions::assert_eq;
use vesper::{
    Cenv, CompileResult, EvalSituation, Inliner, Insn, Opcode, Value, Vm, compile, compile_p1, compile_p2, compile_p3,
    compile_toplevel_lambda, define_builtin, intern, read_all, read_one,
};

fn compile_program(vm: &mut Vm, src: &str) -> CompileResult<Vec<vesper::CompiledCode>> {
    let mut out = Vec::new();
    for form in read_all(src).unwrap() {
        out.push(compile(vm, &form, None)?);
    }
    Ok(out)
}

#[test]
fn test_define_module_export_import() {
    let mut vm = Vm::new();
    let codes = compile_program(
        &mut vm,
        "(define-module mylib
           (define-constant shift 3)
           (export shift))
         (import mylib)
         shift",
    )
    .unwrap();
    // The constant travels through export/import and inlines at the use
    // site.
    let last = codes.last().unwrap();
    assert_eq!(last.code(), &[Insn::arg(Opcode::ConstI, 3), Insn::new(Opcode::Ret)]);
}

#[test]
fn test_unexported_binding_stays_global_reference() {
    let mut vm = Vm::new();
    let codes = compile_program(
        &mut vm,
        "(define-module hidden (define-constant secret 1))
         (import hidden)
         secret",
    )
    .unwrap();
    let text = codes.last().unwrap().disassemble();
    assert!(text.contains("GREF"), "disassembly:\n{text}");
}

#[test]
fn test_with_module_compiles_in_target_module() {
    let mut vm = Vm::new();
    let codes = compile_program(
        &mut vm,
        "(define-module other)
         (with-module other (define-constant k 7))
         (with-module other k)",
    )
    .unwrap();
    let last = codes.last().unwrap();
    assert_eq!(last.code(), &[Insn::arg(Opcode::ConstI, 7), Insn::new(Opcode::Ret)]);
}

#[test]
fn test_select_module_switches_current() {
    let mut vm = Vm::new();
    compile_program(
        &mut vm,
        "(define-module scratch)
         (select-module scratch)
         (define-constant local-k 9)
         (select-module user)",
    )
    .unwrap();
    let scratch = vm.modules().find_module(intern("scratch")).unwrap();
    let gloc = vm.modules().find_binding(scratch, intern("local-k")).unwrap();
    assert_eq!(gloc.value(), &Value::Int(9));
    assert!(gloc.is_constant());
}

#[test]
fn test_define_in_module() {
    let mut vm = Vm::new();
    compile_program(
        &mut vm,
        "(define-module target)
         (define-in-module target x 1)",
    )
    .unwrap();
    // The define emits into the target module's identifier; the binding
    // itself is created at run time, so only the instruction operand can
    // be checked here.
    let code = compile(&mut vm, &read_one("(define-in-module target x 1)").unwrap(), None).unwrap();
    let text = code.disassemble();
    assert!(text.contains("DEFINE"), "disassembly:\n{text}");
}

#[test]
fn test_module_override_is_scoped_to_one_compile() {
    let mut vm = Vm::new();
    let other = vm.modules_mut().make_module(intern("override-test"));
    let form = read_one("(define-constant k 5)").unwrap();
    compile(&mut vm, &form, Some(other)).unwrap();
    assert_eq!(vm.current_module(), vm.modules().user());
    assert!(vm.modules().find_binding(other, intern("k")).is_some());
}

// --- define-inline ---

#[test]
fn test_define_inline_expands_at_call_site() {
    let mut vm = Vm::new();
    let codes = compile_program(
        &mut vm,
        "(define-inline (add1 x) (+ x 1))
         (add1 5)",
    )
    .unwrap();
    let last = codes.last().unwrap();
    assert_eq!(last.code(), &[Insn::arg(Opcode::ConstI, 6), Insn::new(Opcode::Ret)]);
}

#[test]
fn test_define_inline_attaches_packed_body() {
    let mut vm = Vm::new();
    let codes = compile_program(&mut vm, "(define-inline (twice x) (* x 2))").unwrap();
    // The defined closure carries its packed IR for cross-compilation.
    let text = codes[0].disassemble();
    assert!(text.contains("CLOSURE"), "disassembly:\n{text}");
    let mut found = false;
    for insn in codes[0].code() {
        if let vesper::Operand::Code(code) = &insn.operand {
            assert!(code.intform().is_some());
            found = true;
        }
    }
    assert!(found, "no nested code object");
}

#[test]
fn test_define_inline_each_expansion_is_independent() {
    let mut vm = Vm::new();
    let codes = compile_program(
        &mut vm,
        "(define-inline (square x) (* x x))
         (+ (square 3) (square 4))",
    )
    .unwrap();
    let last = codes.last().unwrap();
    assert_eq!(last.code(), &[Insn::arg(Opcode::ConstI, 25), Insn::new(Opcode::Ret)]);
}

// --- eval-when ---

#[test]
fn test_eval_when_emits_matching_situation() {
    let mut vm = Vm::new();
    let form = read_one("(eval-when (:execute) 42)").unwrap();
    let code = compile(&mut vm, &form, None).unwrap();
    assert_eq!(code.code()[0], Insn::arg(Opcode::ConstI, 42));

    let form = read_one("(eval-when (:load-toplevel) 42)").unwrap();
    let code = compile(&mut vm, &form, None).unwrap();
    assert_eq!(code.code()[0], Insn::new(Opcode::ConstU));
}

#[test]
fn test_eval_when_records_compile_time_forms() {
    let mut vm = Vm::new();
    vm.set_eval_situation(EvalSituation::CompileToplevel);
    let form = read_one("(eval-when (:compile-toplevel) (setup!))").unwrap();
    compile(&mut vm, &form, None).unwrap();
    assert_eq!(vm.compile_time_evals.len(), 1);
    assert_eq!(vm.compile_time_evals[0].to_string(), "(setup!)");
}

// --- toplevel lambda shortcut ---

#[test]
fn test_compile_toplevel_lambda_skips_closure_allocation() {
    let mut vm = Vm::new();
    let formals = read_one("(a b)").unwrap();
    let body = read_all("(+ a b)").map(|forms| Value::list(&forms)).unwrap();
    let src = read_one("(define (add a b) (+ a b))").unwrap();
    let user = vm.modules().user();
    let code = compile_toplevel_lambda(&mut vm, &src, intern("add"), &formals, &body, user).unwrap();
    assert_eq!(code.reqargs(), 2);
    assert!(!code.optarg());
    let text = code.disassemble();
    assert!(!text.contains("CLOSURE"), "disassembly:\n{text}");
    assert!(text.contains("NUMADD2"), "disassembly:\n{text}");
}

// --- macros ---

#[test]
fn test_native_macro_expansion() {
    // Rewrites (as-minus a b ...) into (- a b ...); the expansion is
    // recursively compiled, so the arithmetic folds.
    fn to_minus(form: &Value, _cenv: &Cenv) -> CompileResult<Value> {
        let parts = form.list_to_vec().expect("macro use is a list");
        let mut rewritten = vec![Value::Sym(intern("-"))];
        rewritten.extend(parts[1..].iter().cloned());
        Ok(Value::list(&rewritten))
    }
    let mut vm = Vm::new();
    let user = vm.modules().user();
    vm.define_macro(user, intern("as-minus"), to_minus);
    let form = read_one("(as-minus 10 4)").unwrap();
    let code = compile(&mut vm, &form, None).unwrap();
    assert_eq!(code.code()[0], Insn::arg(Opcode::ConstI, 6));
}

#[test]
fn test_native_inliner_declines_to_generic_call() {
    // Folds (halve n) for even literals, declines otherwise.
    fn halve(form: &Value, _cenv: &Cenv) -> Option<Value> {
        let parts = form.list_to_vec()?;
        match parts.get(1) {
            Some(Value::Int(n)) if n % 2 == 0 => Some(Value::Int(n / 2)),
            _ => None,
        }
    }
    let mut vm = Vm::new();
    let user = vm.modules().user();
    define_builtin(vm.modules_mut(), user, "halve", 1, false, Some(Inliner::Native(halve)));

    let code = compile(&mut vm, &read_one("(halve 10)").unwrap(), None).unwrap();
    assert_eq!(code.code()[0], Insn::arg(Opcode::ConstI, 5));

    let code = compile(&mut vm, &read_one("(halve x)").unwrap(), None).unwrap();
    let text = code.disassemble();
    assert!(text.contains("GREF-TAIL-CALL"), "disassembly:\n{text}");
}

// --- diagnostic entry points ---

#[test]
fn test_compile_p1_dumps_raw_ir() {
    let mut vm = Vm::new();
    let form = read_one("(let ((x 1)) x)").unwrap();
    let text = compile_p1(&mut vm, &form).unwrap();
    assert!(text.contains("($let let"), "dump:\n{text}");
    assert!(text.contains("($lref x."), "dump:\n{text}");
}

#[test]
fn test_compile_p2_shows_optimized_ir() {
    let mut vm = Vm::new();
    let form = read_one("(let ((x 1)) x)").unwrap();
    let text = compile_p2(&mut vm, &form).unwrap();
    assert_eq!(text.trim(), "($const 1)");
}

#[test]
fn test_compile_p3_shows_disassembly() {
    let mut vm = Vm::new();
    let form = read_one("(let ((x 1)) x)").unwrap();
    let text = compile_p3(&mut vm, &form).unwrap();
    assert!(text.contains("CONSTI(1)"), "disassembly:\n{text}");
    assert!(text.contains("maxstack"), "disassembly:\n{text}");
}
