//! End-to-end pipeline tests: source text through all three passes to
//! instruction vectors.

use pretty_assertions::assert_eq;
use vesper::{CompileError, ErrorKind, Insn, Opcode, Operand, Vm, compile, flags, read_one};

fn compile_src(src: &str) -> Result<vesper::CompiledCode, CompileError> {
    let mut vm = Vm::new();
    let form = read_one(src).unwrap();
    compile(&mut vm, &form, None)
}

fn code_of(src: &str) -> vesper::CompiledCode {
    compile_src(src).unwrap_or_else(|err| panic!("compiling {src}: {err}"))
}

fn disassembly_of(src: &str) -> String {
    code_of(src).disassemble()
}

#[test]
fn test_beta_reduced_call_compiles_to_constant_return() {
    // ((lambda (x) (+ x 1)) 3) folds completely in pass 2.
    let code = code_of("((lambda (x) (+ x 1)) 3)");
    assert_eq!(
        code.code(),
        &[Insn::arg(Opcode::ConstI, 4), Insn::new(Opcode::Ret)]
    );
    assert_eq!(code.max_stack(), 0);
}

#[test]
fn test_named_let_loop_embeds_with_jump() {
    let code = code_of("(let loop ((i 0)) (if (= i 10) i (loop (+ i 1))))");
    assert_eq!(
        code.code(),
        &[
            Insn::arg(Opcode::ConstIPush, 0),
            Insn::arg(Opcode::LocalEnv, 1),
            // label L
            Insn::new(Opcode::Lref0),
            Insn::arg(Opcode::BNumNeI, 10).with_operand(Operand::Addr(6)),
            Insn::new(Opcode::Lref0),
            Insn::new(Opcode::Ret),
            // else: step and jump back to L
            Insn::new(Opcode::Lref0),
            Insn::arg(Opcode::NumAddI, 1),
            Insn::new(Opcode::Push),
            Insn::arg(Opcode::LocalEnvJump, 1).with_operand(Operand::Addr(2)),
        ]
    );
    assert_eq!(code.max_stack(), 4);
}

#[test]
fn test_define_constant_reference_compiles_to_constant() {
    let mut vm = Vm::new();
    let def = read_one("(define-constant K 42)").unwrap();
    compile(&mut vm, &def, None).unwrap();
    let use_k = read_one("K").unwrap();
    let code = compile(&mut vm, &use_k, None).unwrap();
    assert_eq!(
        code.code(),
        &[Insn::arg(Opcode::ConstI, 42), Insn::new(Opcode::Ret)]
    );
}

#[test]
fn test_case_dispatch_uses_eq_eqv_memv_branches() {
    let text = disassembly_of("(case x ((a) 1) ((b c) 2) (else 3))");
    // Single-symbol keys use the immediate eq-compare branch; multi-key
    // clauses search with MEMV.
    assert!(text.contains("BNEQC"), "disassembly:\n{text}");
    assert!(text.contains("MEMV"), "disassembly:\n{text}");
}

#[test]
fn test_generalized_set_calls_setter() {
    let text = disassembly_of("(set! (car p) v)");
    assert!(text.contains("setter"), "disassembly:\n{text}");
    assert!(text.contains("TAIL-CALL"), "disassembly:\n{text}");
}

#[test]
fn test_quasiquote_with_splicing_appends() {
    let text = disassembly_of("`(1 ,(+ 2 3) ,@xs 6)");
    assert!(text.contains("APPEND"), "disassembly:\n{text}");
    assert!(text.contains("CONS"), "disassembly:\n{text}");
}

// --- boundary behaviors ---

#[test]
fn test_empty_let_compiles_like_its_body() {
    assert_eq!(disassembly_of("(let () (f))"), disassembly_of("(f)"));
}

#[test]
fn test_single_form_begin_is_transparent() {
    assert_eq!(disassembly_of("(begin (f))"), disassembly_of("(f)"));
}

#[test]
fn test_empty_begin_yields_undefined() {
    let code = code_of("(begin)");
    assert_eq!(code.code(), &[Insn::new(Opcode::ConstU), Insn::new(Opcode::Ret)]);
}

#[test]
fn test_constant_if_selects_branch() {
    assert_eq!(disassembly_of("(if #t (f) (g))"), disassembly_of("(f)"));
    assert_eq!(disassembly_of("(if #f (f) (g))"), disassembly_of("(g)"));
}

#[test]
fn test_unquote_free_quasiquote_is_one_constant() {
    let code = code_of("`(1 2 3)");
    assert_eq!(code.code().len(), 1);
    assert_eq!(code.code()[0].op, Opcode::ConstRet);
}

#[test]
fn test_inlined_arity_failure_is_compile_time() {
    let err = compile_src("(cons 1)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Arity);
    let err = compile_src("((lambda (x) x) 1 2)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Arity);
}

#[test]
fn test_compilation_is_deterministic() {
    let src = "(define (fact n) (if (< n 2) 1 (* n (fact (- n 1)))))";
    assert_eq!(disassembly_of(src), disassembly_of(src));
}

// --- instruction selection details ---

#[test]
fn test_branch_on_null_test() {
    let text = disassembly_of("(if (null? xs) 'empty (car xs))");
    assert!(text.contains("BNNULL"), "disassembly:\n{text}");
}

#[test]
fn test_not_test_swaps_branches() {
    // (if (not x) a b) and (if x b a) produce identical code.
    assert_eq!(disassembly_of("(if (not x) (f) (g))"), disassembly_of("(if x (g) (f))"));
}

#[test]
fn test_tail_or_returns_with_rt() {
    let text = disassembly_of("(or (f) (g))");
    assert!(text.contains("RT"), "disassembly:\n{text}");
}

#[test]
fn test_car_of_cdr_fuses() {
    let text = disassembly_of("(car (cdr x))");
    assert!(text.contains("CADR"), "disassembly:\n{text}");
    assert!(!text.contains("CAR "), "disassembly:\n{text}");
}

#[test]
fn test_global_call_fuses_gref() {
    let code = code_of("(f x)");
    let ops: Vec<Opcode> = code.code().iter().map(|i| i.op).collect();
    assert_eq!(ops, vec![Opcode::PushGref, Opcode::GrefTailCall]);
}

#[test]
fn test_nested_call_protects_with_pre_call() {
    let text = disassembly_of("(f (g 1) 2)");
    assert!(text.contains("PRE-CALL"), "disassembly:\n{text}");
}

#[test]
fn test_noinline_globals_disables_asm_expansion() {
    let mut vm = Vm::new();
    vm.set_flag(flags::NOINLINE_GLOBALS);
    let form = read_one("(car p)").unwrap();
    let code = compile(&mut vm, &form, None).unwrap();
    let text = code.disassemble();
    assert!(!text.contains(" CAR"), "disassembly:\n{text}");
    assert!(text.contains("GREF-TAIL-CALL"), "disassembly:\n{text}");
}

#[test]
fn test_closure_emission_when_lambda_escapes() {
    let code = code_of("(lambda (x) (cons x x))");
    let text = code.disassemble();
    assert!(text.contains("CLOSURE"), "disassembly:\n{text}");
    // The nested body is disassembled too.
    assert!(text.contains("CONS"), "disassembly:\n{text}");
}

#[test]
fn test_letrec_materializes_escaping_closure_in_frame() {
    // `f` escapes as an argument, so it stays a real closure in the
    // recursive frame and the body call goes through the local-call path.
    let text = disassembly_of("(letrec ((f (lambda (n) (g f n)))) (f 1))");
    assert!(text.contains("LOCAL-ENV-CLOSURES"), "disassembly:\n{text}");
    assert!(text.contains("LOCAL-ENV-TAIL-CALL"), "disassembly:\n{text}");
}

#[test]
fn test_mutual_recursion_collapses_to_loop() {
    // Single-use odd? inlines into even?, whose calls then all classify
    // as one entry plus a direct tail self-call: embed with a jump.
    let text = disassembly_of(
        "(letrec ((even? (lambda (n) (if (= n 0) #t (odd? (- n 1)))))
                  (odd? (lambda (n) (if (= n 0) #f (even? (- n 1))))))
           (even? 10))",
    );
    assert!(text.contains("LOCAL-ENV-JUMP"), "disassembly:\n{text}");
    assert!(!text.contains("CLOSURE"), "disassembly:\n{text}");
}

#[test]
fn test_do_loop_compiles_to_jump() {
    let text = disassembly_of("(do ((i 0 (+ i 1)) (acc 0 (+ acc i))) ((= i 5) acc))");
    assert!(text.contains("LOCAL-ENV-JUMP"), "disassembly:\n{text}");
}

#[test]
fn test_receive_emits_receive_instruction() {
    let text = disassembly_of("(receive (a b . rest) (three-values) b)");
    assert!(text.contains("TAIL-RECEIVE(2,1)"), "disassembly:\n{text}");
}

#[test]
fn test_delay_emits_promise() {
    let text = disassembly_of("(delay (+ x 1))");
    assert!(text.contains("PROMISE"), "disassembly:\n{text}");
    assert!(text.contains("CLOSURE"), "disassembly:\n{text}");
}

#[test]
fn test_max_stack_grows_with_argument_count() {
    let narrow = code_of("(f 1)");
    let wide = code_of("(f 1 2 3 4 5 6)");
    assert!(wide.max_stack() > narrow.max_stack());
}

#[test]
fn test_toplevel_only_form_rejected_in_expression() {
    let err = compile_src("(lambda () (select-module user))").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
}

#[test]
fn test_error_carries_offending_form() {
    let err = compile_src("(if)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert!(err.form().is_some());
    assert!(err.to_string().contains("(if)"));
}
