#![doc = include_str!("../../../README.md")]

mod error;
mod identifier;
mod intern;
mod macros;
mod module;
mod procedure;
mod reader;
mod value;
mod vmstate;

pub mod compiler;

pub use crate::{
    compiler::{
        cenv::{Binding, Cenv, Frame, FrameKind, Lookup},
        code::{ClosureSlot, CompiledCode, Insn, Operand},
        compile, compile_p1, compile_p2, compile_p3, compile_toplevel_lambda,
        op::Opcode,
    },
    error::{CompileError, CompileResult, ErrorKind},
    identifier::{Identifier, identifier_p, make_identifier},
    intern::{StaticSym, Symbol, gensym, intern},
    macros::{Macro, MacroTransformer, call_macro_expander},
    module::{Gloc, ModuleId, ModuleRegistry, define_builtin},
    procedure::{Inliner, NativeInliner, NumCmpOp, NumOp, Procedure},
    reader::{ReadError, read_all, read_one},
    value::{Pair, Value},
    vmstate::{EvalSituation, SyntaxRulesHook, Vm, flags},
};
