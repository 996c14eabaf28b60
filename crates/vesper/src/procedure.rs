//! Procedure descriptors.
//!
//! The compiler never sees procedure bodies at call sites; what it can see
//! is a binding whose value is a `Procedure` carrying arity information and,
//! for inlinable procedures, an [`Inliner`] describing how call sites may be
//! expanded.

use std::rc::Rc;

use crate::compiler::cenv::Cenv;
use crate::compiler::iform::PackedIr;
use crate::compiler::op::Opcode;
use crate::intern::Symbol;
use crate::value::Value;

/// A procedure as known to the compiler.
#[derive(Debug)]
pub struct Procedure {
    pub name: Symbol,
    /// Number of required arguments.
    pub reqargs: u32,
    /// Whether surplus arguments are collected into a rest list.
    pub optarg: bool,
    pub inliner: Option<Inliner>,
}

impl Procedure {
    #[must_use]
    pub fn new(name: Symbol, reqargs: u32, optarg: bool, inliner: Option<Inliner>) -> Rc<Self> {
        Rc::new(Self {
            name,
            reqargs,
            optarg,
            inliner,
        })
    }

    /// Checks a call-site argument count against this procedure's arity.
    #[must_use]
    pub fn accepts(&self, nargs: usize) -> bool {
        let req = self.reqargs as usize;
        if self.optarg { nargs >= req } else { nargs == req }
    }

    /// Human-readable arity for error messages, e.g. `"2"` or `"at least 1"`.
    #[must_use]
    pub fn arity_description(&self) -> String {
        if self.optarg {
            format!("at least {}", self.reqargs)
        } else {
            self.reqargs.to_string()
        }
    }
}

/// Native inliner signature: receives the whole call form and the use-site
/// environment. Returning `None` declines, and pass 1 falls back to a
/// generic call.
pub type NativeInliner = fn(&Value, &Cenv) -> Option<Value>;

/// Describes how call sites of an inlinable procedure are expanded.
#[derive(Debug)]
pub enum Inliner {
    /// Emit a single VM instruction with the call arguments as operands.
    /// Arity is validated against the procedure before expansion; variadic
    /// instructions receive the argument count as an immediate.
    Insn { op: Opcode, variadic: bool },
    /// Left-associating arithmetic fold with compile-time constant folding.
    NumCalc(NumOp),
    /// Binary numeric comparison; more than two arguments fall back to a
    /// generic call.
    NumCmp(NumCmpOp),
    /// A packed IR body stored by `define-inline`; call sites substitute the
    /// unpacked body with their arguments.
    Packed(Rc<PackedIr>),
    /// A native rewriter invoked like a macro.
    Native(NativeInliner),
}

/// Arithmetic operators with dedicated two-operand instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl NumOp {
    /// The two-operand instruction implementing this operator.
    #[must_use]
    pub fn insn(self) -> Opcode {
        match self {
            NumOp::Add => Opcode::NumAdd2,
            NumOp::Sub => Opcode::NumSub2,
            NumOp::Mul => Opcode::NumMul2,
            NumOp::Div => Opcode::NumDiv2,
        }
    }

    /// The immediate-operand instruction, when one exists (`+` and `-`).
    #[must_use]
    pub fn immediate_insn(self) -> Option<Opcode> {
        match self {
            NumOp::Add => Some(Opcode::NumAddI),
            NumOp::Sub => Some(Opcode::NumSubI),
            NumOp::Mul | NumOp::Div => None,
        }
    }
}

/// Numeric comparison operators with dedicated two-operand instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumCmpOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl NumCmpOp {
    #[must_use]
    pub fn insn(self) -> Opcode {
        match self {
            NumCmpOp::Eq => Opcode::NumEq2,
            NumCmpOp::Lt => Opcode::NumLt2,
            NumCmpOp::Le => Opcode::NumLe2,
            NumCmpOp::Gt => Opcode::NumGt2,
            NumCmpOp::Ge => Opcode::NumGe2,
        }
    }
}
