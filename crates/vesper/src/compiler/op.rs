//! VM opcode definitions.
//!
//! The compiler treats opcodes as opaque tags except for the peephole
//! fusion rules and the operand-fitting predicates. Instruction semantics
//! live with the VM; the notes here describe only what the emitter relies
//! on:
//!
//! * value-producing instructions leave their result in the value register
//! * `PUSH` pushes the value register onto the operand stack
//! * conditional branches (`BF`, `BNEQ`, ...) jump when the tested
//!   condition fails and leave `#f` in the value register on the jumping
//!   path

use strum::{FromRepr, IntoStaticStr};

/// Inclusive range of signed immediates that fit an instruction operand
/// slot.
pub const IMM_MIN: i64 = -524_288;
pub const IMM_MAX: i64 = 524_287;
/// Maximum unsigned immediate (frame sizes, argument counts).
pub const IMM_UMAX: i64 = 524_287;

/// Returns true if `n` fits the signed immediate operand slot.
#[inline]
#[must_use]
pub fn fits_signed_imm(n: i64) -> bool {
    (IMM_MIN..=IMM_MAX).contains(&n)
}

/// What an instruction's out-of-line operand slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// A literal value.
    Obj,
    /// A jump target (label while building, code offset once finished).
    Addr,
    /// A compiled-code object (closure body).
    Code,
    /// A vector of closure-or-constant slots for `LOCAL-ENV-CLOSURES`.
    Codes,
}

/// The instruction set referenced by the code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, FromRepr)]
#[repr(u8)]
pub enum Opcode {
    // --- constants ---
    #[strum(serialize = "CONST")]
    Const,
    /// Small exact integer immediate.
    #[strum(serialize = "CONSTI")]
    ConstI,
    #[strum(serialize = "CONSTN")]
    ConstN,
    #[strum(serialize = "CONSTF")]
    ConstF,
    #[strum(serialize = "CONSTU")]
    ConstU,
    #[strum(serialize = "CONST-PUSH")]
    ConstPush,
    #[strum(serialize = "CONSTI-PUSH")]
    ConstIPush,
    #[strum(serialize = "CONSTN-PUSH")]
    ConstNPush,
    #[strum(serialize = "CONSTF-PUSH")]
    ConstFPush,
    #[strum(serialize = "CONSTU-PUSH")]
    ConstUPush,
    #[strum(serialize = "CONST-RET")]
    ConstRet,

    // --- stack ---
    #[strum(serialize = "PUSH")]
    Push,
    #[strum(serialize = "PRE-CALL")]
    PreCall,
    #[strum(serialize = "PUSH-PRE-CALL")]
    PushPreCall,

    // --- local references (depth, offset) ---
    #[strum(serialize = "LREF")]
    Lref,
    #[strum(serialize = "LREF0")]
    Lref0,
    #[strum(serialize = "LREF1")]
    Lref1,
    #[strum(serialize = "LREF2")]
    Lref2,
    #[strum(serialize = "LREF3")]
    Lref3,
    #[strum(serialize = "LREF4")]
    Lref4,
    #[strum(serialize = "LREF10")]
    Lref10,
    #[strum(serialize = "LREF11")]
    Lref11,
    #[strum(serialize = "LREF12")]
    Lref12,
    #[strum(serialize = "LREF13")]
    Lref13,
    #[strum(serialize = "LREF14")]
    Lref14,
    #[strum(serialize = "LREF-PUSH")]
    LrefPush,
    #[strum(serialize = "LREF0-PUSH")]
    Lref0Push,
    #[strum(serialize = "LREF1-PUSH")]
    Lref1Push,
    #[strum(serialize = "LREF2-PUSH")]
    Lref2Push,
    #[strum(serialize = "LREF3-PUSH")]
    Lref3Push,
    #[strum(serialize = "LREF4-PUSH")]
    Lref4Push,
    #[strum(serialize = "LREF10-PUSH")]
    Lref10Push,
    #[strum(serialize = "LREF11-PUSH")]
    Lref11Push,
    #[strum(serialize = "LREF12-PUSH")]
    Lref12Push,
    #[strum(serialize = "LREF13-PUSH")]
    Lref13Push,
    #[strum(serialize = "LREF14-PUSH")]
    Lref14Push,
    #[strum(serialize = "LSET")]
    Lset,

    // --- global references ---
    #[strum(serialize = "GREF")]
    Gref,
    #[strum(serialize = "PUSH-GREF")]
    PushGref,
    #[strum(serialize = "GREF-CALL")]
    GrefCall,
    #[strum(serialize = "GREF-TAIL-CALL")]
    GrefTailCall,
    #[strum(serialize = "GSET")]
    Gset,
    #[strum(serialize = "DEFINE")]
    Define,

    // --- control ---
    #[strum(serialize = "JUMP")]
    Jump,
    #[strum(serialize = "BF")]
    BF,
    #[strum(serialize = "BNEQ")]
    BNEq,
    #[strum(serialize = "BNEQC")]
    BNEqC,
    #[strum(serialize = "BNEQV")]
    BNEqv,
    #[strum(serialize = "BNEQVC")]
    BNEqvC,
    #[strum(serialize = "BNNULL")]
    BNNull,
    #[strum(serialize = "BNUMNE")]
    BNumNe,
    #[strum(serialize = "BNUMNEI")]
    BNumNeI,
    #[strum(serialize = "BNLT")]
    BNLt,
    #[strum(serialize = "BNLE")]
    BNLe,
    #[strum(serialize = "BNGT")]
    BNGt,
    #[strum(serialize = "BNGE")]
    BNGe,
    /// Return the value register if it is truthy, else fall through.
    #[strum(serialize = "RT")]
    RT,
    /// Return the value register if it is `#f`, else fall through.
    #[strum(serialize = "RF")]
    RF,
    #[strum(serialize = "RET")]
    Ret,

    // --- calls and environments ---
    #[strum(serialize = "CALL")]
    Call,
    #[strum(serialize = "TAIL-CALL")]
    TailCall,
    #[strum(serialize = "LOCAL-ENV")]
    LocalEnv,
    #[strum(serialize = "POP-LOCAL-ENV")]
    PopLocalEnv,
    #[strum(serialize = "LOCAL-ENV-CALL")]
    LocalEnvCall,
    #[strum(serialize = "LOCAL-ENV-TAIL-CALL")]
    LocalEnvTailCall,
    #[strum(serialize = "LOCAL-ENV-JUMP")]
    LocalEnvJump,
    #[strum(serialize = "LOCAL-ENV-CLOSURES")]
    LocalEnvClosures,
    #[strum(serialize = "CLOSURE")]
    Closure,
    #[strum(serialize = "RECEIVE")]
    Receive,
    #[strum(serialize = "TAIL-RECEIVE")]
    TailReceive,

    // --- pairs, lists, vectors ---
    #[strum(serialize = "CONS")]
    Cons,
    #[strum(serialize = "CAR")]
    Car,
    #[strum(serialize = "CDR")]
    Cdr,
    #[strum(serialize = "CAAR")]
    Caar,
    #[strum(serialize = "CADR")]
    Cadr,
    #[strum(serialize = "CDAR")]
    Cdar,
    #[strum(serialize = "CDDR")]
    Cddr,
    #[strum(serialize = "LIST")]
    List,
    #[strum(serialize = "LIST-STAR")]
    ListStar,
    #[strum(serialize = "APPEND")]
    Append,
    #[strum(serialize = "MEMV")]
    Memv,
    #[strum(serialize = "EQ")]
    Eq,
    #[strum(serialize = "EQV")]
    Eqv,
    #[strum(serialize = "NULLP")]
    NullP,
    #[strum(serialize = "NOT")]
    Not,
    #[strum(serialize = "VEC")]
    VecBuild,
    #[strum(serialize = "LIST2VEC")]
    ListToVec,

    // --- numeric ---
    #[strum(serialize = "NUMADD2")]
    NumAdd2,
    #[strum(serialize = "NUMSUB2")]
    NumSub2,
    #[strum(serialize = "NUMMUL2")]
    NumMul2,
    #[strum(serialize = "NUMDIV2")]
    NumDiv2,
    #[strum(serialize = "NUMADDI")]
    NumAddI,
    #[strum(serialize = "NUMSUBI")]
    NumSubI,
    #[strum(serialize = "NEGATE")]
    Negate,
    #[strum(serialize = "NUMEQ2")]
    NumEq2,
    #[strum(serialize = "NUMLT2")]
    NumLt2,
    #[strum(serialize = "NUMLE2")]
    NumLe2,
    #[strum(serialize = "NUMGT2")]
    NumGt2,
    #[strum(serialize = "NUMGE2")]
    NumGe2,

    // --- promises ---
    #[strum(serialize = "PROMISE")]
    Promise,
}

impl Opcode {
    /// How many inline integer arguments the instruction carries.
    #[must_use]
    pub fn num_args(self) -> u8 {
        use Opcode as Op;
        match self {
            Op::ConstI | Op::ConstIPush | Op::NumAddI | Op::NumSubI => 1,
            Op::Lref | Op::LrefPush | Op::Lset => 2,
            Op::Call
            | Op::TailCall
            | Op::GrefCall
            | Op::GrefTailCall
            | Op::LocalEnv
            | Op::LocalEnvCall
            | Op::LocalEnvTailCall
            | Op::LocalEnvJump
            | Op::LocalEnvClosures
            | Op::PreCall
            | Op::PushPreCall
            | Op::List
            | Op::ListStar
            | Op::Append
            | Op::VecBuild => 1,
            Op::Receive | Op::TailReceive => 2,
            Op::BNumNeI => 1,
            Op::Define => 1,
            _ => 0,
        }
    }

    /// What the instruction's out-of-line operand slot holds.
    #[must_use]
    pub fn operand_kind(self) -> OperandKind {
        use Opcode as Op;
        match self {
            Op::Const | Op::ConstPush | Op::ConstRet => OperandKind::Obj,
            Op::Gref | Op::PushGref | Op::GrefCall | Op::GrefTailCall | Op::Gset | Op::Define => OperandKind::Obj,
            Op::BNEqC | Op::BNEqvC => OperandKind::Obj,
            Op::Jump
            | Op::BF
            | Op::BNEq
            | Op::BNEqv
            | Op::BNNull
            | Op::BNumNe
            | Op::BNumNeI
            | Op::BNLt
            | Op::BNLe
            | Op::BNGt
            | Op::BNGe
            | Op::PreCall
            | Op::PushPreCall
            | Op::LocalEnvJump => OperandKind::Addr,
            Op::Closure => OperandKind::Code,
            Op::LocalEnvClosures => OperandKind::Codes,
            _ => OperandKind::None,
        }
    }

    /// The short form of `LREF depth offset`, when one exists.
    #[must_use]
    pub fn lref_short(depth: i32, offset: i32) -> Option<Opcode> {
        use Opcode as Op;
        match (depth, offset) {
            (0, 0) => Some(Op::Lref0),
            (0, 1) => Some(Op::Lref1),
            (0, 2) => Some(Op::Lref2),
            (0, 3) => Some(Op::Lref3),
            (0, 4) => Some(Op::Lref4),
            (1, 0) => Some(Op::Lref10),
            (1, 1) => Some(Op::Lref11),
            (1, 2) => Some(Op::Lref12),
            (1, 3) => Some(Op::Lref13),
            (1, 4) => Some(Op::Lref14),
            _ => None,
        }
    }

    /// The `-PUSH` fusion of an `LREF`-family instruction.
    #[must_use]
    pub fn lref_push_fusion(self) -> Option<Opcode> {
        use Opcode as Op;
        match self {
            Op::Lref => Some(Op::LrefPush),
            Op::Lref0 => Some(Op::Lref0Push),
            Op::Lref1 => Some(Op::Lref1Push),
            Op::Lref2 => Some(Op::Lref2Push),
            Op::Lref3 => Some(Op::Lref3Push),
            Op::Lref4 => Some(Op::Lref4Push),
            Op::Lref10 => Some(Op::Lref10Push),
            Op::Lref11 => Some(Op::Lref11Push),
            Op::Lref12 => Some(Op::Lref12Push),
            Op::Lref13 => Some(Op::Lref13Push),
            Op::Lref14 => Some(Op::Lref14Push),
            _ => None,
        }
    }

    /// `CAR`/`CDR` access-chain fusion: `self` was emitted first, `next`
    /// applies to its result.
    #[must_use]
    pub fn car_cdr_fusion(self, next: Opcode) -> Option<Opcode> {
        use Opcode as Op;
        match (self, next) {
            (Op::Car, Op::Car) => Some(Op::Caar),
            (Op::Car, Op::Cdr) => Some(Op::Cdar),
            (Op::Cdr, Op::Car) => Some(Op::Cadr),
            (Op::Cdr, Op::Cdr) => Some(Op::Cddr),
            _ => None,
        }
    }

    /// The instruction's mnemonic.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(Opcode::LocalEnvJump.name(), "LOCAL-ENV-JUMP");
        assert_eq!(Opcode::ConstIPush.name(), "CONSTI-PUSH");
    }

    #[test]
    fn test_lref_shorts() {
        assert_eq!(Opcode::lref_short(0, 0), Some(Opcode::Lref0));
        assert_eq!(Opcode::lref_short(1, 4), Some(Opcode::Lref14));
        assert_eq!(Opcode::lref_short(2, 0), None);
        assert_eq!(Opcode::lref_short(0, 5), None);
    }

    #[test]
    fn test_fusions() {
        assert_eq!(Opcode::Lref3.lref_push_fusion(), Some(Opcode::Lref3Push));
        assert_eq!(Opcode::Car.car_cdr_fusion(Opcode::Cdr), Some(Opcode::Cdar));
        assert_eq!(Opcode::Caar.car_cdr_fusion(Opcode::Car), None);
    }

    #[test]
    fn test_imm_fit() {
        assert!(fits_signed_imm(0));
        assert!(fits_signed_imm(-524_288));
        assert!(fits_signed_imm(524_287));
        assert!(!fits_signed_imm(524_288));
    }
}
