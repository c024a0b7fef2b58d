//! The low-level IR: opcodes, modifiers and jump types.

use crate::condcodes::{CondCode, FloatCond};
use core::fmt;

/// Zero-operand ops.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op0 {
    /// No operation.
    Nop,
    /// Native debugger trap.
    Breakpoint,
    /// Unsigned widening multiply: `r1:r0 = r0 * r1`.
    LMulUw,
    /// Signed widening multiply: `r1:r0 = r0 * r1`.
    LMulSw,
    /// Unsigned divide + remainder: `r0 = r0 / r1`, `r1 = r0 % r1`.
    DivmodUw,
    /// Signed divide + remainder: `r0 = r0 / r1`, `r1 = r0 % r1`.
    DivmodSw,
}

impl Op0 {
    pub fn to_static_str(self) -> &'static str {
        match self {
            Op0::Nop => "nop",
            Op0::Breakpoint => "breakpoint",
            Op0::LMulUw => "lmul_uw",
            Op0::LMulSw => "lmul_sw",
            Op0::DivmodUw => "divmod_uw",
            Op0::DivmodSw => "divmod_sw",
        }
    }
}

impl fmt::Display for Op0 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

/// Single-source ops: moves with optional extension, and unary arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op1 {
    /// Full-width move.
    Mov,
    /// Move with zero-extension from 8 bits.
    MovU8,
    /// Move with sign-extension from 8 bits.
    MovS8,
    /// Move with zero-extension from 16 bits.
    MovU16,
    /// Move with sign-extension from 16 bits.
    MovS16,
    /// Move with zero-extension from 32 bits (64-bit ISAs only).
    MovU32,
    /// Move with sign-extension from 32 bits (64-bit ISAs only).
    MovS32,
    /// Bitwise not.
    Not,
    /// Arithmetic negation.
    Neg,
    /// Count leading zeros.
    Clz,
}

impl Op1 {
    /// The access width in bytes for a narrowing move, if any.
    pub(crate) fn mov_width(self) -> Option<(u8, bool)> {
        match self {
            Op1::MovU8 => Some((1, false)),
            Op1::MovS8 => Some((1, true)),
            Op1::MovU16 => Some((2, false)),
            Op1::MovS16 => Some((2, true)),
            Op1::MovU32 => Some((4, false)),
            Op1::MovS32 => Some((4, true)),
            _ => None,
        }
    }

    pub(crate) fn is_mov(self) -> bool {
        !matches!(self, Op1::Not | Op1::Neg | Op1::Clz)
    }

    pub fn to_static_str(self) -> &'static str {
        match self {
            Op1::Mov => "mov",
            Op1::MovU8 => "mov_u8",
            Op1::MovS8 => "mov_s8",
            Op1::MovU16 => "mov_u16",
            Op1::MovS16 => "mov_s16",
            Op1::MovU32 => "mov_u32",
            Op1::MovS32 => "mov_s32",
            Op1::Not => "not",
            Op1::Neg => "neg",
            Op1::Clz => "clz",
        }
    }
}

impl fmt::Display for Op1 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

/// Two-source ops: binary arithmetic, bitwise logic and shifts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op2 {
    Add,
    /// Add with the emulated carry flag.
    Addc,
    Sub,
    /// Subtract with the emulated carry (borrow) flag.
    Subc,
    Mul,
    And,
    Or,
    Xor,
    /// Logical shift left.
    Shl,
    /// Logical shift right.
    Lshr,
    /// Arithmetic shift right.
    Ashr,
}

impl Op2 {
    /// Whether `a op b == b op a`.
    pub(crate) fn is_commutative(self) -> bool {
        matches!(self, Op2::Add | Op2::Addc | Op2::Mul | Op2::And | Op2::Or | Op2::Xor)
    }

    pub fn to_static_str(self) -> &'static str {
        match self {
            Op2::Add => "add",
            Op2::Addc => "addc",
            Op2::Sub => "sub",
            Op2::Subc => "subc",
            Op2::Mul => "mul",
            Op2::And => "and",
            Op2::Or => "or",
            Op2::Xor => "xor",
            Op2::Shl => "shl",
            Op2::Lshr => "lshr",
            Op2::Ashr => "ashr",
        }
    }
}

impl fmt::Display for Op2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

/// Single-source float ops. `Cmp` writes the emulated float condition state
/// consumed by a following conditional branch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FOp1 {
    Mov,
    Neg,
    Abs,
    Cmp,
}

impl FOp1 {
    pub fn to_static_str(self) -> &'static str {
        match self {
            FOp1::Mov => "fmov",
            FOp1::Neg => "fneg",
            FOp1::Abs => "fabs",
            FOp1::Cmp => "fcmp",
        }
    }
}

impl fmt::Display for FOp1 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

/// Two-source float ops.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FOp2 {
    Add,
    Sub,
    Mul,
    Div,
}

impl FOp2 {
    pub fn to_static_str(self) -> &'static str {
        match self {
            FOp2::Add => "fadd",
            FOp2::Sub => "fsub",
            FOp2::Mul => "fmul",
            FOp2::Div => "fdiv",
        }
    }
}

impl fmt::Display for FOp2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

/// The combining op of `emit_op_flags`: either overwrite the destination
/// with the 0/1 flag value, or accumulate it with a bitwise or.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlagsOp {
    Mov,
    Or,
}

/// Op modifiers: requested flag effects and the 32-bit-operation marker.
///
/// The flag requests tell the encoder which emulated flags the following
/// conditional branch or `emit_op_flags` will consume, so it can pick the
/// native flag-setting variant (or synthesize the flag on ISAs that lack
/// it). `i32_op` narrows the operation to the low 32 bits on 64-bit ISAs
/// and is ignored on 32-bit ones.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Mods {
    pub set_z: bool,
    pub set_carry: bool,
    pub set_overflow: bool,
    pub i32_op: bool,
    /// The predicate a fused compare-and-branch will consume. Backends
    /// whose compare instructions encode signedness (S390x) read it.
    pub(crate) cmp: Option<CondCode>,
}

impl Mods {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set_z(mut self) -> Self {
        self.set_z = true;
        self
    }

    #[must_use]
    pub fn set_carry(mut self) -> Self {
        self.set_carry = true;
        self
    }

    #[must_use]
    pub fn set_overflow(mut self) -> Self {
        self.set_overflow = true;
        self
    }

    #[must_use]
    pub fn i32_op(mut self) -> Self {
        self.i32_op = true;
        self
    }

    /// Whether any flag effect was requested.
    pub fn sets_flags(&self) -> bool {
        self.set_z || self.set_carry || self.set_overflow
    }
}

/// What a jump branches on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JumpKind {
    /// Unconditional jump.
    Jump,
    /// Conditional jump on an integer predicate.
    Cond(CondCode),
    /// Conditional jump on a float predicate (after `fcmp`).
    FCond(FloatCond),
    /// Call with 0..=3 word arguments in the platform argument positions.
    Call(u8),
    /// Call through a scratch link: the return address lands where
    /// `emit_fast_enter` can fetch it, leaving the normal link path free.
    FastCall,
}

impl fmt::Display for JumpKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JumpKind::Jump => write!(f, "jump"),
            JumpKind::Cond(cc) => write!(f, "{}", cc),
            JumpKind::FCond(cc) => write!(f, "{}", cc),
            JumpKind::Call(n) => write!(f, "call{}", n),
            JumpKind::FastCall => write!(f, "fast_call"),
        }
    }
}

/// A jump request: the kind plus the rewritable marker. Rewritable jumps
/// always receive the conservative long encoding so their target can be
/// replaced after finalization.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct JumpType {
    pub kind: JumpKind,
    pub rewritable: bool,
}

impl JumpType {
    pub fn jump() -> Self {
        JumpKind::Jump.into()
    }

    pub fn cond(cc: CondCode) -> Self {
        JumpKind::Cond(cc).into()
    }

    pub fn fcond(cc: FloatCond) -> Self {
        JumpKind::FCond(cc).into()
    }

    pub fn call(args: u8) -> Self {
        debug_assert!(args <= 3);
        JumpKind::Call(args).into()
    }

    pub fn fast_call() -> Self {
        JumpKind::FastCall.into()
    }

    /// Mark the jump target as replaceable after finalization.
    #[must_use]
    pub fn rewritable(mut self) -> Self {
        self.rewritable = true;
        self
    }
}

impl From<JumpKind> for JumpType {
    fn from(kind: JumpKind) -> Self {
        JumpType {
            kind,
            rewritable: false,
        }
    }
}
