//! Instruction set architectures.
//!
//! Each sub-module implements the [`Backend`] contract for one ISA family:
//! the mapping from LIR ops to native instruction words, the prologue and
//! epilogue, the addressing lowerer, flag emulation, and the layout hooks
//! the relocation resolver calls to size and encode branches. Every backend
//! is always compiled so encoders are testable from any host; executing
//! produced code requires that the selected [`Arch`] matches the machine.

use core::fmt;

use target_lexicon::{Architecture, Triple};

use crate::abi::AbiProfile;
use crate::buffer::{CodeBuffer, CodeOffset, CodeSink, Const, FixupKind, Jump, JumpData};
use crate::condcodes::CondCode;
use crate::lir::{FOp1, FOp2, FlagsOp, JumpType, Mods, Op0, Op1, Op2};
use crate::operand::{FOperand, Operand, Reg};
use crate::CodegenResult;

pub(crate) mod aarch64;
pub(crate) mod arm;
pub(crate) mod ppc;
pub(crate) mod sparc;
pub(crate) mod s390x;
pub(crate) mod thumb2;
pub(crate) mod x86;

/// A supported target architecture.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Arch {
    X86_32,
    X86_64,
    /// ARM v5 (A32, literal pools for wide immediates).
    ArmV5,
    /// ARM v7 (A32, `movw`/`movt` available).
    ArmV7,
    /// ARM Thumb-2.
    Thumb2,
    Aarch64,
    Ppc32,
    Ppc64,
    Sparc32,
    S390x,
}

/// Describes reason for target lookup failure.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum LookupError {
    /// The requested target is unknown to this library.
    Unsupported,
}

// This is manually implementing Error and Display instead of using thiserror
// to reduce the amount of dependencies.
impl std::error::Error for LookupError {}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LookupError::Unsupported => write!(f, "unsupported target"),
        }
    }
}

/// Look up the architecture for a target triple.
pub fn lookup(triple: &Triple) -> Result<Arch, LookupError> {
    match triple.architecture {
        Architecture::X86_32(_) => Ok(Arch::X86_32),
        Architecture::X86_64 => Ok(Arch::X86_64),
        Architecture::Aarch64(_) => Ok(Arch::Aarch64),
        Architecture::Arm(a) => {
            let name = a.into_str();
            if name.starts_with("thumb") {
                Ok(Arch::Thumb2)
            } else if name.contains("v7") || name.contains("v8") {
                Ok(Arch::ArmV7)
            } else {
                Ok(Arch::ArmV5)
            }
        }
        Architecture::Powerpc => Ok(Arch::Ppc32),
        Architecture::Powerpc64 | Architecture::Powerpc64le => Ok(Arch::Ppc64),
        Architecture::Sparc | Architecture::Sparcv9 => Ok(Arch::Sparc32),
        Architecture::S390x => Ok(Arch::S390x),
        _ => Err(LookupError::Unsupported),
    }
}

impl Arch {
    /// The architecture of the running machine.
    pub fn host() -> Result<Arch, LookupError> {
        #[cfg(target_arch = "x86")]
        return Ok(Arch::X86_32);
        #[cfg(target_arch = "x86_64")]
        return Ok(Arch::X86_64);
        #[cfg(target_arch = "aarch64")]
        return Ok(Arch::Aarch64);
        #[cfg(all(target_arch = "arm", target_feature = "thumb-mode"))]
        return Ok(Arch::Thumb2);
        #[cfg(all(target_arch = "arm", not(target_feature = "thumb-mode")))]
        return Ok(Arch::ArmV7);
        #[cfg(target_arch = "powerpc")]
        return Ok(Arch::Ppc32);
        #[cfg(target_arch = "powerpc64")]
        return Ok(Arch::Ppc64);
        #[cfg(target_arch = "sparc")]
        return Ok(Arch::Sparc32);
        #[cfg(target_arch = "s390x")]
        return Ok(Arch::S390x);
        #[allow(unreachable_code)]
        Err(LookupError::Unsupported)
    }

    /// Native machine-word width in bytes.
    pub fn word_bytes(self) -> u8 {
        match self {
            Arch::X86_64 | Arch::Aarch64 | Arch::Ppc64 | Arch::S390x => 8,
            _ => 4,
        }
    }

    /// log2 of the word width; the shift for word-indexed addressing.
    pub fn word_shift(self) -> u8 {
        if self.word_bytes() == 8 {
            3
        } else {
            2
        }
    }

    /// Whether instruction words are stored big-endian.
    pub fn big_endian(self) -> bool {
        matches!(self, Arch::Ppc32 | Arch::Ppc64 | Arch::Sparc32 | Arch::S390x)
    }

    /// The bias added to entry addresses (Thumb sets the interworking bit).
    pub fn entry_bias(self) -> usize {
        if self == Arch::Thumb2 {
            1
        } else {
            0
        }
    }

    pub fn to_static_str(self) -> &'static str {
        match self {
            Arch::X86_32 => "x86_32",
            Arch::X86_64 => "x86_64",
            Arch::ArmV5 => "arm_v5",
            Arch::ArmV7 => "arm_v7",
            Arch::Thumb2 => "thumb2",
            Arch::Aarch64 => "aarch64",
            Arch::Ppc32 => "ppc32",
            Arch::Ppc64 => "ppc64",
            Arch::Sparc32 => "sparc32",
            Arch::S390x => "s390x",
        }
    }

    /// Rewrite the target of a rewritable jump emitted by this
    /// architecture.
    ///
    /// `at` points at the jump's patchable site in the *writable* view;
    /// `site_exec_addr` is the same site's address in the executable view
    /// (they differ by the allocator's executable offset). The caller is
    /// responsible for write permissions and for flushing the instruction
    /// cache afterwards.
    ///
    /// # Safety
    /// `at` must point at a patchable site produced by this library for
    /// this architecture, with enough valid bytes for the long jump form.
    pub unsafe fn patch_jump_target(self, at: *mut u8, site_exec_addr: u64, new_target: u64) {
        let slice = |len: usize| core::slice::from_raw_parts_mut(at, len);
        match self {
            Arch::X86_32 => {
                // Long jumps are `e9/0f 8x rel32`; `at` addresses the rel32.
                let rel = (new_target as u32).wrapping_sub(site_exec_addr as u32 + 4);
                slice(4).copy_from_slice(&rel.to_le_bytes());
            }
            Arch::X86_64 => {
                // Long jumps are `mov r10, imm64; jmp/call r10`; `at`
                // addresses the imm64.
                slice(8).copy_from_slice(&new_target.to_le_bytes());
            }
            Arch::ArmV5 => arm::patch_pool_load(at, new_target as u32),
            Arch::ArmV7 => arm::patch_movw_movt(slice(8), new_target as u32),
            Arch::Thumb2 => thumb2::patch_movw_movt(slice(8), (new_target as u32) | 1),
            Arch::Aarch64 => aarch64::patch_mov_seq(slice(16), 4, new_target),
            Arch::Ppc32 => ppc::patch_imm32(slice(8), new_target as u32),
            Arch::Ppc64 => ppc::patch_imm64(slice(20), new_target),
            Arch::Sparc32 => sparc::patch_hi_lo(slice(8), new_target as u32),
            Arch::S390x => s390x::patch_imm64(slice(12), new_target),
        }
    }

    /// Rewrite the value of an embedded constant emitted by this
    /// architecture. Same contract as [`Arch::patch_jump_target`].
    ///
    /// # Safety
    /// `at` must point at a const site produced by this library for this
    /// architecture.
    pub unsafe fn patch_const_value(self, at: *mut u8, value: u64) {
        let slice = |len: usize| core::slice::from_raw_parts_mut(at, len);
        match self {
            Arch::X86_32 => slice(4).copy_from_slice(&(value as u32).to_le_bytes()),
            Arch::X86_64 => slice(8).copy_from_slice(&value.to_le_bytes()),
            Arch::ArmV5 => arm::patch_pool_load(at, value as u32),
            Arch::ArmV7 => arm::patch_movw_movt(slice(8), value as u32),
            Arch::Thumb2 => thumb2::patch_movw_movt(slice(8), value as u32),
            Arch::Aarch64 => aarch64::patch_mov_seq(slice(16), 4, value),
            Arch::Ppc32 => ppc::patch_imm32(slice(8), value as u32),
            Arch::Ppc64 => ppc::patch_imm64(slice(20), value),
            Arch::Sparc32 => sparc::patch_hi_lo(slice(8), value as u32),
            Arch::S390x => s390x::patch_imm64(slice(12), value),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

/// Per-ISA capability limits checked by `emit_enter`.
#[derive(Clone, Copy, Debug)]
pub struct IsaLimits {
    /// Maximum exposed scratch registers.
    pub scratches_max: u8,
    /// Maximum exposed saved registers.
    pub saveds_max: u8,
    /// Maximum exposed float registers.
    pub fscratches_max: u8,
    /// Maximum callee-saved float registers the prologue can preserve.
    pub fsaveds_max: u8,
}

/// The per-architecture encoder contract.
///
/// A backend owns its transient state (constant-pool fill, operand cache,
/// delay-slot staging, carry flavor) and implements both the emission
/// entry points the compiler forwards to and the layout hooks the
/// relocation resolver drives.
pub(crate) trait Backend {
    fn arch(&self) -> Arch;

    fn limits(&self) -> IsaLimits;

    // ---- emission -------------------------------------------------------

    fn enter(&mut self, buf: &mut CodeBuffer, abi: &AbiProfile) -> CodegenResult<()>;

    /// Record the ABI profile without emitting the prologue.
    fn fake_enter(&mut self, abi: &AbiProfile) -> CodegenResult<()>;

    /// Epilogue, optionally preceded by a move of `src` into the return
    /// register with move-op `op`.
    fn ret(
        &mut self,
        buf: &mut CodeBuffer,
        abi: &AbiProfile,
        value: Option<(Op1, Operand)>,
    ) -> CodegenResult<()>;

    fn op0(&mut self, buf: &mut CodeBuffer, op: Op0) -> CodegenResult<()>;

    fn op1(
        &mut self,
        buf: &mut CodeBuffer,
        op: Op1,
        mods: Mods,
        dst: Option<Operand>,
        src: Operand,
    ) -> CodegenResult<()>;

    fn op2(
        &mut self,
        buf: &mut CodeBuffer,
        op: Op2,
        mods: Mods,
        dst: Option<Operand>,
        src1: Operand,
        src2: Operand,
    ) -> CodegenResult<()>;

    fn fop1(
        &mut self,
        buf: &mut CodeBuffer,
        op: FOp1,
        dst: FOperand,
        src: FOperand,
    ) -> CodegenResult<()>;

    fn fop2(
        &mut self,
        buf: &mut CodeBuffer,
        op: FOp2,
        dst: FOperand,
        src1: FOperand,
        src2: FOperand,
    ) -> CodegenResult<()>;

    /// Materialize 0/1 from an emulated predicate into `dst`, combining
    /// with `op`.
    fn op_flags(
        &mut self,
        buf: &mut CodeBuffer,
        op: FlagsOp,
        dst: Operand,
        cc: CondCode,
    ) -> CodegenResult<()>;

    /// Fetch the fast-call return address into `dst`.
    fn fast_enter(&mut self, buf: &mut CodeBuffer, dst: Operand) -> CodegenResult<()>;

    /// Return through a fast-call return address in `src`.
    fn fast_return(&mut self, buf: &mut CodeBuffer, src: Operand) -> CodegenResult<()>;

    /// Advance `reg` by `disp` without disturbing the emulated flags
    /// (write-back lowering support).
    fn add_no_flags(&mut self, buf: &mut CodeBuffer, reg: Reg, disp: i64) -> CodegenResult<()>;

    fn jump(&mut self, buf: &mut CodeBuffer, ty: JumpType) -> CodegenResult<Jump>;

    fn ijump(&mut self, buf: &mut CodeBuffer, ty: JumpType, src: Operand) -> CodegenResult<()>;

    /// Emit a rewritable machine-word literal load into `dst`.
    fn const_(
        &mut self,
        buf: &mut CodeBuffer,
        dst: Option<Operand>,
        init: i64,
    ) -> CodegenResult<Const>;

    // ---- layout ---------------------------------------------------------

    /// Called right before a label is recorded so backends with staged
    /// state (delay-slot lookahead) can settle positions.
    fn pre_label(&mut self, buf: &mut CodeBuffer) {
        let _ = buf;
    }

    /// Called once before layout: flush pending constant pools and staged
    /// delay-slot instructions.
    fn before_layout(&mut self, buf: &mut CodeBuffer) -> CodegenResult<()> {
        let _ = buf;
        Ok(())
    }

    /// Candidate encoding sizes for a jump, ascending. A single entry
    /// means the size is fixed at emission time.
    fn jump_encodings(&self, jump: &JumpData) -> &'static [u32];

    /// The smallest candidate that reaches `target` from `at` (`None` for
    /// absolute or unset targets, which always take the long form).
    fn jump_needed_size(
        &self,
        jump: &JumpData,
        at: CodeOffset,
        target: Option<CodeOffset>,
    ) -> u32;

    /// Emit the final encoding of `jump` with the chosen `size`. Returns
    /// the offset of the patchable site within the image.
    fn emit_jump(
        &self,
        jump: &JumpData,
        size: u32,
        at: CodeOffset,
        target: Option<CodeOffset>,
        sink: &mut CodeSink,
    ) -> CodeOffset;

    /// Pad the image with encoder fill (nops or zeros) up to `target`.
    fn pad_to(&self, target: CodeOffset, sink: &mut CodeSink);
}

/// Construct the backend for an architecture.
pub(crate) fn backend_for(arch: Arch) -> Box<dyn Backend> {
    match arch {
        Arch::X86_32 => Box::new(x86::X86Backend::new(false)),
        Arch::X86_64 => Box::new(x86::X86Backend::new(true)),
        Arch::ArmV5 => Box::new(arm::ArmBackend::new(false)),
        Arch::ArmV7 => Box::new(arm::ArmBackend::new(true)),
        Arch::Thumb2 => Box::new(thumb2::Thumb2Backend::new()),
        Arch::Aarch64 => Box::new(aarch64::A64Backend::new()),
        Arch::Ppc32 => Box::new(ppc::PpcBackend::new(false)),
        Arch::Ppc64 => Box::new(ppc::PpcBackend::new(true)),
        Arch::Sparc32 => Box::new(sparc::SparcBackend::new()),
        Arch::S390x => Box::new(s390x::S390xBackend::new()),
    }
}

/// Apply one absolute fixup into `code` (sliced so the fixup begins at
/// index 0). `fixup_addr` is the executable address of that position and
/// `value` the resolved absolute target.
pub(crate) fn apply_fixup(
    arch: Arch,
    kind: FixupKind,
    code: &mut [u8],
    fixup_addr: u64,
    value: u64,
) {
    match kind {
        FixupKind::Abs32 => {
            let word = value as u32;
            let bytes = if arch.big_endian() {
                word.to_be_bytes()
            } else {
                word.to_le_bytes()
            };
            code[..4].copy_from_slice(&bytes);
        }
        FixupKind::Abs64 => {
            code[..8].copy_from_slice(&value.to_le_bytes());
        }
        FixupKind::X86Rel32 => {
            let rel = (value as u32).wrapping_sub((fixup_addr as u32).wrapping_add(4));
            code[..4].copy_from_slice(&rel.to_le_bytes());
        }
        FixupKind::A64MovSeq { count } => aarch64::patch_mov_seq(code, count, value),
        FixupKind::ArmMovSeq => arm::patch_movw_movt(code, value as u32),
        // Branch targets inside Thumb code carry the interworking bit.
        FixupKind::Thumb2MovSeq => thumb2::patch_movw_movt(code, (value as u32) | 1),
        FixupKind::PpcImm32 => ppc::patch_imm32(code, value as u32),
        FixupKind::PpcImm64 => ppc::patch_imm64(code, value),
        FixupKind::SparcHiLo => sparc::patch_hi_lo(code, value as u32),
        FixupKind::S390xImm64 => s390x::patch_imm64(code, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn lookup_by_triple() {
        let t = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        assert_eq!(lookup(&t), Ok(Arch::X86_64));
        let t = Triple::from_str("thumbv7em-none-eabi").unwrap();
        assert_eq!(lookup(&t), Ok(Arch::Thumb2));
        let t = Triple::from_str("armv7-unknown-linux-gnueabihf").unwrap();
        assert_eq!(lookup(&t), Ok(Arch::ArmV7));
        let t = Triple::from_str("s390x-unknown-linux-gnu").unwrap();
        assert_eq!(lookup(&t), Ok(Arch::S390x));
    }

    #[test]
    fn word_widths() {
        assert_eq!(Arch::X86_32.word_bytes(), 4);
        assert_eq!(Arch::X86_64.word_bytes(), 8);
        assert_eq!(Arch::S390x.word_bytes(), 8);
        assert_eq!(Arch::Ppc64.word_shift(), 3);
        assert!(Arch::Sparc32.big_endian());
        assert_eq!(Arch::Thumb2.entry_bias(), 1);
    }
}
