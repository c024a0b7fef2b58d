//! x86-32 / x86-64 ISA: binary code emission.
//!
//! Both modes share one encoder; a mode flag controls REX emission, operand
//! widths and the register map. Variable-length branch encodings (rel8 vs
//! rel32) are the reason the generic layout loop exists at all: every other
//! backend keeps its jump sizes fixed at emission time.
//!
//! Register map (64-bit): `r0..r3` = rax, rcx, rdx, r8; `s0..s3` = rbx,
//! r12, r13, r14; locals base = rsp; encoder temporaries r10/r11.
//! Register map (32-bit): `r0..r2` = eax, ecx, edx; `s0..s2` = esi, edi,
//! ebp; locals base = esp; encoder temporary ebx (always preserved by the
//! prologue).

use crate::abi::AbiProfile;
use crate::buffer::{
    ByteSink, CodeBuffer, CodeOffset, CodeSink, Const, FixTarget, FixupKind, Jump, JumpData,
    JumpTarget,
};
use crate::condcodes::{CondCode, FloatCond};
use crate::isa::{Arch, Backend, IsaLimits};
use crate::lir::{FOp1, FOp2, FlagsOp, JumpKind, JumpType, Mods, Op0, Op1, Op2};
use crate::operand::{FOperand, Mem, Operand, Reg};
use crate::{CodegenResult, Error};

// Native register numbers.
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R10: u8 = 10;
const R11: u8 = 11;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;

/// Virtual-to-native map, 64-bit mode: r0..r3, s0..s3, sp.
const MAP64: [u8; 9] = [RAX, RCX, RDX, R8, RBX, R12, R13, R14, RSP];
/// Virtual-to-native map, 32-bit mode (r3/s3 unavailable).
const MAP32: [u8; 9] = [RAX, RCX, RDX, 0xff, RSI, RDI, RBP, 0xff, RSP];

const SAVED64: [u8; 4] = [RBX, R12, R13, R14];
const SAVED32: [u8; 3] = [RSI, RDI, RBP];

#[cfg(not(windows))]
const ARG_REGS64: [u8; 3] = [RDI, RSI, RDX];
#[cfg(windows)]
const ARG_REGS64: [u8; 3] = [RCX, RDX, R8];

// 16-byte-aligned xmm masks referenced absolutely by fneg/fabs.
#[repr(align(16))]
struct XmmMask([u64; 2]);
static FNEG_MASK: XmmMask = XmmMask([0x8000_0000_0000_0000, 0]);
static FABS_MASK: XmmMask = XmmMask([0x7fff_ffff_ffff_ffff, !0u64]);

/// Condition nibble for `jcc`/`setcc`/`cmovcc` opcodes.
fn cc_nibble(cc: CondCode) -> u8 {
    match cc {
        CondCode::Equal => 0x4,
        CondCode::NotEqual => 0x5,
        CondCode::Less | CondCode::Carry => 0x2,
        CondCode::GreaterEqual | CondCode::NotCarry => 0x3,
        CondCode::Greater => 0x7,
        CondCode::LessEqual => 0x6,
        CondCode::SigLess => 0xc,
        CondCode::SigGreaterEqual => 0xd,
        CondCode::SigGreater => 0xf,
        CondCode::SigLessEqual => 0xe,
        CondCode::Overflow => 0x0,
        CondCode::NotOverflow => 0x1,
    }
}

/// Condition nibble after `ucomisd src1, src2`. The basic six are
/// meaningful for ordered inputs; `Ordered`/`Unordered` test PF.
fn fcc_nibble(cc: FloatCond) -> u8 {
    match cc {
        FloatCond::Equal => 0x4,
        FloatCond::NotEqual => 0x5,
        FloatCond::Less => 0x2,
        FloatCond::GreaterEqual => 0x3,
        FloatCond::Greater => 0x7,
        FloatCond::LessEqual => 0x6,
        FloatCond::Unordered => 0xa,
        FloatCond::Ordered => 0xb,
    }
}

/// A resolved r/m operand with native register numbers.
#[derive(Clone, Copy, Debug)]
enum Rm {
    Reg(u8),
    Mem {
        base: Option<u8>,
        index: Option<(u8, u8)>,
        disp: i32,
    },
}

#[derive(Clone, Copy, Debug)]
enum ImmPart {
    None,
    I8(i8),
    I32(i32),
}

/// Assemble one instruction: optional 66 prefix, REX, opcode bytes, ModRM,
/// SIB, displacement and trailing immediate.
fn emit_ins(
    buf: &mut dyn ByteSink,
    x64: bool,
    p66: bool,
    rex_w: bool,
    opcode: &[u8],
    reg: u8,
    rm: Rm,
    imm: ImmPart,
) {
    if p66 {
        buf.put1(0x66);
    }
    let (modrm_rm, sib, disp_kind) = encode_rm(x64, rm);
    if x64 {
        let mut rex = 0u8;
        if rex_w {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if let Some(sib) = sib {
            if sib.index >= 8 {
                rex |= 0x02;
            }
            if sib.base >= 8 && sib.base != 0xff {
                rex |= 0x01;
            }
        }
        if modrm_rm >= 8 {
            rex |= 0x01;
        }
        if rex != 0 {
            buf.put1(0x40 | rex);
        }
    } else {
        debug_assert!(!rex_w && reg < 8);
    }
    for b in opcode {
        buf.put1(*b);
    }
    let mod_bits = match disp_kind {
        DispKind::None => 0b00,
        DispKind::D8(_) => 0b01,
        DispKind::D32(_) => 0b10,
        DispKind::Abs32(_) => 0b00,
        DispKind::Direct => 0b11,
    };
    let rm_bits = if sib.is_some() { 0b100 } else { modrm_rm & 7 };
    buf.put1((mod_bits << 6) | ((reg & 7) << 3) | rm_bits);
    if let Some(sib) = sib {
        let base_bits = if sib.base == 0xff { 0b101 } else { sib.base & 7 };
        buf.put1((sib.scale << 6) | ((sib.index & 7) << 3) | base_bits);
    }
    match disp_kind {
        DispKind::D8(d) => buf.put1(d as u8),
        DispKind::D32(d) | DispKind::Abs32(d) => buf.put4(d as u32),
        _ => {}
    }
    match imm {
        ImmPart::None => {}
        ImmPart::I8(v) => buf.put1(v as u8),
        ImmPart::I32(v) => buf.put4(v as u32),
    }
}

#[derive(Clone, Copy)]
struct Sib {
    scale: u8,
    index: u8,
    /// 0xff marks "no base" (disp32-only SIB form).
    base: u8,
}

#[derive(Clone, Copy)]
enum DispKind {
    None,
    D8(i8),
    D32(i32),
    /// mod=00 absolute/displacement-only form.
    Abs32(i32),
    /// Register-direct (mod=11).
    Direct,
}

fn encode_rm(x64: bool, rm: Rm) -> (u8, Option<Sib>, DispKind) {
    match rm {
        Rm::Reg(r) => (r, None, DispKind::Direct),
        Rm::Mem { base, index, disp } => match (base, index) {
            (None, None) => {
                if x64 {
                    // [disp32] needs the SIB no-base form; plain rm=101 would
                    // be RIP-relative in 64-bit mode.
                    (
                        0,
                        Some(Sib {
                            scale: 0,
                            index: 0b100,
                            base: 0xff,
                        }),
                        DispKind::Abs32(disp),
                    )
                } else {
                    (0b101, None, DispKind::Abs32(disp))
                }
            }
            (None, Some((idx, shift))) => (
                0,
                Some(Sib {
                    scale: shift,
                    index: idx,
                    base: 0xff,
                }),
                DispKind::Abs32(disp),
            ),
            (Some(base), index) => {
                let need_sib = index.is_some() || (base & 7) == 0b100;
                let disp_kind = if disp == 0 && (base & 7) != 0b101 {
                    DispKind::None
                } else if (-128..=127).contains(&disp) {
                    DispKind::D8(disp as i8)
                } else {
                    DispKind::D32(disp)
                };
                if need_sib {
                    let (scale, idx) = match index {
                        Some((idx, shift)) => {
                            debug_assert!(idx & 7 != 0b100 || idx >= 8);
                            (shift, idx)
                        }
                        // index=100 with REX.X=0 encodes "none".
                        None => (0, 0b100),
                    };
                    (
                        base,
                        Some(Sib {
                            scale,
                            index: idx,
                            base,
                        }),
                        disp_kind,
                    )
                } else {
                    (base, None, disp_kind)
                }
            }
        },
    }
}

fn fits_i8(v: i64) -> bool {
    (-128..=127).contains(&v)
}

fn fits_i32(v: i64) -> bool {
    v >= i32::MIN as i64 && v <= i32::MAX as i64
}

fn fits_u32(v: i64) -> bool {
    v >= 0 && v <= u32::MAX as i64
}

pub(crate) struct X86Backend {
    x64: bool,
}

impl X86Backend {
    pub(crate) fn new(x64: bool) -> Self {
        X86Backend { x64 }
    }

    fn hw(&self, r: Reg) -> u8 {
        let map = if self.x64 { &MAP64[..] } else { &MAP32[..] };
        let native = map[r.index() as usize];
        debug_assert!(native != 0xff, "register not available in this mode");
        native
    }

    /// Data-working temporary.
    fn tmp0(&self) -> u8 {
        if self.x64 {
            R10
        } else {
            RBX
        }
    }

    /// Address/immediate-staging temporary. 32-bit addressing never needs
    /// one, so ebx can double for the rare imm-staging uses there.
    fn tmp1(&self) -> u8 {
        if self.x64 {
            R11
        } else {
            RBX
        }
    }

    fn rex_w(&self, mods: Mods) -> bool {
        self.x64 && !mods.i32_op
    }

    /// Lower a virtual memory expression to a native r/m, materializing an
    /// out-of-range displacement into the staging temporary.
    fn lower_mem(&self, buf: &mut CodeBuffer, m: &Mem) -> CodegenResult<Rm> {
        let base = m.base.map(|r| self.hw(r));
        let index = m.index.map(|(r, s)| (self.hw(r), s));
        if !self.x64 {
            // 32-bit address arithmetic wraps.
            return Ok(Rm::Mem {
                base,
                index,
                disp: m.disp as u32 as i32,
            });
        }
        if fits_i32(m.disp) {
            return Ok(Rm::Mem {
                base,
                index,
                disp: m.disp as i32,
            });
        }
        // movabs tmp1, disp
        self.mov_imm64(buf, self.tmp1(), m.disp);
        match (base, index) {
            (None, None) => Ok(Rm::Mem {
                base: Some(self.tmp1()),
                index: None,
                disp: 0,
            }),
            (Some(b), None) => Ok(Rm::Mem {
                base: Some(b),
                index: Some((self.tmp1(), 0)),
                disp: 0,
            }),
            (Some(b), Some(ix)) => {
                // lea tmp1, [base + tmp1]; keep the scaled index native.
                emit_ins(
                    buf,
                    true,
                    false,
                    true,
                    &[0x8d],
                    self.tmp1(),
                    Rm::Mem {
                        base: Some(b),
                        index: Some((self.tmp1(), 0)),
                        disp: 0,
                    },
                    ImmPart::None,
                );
                Ok(Rm::Mem {
                    base: Some(self.tmp1()),
                    index: Some(ix),
                    disp: 0,
                })
            }
            (None, Some(ix)) => Ok(Rm::Mem {
                base: Some(self.tmp1()),
                index: Some(ix),
                disp: 0,
            }),
        }
    }

    /// `mov r, imm` choosing the shortest correct form; full-width.
    fn mov_imm64(&self, buf: &mut dyn ByteSink, r: u8, imm: i64) {
        if !self.x64 {
            // b8+r imm32
            buf.put1(0xb8 + (r & 7));
            buf.put4(imm as u32);
        } else if fits_u32(imm) {
            // 32-bit mov zero-extends.
            if r >= 8 {
                buf.put1(0x41);
            }
            buf.put1(0xb8 + (r & 7));
            buf.put4(imm as u32);
        } else if fits_i32(imm) {
            emit_ins(
                buf,
                true,
                false,
                true,
                &[0xc7],
                0,
                Rm::Reg(r),
                ImmPart::I32(imm as i32),
            );
        } else {
            // movabs r, imm64
            buf.put1(0x48 | if r >= 8 { 0x01 } else { 0x00 });
            buf.put1(0xb8 + (r & 7));
            buf.put8(imm as u64);
        }
    }

    /// Full-width `mov` between a native register and an r/m.
    fn mov_rr(&self, buf: &mut dyn ByteSink, w: bool, dst: u8, src: u8) {
        emit_ins(buf, self.x64, false, w, &[0x8b], dst, Rm::Reg(src), ImmPart::None);
    }

    fn load(&self, buf: &mut dyn ByteSink, w: bool, dst: u8, rm: Rm) {
        emit_ins(buf, self.x64, false, w, &[0x8b], dst, rm, ImmPart::None);
    }

    fn store(&self, buf: &mut dyn ByteSink, w: bool, src: u8, rm: Rm) {
        emit_ins(buf, self.x64, false, w, &[0x89], src, rm, ImmPart::None);
    }

    /// Load the value of an integer operand into a native register.
    fn load_operand(&self, buf: &mut CodeBuffer, r: u8, src: Operand, w: bool) -> CodegenResult<()> {
        match src {
            Operand::Reg(s) => {
                let s = self.hw(s);
                if s != r {
                    self.mov_rr(buf, w, r, s);
                }
            }
            Operand::Imm(v) => self.mov_imm64(buf, r, v),
            Operand::Mem(m) => {
                let rm = self.lower_mem(buf, &m)?;
                self.load(buf, w, r, rm);
            }
        }
        Ok(())
    }

    /// ALU op `/digit` pair: (rm,r opcode, r,rm opcode, modrm digit).
    fn alu_bytes(op: Op2) -> Option<(u8, u8, u8)> {
        match op {
            Op2::Add => Some((0x01, 0x03, 0)),
            Op2::Addc => Some((0x11, 0x13, 2)),
            Op2::Sub => Some((0x29, 0x2b, 5)),
            Op2::Subc => Some((0x19, 0x1b, 3)),
            Op2::And => Some((0x21, 0x23, 4)),
            Op2::Or => Some((0x09, 0x0b, 1)),
            Op2::Xor => Some((0x31, 0x33, 6)),
            _ => None,
        }
    }

    /// `alu r, rm`.
    fn alu_r_rm(&self, buf: &mut dyn ByteSink, op: Op2, w: bool, r: u8, rm: Rm) {
        let (_, r_rm, _) = Self::alu_bytes(op).unwrap();
        emit_ins(buf, self.x64, false, w, &[r_rm], r, rm, ImmPart::None);
    }

    /// `alu rm, r`.
    fn alu_rm_r(&self, buf: &mut dyn ByteSink, op: Op2, w: bool, rm: Rm, r: u8) {
        let (rm_r, _, _) = Self::alu_bytes(op).unwrap();
        emit_ins(buf, self.x64, false, w, &[rm_r], r, rm, ImmPart::None);
    }

    /// `alu rm, imm` (imm must fit i32).
    fn alu_rm_imm(&self, buf: &mut dyn ByteSink, op: Op2, w: bool, rm: Rm, imm: i32) {
        let (_, _, digit) = Self::alu_bytes(op).unwrap();
        if fits_i8(imm as i64) {
            emit_ins(buf, self.x64, false, w, &[0x83], digit, rm, ImmPart::I8(imm as i8));
        } else {
            emit_ins(buf, self.x64, false, w, &[0x81], digit, rm, ImmPart::I32(imm));
        }
    }

    fn push(&self, buf: &mut dyn ByteSink, r: u8) {
        if r >= 8 {
            buf.put1(0x41);
        }
        buf.put1(0x50 + (r & 7));
    }

    fn pop(&self, buf: &mut dyn ByteSink, r: u8) {
        if r >= 8 {
            buf.put1(0x41);
        }
        buf.put1(0x58 + (r & 7));
    }

    fn add_sp(&self, buf: &mut dyn ByteSink, delta: i32) {
        if delta == 0 {
            return;
        }
        let (op, v) = if delta > 0 { (Op2::Add, delta) } else { (Op2::Sub, -delta) };
        self.alu_rm_imm(buf, op, self.x64, Rm::Reg(RSP), v);
    }

    /// The registers pushed by the prologue, in push order.
    fn pushed_regs(&self, abi: &AbiProfile) -> smallvec::SmallVec<[u8; 5]> {
        let mut regs = smallvec::SmallVec::new();
        if !self.x64 {
            // ebx is the encoder temporary; it is callee-saved so the
            // prologue always preserves it.
            regs.push(RBX);
        }
        let saved: &[u8] = if self.x64 { &SAVED64 } else { &SAVED32 };
        for i in 0..abi.saveds {
            regs.push(saved[i as usize]);
        }
        regs
    }

    /// Local-frame size padded so call sites stay 16-byte aligned.
    fn frame_size(&self, abi: &AbiProfile) -> i32 {
        let pushes = self.pushed_regs(abi).len() as i64;
        let word = if self.x64 { 8 } else { 4 };
        let mut l = (i64::from(abi.local_size) + word - 1) & !(word - 1);
        // After the return address and the pushes, the frame must bring the
        // stack pointer back to 16-byte alignment.
        let entry_mis = 16 - word; // sp mod 16 right after the call
        while (entry_mis - pushes * word - l).rem_euclid(16) != 0 {
            l += word;
        }
        l as i32
    }

    /// setcc into the data temporary, zero-extended.
    fn set_cc_tmp(&self, buf: &mut dyn ByteSink, nibble: u8) {
        let t = self.tmp0();
        emit_ins(buf, self.x64, false, false, &[0x0f, 0x90 + nibble], 0, Rm::Reg(t), ImmPart::None);
        // movzx t, t8
        emit_ins(buf, self.x64, false, false, &[0x0f, 0xb6], t, Rm::Reg(t), ImmPart::None);
    }

    fn cc_of_jump(&self, kind: JumpKind) -> Option<u8> {
        match kind {
            JumpKind::Cond(cc) => Some(cc_nibble(cc)),
            JumpKind::FCond(cc) => Some(fcc_nibble(cc)),
            _ => None,
        }
    }

    /// Move the scratch registers into the platform argument positions.
    fn shuffle_call_args(&self, buf: &mut CodeBuffer, nargs: u8) -> CodegenResult<()> {
        if self.x64 {
            // Copy in reverse so an argument home doubling as a virtual
            // scratch is read before it is overwritten.
            for i in (0..nargs).rev() {
                let dst = ARG_REGS64[i as usize];
                let src = MAP64[i as usize];
                if dst != src {
                    self.mov_rr(buf, true, dst, src);
                }
            }
        } else {
            // cdecl: push right-to-left, caller cleans up after the call
            // (the jump emitter pads for 16-byte alignment).
            let pad = (16 - 4 * i32::from(nargs) % 16) % 16;
            if pad != 0 {
                self.add_sp(buf, -pad);
            }
            for i in (0..nargs).rev() {
                self.push(buf, MAP32[i as usize]);
            }
        }
        Ok(())
    }

    /// Stack bytes the call-argument shuffle leaves to be popped.
    fn call_arg_cleanup(&self, nargs: u8) -> i32 {
        if self.x64 || nargs == 0 {
            0
        } else {
            let pad = (16 - 4 * i32::from(nargs) % 16) % 16;
            4 * i32::from(nargs) + pad
        }
    }

    // ---- float helpers --------------------------------------------------

    fn fhw(&self, r: crate::operand::FReg) -> u8 {
        r.index()
    }

    const FTMP: u8 = 4;

    /// SSE op `prefix 0f opcode /r` with xmm reg and r/m.
    fn sse(&self, buf: &mut dyn ByteSink, prefix: u8, opcode: u8, reg: u8, rm: Rm) {
        buf.put1(prefix);
        // REX would sit between the mandatory prefix and 0f; none of the
        // exposed xmm registers need one.
        emit_ins(buf, self.x64, false, false, &[0x0f, opcode], reg, rm, ImmPart::None);
    }

    fn lower_fmem(&self, buf: &mut CodeBuffer, m: &Mem) -> CodegenResult<Rm> {
        self.lower_mem(buf, m)
    }

    /// Load a float operand into an xmm register (returns the register).
    fn load_foperand(
        &self,
        buf: &mut CodeBuffer,
        want: u8,
        src: FOperand,
    ) -> CodegenResult<u8> {
        match src {
            FOperand::Reg(r) => Ok(self.fhw(r)),
            FOperand::Mem(m) => {
                let rm = self.lower_fmem(buf, &m)?;
                self.sse(buf, 0xf2, 0x10, want, rm);
                Ok(want)
            }
        }
    }

    /// r/m pointing at a 16-byte aligned static mask.
    fn mask_rm(&self, buf: &mut CodeBuffer, mask: &'static XmmMask) -> Rm {
        let addr = mask as *const XmmMask as usize as i64;
        if !self.x64 {
            return Rm::Mem {
                base: None,
                index: None,
                disp: addr as u32 as i32,
            };
        }
        if fits_i32(addr) {
            Rm::Mem {
                base: None,
                index: None,
                disp: addr as i32,
            }
        } else {
            self.mov_imm64(buf, self.tmp1(), addr);
            Rm::Mem {
                base: Some(self.tmp1()),
                index: None,
                disp: 0,
            }
        }
    }
}

impl Backend for X86Backend {
    fn arch(&self) -> Arch {
        if self.x64 {
            Arch::X86_64
        } else {
            Arch::X86_32
        }
    }

    fn limits(&self) -> IsaLimits {
        if self.x64 {
            IsaLimits {
                scratches_max: 4,
                saveds_max: 4,
                fscratches_max: 4,
                fsaveds_max: 0,
            }
        } else {
            IsaLimits {
                scratches_max: 3,
                saveds_max: 3,
                fscratches_max: 4,
                fsaveds_max: 0,
            }
        }
    }

    fn enter(&mut self, buf: &mut CodeBuffer, abi: &AbiProfile) -> CodegenResult<()> {
        for r in self.pushed_regs(abi) {
            self.push(buf, r);
        }
        let frame = self.frame_size(abi);
        self.add_sp(buf, -frame);
        let nargs = abi.args.count();
        if self.x64 {
            for i in 0..nargs {
                let dst = MAP64[4 + i as usize];
                self.mov_rr(buf, true, dst, ARG_REGS64[i as usize]);
            }
        } else {
            // Arguments live above the return address on the stack.
            let pushed = self.pushed_regs(abi).len() as i32;
            for i in 0..nargs {
                let disp = frame + 4 * pushed + 4 + 4 * i32::from(i);
                let rm = Rm::Mem {
                    base: Some(RSP),
                    index: None,
                    disp,
                };
                self.load(buf, false, MAP32[4 + i as usize], rm);
            }
        }
        Ok(())
    }

    fn fake_enter(&mut self, _abi: &AbiProfile) -> CodegenResult<()> {
        Ok(())
    }

    fn ret(
        &mut self,
        buf: &mut CodeBuffer,
        abi: &AbiProfile,
        value: Option<(Op1, Operand)>,
    ) -> CodegenResult<()> {
        if let Some((op, src)) = value {
            self.op1(buf, op, Mods::new(), Some(Operand::Reg(crate::operand::r(0))), src)?;
        }
        self.add_sp(buf, self.frame_size(abi));
        for r in self.pushed_regs(abi).iter().rev() {
            self.pop(buf, *r);
        }
        buf.put1(0xc3);
        Ok(())
    }

    fn op0(&mut self, buf: &mut CodeBuffer, op: Op0) -> CodegenResult<()> {
        let w = self.x64;
        match op {
            Op0::Nop => buf.put1(0x90),
            Op0::Breakpoint => buf.put1(0xcc),
            Op0::LMulUw | Op0::LMulSw => {
                // rdx:rax = rax * rcx, then the high half moves to r1.
                let digit = if op == Op0::LMulUw { 4 } else { 5 };
                emit_ins(buf, self.x64, false, w, &[0xf7], digit, Rm::Reg(RCX), ImmPart::None);
                self.mov_rr(buf, w, RCX, RDX);
            }
            Op0::DivmodUw | Op0::DivmodSw => {
                if op == Op0::DivmodUw {
                    // xor edx, edx
                    emit_ins(buf, self.x64, false, false, &[0x31], RDX, Rm::Reg(RDX), ImmPart::None);
                } else if self.x64 {
                    buf.put1(0x48); // cqo
                    buf.put1(0x99);
                } else {
                    buf.put1(0x99); // cdq
                }
                let digit = if op == Op0::DivmodUw { 6 } else { 7 };
                emit_ins(buf, self.x64, false, w, &[0xf7], digit, Rm::Reg(RCX), ImmPart::None);
                self.mov_rr(buf, w, RCX, RDX);
            }
        }
        Ok(())
    }

    fn op1(
        &mut self,
        buf: &mut CodeBuffer,
        op: Op1,
        mods: Mods,
        dst: Option<Operand>,
        src: Operand,
    ) -> CodegenResult<()> {
        let dst = dst.ok_or(Error::BadArgument)?;
        let w = self.rex_w(mods);
        match op {
            Op1::Mov | Op1::MovU32 | Op1::MovS32 if !self.x64 || op == Op1::Mov => {
                // Full-width move.
                match (dst, src) {
                    (Operand::Reg(d), _) => self.load_operand(buf, self.hw(d), src, w)?,
                    (Operand::Mem(dm), Operand::Reg(s)) => {
                        let rm = self.lower_mem(buf, &dm)?;
                        self.store(buf, w, self.hw(s), rm);
                    }
                    (Operand::Mem(dm), Operand::Imm(v)) => {
                        if fits_i32(v) {
                            let rm = self.lower_mem(buf, &dm)?;
                            emit_ins(buf, self.x64, false, w, &[0xc7], 0, rm, ImmPart::I32(v as i32));
                        } else {
                            self.mov_imm64(buf, self.tmp0(), v);
                            let rm = self.lower_mem(buf, &dm)?;
                            self.store(buf, w, self.tmp0(), rm);
                        }
                    }
                    (Operand::Mem(dm), Operand::Mem(_)) => {
                        self.load_operand(buf, self.tmp0(), src, w)?;
                        let rm = self.lower_mem(buf, &dm)?;
                        self.store(buf, w, self.tmp0(), rm);
                    }
                    (Operand::Imm(_), _) => return Err(Error::BadArgument),
                }
            }
            Op1::Mov => unreachable!(),
            Op1::MovU32 => {
                // 32-bit mov zero-extends on x86-64.
                match dst {
                    Operand::Reg(d) => self.load_operand(buf, self.hw(d), src, false)?,
                    Operand::Mem(dm) => {
                        self.load_operand(buf, self.tmp0(), src, false)?;
                        let rm = self.lower_mem(buf, &dm)?;
                        self.store(buf, false, self.tmp0(), rm);
                    }
                    Operand::Imm(_) => return Err(Error::BadArgument),
                }
            }
            Op1::MovS32 => {
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => self.tmp0(),
                };
                match src {
                    Operand::Reg(s) => {
                        // movsxd work, s
                        emit_ins(buf, true, false, true, &[0x63], work, Rm::Reg(self.hw(s)), ImmPart::None);
                    }
                    Operand::Mem(m) => {
                        let rm = self.lower_mem(buf, &m)?;
                        emit_ins(buf, true, false, true, &[0x63], work, rm, ImmPart::None);
                    }
                    Operand::Imm(v) => self.mov_imm64(buf, work, v as i32 as i64),
                }
                if let Operand::Mem(dm) = dst {
                    let rm = self.lower_mem(buf, &dm)?;
                    self.store(buf, true, work, rm);
                }
            }
            Op1::MovU8 | Op1::MovS8 | Op1::MovU16 | Op1::MovS16 => {
                let (width, signed) = op.mov_width().unwrap();
                // Load (or mask) the narrow value into a working register.
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => self.tmp0(),
                };
                match src {
                    Operand::Imm(v) => {
                        let v = match (width, signed) {
                            (1, false) => (v as u8) as i64,
                            (1, true) => (v as i8) as i64,
                            (2, false) => (v as u16) as i64,
                            _ => (v as i16) as i64,
                        };
                        self.mov_imm64(buf, work, v);
                    }
                    Operand::Reg(s) => {
                        let mut s = self.hw(s);
                        if width == 1 && !self.x64 && s >= 4 {
                            // No byte form for esi/edi/ebp: stage in ebx.
                            self.mov_rr(buf, false, RBX, s);
                            s = RBX;
                        }
                        let opc: &[u8] = match (width, signed) {
                            (1, false) => &[0x0f, 0xb6],
                            (1, true) => &[0x0f, 0xbe],
                            (2, false) => &[0x0f, 0xb7],
                            _ => &[0x0f, 0xbf],
                        };
                        emit_ins(buf, self.x64, false, w, opc, work, Rm::Reg(s), ImmPart::None);
                    }
                    Operand::Mem(m) => {
                        let rm = self.lower_mem(buf, &m)?;
                        let opc: &[u8] = match (width, signed) {
                            (1, false) => &[0x0f, 0xb6],
                            (1, true) => &[0x0f, 0xbe],
                            (2, false) => &[0x0f, 0xb7],
                            _ => &[0x0f, 0xbf],
                        };
                        emit_ins(buf, self.x64, false, w, opc, work, rm, ImmPart::None);
                    }
                }
                if let Operand::Mem(dm) = dst {
                    // Narrow store of the working register.
                    let rm = self.lower_mem(buf, &dm)?;
                    match width {
                        1 => emit_ins(buf, self.x64, false, false, &[0x88], work, rm, ImmPart::None),
                        2 => emit_ins(buf, self.x64, true, false, &[0x89], work, rm, ImmPart::None),
                        _ => unreachable!(),
                    }
                }
            }
            Op1::Not | Op1::Neg => {
                let digit = if op == Op1::Not { 2 } else { 3 };
                // `not` leaves the flags alone; a zero request forces the
                // result through a register so it can be re-tested.
                let needs_test = op == Op1::Not && mods.set_z;
                if dst == src && !needs_test {
                    // Operate on the r/m in place.
                    let rm = match dst {
                        Operand::Reg(d) => Rm::Reg(self.hw(d)),
                        Operand::Mem(m) => self.lower_mem(buf, &m)?,
                        Operand::Imm(_) => return Err(Error::BadArgument),
                    };
                    emit_ins(buf, self.x64, false, w, &[0xf7], digit, rm, ImmPart::None);
                } else {
                    let work = match dst {
                        Operand::Reg(d) => self.hw(d),
                        _ => self.tmp0(),
                    };
                    self.load_operand(buf, work, src, w)?;
                    emit_ins(buf, self.x64, false, w, &[0xf7], digit, Rm::Reg(work), ImmPart::None);
                    if needs_test {
                        emit_ins(buf, self.x64, false, w, &[0x85], work, Rm::Reg(work), ImmPart::None);
                    }
                    if let Operand::Mem(dm) = dst {
                        let rm = self.lower_mem(buf, &dm)?;
                        self.store(buf, w, work, rm);
                    }
                }
            }
            Op1::Clz => {
                let work = self.tmp0();
                let srm = match src {
                    Operand::Reg(s) => Rm::Reg(self.hw(s)),
                    Operand::Mem(m) => self.lower_mem(buf, &m)?,
                    Operand::Imm(v) => {
                        self.mov_imm64(buf, work, v);
                        Rm::Reg(work)
                    }
                };
                let bits: i64 = if w { 64 } else { 32 };
                // bsr work, src
                emit_ins(buf, self.x64, false, w, &[0x0f, 0xbd], work, srm, ImmPart::None);
                // jnz over the zero-input fixup
                let fixup_len: u8 = if self.x64 { 7 } else { 6 };
                buf.put1(0x75);
                buf.put1(fixup_len);
                // mov work, 2*bits - 1  (so the xor below yields `bits`)
                emit_ins(
                    buf,
                    self.x64,
                    false,
                    w,
                    &[0xc7],
                    0,
                    Rm::Reg(work),
                    ImmPart::I32((2 * bits - 1) as i32),
                );
                // xor work, bits - 1
                self.alu_rm_imm(buf, Op2::Xor, w, Rm::Reg(work), (bits - 1) as i32);
                match dst {
                    Operand::Reg(d) => self.mov_rr(buf, w, self.hw(d), work),
                    Operand::Mem(dm) => {
                        let rm = self.lower_mem(buf, &dm)?;
                        self.store(buf, w, work, rm);
                    }
                    Operand::Imm(_) => return Err(Error::BadArgument),
                }
            }
        }
        Ok(())
    }

    fn op2(
        &mut self,
        buf: &mut CodeBuffer,
        op: Op2,
        mods: Mods,
        dst: Option<Operand>,
        src1: Operand,
        src2: Operand,
    ) -> CodegenResult<()> {
        let w = self.rex_w(mods);
        match op {
            Op2::Shl | Op2::Lshr | Op2::Ashr => return self.shift(buf, op, w, dst, src1, src2),
            Op2::Mul => return self.mul(buf, w, mods, dst, src1, src2),
            _ => {}
        }

        if dst.is_none() {
            // Pure flag ops: sub becomes cmp, and becomes test.
            match op {
                Op2::Sub => return self.cmp_like(buf, w, 0x39, 0x3b, 7, src1, src2),
                Op2::And => return self.test_like(buf, w, src1, src2),
                _ => {
                    let work = self.tmp0();
                    self.load_operand(buf, work, src1, w)?;
                    self.alu_into(buf, op, w, work, src2)?;
                    return Ok(());
                }
            }
        }
        let dst = dst.unwrap();

        // In-place forms: alu rm, src2 when dst aliases src1.
        if dst == src1 {
            match (dst, src2) {
                (Operand::Reg(d), _) => {
                    self.alu_into(buf, op, w, self.hw(d), src2)?;
                    return Ok(());
                }
                (Operand::Mem(dm), Operand::Reg(s2)) => {
                    let rm = self.lower_mem(buf, &dm)?;
                    self.alu_rm_r(buf, op, w, rm, self.hw(s2));
                    return Ok(());
                }
                (Operand::Mem(dm), Operand::Imm(v)) if fits_i32(v) => {
                    let rm = self.lower_mem(buf, &dm)?;
                    self.alu_rm_imm(buf, op, w, rm, v as i32);
                    return Ok(());
                }
                _ => {}
            }
        }
        if op.is_commutative() && dst == src2 {
            return self.op2(buf, op, mods, Some(dst), src2, src1);
        }

        // General form: work = src1; work op= src2; dst = work.
        let work = match dst {
            Operand::Reg(d) if src2 != dst => self.hw(d),
            _ => self.tmp0(),
        };
        self.load_operand(buf, work, src1, w)?;
        self.alu_into(buf, op, w, work, src2)?;
        match dst {
            Operand::Reg(d) => {
                if self.hw(d) != work {
                    self.mov_rr(buf, w, self.hw(d), work);
                }
            }
            Operand::Mem(dm) => {
                let rm = self.lower_mem(buf, &dm)?;
                self.store(buf, w, work, rm);
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fop1(
        &mut self,
        buf: &mut CodeBuffer,
        op: FOp1,
        dst: FOperand,
        src: FOperand,
    ) -> CodegenResult<()> {
        match op {
            FOp1::Mov => match (dst, src) {
                (FOperand::Reg(d), FOperand::Reg(s)) => {
                    if d != s {
                        self.sse(buf, 0xf2, 0x10, self.fhw(d), Rm::Reg(self.fhw(s)));
                    }
                }
                (FOperand::Reg(d), FOperand::Mem(m)) => {
                    let rm = self.lower_fmem(buf, &m)?;
                    self.sse(buf, 0xf2, 0x10, self.fhw(d), rm);
                }
                (FOperand::Mem(m), FOperand::Reg(s)) => {
                    let rm = self.lower_fmem(buf, &m)?;
                    self.sse(buf, 0xf2, 0x11, self.fhw(s), rm);
                }
                (FOperand::Mem(dm), FOperand::Mem(_)) => {
                    let s = self.load_foperand(buf, Self::FTMP, src)?;
                    let rm = self.lower_fmem(buf, &dm)?;
                    self.sse(buf, 0xf2, 0x11, s, rm);
                }
            },
            FOp1::Neg | FOp1::Abs => {
                let (mask, opcode) = if op == FOp1::Neg {
                    (&FNEG_MASK, 0x57) // xorpd
                } else {
                    (&FABS_MASK, 0x54) // andpd
                };
                let work = match dst {
                    FOperand::Reg(d) => self.fhw(d),
                    FOperand::Mem(_) => Self::FTMP,
                };
                let s = self.load_foperand(buf, work, src)?;
                if s != work {
                    self.sse(buf, 0xf2, 0x10, work, Rm::Reg(s));
                }
                let rm = self.mask_rm(buf, mask);
                buf.put1(0x66);
                emit_ins(buf, self.x64, false, false, &[0x0f, opcode], work, rm, ImmPart::None);
                if let FOperand::Mem(dm) = dst {
                    let rm = self.lower_fmem(buf, &dm)?;
                    self.sse(buf, 0xf2, 0x11, work, rm);
                }
            }
            FOp1::Cmp => {
                // ucomisd dst, src (dst is the left comparand).
                let a = self.load_foperand(buf, Self::FTMP, dst)?;
                let rm = match src {
                    FOperand::Reg(s) => Rm::Reg(self.fhw(s)),
                    FOperand::Mem(m) => self.lower_fmem(buf, &m)?,
                };
                buf.put1(0x66);
                emit_ins(buf, self.x64, false, false, &[0x0f, 0x2e], a, rm, ImmPart::None);
            }
        }
        Ok(())
    }

    fn fop2(
        &mut self,
        buf: &mut CodeBuffer,
        op: FOp2,
        dst: FOperand,
        src1: FOperand,
        src2: FOperand,
    ) -> CodegenResult<()> {
        let opcode = match op {
            FOp2::Add => 0x58,
            FOp2::Sub => 0x5c,
            FOp2::Mul => 0x59,
            FOp2::Div => 0x5e,
        };
        let commutative = matches!(op, FOp2::Add | FOp2::Mul);
        // Pick the working register.
        let work = match dst {
            FOperand::Reg(d) if FOperand::Reg(d) != src2 || commutative || src1 == dst => {
                self.fhw(d)
            }
            _ => Self::FTMP,
        };
        if commutative && dst == src2 && src1 != dst {
            return self.fop2(buf, op, dst, src2, src1);
        }
        match src1 {
            FOperand::Reg(s) if self.fhw(s) == work => {}
            _ => {
                let s = self.load_foperand(buf, work, src1)?;
                if s != work {
                    self.sse(buf, 0xf2, 0x10, work, Rm::Reg(s));
                }
            }
        }
        let rm = match src2 {
            FOperand::Reg(s) => Rm::Reg(self.fhw(s)),
            FOperand::Mem(m) => self.lower_fmem(buf, &m)?,
        };
        self.sse(buf, 0xf2, opcode, work, rm);
        match dst {
            FOperand::Reg(d) => {
                if self.fhw(d) != work {
                    self.sse(buf, 0xf2, 0x10, self.fhw(d), Rm::Reg(work));
                }
            }
            FOperand::Mem(dm) => {
                let rm = self.lower_fmem(buf, &dm)?;
                self.sse(buf, 0xf2, 0x11, work, rm);
            }
        }
        Ok(())
    }

    fn op_flags(
        &mut self,
        buf: &mut CodeBuffer,
        op: FlagsOp,
        dst: Operand,
        cc: CondCode,
    ) -> CodegenResult<()> {
        self.set_cc_tmp(buf, cc_nibble(cc));
        let w = self.x64;
        let t = self.tmp0();
        match (op, dst) {
            (FlagsOp::Mov, Operand::Reg(d)) => self.mov_rr(buf, w, self.hw(d), t),
            (FlagsOp::Mov, Operand::Mem(dm)) => {
                let rm = self.lower_mem(buf, &dm)?;
                self.store(buf, w, t, rm);
            }
            (FlagsOp::Or, Operand::Reg(d)) => {
                self.alu_r_rm(buf, Op2::Or, w, self.hw(d), Rm::Reg(t))
            }
            (FlagsOp::Or, Operand::Mem(dm)) => {
                let rm = self.lower_mem(buf, &dm)?;
                self.alu_rm_r(buf, Op2::Or, w, rm, t);
            }
            _ => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fast_enter(&mut self, buf: &mut CodeBuffer, dst: Operand) -> CodegenResult<()> {
        match dst {
            Operand::Reg(d) => self.pop(buf, self.hw(d)),
            Operand::Mem(m) => {
                let rm = self.lower_mem(buf, &m)?;
                emit_ins(buf, self.x64, false, false, &[0x8f], 0, rm, ImmPart::None);
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fast_return(&mut self, buf: &mut CodeBuffer, src: Operand) -> CodegenResult<()> {
        match src {
            Operand::Reg(s) => self.push(buf, self.hw(s)),
            Operand::Mem(m) => {
                let rm = self.lower_mem(buf, &m)?;
                emit_ins(buf, self.x64, false, false, &[0xff], 6, rm, ImmPart::None);
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        buf.put1(0xc3);
        Ok(())
    }

    fn add_no_flags(&mut self, buf: &mut CodeBuffer, reg: Reg, disp: i64) -> CodegenResult<()> {
        if !fits_i32(disp) {
            return Err(Error::BadArgument);
        }
        let r = self.hw(reg);
        // lea r, [r + disp] keeps the flags untouched.
        emit_ins(
            buf,
            self.x64,
            false,
            self.x64,
            &[0x8d],
            r,
            Rm::Mem {
                base: Some(r),
                index: None,
                disp: disp as i32,
            },
            ImmPart::None,
        );
        Ok(())
    }

    fn jump(&mut self, buf: &mut CodeBuffer, ty: JumpType) -> CodegenResult<Jump> {
        if let JumpKind::Call(n) = ty.kind {
            self.shuffle_call_args(buf, n)?;
        }
        let data = JumpData {
            kind: ty.kind,
            rewritable: ty.rewritable,
            target: JumpTarget::Unset,
            hint: 0,
            delay: None,
        };
        let reserved = *self.jump_encodings(&data).last().unwrap();
        let jump = buf.add_jump(data, reserved);
        // cdecl call cleanup happens after the call returns.
        if let JumpKind::Call(n) = ty.kind {
            let cleanup = self.call_arg_cleanup(n);
            if cleanup != 0 {
                self.add_sp(buf, cleanup);
            }
        }
        Ok(jump)
    }

    fn ijump(&mut self, buf: &mut CodeBuffer, ty: JumpType, src: Operand) -> CodegenResult<()> {
        let is_call = matches!(ty.kind, JumpKind::Call(_) | JumpKind::FastCall);
        if let Operand::Imm(target) = src {
            // Fixed-target jump: route through the relocation machinery.
            if let JumpKind::Call(n) = ty.kind {
                self.shuffle_call_args(buf, n)?;
            }
            let data = JumpData {
                kind: ty.kind,
                rewritable: false,
                target: JumpTarget::Addr(target as u64),
                hint: 0,
                delay: None,
            };
            let reserved = *self.jump_encodings(&data).last().unwrap();
            buf.add_jump(data, reserved);
            if let JumpKind::Call(n) = ty.kind {
                let cleanup = self.call_arg_cleanup(n);
                if cleanup != 0 {
                    self.add_sp(buf, cleanup);
                }
            }
            return Ok(());
        }
        if let JumpKind::Call(n) = ty.kind {
            // The shuffle may clobber the operand: stage the target first.
            self.load_operand(buf, self.tmp0(), src, self.x64)?;
            self.shuffle_call_args(buf, n)?;
            emit_ins(buf, self.x64, false, false, &[0xff], 2, Rm::Reg(self.tmp0()), ImmPart::None);
            let cleanup = self.call_arg_cleanup(n);
            if cleanup != 0 {
                self.add_sp(buf, cleanup);
            }
            return Ok(());
        }
        let digit = if is_call { 2 } else { 4 };
        let rm = match src {
            Operand::Reg(s) => Rm::Reg(self.hw(s)),
            Operand::Mem(m) => self.lower_mem(buf, &m)?,
            Operand::Imm(_) => unreachable!(),
        };
        emit_ins(buf, self.x64, false, false, &[0xff], digit, rm, ImmPart::None);
        Ok(())
    }

    fn const_(
        &mut self,
        buf: &mut CodeBuffer,
        dst: Option<Operand>,
        init: i64,
    ) -> CodegenResult<Const> {
        let dst = dst.ok_or(Error::BadArgument)?;
        let konst;
        if self.x64 {
            let work = match dst {
                Operand::Reg(d) => self.hw(d),
                _ => self.tmp0(),
            };
            // Always the full movabs form so the value stays patchable.
            buf.put1(0x48 | if work >= 8 { 0x01 } else { 0x00 });
            buf.put1(0xb8 + (work & 7));
            buf.put8(init as u64);
            konst = buf.add_const(8);
            if let Operand::Mem(dm) = dst {
                let rm = self.lower_mem(buf, &dm)?;
                self.store(buf, true, work, rm);
            }
        } else {
            match dst {
                Operand::Reg(d) => {
                    buf.put1(0xb8 + (self.hw(d) & 7));
                    buf.put4(init as u32);
                    konst = buf.add_const(4);
                }
                Operand::Mem(dm) => {
                    let rm = self.lower_mem(buf, &dm)?;
                    emit_ins(buf, false, false, false, &[0xc7], 0, rm, ImmPart::I32(init as i32));
                    konst = buf.add_const(4);
                }
                Operand::Imm(_) => return Err(Error::BadArgument),
            }
        }
        Ok(konst)
    }

    // ---- layout ---------------------------------------------------------

    fn jump_encodings(&self, jump: &JumpData) -> &'static [u32] {
        let label = matches!(jump.target, JumpTarget::Label(_));
        let cond = matches!(jump.kind, JumpKind::Cond(_) | JumpKind::FCond(_));
        if label && !jump.rewritable {
            match jump.kind {
                JumpKind::Cond(_) | JumpKind::FCond(_) => &[2, 6],
                JumpKind::Jump => &[2, 5],
                JumpKind::Call(_) | JumpKind::FastCall => &[5],
            }
        } else if self.x64 {
            if cond {
                &[15]
            } else {
                &[13]
            }
        } else {
            // rel32 always reaches in a 32-bit address space.
            if cond {
                &[6]
            } else {
                &[5]
            }
        }
    }

    fn jump_needed_size(
        &self,
        jump: &JumpData,
        at: CodeOffset,
        target: Option<CodeOffset>,
    ) -> u32 {
        let encodings = self.jump_encodings(jump);
        if encodings.len() == 1 {
            return encodings[0];
        }
        let target = match target {
            Some(t) => t,
            None => return *encodings.last().unwrap(),
        };
        let short = encodings[0];
        let disp = i64::from(target) - (i64::from(at) + i64::from(short));
        if fits_i8(disp) {
            short
        } else {
            *encodings.last().unwrap()
        }
    }

    fn emit_jump(
        &self,
        jump: &JumpData,
        size: u32,
        at: CodeOffset,
        target: Option<CodeOffset>,
        sink: &mut CodeSink,
    ) -> CodeOffset {
        let cc = self.cc_of_jump(jump.kind);
        let label = matches!(jump.target, JumpTarget::Label(_));
        if label && !jump.rewritable {
            let target = target.unwrap();
            let disp = i64::from(target) - (i64::from(at) + i64::from(size));
            match jump.kind {
                JumpKind::Cond(_) | JumpKind::FCond(_) => {
                    if size == 2 {
                        sink.put1(0x70 + cc.unwrap());
                        sink.put1(disp as u8);
                        return at + 1;
                    }
                    sink.put1(0x0f);
                    sink.put1(0x80 + cc.unwrap());
                    sink.put4(disp as u32);
                    return at + 2;
                }
                JumpKind::Jump => {
                    if size == 2 {
                        sink.put1(0xeb);
                        sink.put1(disp as u8);
                        return at + 1;
                    }
                    sink.put1(0xe9);
                    sink.put4(disp as u32);
                    return at + 1;
                }
                JumpKind::Call(_) | JumpKind::FastCall => {
                    sink.put1(0xe8);
                    sink.put4(disp as u32);
                    return at + 1;
                }
            }
        }

        // Long form: patchable target.
        let fix_target = match jump.target {
            JumpTarget::Label(_) => FixTarget::Offset(target.unwrap()),
            JumpTarget::Addr(a) => FixTarget::Addr(a),
            JumpTarget::Unset => FixTarget::Addr(0),
        };
        if self.x64 {
            let mut site = at + 2;
            if let Some(cc) = cc {
                // Inverted short branch over the absolute jump.
                sink.put1(0x70 + (cc ^ 1));
                sink.put1(13);
                site = at + 4;
            }
            // movabs r10, target
            sink.put1(0x49);
            sink.put1(0xba);
            sink.fixup(FixupKind::Abs64, fix_target);
            sink.put8(match fix_target {
                FixTarget::Addr(a) => a,
                _ => 0,
            });
            // jmp/call r10
            sink.put1(0x41);
            sink.put1(0xff);
            let is_call = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
            sink.put1(if is_call { 0xd2 } else { 0xe2 });
            site
        } else {
            let site;
            match jump.kind {
                JumpKind::Cond(_) | JumpKind::FCond(_) => {
                    sink.put1(0x0f);
                    sink.put1(0x80 + cc.unwrap());
                    site = at + 2;
                }
                JumpKind::Jump => {
                    sink.put1(0xe9);
                    site = at + 1;
                }
                JumpKind::Call(_) | JumpKind::FastCall => {
                    sink.put1(0xe8);
                    site = at + 1;
                }
            }
            match fix_target {
                FixTarget::Offset(t) => {
                    // Label targets stay image-relative; write directly.
                    let disp = i64::from(t) - (i64::from(site) + 4);
                    sink.put4(disp as u32);
                }
                FixTarget::Addr(_) => {
                    sink.fixup(FixupKind::X86Rel32, fix_target);
                    sink.put4(0);
                }
                FixTarget::Jump(_) => unreachable!(),
            }
            site
        }
    }

    fn pad_to(&self, target: CodeOffset, sink: &mut CodeSink) {
        while sink.cur_offset() < target {
            sink.put1(0x90);
        }
    }
}

impl X86Backend {
    /// `work op= src2` where work is a native register.
    fn alu_into(&self, buf: &mut CodeBuffer, op: Op2, w: bool, work: u8, src2: Operand) -> CodegenResult<()> {
        match src2 {
            Operand::Reg(s) => self.alu_r_rm(buf, op, w, work, Rm::Reg(self.hw(s))),
            Operand::Mem(m) => {
                let rm = self.lower_mem(buf, &m)?;
                self.alu_r_rm(buf, op, w, work, rm);
            }
            Operand::Imm(v) => {
                if fits_i32(v) {
                    self.alu_rm_imm(buf, op, w, Rm::Reg(work), v as i32);
                } else {
                    debug_assert!(work != self.tmp1());
                    self.mov_imm64(buf, self.tmp1(), v);
                    self.alu_r_rm(buf, op, w, work, Rm::Reg(self.tmp1()));
                }
            }
        }
        Ok(())
    }

    /// `cmp src1, src2` without a destination.
    fn cmp_like(
        &self,
        buf: &mut CodeBuffer,
        w: bool,
        rm_r: u8,
        r_rm: u8,
        digit: u8,
        src1: Operand,
        src2: Operand,
    ) -> CodegenResult<()> {
        match (src1, src2) {
            (Operand::Reg(a), Operand::Reg(b)) => {
                emit_ins(buf, self.x64, false, w, &[rm_r], self.hw(b), Rm::Reg(self.hw(a)), ImmPart::None);
            }
            (Operand::Reg(a), Operand::Imm(v)) if fits_i32(v) => {
                let imm = if fits_i8(v) {
                    ImmPart::I8(v as i8)
                } else {
                    ImmPart::I32(v as i32)
                };
                let opc = if fits_i8(v) { 0x83 } else { 0x81 };
                emit_ins(buf, self.x64, false, w, &[opc], digit, Rm::Reg(self.hw(a)), imm);
            }
            (Operand::Reg(a), Operand::Mem(m)) => {
                let rm = self.lower_mem(buf, &m)?;
                emit_ins(buf, self.x64, false, w, &[r_rm], self.hw(a), rm, ImmPart::None);
            }
            (Operand::Mem(m), Operand::Reg(b)) => {
                let rm = self.lower_mem(buf, &m)?;
                emit_ins(buf, self.x64, false, w, &[rm_r], self.hw(b), rm, ImmPart::None);
            }
            (Operand::Mem(m), Operand::Imm(v)) if fits_i32(v) => {
                let rm = self.lower_mem(buf, &m)?;
                let imm = if fits_i8(v) {
                    ImmPart::I8(v as i8)
                } else {
                    ImmPart::I32(v as i32)
                };
                let opc = if fits_i8(v) { 0x83 } else { 0x81 };
                emit_ins(buf, self.x64, false, w, &[opc], digit, rm, imm);
            }
            _ => {
                let work = self.tmp0();
                self.load_operand(buf, work, src1, w)?;
                match src2 {
                    Operand::Imm(v) => {
                        self.mov_imm64(buf, self.tmp1(), v);
                        emit_ins(buf, self.x64, false, w, &[rm_r], self.tmp1(), Rm::Reg(work), ImmPart::None);
                    }
                    _ => {
                        let rm = match src2 {
                            Operand::Reg(b) => Rm::Reg(self.hw(b)),
                            Operand::Mem(m) => self.lower_mem(buf, &m)?,
                            Operand::Imm(_) => unreachable!(),
                        };
                        emit_ins(buf, self.x64, false, w, &[r_rm], work, rm, ImmPart::None);
                    }
                }
            }
        }
        Ok(())
    }

    /// `test src1, src2` without a destination.
    fn test_like(&self, buf: &mut CodeBuffer, w: bool, src1: Operand, src2: Operand) -> CodegenResult<()> {
        match (src1, src2) {
            (Operand::Reg(a), Operand::Reg(b)) => {
                emit_ins(buf, self.x64, false, w, &[0x85], self.hw(b), Rm::Reg(self.hw(a)), ImmPart::None);
            }
            (Operand::Reg(a), Operand::Imm(v)) if fits_i32(v) => {
                emit_ins(buf, self.x64, false, w, &[0xf7], 0, Rm::Reg(self.hw(a)), ImmPart::I32(v as i32));
            }
            (Operand::Mem(m), Operand::Reg(b)) => {
                let rm = self.lower_mem(buf, &m)?;
                emit_ins(buf, self.x64, false, w, &[0x85], self.hw(b), rm, ImmPart::None);
            }
            (Operand::Mem(m), Operand::Imm(v)) if fits_i32(v) => {
                let rm = self.lower_mem(buf, &m)?;
                emit_ins(buf, self.x64, false, w, &[0xf7], 0, rm, ImmPart::I32(v as i32));
            }
            _ => {
                let work = self.tmp0();
                self.load_operand(buf, work, src1, w)?;
                match src2 {
                    Operand::Reg(b) => {
                        emit_ins(buf, self.x64, false, w, &[0x85], self.hw(b), Rm::Reg(work), ImmPart::None);
                    }
                    Operand::Imm(v) if fits_i32(v) => {
                        emit_ins(buf, self.x64, false, w, &[0xf7], 0, Rm::Reg(work), ImmPart::I32(v as i32));
                    }
                    Operand::Imm(v) => {
                        self.mov_imm64(buf, self.tmp1(), v);
                        emit_ins(buf, self.x64, false, w, &[0x85], self.tmp1(), Rm::Reg(work), ImmPart::None);
                    }
                    Operand::Mem(m) => {
                        let rm = self.lower_mem(buf, &m)?;
                        emit_ins(buf, self.x64, false, w, &[0x85], work, rm, ImmPart::None);
                    }
                }
            }
        }
        Ok(())
    }

    fn shift(
        &mut self,
        buf: &mut CodeBuffer,
        op: Op2,
        w: bool,
        dst: Option<Operand>,
        src1: Operand,
        src2: Operand,
    ) -> CodegenResult<()> {
        let digit = match op {
            Op2::Shl => 4,
            Op2::Lshr => 5,
            Op2::Ashr => 7,
            _ => unreachable!(),
        };
        // A missing destination still computes (for the flags) into the
        // temporary without touching the register file.
        let discard = dst.is_none();
        let dst = dst.unwrap_or(Operand::Reg(crate::operand::r(0)));
        if let Operand::Imm(count) = src2 {
            let count = (count as u8) & if w { 63 } else { 31 };
            // work = src1; shift work, imm; dst = work.
            let work = match dst {
                Operand::Reg(d) if !discard => self.hw(d),
                _ => self.tmp0(),
            };
            self.load_operand(buf, work, src1, w)?;
            if count == 1 {
                emit_ins(buf, self.x64, false, w, &[0xd1], digit, Rm::Reg(work), ImmPart::None);
            } else if count != 0 {
                emit_ins(buf, self.x64, false, w, &[0xc1], digit, Rm::Reg(work), ImmPart::I8(count as i8));
            }
            if let Operand::Mem(dm) = dst {
                let rm = self.lower_mem(buf, &dm)?;
                self.store(buf, w, work, rm);
            }
            return Ok(());
        }

        // Variable count: it must live in cl.
        let count_in_ecx = src2 == Operand::Reg(crate::operand::r(1));
        let dst_is_ecx = !discard && dst == Operand::Reg(crate::operand::r(1));
        let work = match dst {
            Operand::Reg(d) if !discard && !dst_is_ecx && dst != src2 => self.hw(d),
            _ => self.tmp0(),
        };
        self.load_operand(buf, work, src1, w)?;
        debug_assert!(work != RCX);
        if count_in_ecx {
            emit_ins(buf, self.x64, false, w, &[0xd3], digit, Rm::Reg(work), ImmPart::None);
        } else if dst_is_ecx {
            // The old rcx dies anyway; no save needed.
            self.load_operand(buf, RCX, src2, false)?;
            emit_ins(buf, self.x64, false, w, &[0xd3], digit, Rm::Reg(work), ImmPart::None);
        } else {
            self.push(buf, RCX);
            // The push moved the stack pointer; compensate sp-relative
            // count operands.
            let word = if self.x64 { 8 } else { 4 };
            let count = match src2 {
                Operand::Mem(mut m) if m.base == Some(crate::operand::sp()) => {
                    m.disp += word;
                    Operand::Mem(m)
                }
                other => other,
            };
            self.load_operand(buf, RCX, count, false)?;
            emit_ins(buf, self.x64, false, w, &[0xd3], digit, Rm::Reg(work), ImmPart::None);
            self.pop(buf, RCX);
        }
        if discard {
            return Ok(());
        }
        match dst {
            Operand::Reg(d) => {
                if self.hw(d) != work {
                    self.mov_rr(buf, w, self.hw(d), work);
                }
            }
            Operand::Mem(dm) => {
                let rm = self.lower_mem(buf, &dm)?;
                self.store(buf, w, work, rm);
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn mul(
        &mut self,
        buf: &mut CodeBuffer,
        w: bool,
        mods: Mods,
        dst: Option<Operand>,
        src1: Operand,
        src2: Operand,
    ) -> CodegenResult<()> {
        let discard = dst.is_none();
        let dst = dst.unwrap_or(Operand::Reg(crate::operand::r(0)));
        let work = match dst {
            Operand::Reg(d) if !discard && dst != src2 => self.hw(d),
            _ => self.tmp0(),
        };
        self.load_operand(buf, work, src1, w)?;
        match src2 {
            Operand::Reg(s) => {
                emit_ins(buf, self.x64, false, w, &[0x0f, 0xaf], work, Rm::Reg(self.hw(s)), ImmPart::None);
            }
            Operand::Mem(m) => {
                let rm = self.lower_mem(buf, &m)?;
                emit_ins(buf, self.x64, false, w, &[0x0f, 0xaf], work, rm, ImmPart::None);
            }
            Operand::Imm(v) if fits_i32(v) => {
                // imul work, work, imm32
                emit_ins(buf, self.x64, false, w, &[0x69], work, Rm::Reg(work), ImmPart::I32(v as i32));
            }
            Operand::Imm(v) => {
                self.mov_imm64(buf, self.tmp1(), v);
                emit_ins(buf, self.x64, false, w, &[0x0f, 0xaf], work, Rm::Reg(self.tmp1()), ImmPart::None);
            }
        }
        if mods.set_z {
            // imul leaves ZF undefined.
            emit_ins(buf, self.x64, false, w, &[0x85], work, Rm::Reg(work), ImmPart::None);
        }
        if discard {
            return Ok(());
        }
        match dst {
            Operand::Reg(d) => {
                if self.hw(d) != work {
                    self.mov_rr(buf, w, self.hw(d), work);
                }
            }
            Operand::Mem(dm) => {
                let rm = self.lower_mem(buf, &dm)?;
                self.store(buf, w, work, rm);
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::abi::ArgTypes;
    use crate::operand::{fr, r, s, sp};

    fn emit64(f: impl FnOnce(&mut X86Backend, &mut CodeBuffer)) -> Vec<u8> {
        let mut backend = X86Backend::new(true);
        let mut buf = CodeBuffer::new();
        f(&mut backend, &mut buf);
        buf.finalize(&mut backend).unwrap().code().to_vec()
    }

    fn emit32(f: impl FnOnce(&mut X86Backend, &mut CodeBuffer)) -> Vec<u8> {
        let mut backend = X86Backend::new(false);
        let mut buf = CodeBuffer::new();
        f(&mut backend, &mut buf);
        buf.finalize(&mut backend).unwrap().code().to_vec()
    }

    #[test]
    fn mov_reg_reg() {
        let code = emit64(|b, buf| {
            b.op1(buf, Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(r(1)))
                .unwrap();
        });
        assert_eq!(code, vec![0x48, 0x8b, 0xc1]);
        let code = emit32(|b, buf| {
            b.op1(buf, Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(r(1)))
                .unwrap();
        });
        assert_eq!(code, vec![0x8b, 0xc1]);
    }

    #[test]
    fn add_imm8_in_place() {
        let code = emit64(|b, buf| {
            b.op2(
                buf,
                Op2::Add,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Reg(r(0)),
                Operand::Imm(100),
            )
            .unwrap();
        });
        assert_eq!(code, vec![0x48, 0x83, 0xc0, 0x64]);
    }

    #[test]
    fn add_three_regs() {
        let code = emit64(|b, buf| {
            b.op2(
                buf,
                Op2::Add,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Reg(r(1)),
                Operand::Reg(r(2)),
            )
            .unwrap();
        });
        // mov rax, rcx; add rax, rdx
        assert_eq!(code, vec![0x48, 0x8b, 0xc1, 0x48, 0x03, 0xc2]);
    }

    #[test]
    fn store_to_frame() {
        let code = emit64(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Mem(Mem::base(sp(), 8))),
                Operand::Reg(r(0)),
            )
            .unwrap();
        });
        assert_eq!(code, vec![0x48, 0x89, 0x44, 0x24, 0x08]);
    }

    #[test]
    fn scaled_index_load() {
        let code = emit64(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Mem(Mem::base_index_shift(s(0), r(1), 3, 0)),
            )
            .unwrap();
        });
        // mov rax, [rbx + rcx*8]
        assert_eq!(code, vec![0x48, 0x8b, 0x04, 0xcb]);
    }

    #[test]
    fn movzx_byte_load() {
        let code = emit64(|b, buf| {
            b.op1(
                buf,
                Op1::MovU8,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Mem(Mem::base(s(0), 0)),
            )
            .unwrap();
        });
        assert_eq!(code, vec![0x48, 0x0f, 0xb6, 0x03]);
    }

    #[test]
    fn flags_materialize() {
        let code = emit64(|b, buf| {
            b.op_flags(buf, FlagsOp::Mov, Operand::Reg(r(0)), CondCode::Equal)
                .unwrap();
        });
        // sete r10b; movzx r10d, r10b; mov rax, r10
        assert_eq!(
            code,
            vec![0x41, 0x0f, 0x94, 0xc2, 0x45, 0x0f, 0xb6, 0xd2, 0x49, 0x8b, 0xc2]
        );
    }

    #[test]
    fn const_is_movabs() {
        let code = emit64(|b, buf| {
            b.const_(buf, Some(Operand::Reg(r(0))), 1234).unwrap();
        });
        let mut expect = vec![0x48, 0xb8];
        expect.extend_from_slice(&1234u64.to_le_bytes());
        assert_eq!(code, expect);
    }

    #[test]
    fn ucomisd_and_addsd() {
        let code = emit64(|b, buf| {
            b.fop1(buf, FOp1::Cmp, FOperand::Reg(fr(0)), FOperand::Reg(fr(1)))
                .unwrap();
            b.fop2(
                buf,
                FOp2::Add,
                FOperand::Reg(fr(0)),
                FOperand::Reg(fr(0)),
                FOperand::Reg(fr(1)),
            )
            .unwrap();
        });
        assert_eq!(code, vec![0x66, 0x0f, 0x2e, 0xc1, 0xf2, 0x0f, 0x58, 0xc1]);
    }

    #[test]
    fn prologue_64() {
        let abi = AbiProfile {
            args: ArgTypes::words(3),
            scratches: 3,
            saveds: 3,
            fscratches: 0,
            fsaveds: 0,
            local_size: 16,
        };
        let code = emit64(|b, buf| {
            b.enter(buf, &abi).unwrap();
        });
        #[cfg(not(windows))]
        assert_eq!(
            code,
            vec![
                0x53, // push rbx
                0x41, 0x54, // push r12
                0x41, 0x55, // push r13
                0x48, 0x83, 0xec, 0x10, // sub rsp, 16
                0x48, 0x8b, 0xdf, // mov rbx, rdi
                0x4c, 0x8b, 0xe6, // mov r12, rsi
                0x4c, 0x8b, 0xea, // mov r13, rdx
            ]
        );
    }

    #[test]
    fn epilogue_64() {
        let abi = AbiProfile {
            args: ArgTypes::none(),
            scratches: 1,
            saveds: 0,
            fscratches: 0,
            fsaveds: 0,
            local_size: 0,
        };
        let code = emit64(|b, buf| {
            b.ret(buf, &abi, None).unwrap();
        });
        // add rsp, 8; ret  (8 bytes keep call sites 16-aligned)
        assert_eq!(code, vec![0x48, 0x83, 0xc4, 0x08, 0xc3]);
    }

    #[test]
    fn short_and_near_jump_selection() {
        // Forward conditional jump over 10 bytes: rel8 form.
        let mut backend = X86Backend::new(true);
        let mut buf = CodeBuffer::new();
        let j = backend
            .jump(&mut buf, JumpType::cond(CondCode::Equal))
            .unwrap();
        for _ in 0..10 {
            backend.op0(&mut buf, Op0::Nop).unwrap();
        }
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        assert_eq!(image.code()[0], 0x74);
        assert_eq!(image.code()[1], 10);
        assert_eq!(image.label_offset(l), 12);

        // Over 200 bytes: rel32 form.
        let mut backend = X86Backend::new(true);
        let mut buf = CodeBuffer::new();
        let j = backend
            .jump(&mut buf, JumpType::cond(CondCode::Equal))
            .unwrap();
        for _ in 0..200 {
            backend.op0(&mut buf, Op0::Nop).unwrap();
        }
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        assert_eq!(&image.code()[0..2], &[0x0f, 0x84]);
        assert_eq!(&image.code()[2..6], &200u32.to_le_bytes());
        assert_eq!(image.len(), 6 + 200);
    }

    #[test]
    fn rewritable_jump_relocates() {
        let mut backend = X86Backend::new(true);
        let mut buf = CodeBuffer::new();
        let j = backend
            .jump(&mut buf, JumpType::jump().rewritable())
            .unwrap();
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        // movabs r10, imm64; jmp r10
        assert_eq!(&image.code()[0..2], &[0x49, 0xba]);
        assert_eq!(&image.code()[10..13], &[0x41, 0xff, 0xe2]);
        assert_eq!(image.jump_offset(j), 2);
        let mut code = image.code().to_vec();
        image.relocate(0x1000, &mut code);
        let target = u64::from_le_bytes(code[2..10].try_into().unwrap());
        assert_eq!(target, 0x1000 + 13);
    }

    #[test]
    fn prologue_32_loads_stack_args() {
        let abi = AbiProfile {
            args: ArgTypes::words(3),
            scratches: 3,
            saveds: 3,
            fscratches: 0,
            fsaveds: 0,
            local_size: 0,
        };
        let code = emit32(|b, buf| {
            b.enter(buf, &abi).unwrap();
        });
        assert_eq!(
            code,
            vec![
                0x53, // push ebx (encoder temp)
                0x56, // push esi
                0x57, // push edi
                0x55, // push ebp
                0x83, 0xec, 0x0c, // sub esp, 12
                0x8b, 0x74, 0x24, 0x20, // mov esi, [esp+32]
                0x8b, 0x7c, 0x24, 0x24, // mov edi, [esp+36]
                0x8b, 0x6c, 0x24, 0x28, // mov ebp, [esp+40]
            ]
        );
    }

    #[test]
    fn shift_by_cl_saves_rcx() {
        let code = emit64(|b, buf| {
            b.op2(
                buf,
                Op2::Shl,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Reg(r(0)),
                Operand::Reg(r(2)),
            )
            .unwrap();
        });
        // push rcx; mov ecx, edx; shl rax, cl; pop rcx
        assert_eq!(
            code,
            vec![0x51, 0x8b, 0xca, 0x48, 0xd3, 0xe0, 0x59]
        );
    }
}
