//! PowerPC 32/64 ISA: binary code emission.
//!
//! Big-endian instruction words. Register map: `r0..r3` = r3..r6 (the
//! first three double as argument/return registers), `s0..s3` = r14..r17,
//! locals base = r1 (with the ABI-reserved area below the locals),
//! temporaries r11/r12 and r0 where the encoding allows.
//!
//! Direct label branches use `b`/`bc`; conditional branches grow to an
//! inverted-skip pair when the ±32 KiB `bc` field is exceeded. Rewritable
//! and absolute targets are materialized with `lis`/`ori` (plus the
//! `sldi`/`oris`/`ori` tail on 64-bit) into r12 and dispatched through
//! `mtctr`/`bctr`.

use crate::abi::AbiProfile;
use crate::buffer::{
    ByteSink, CodeBuffer, CodeOffset, CodeSink, Const, FixTarget, FixupKind, Jump, JumpData,
    JumpTarget,
};
use crate::condcodes::{CondCode, FloatCond};
use crate::isa::{Arch, Backend, IsaLimits};
use crate::lir::{FOp1, FOp2, FlagsOp, JumpKind, JumpType, Mods, Op0, Op1, Op2};
use crate::operand::{FOperand, FReg, Mem, Operand, Reg};
use crate::{CodegenResult, Error};

const R0: u8 = 0;
const SP: u8 = 1;
const TMP1: u8 = 11;
const TMP2: u8 = 12;
const FTMP: u8 = 0;
const FTMP2: u8 = 13;

/// Virtual-to-native map: r0..r3, s0..s3, sp.
const MAP: [u8; 9] = [3, 4, 5, 6, 14, 15, 16, 17, SP];

const NOP: u32 = 0x6000_0000; // ori r0, r0, 0

/// CR0 bit and sense for an integer predicate.
fn cr_bit(cc: CondCode) -> (u32, bool) {
    match cc {
        CondCode::Equal => (2, true),
        CondCode::NotEqual => (2, false),
        CondCode::Less | CondCode::SigLess => (0, true),
        CondCode::GreaterEqual | CondCode::SigGreaterEqual => (0, false),
        CondCode::Greater | CondCode::SigGreater => (1, true),
        CondCode::LessEqual | CondCode::SigLessEqual => (1, false),
        CondCode::Overflow => (3, true),
        CondCode::NotOverflow => (3, false),
        // Carry is synthesized into CR0.EQ before the branch (addze).
        CondCode::Carry => (2, false),
        CondCode::NotCarry => (2, true),
    }
}

/// CR0 bit, sense and an optional `cror` fold for a float predicate.
/// After `fcmpu` the bits are LT, GT, EQ, UN.
fn fcr_bit(cc: FloatCond) -> (u32, bool, Option<(u32, u32)>) {
    match cc {
        FloatCond::Equal => (2, true, None),
        FloatCond::NotEqual => (2, false, None),
        FloatCond::Less => (0, true, None),
        FloatCond::Greater => (1, true, None),
        // ge: !(LT | UN); le: !(GT | UN). Folded into CR1[0] (bit 4).
        FloatCond::GreaterEqual => (4, false, Some((0, 3))),
        FloatCond::LessEqual => (4, false, Some((1, 3))),
        FloatCond::Ordered => (3, false, None),
        FloatCond::Unordered => (3, true, None),
    }
}

fn enc_d(opcode: u32, rt: u8, ra: u8, imm16: u32) -> u32 {
    (opcode << 26) | (u32::from(rt) << 21) | (u32::from(ra) << 16) | (imm16 & 0xffff)
}

fn enc_x(rt: u8, ra: u8, rb: u8, xo: u32) -> u32 {
    (31 << 26) | (u32::from(rt) << 21) | (u32::from(ra) << 16) | (u32::from(rb) << 11) | (xo << 1)
}

/// sldi: rldicr rt, rs, sh, 63-sh (here only sh=32 is needed).
fn enc_sldi32(rt: u8, rs: u8) -> u32 {
    let sh = 32u32;
    let me = 31u32;
    (30 << 26)
        | (u32::from(rs) << 21)
        | (u32::from(rt) << 16)
        | ((sh & 31) << 11)
        | ((((me & 31) << 1) | (me >> 5)) << 5)
        | (1 << 2)
        | ((sh >> 5) << 1)
}

/// clrldi rt, rs, 32 (zero-extend low word).
fn enc_clrldi32(rt: u8, rs: u8) -> u32 {
    let mb = 32u32;
    (30 << 26)
        | (u32::from(rs) << 21)
        | (u32::from(rt) << 16)
        | ((((mb & 31) << 1) | (mb >> 5)) << 5)
}

pub(crate) struct PpcBackend {
    p64: bool,
    /// Offset of the local frame above r1 (reserved + save area below it).
    locals_off: u32,
}

impl PpcBackend {
    pub(crate) fn new(p64: bool) -> Self {
        PpcBackend {
            p64,
            locals_off: if p64 { 32 } else { 8 },
        }
    }

    fn hw(&self, r: Reg) -> u8 {
        MAP[r.index() as usize]
    }

    fn word(&self) -> u32 {
        if self.p64 {
            8
        } else {
            4
        }
    }

    fn put(&self, buf: &mut dyn ByteSink, word: u32) {
        buf.put4_be(word);
    }

    /// mr rt, rs.
    fn mov_rr(&self, buf: &mut dyn ByteSink, rt: u8, rs: u8) {
        self.put(buf, enc_x(rs, rt, rs, 444));
    }

    fn load_imm(&self, buf: &mut dyn ByteSink, rd: u8, value: i64) {
        if (-0x8000..0x8000).contains(&value) {
            self.put(buf, enc_d(14, rd, 0, value as u32)); // li
            return;
        }
        if !self.p64 || (value >= i32::MIN as i64 && value <= i32::MAX as i64) {
            let v = value as u32;
            self.put(buf, enc_d(15, rd, 0, v >> 16)); // lis
            if v & 0xffff != 0 {
                self.put(buf, enc_d(24, rd, rd, v)); // ori
            }
            // A negative 32-bit value on a 64-bit target needs its top
            // cleared or kept; lis sign-extends, which matches i64 here
            // only when bit 31 propagates correctly.
            if self.p64 && value >= 0 && value > 0x7fff_ffff {
                self.put(buf, enc_clrldi32(rd, rd));
            }
            return;
        }
        // Full 64-bit build: lis/ori upper, shift, oris/ori lower.
        let v = value as u64;
        let hi = (v >> 32) as u32;
        let lo = v as u32;
        self.put(buf, enc_d(15, rd, 0, hi >> 16));
        self.put(buf, enc_d(24, rd, rd, hi));
        self.put(buf, enc_sldi32(rd, rd));
        if lo >> 16 != 0 {
            self.put(buf, enc_d(25, rd, rd, lo >> 16)); // oris
        }
        if lo & 0xffff != 0 {
            self.put(buf, enc_d(24, rd, rd, lo));
        }
    }

    /// The fixed patchable form: 2 instructions on 32-bit, 5 on 64-bit.
    fn load_imm_patchable(&self, sink: &mut dyn ByteSink, rd: u8, value: u64) {
        if !self.p64 {
            let v = value as u32;
            self.put(sink, enc_d(15, rd, 0, v >> 16));
            self.put(sink, enc_d(24, rd, rd, v));
        } else {
            let hi = (value >> 32) as u32;
            let lo = value as u32;
            self.put(sink, enc_d(15, rd, 0, hi >> 16));
            self.put(sink, enc_d(24, rd, rd, hi));
            self.put(sink, enc_sldi32(rd, rd));
            self.put(sink, enc_d(25, rd, rd, lo >> 16));
            self.put(sink, enc_d(24, rd, rd, lo));
        }
    }

    /// Resolve a memory operand to `(base, disp)`; folds indexes into
    /// `scratch` and applies the locals-base bias.
    fn lower_base(
        &self,
        buf: &mut CodeBuffer,
        scratch: u8,
        m: &Mem,
    ) -> CodegenResult<(u8, i64)> {
        let bias = if m.base == Some(crate::operand::sp()) {
            i64::from(self.locals_off)
        } else {
            0
        };
        match (m.base, m.index) {
            (None, None) => {
                self.load_imm(buf, scratch, m.disp);
                Ok((scratch, 0))
            }
            (Some(base), None) => Ok((self.hw(base), m.disp + bias)),
            (base, Some((index, shift))) => {
                let idx = self.hw(index);
                let folded = if shift != 0 {
                    // slwi/sldi scratch, index, shift
                    if self.p64 {
                        let sh = u32::from(shift);
                        let me = 63 - sh;
                        self.put(
                            buf,
                            (30 << 26)
                                | (u32::from(idx) << 21)
                                | (u32::from(scratch) << 16)
                                | ((sh & 31) << 11)
                                | ((((me & 31) << 1) | (me >> 5)) << 5)
                                | (1 << 2)
                                | ((sh >> 5) << 1),
                        );
                    } else {
                        // rlwinm scratch, index, sh, 0, 31-sh
                        let sh = u32::from(shift);
                        self.put(
                            buf,
                            (21 << 26)
                                | (u32::from(idx) << 21)
                                | (u32::from(scratch) << 16)
                                | (sh << 11)
                                | (0 << 6)
                                | ((31 - sh) << 1),
                        );
                    }
                    scratch
                } else {
                    idx
                };
                match base {
                    Some(b) => {
                        self.put(buf, enc_x(scratch, self.hw(b), folded, 266)); // add
                        Ok((scratch, m.disp + bias))
                    }
                    None => Ok((folded, m.disp)),
                }
            }
        }
    }

    /// D-form load/store with an X-form fallback for far displacements.
    /// `d_op` is the D opcode (0 = unavailable), `x_xo` the X-form XO.
    #[allow(clippy::too_many_arguments)]
    fn ldst(
        &self,
        buf: &mut CodeBuffer,
        d_op: u32,
        x_xo: u32,
        ds_low: u32,
        rt: u8,
        scratch: u8,
        m: &Mem,
    ) -> CodegenResult<()> {
        let (base, disp) = self.lower_base(buf, scratch, m)?;
        // DS-form displacements must be word aligned.
        let ds_form = matches!(d_op, 58 | 62);
        let aligned_ok = !ds_form || disp % 4 == 0;
        if aligned_ok && (-0x8000..0x8000).contains(&disp) {
            self.put(
                buf,
                enc_d(d_op, rt, base, (disp as u32 & 0xffff) | ds_low),
            );
        } else {
            // r0 never carries a base or the stored value here, so it can
            // stage the far displacement regardless of what the scratch
            // currently holds.
            self.load_imm(buf, R0, disp);
            self.put(buf, enc_x(rt, base, R0, x_xo));
        }
        Ok(())
    }

    fn load_operand(
        &self,
        buf: &mut CodeBuffer,
        want: u8,
        src: Operand,
    ) -> CodegenResult<u8> {
        match src {
            Operand::Reg(s) => {
                let native = self.hw(s);
                if native == SP {
                    // The locals base with its bias applied.
                    self.put(buf, enc_d(14, want, SP, self.locals_off));
                    Ok(want)
                } else {
                    Ok(native)
                }
            }
            Operand::Imm(v) => {
                self.load_imm(buf, want, v);
                Ok(want)
            }
            Operand::Mem(m) => {
                if self.p64 {
                    self.ldst(buf, 58, 21, 0, want, want, &m)?;
                } else {
                    self.ldst(buf, 32, 23, 0, want, want, &m)?;
                }
                Ok(want)
            }
        }
    }

    fn store_result(&self, buf: &mut CodeBuffer, work: u8, dst: Operand) -> CodegenResult<()> {
        match dst {
            Operand::Reg(d) => {
                let native = self.hw(d);
                debug_assert!(native != SP);
                if native != work {
                    self.mov_rr(buf, native, work);
                }
            }
            Operand::Mem(m) => {
                let scratch = if work == TMP1 { TMP2 } else { TMP1 };
                if self.p64 {
                    self.ldst(buf, 62, 149, 0, work, scratch, &m)?;
                } else {
                    self.ldst(buf, 36, 151, 0, work, scratch, &m)?;
                }
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fhw(&self, r: FReg) -> u8 {
        r.index() + 1
    }

    fn fldst(
        &self,
        buf: &mut CodeBuffer,
        load: bool,
        frt: u8,
        m: &Mem,
    ) -> CodegenResult<()> {
        let (d_op, x_xo) = if load { (50, 599) } else { (54, 727) };
        let (base, disp) = self.lower_base(buf, TMP1, m)?;
        if (-0x8000..0x8000).contains(&disp) {
            self.put(buf, enc_d(d_op, frt, base, disp as u32));
        } else {
            self.load_imm(buf, R0, disp);
            self.put(buf, enc_x(frt, base, R0, x_xo));
        }
        Ok(())
    }

    fn load_fop(&self, buf: &mut CodeBuffer, want: u8, src: FOperand) -> CodegenResult<u8> {
        match src {
            FOperand::Reg(s) => Ok(self.fhw(s)),
            FOperand::Mem(m) => {
                self.fldst(buf, true, want, &m)?;
                Ok(want)
            }
        }
    }

    /// Clear XER so a following overflow-recording op reports only its
    /// own event.
    fn clear_xer(&self, buf: &mut CodeBuffer) {
        self.load_imm(buf, R0, 0);
        // mtxer r0
        self.put(buf, (31 << 26) | (u32::from(R0) << 21) | (1 << 16) | (467 << 1));
    }

    /// Save-area layout: the ABI-reserved bytes, then lr, saved GPRs and
    /// saved FPRs at small offsets, then the locals. Keeping the save
    /// slots low keeps every prologue store in D-form range even for
    /// large local frames.
    fn reserved(&self) -> u32 {
        if self.p64 {
            32
        } else {
            8
        }
    }

    fn lr_slot(&self) -> u32 {
        self.reserved()
    }

    fn saved_slot(&self, i: u32) -> u32 {
        self.reserved() + self.word() * (1 + i)
    }

    fn fsaved_slot(&self, abi: &AbiProfile, i: u32) -> u32 {
        let base = self.saved_slot(u32::from(abi.saveds));
        (base + 7) / 8 * 8 + 8 * i
    }

    fn frame_size(&self, abi: &AbiProfile) -> u32 {
        let locals = self.fsaved_slot(abi, u32::from(abi.fsaveds));
        let locals = (locals + 7) & !7;
        (locals + abi.local_size + 15) & !15
    }

    fn locals_base(&self, abi: &AbiProfile) -> u32 {
        let locals = self.fsaved_slot(abi, u32::from(abi.fsaveds));
        (locals + 7) & !7
    }

    /// `r1 -= frame`, recording the backchain; handles large frames.
    fn push_frame(&self, buf: &mut CodeBuffer, frame: u32) {
        if frame < 0x8000 {
            if self.p64 {
                self.put(buf, enc_d(62, SP, SP, ((-(frame as i64)) as u32 & 0xfffc) | 1));
            } else {
                self.put(buf, enc_d(37, SP, SP, (-(frame as i64)) as u32));
            }
        } else {
            self.load_imm(buf, R0, -(i64::from(frame)));
            let xo = if self.p64 { 181 } else { 183 };
            self.put(buf, enc_x(SP, SP, R0, xo)); // stdux/stwux
        }
    }

    fn pop_frame(&self, buf: &mut CodeBuffer, frame: u32) {
        if frame < 0x8000 {
            self.put(buf, enc_d(14, SP, SP, frame));
        } else {
            self.load_imm(buf, R0, i64::from(frame));
            self.put(buf, enc_x(SP, SP, R0, 266));
        }
    }
}

impl Backend for PpcBackend {
    fn arch(&self) -> Arch {
        if self.p64 {
            Arch::Ppc64
        } else {
            Arch::Ppc32
        }
    }

    fn limits(&self) -> IsaLimits {
        IsaLimits {
            scratches_max: 4,
            saveds_max: 4,
            fscratches_max: 4,
            fsaveds_max: 4,
        }
    }

    fn enter(&mut self, buf: &mut CodeBuffer, abi: &AbiProfile) -> CodegenResult<()> {
        let frame = self.frame_size(abi);
        self.locals_off = self.locals_base(abi);
        // mflr r0
        self.put(buf, (31 << 26) | (u32::from(R0) << 21) | (8 << 16) | (339 << 1));
        self.push_frame(buf, frame);
        // Save lr and callee-saved registers at the bottom of the frame.
        let st = if self.p64 { 62u32 } else { 36 };
        self.put(buf, enc_d(st, R0, SP, self.lr_slot()));
        for i in 0..abi.saveds {
            self.put(
                buf,
                enc_d(st, MAP[4 + i as usize], SP, self.saved_slot(u32::from(i))),
            );
        }
        for i in 0..abi.fsaveds {
            self.put(buf, enc_d(54, 14 + i, SP, self.fsaved_slot(abi, u32::from(i))));
        }
        for i in 0..abi.args.count() {
            self.mov_rr(buf, MAP[4 + i as usize], MAP[i as usize]);
        }
        Ok(())
    }

    fn fake_enter(&mut self, abi: &AbiProfile) -> CodegenResult<()> {
        self.locals_off = self.locals_base(abi);
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
        let frame = self.frame_size(abi);
        let ld = if self.p64 { 58 } else { 32 };
        self.put(buf, enc_d(ld, R0, SP, self.lr_slot()));
        for i in 0..abi.saveds {
            self.put(
                buf,
                enc_d(ld, MAP[4 + i as usize], SP, self.saved_slot(u32::from(i))),
            );
        }
        for i in 0..abi.fsaveds {
            self.put(buf, enc_d(50, 14 + i, SP, self.fsaved_slot(abi, u32::from(i))));
        }
        // mtlr r0; release the frame; blr
        self.put(buf, (31 << 26) | (u32::from(R0) << 21) | (8 << 16) | (467 << 1));
        self.pop_frame(buf, frame);
        self.put(buf, 0x4e80_0020);
        Ok(())
    }

    fn op0(&mut self, buf: &mut CodeBuffer, op: Op0) -> CodegenResult<()> {
        match op {
            Op0::Nop => self.put(buf, NOP),
            Op0::Breakpoint => self.put(buf, 0x7fe0_0008), // trap
            Op0::LMulUw | Op0::LMulSw => {
                // mulhxu/mulhx into tmp, mull into r0's home, then place.
                let (a, b) = (MAP[0], MAP[1]);
                let mulh_xo = if op == Op0::LMulUw {
                    if self.p64 { 9 } else { 11 }
                } else if self.p64 {
                    73
                } else {
                    75
                };
                let mull_xo = if self.p64 { 233 } else { 235 };
                self.put(buf, enc_x(TMP1, a, b, mulh_xo));
                self.put(buf, enc_x(a, a, b, mull_xo));
                self.mov_rr(buf, b, TMP1);
            }
            Op0::DivmodUw | Op0::DivmodSw => {
                let (a, b) = (MAP[0], MAP[1]);
                let div_xo = match (op, self.p64) {
                    (Op0::DivmodUw, false) => 459, // divwu
                    (Op0::DivmodUw, true) => 457,  // divdu
                    (_, false) => 491,             // divw
                    (_, true) => 489,              // divd
                };
                let mull_xo = if self.p64 { 233 } else { 235 };
                self.put(buf, enc_x(TMP1, a, b, div_xo));
                self.put(buf, enc_x(TMP2, TMP1, b, mull_xo));
                self.put(buf, enc_x(b, TMP2, a, 40)); // subf b, tmp2, a
                self.mov_rr(buf, a, TMP1);
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
        match op {
            Op1::Mov => match (dst, src) {
                (Operand::Reg(d), _) => {
                    let d = self.hw(d);
                    let s = self.load_operand(buf, d, src)?;
                    if s != d {
                        self.mov_rr(buf, d, s);
                    }
                }
                (Operand::Mem(_), _) => {
                    let work = self.load_operand(buf, TMP1, src)?;
                    self.store_result(buf, work, dst)?;
                }
                (Operand::Imm(_), _) => return Err(Error::BadArgument),
            },
            Op1::MovU8 | Op1::MovS8 | Op1::MovU16 | Op1::MovS16 | Op1::MovU32 | Op1::MovS32 => {
                let (width, signed) = op.mov_width().unwrap();
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => TMP1,
                };
                match src {
                    Operand::Mem(m) => match (width, signed) {
                        (1, _) => {
                            self.ldst(buf, 34, 87, 0, work, TMP2, &m)?; // lbz
                            if signed {
                                self.put(buf, enc_x(work, work, 0, 954)); // extsb
                            }
                        }
                        (2, false) => self.ldst(buf, 40, 279, 0, work, TMP2, &m)?,
                        (2, true) => self.ldst(buf, 42, 343, 0, work, TMP2, &m)?,
                        (4, false) => self.ldst(buf, 32, 23, 0, work, TMP2, &m)?,
                        _ => {
                            if self.p64 {
                                self.ldst(buf, 58, 341, 2, work, TMP2, &m)?; // lwa
                            } else {
                                self.ldst(buf, 32, 23, 0, work, TMP2, &m)?;
                            }
                        }
                    },
                    Operand::Reg(s) => {
                        let s = self.hw(s);
                        match (width, signed) {
                            (1, false) => self.put(
                                buf,
                                // clrldi/rlwinm to the low byte
                                if self.p64 {
                                    (30 << 26)
                                        | (u32::from(s) << 21)
                                        | (u32::from(work) << 16)
                                        | ((((56 & 31) << 1) | (56 >> 5)) << 5)
                                } else {
                                    (21 << 26)
                                        | (u32::from(s) << 21)
                                        | (u32::from(work) << 16)
                                        | (24 << 6)
                                        | (31 << 1)
                                },
                            ),
                            (1, true) => self.put(buf, enc_x(s, work, 0, 954)),
                            (2, false) => self.put(
                                buf,
                                if self.p64 {
                                    (30 << 26)
                                        | (u32::from(s) << 21)
                                        | (u32::from(work) << 16)
                                        | ((((48 & 31) << 1) | (48 >> 5)) << 5)
                                } else {
                                    (21 << 26)
                                        | (u32::from(s) << 21)
                                        | (u32::from(work) << 16)
                                        | (16 << 6)
                                        | (31 << 1)
                                },
                            ),
                            (2, true) => self.put(buf, enc_x(s, work, 0, 922)),
                            (4, false) => self.put(buf, enc_clrldi32(work, s)),
                            _ => self.put(buf, enc_x(s, work, 0, 986)), // extsw
                        }
                    }
                    Operand::Imm(v) => {
                        let v = match (width, signed) {
                            (1, false) => (v as u8) as i64,
                            (1, true) => (v as i8) as i64,
                            (2, false) => (v as u16) as i64,
                            (2, true) => (v as i16) as i64,
                            (4, false) => (v as u32) as i64,
                            _ => (v as i32) as i64,
                        };
                        self.load_imm(buf, work, v);
                    }
                }
                if let Operand::Mem(dm) = dst {
                    match width {
                        1 => self.ldst(buf, 38, 215, 0, work, TMP2, &dm)?,
                        2 => self.ldst(buf, 44, 407, 0, work, TMP2, &dm)?,
                        _ => self.ldst(buf, 36, 151, 0, work, TMP2, &dm)?,
                    }
                }
            }
            Op1::Not | Op1::Neg | Op1::Clz => {
                let s = self.load_operand(buf, TMP1, src)?;
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => TMP1,
                };
                let rc = mods.set_z as u32;
                match op {
                    Op1::Not => self.put(buf, enc_x(s, work, s, 124) | rc), // nor
                    Op1::Neg => {
                        let mut w = (31 << 26)
                            | (u32::from(work) << 21)
                            | (u32::from(s) << 16)
                            | (104 << 1)
                            | rc;
                        if mods.set_overflow {
                            self.clear_xer(buf);
                            w |= 1 << 10;
                        }
                        self.put(buf, w);
                    }
                    Op1::Clz => {
                        let xo = if self.p64 { 58 } else { 26 };
                        self.put(buf, enc_x(s, work, 0, xo) | rc);
                    }
                    _ => unreachable!(),
                }
                self.store_result(buf, work, dst)?;
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
        // Pure compare: use cmp/cmpl so the full predicate set works.
        if dst.is_none() && op == Op2::Sub {
            let a = self.load_operand(buf, TMP1, src1)?;
            let signed = mods.cmp.map_or(true, |cc| cc.is_signed());
            let l = u32::from(self.p64);
            match src2 {
                Operand::Imm(v) if signed && (-0x8000..0x8000).contains(&v) => {
                    self.put(buf, enc_d(11, 0, a, v as u32) | (l << 21));
                }
                Operand::Imm(v) if !signed && (0..0x10000).contains(&v) => {
                    self.put(buf, enc_d(10, 0, a, v as u32) | (l << 21));
                }
                _ => {
                    let b = self.load_operand(buf, TMP2, src2)?;
                    let xo = if signed { 0 } else { 32 };
                    self.put(
                        buf,
                        (31 << 26) | (l << 21) | (u32::from(a) << 16) | (u32::from(b) << 11) | (xo << 1),
                    );
                }
            }
            return Ok(());
        }

        let rc = u32::from(mods.set_z);
        let oe = u32::from(mods.set_overflow) << 10;
        if mods.set_overflow {
            self.clear_xer(buf);
        }
        let a = self.load_operand(buf, TMP1, src1)?;
        let work = match dst {
            Some(Operand::Reg(d)) => self.hw(d),
            _ => TMP1,
        };
        match op {
            Op2::Add if matches!(src2, Operand::Imm(v) if (-0x8000..0x8000).contains(&v))
                && !mods.sets_flags() =>
            {
                if let Operand::Imm(v) = src2 {
                    self.put(buf, enc_d(14, work, a, v as u32));
                }
            }
            Op2::Add | Op2::Sub | Op2::Addc | Op2::Subc | Op2::Mul => {
                let b = self.load_operand(buf, TMP2, src2)?;
                let (xo, swap) = match op {
                    // addc/subfc record CA; adde/subfe consume and record.
                    Op2::Add if mods.set_carry => (10, false),
                    Op2::Add => (266, false),
                    Op2::Addc => (138, false),
                    // subf rt, ra, rb = rb - ra
                    Op2::Sub if mods.set_carry => (8, true),
                    Op2::Sub => (40, true),
                    Op2::Subc => (136, true),
                    Op2::Mul => (if self.p64 { 233 } else { 235 }, false),
                    _ => unreachable!(),
                };
                let (rx, ry) = if swap { (b, a) } else { (a, b) };
                self.put(
                    buf,
                    (31 << 26)
                        | (u32::from(work) << 21)
                        | (u32::from(rx) << 16)
                        | (u32::from(ry) << 11)
                        | oe
                        | (xo << 1)
                        | rc,
                );
            }
            Op2::And | Op2::Or | Op2::Xor => {
                let b = self.load_operand(buf, TMP2, src2)?;
                let xo = match op {
                    Op2::And => 28,
                    Op2::Or => 444,
                    _ => 316,
                };
                // Logical forms put the source in rS.
                self.put(buf, enc_x(a, work, b, xo) | rc);
            }
            Op2::Shl | Op2::Lshr | Op2::Ashr => {
                let b = self.load_operand(buf, TMP2, src2)?;
                let xo = match (op, self.p64) {
                    (Op2::Shl, false) => 24,
                    (Op2::Shl, true) => 27,
                    (Op2::Lshr, false) => 536,
                    (Op2::Lshr, true) => 539,
                    (Op2::Ashr, false) => 792,
                    (Op2::Ashr, true) => 794,
                    _ => unreachable!(),
                };
                self.put(buf, enc_x(a, work, b, xo) | rc);
            }
        }
        if let Some(d) = dst {
            self.store_result(buf, work, d)?;
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
                        self.put(
                            buf,
                            (63 << 26)
                                | (u32::from(self.fhw(d)) << 21)
                                | (u32::from(self.fhw(s)) << 11)
                                | (72 << 1),
                        );
                    }
                }
                (FOperand::Reg(d), FOperand::Mem(m)) => self.fldst(buf, true, self.fhw(d), &m)?,
                (FOperand::Mem(m), FOperand::Reg(s)) => self.fldst(buf, false, self.fhw(s), &m)?,
                (FOperand::Mem(dm), FOperand::Mem(_)) => {
                    let s = self.load_fop(buf, FTMP, src)?;
                    self.fldst(buf, false, s, &dm)?;
                }
            },
            FOp1::Neg | FOp1::Abs => {
                let s = self.load_fop(buf, FTMP, src)?;
                let work = match dst {
                    FOperand::Reg(d) => self.fhw(d),
                    _ => FTMP,
                };
                let xo = if op == FOp1::Neg { 40 } else { 264 };
                self.put(
                    buf,
                    (63 << 26) | (u32::from(work) << 21) | (u32::from(s) << 11) | (xo << 1),
                );
                if let FOperand::Mem(dm) = dst {
                    self.fldst(buf, false, work, &dm)?;
                }
            }
            FOp1::Cmp => {
                let a = self.load_fop(buf, FTMP, dst)?;
                let b = self.load_fop(buf, FTMP2, src)?;
                // fcmpu cr0, a, b
                self.put(buf, (63 << 26) | (u32::from(a) << 16) | (u32::from(b) << 11));
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
        let a = self.load_fop(buf, FTMP, src1)?;
        let b = self.load_fop(buf, FTMP2, src2)?;
        let work = match dst {
            FOperand::Reg(d) => self.fhw(d),
            _ => FTMP,
        };
        let word = match op {
            FOp2::Add => {
                (63 << 26) | (u32::from(work) << 21) | (u32::from(a) << 16) | (u32::from(b) << 11) | (21 << 1)
            }
            FOp2::Sub => {
                (63 << 26) | (u32::from(work) << 21) | (u32::from(a) << 16) | (u32::from(b) << 11) | (20 << 1)
            }
            // fmul takes frC in bits 6..10.
            FOp2::Mul => {
                (63 << 26) | (u32::from(work) << 21) | (u32::from(a) << 16) | (u32::from(b) << 6) | (25 << 1)
            }
            FOp2::Div => {
                (63 << 26) | (u32::from(work) << 21) | (u32::from(a) << 16) | (u32::from(b) << 11) | (18 << 1)
            }
        };
        self.put(buf, word);
        if let FOperand::Mem(dm) = dst {
            self.fldst(buf, false, work, &dm)?;
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
        self.sync_carry_cond(buf, cc);
        let (bit, when_true) = self.resolve_cond(cc);
        // mfcr tmp2; extract the bit; invert when needed.
        self.put(buf, (31 << 26) | (u32::from(TMP2) << 21) | (19 << 1));
        // rlwinm tmp2, tmp2, bit+1, 31, 31
        self.put(
            buf,
            (21 << 26)
                | (u32::from(TMP2) << 21)
                | (u32::from(TMP2) << 16)
                | ((bit + 1) << 11)
                | (31 << 6)
                | (31 << 1),
        );
        if !when_true {
            self.put(buf, enc_d(26, TMP2, TMP2, 1)); // xori
        }
        match op {
            FlagsOp::Mov => self.store_result(buf, TMP2, dst),
            FlagsOp::Or => {
                let cur = self.load_operand(buf, TMP1, dst)?;
                self.put(buf, enc_x(cur, TMP2, TMP2, 444)); // or tmp2, cur, tmp2
                self.store_result(buf, TMP2, dst)
            }
        }
    }

    fn fast_enter(&mut self, buf: &mut CodeBuffer, dst: Operand) -> CodegenResult<()> {
        // mflr into the destination.
        self.put(buf, (31 << 26) | (u32::from(TMP1) << 21) | (8 << 16) | (339 << 1));
        self.store_result(buf, TMP1, dst)
    }

    fn fast_return(&mut self, buf: &mut CodeBuffer, src: Operand) -> CodegenResult<()> {
        let s = self.load_operand(buf, TMP1, src)?;
        // mtlr s; blr
        self.put(buf, (31 << 26) | (u32::from(s) << 21) | (8 << 16) | (467 << 1));
        self.put(buf, 0x4e80_0020);
        Ok(())
    }

    fn add_no_flags(&mut self, buf: &mut CodeBuffer, reg: Reg, disp: i64) -> CodegenResult<()> {
        let r = self.hw(reg);
        if (-0x8000..0x8000).contains(&disp) {
            self.put(buf, enc_d(14, r, r, disp as u32));
        } else {
            self.load_imm(buf, TMP1, disp);
            self.put(buf, enc_x(r, r, TMP1, 266));
        }
        Ok(())
    }

    fn jump(&mut self, buf: &mut CodeBuffer, ty: JumpType) -> CodegenResult<Jump> {
        if let JumpKind::Cond(cc @ (CondCode::Carry | CondCode::NotCarry)) = ty.kind {
            self.sync_carry_cond(buf, cc);
        }
        let kind = ty.kind;
        // Float ge/le need their cror fold emitted before the branch.
        if let JumpKind::FCond(fc) = kind {
            if let (_, _, Some((ba, bb))) = fcr_bit(fc) {
                self.put(buf, (19 << 26) | (4 << 21) | (ba << 16) | (bb << 11) | (449 << 1));
            }
        }
        let data = JumpData {
            kind,
            rewritable: ty.rewritable,
            target: JumpTarget::Unset,
            hint: 0,
            delay: None,
        };
        let reserved = *self.jump_encodings(&data).last().unwrap();
        Ok(buf.add_jump(data, reserved))
    }

    fn ijump(&mut self, buf: &mut CodeBuffer, ty: JumpType, src: Operand) -> CodegenResult<()> {
        if let Operand::Imm(target) = src {
            let data = JumpData {
                kind: ty.kind,
                rewritable: false,
                target: JumpTarget::Addr(target as u64),
                hint: 0,
                delay: None,
            };
            let reserved = *self.jump_encodings(&data).last().unwrap();
            buf.add_jump(data, reserved);
            return Ok(());
        }
        let s = self.load_operand(buf, TMP2, src)?;
        // mtctr s; bctr(l)
        self.put(buf, (31 << 26) | (u32::from(s) << 21) | (9 << 16) | (467 << 1));
        let link = matches!(ty.kind, JumpKind::Call(_) | JumpKind::FastCall);
        self.put(buf, 0x4e80_0420 | u32::from(link));
        Ok(())
    }

    fn const_(
        &mut self,
        buf: &mut CodeBuffer,
        dst: Option<Operand>,
        init: i64,
    ) -> CodegenResult<Const> {
        let dst = dst.ok_or(Error::BadArgument)?;
        let work = match dst {
            Operand::Reg(d) => self.hw(d),
            _ => TMP1,
        };
        self.load_imm_patchable(buf, work, init as u64);
        let konst = buf.add_const(if self.p64 { 20 } else { 8 });
        if let Operand::Mem(_) = dst {
            self.store_result(buf, work, dst)?;
        }
        Ok(konst)
    }

    // ---- layout ---------------------------------------------------------

    fn jump_encodings(&self, jump: &JumpData) -> &'static [u32] {
        let label = matches!(jump.target, JumpTarget::Label(_));
        let cond = matches!(jump.kind, JumpKind::Cond(_) | JumpKind::FCond(_));
        if label && !jump.rewritable {
            if cond {
                &[4, 8]
            } else {
                &[4]
            }
        } else {
            match (cond, self.p64) {
                (false, false) => &[16],
                (true, false) => &[20],
                (false, true) => &[28],
                (true, true) => &[32],
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
        let disp = i64::from(target) - i64::from(at);
        if (-0x8000..0x8000).contains(&disp) {
            encodings[0]
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
        let cond = match jump.kind {
            JumpKind::Cond(cc) => Some(cr_bit(cc)),
            JumpKind::FCond(fc) => {
                let (bit, sense, _) = fcr_bit(fc);
                Some((bit, sense))
            }
            _ => None,
        };
        let label = matches!(jump.target, JumpTarget::Label(_));
        if label && !jump.rewritable {
            let target = target.unwrap();
            match cond {
                Some((bit, sense)) if size == 4 => {
                    let bo = if sense { 12 } else { 4 };
                    let bd = (i64::from(target) - i64::from(at)) as u32;
                    self.put(sink, (16 << 26) | (bo << 21) | (bit << 16) | (bd & 0xfffc));
                }
                Some((bit, sense)) => {
                    // Inverted bc over an unconditional b.
                    let bo = if sense { 4 } else { 12 };
                    self.put(sink, (16 << 26) | (bo << 21) | (bit << 16) | 8);
                    let li = (i64::from(target) - i64::from(at + 4)) as u32;
                    self.put(sink, (18 << 26) | (li & 0x03ff_fffc));
                }
                None => {
                    let link = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
                    let li = (i64::from(target) - i64::from(at)) as u32;
                    self.put(sink, (18 << 26) | (li & 0x03ff_fffc) | u32::from(link));
                }
            }
            return at;
        }

        // Long form: imm sequence into r12, mtctr, bctr(l).
        let mut site = at;
        if let Some((bit, sense)) = cond {
            // Skip the rest of this sequence when the condition fails.
            let bo = if sense { 4 } else { 12 };
            self.put(sink, (16 << 26) | (bo << 21) | (bit << 16) | (size & 0xfffc));
            site = at + 4;
        }
        let fix = match jump.target {
            JumpTarget::Label(_) => FixTarget::Offset(target.unwrap()),
            JumpTarget::Addr(a) => FixTarget::Addr(a),
            JumpTarget::Unset => FixTarget::Addr(0),
        };
        let kind = if self.p64 {
            FixupKind::PpcImm64
        } else {
            FixupKind::PpcImm32
        };
        sink.fixup(kind, fix);
        let value = match fix {
            FixTarget::Addr(a) => a,
            _ => 0,
        };
        self.load_imm_patchable(sink, TMP2, value);
        self.put(sink, (31 << 26) | (u32::from(TMP2) << 21) | (9 << 16) | (467 << 1));
        let link = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
        self.put(sink, 0x4e80_0420 | u32::from(link));
        site
    }

    fn pad_to(&self, target: CodeOffset, sink: &mut CodeSink) {
        while sink.cur_offset() < target {
            sink.put4_be(NOP);
        }
    }
}

impl PpcBackend {
    fn resolve_cond(&self, cc: CondCode) -> (u32, bool) {
        cr_bit(cc)
    }

    /// Materialize the XER carry into CR0.EQ ahead of a carry predicate:
    /// `addze. tmp, zero` leaves EQ set exactly when the carry was clear.
    fn sync_carry_cond(&self, buf: &mut CodeBuffer, cc: CondCode) {
        if matches!(cc, CondCode::Carry | CondCode::NotCarry) {
            self.load_imm(buf, TMP2, 0);
            self.put(
                buf,
                (31 << 26) | (u32::from(TMP2) << 21) | (u32::from(TMP2) << 16) | (202 << 1) | 1,
            );
        }
    }
}

/// Rewrite a `lis`/`ori` pair in place (big-endian words).
pub(crate) fn patch_imm32(code: &mut [u8], value: u32) {
    let mut w0 = u32::from_be_bytes(code[0..4].try_into().unwrap());
    w0 = (w0 & 0xffff_0000) | (value >> 16);
    code[0..4].copy_from_slice(&w0.to_be_bytes());
    let mut w1 = u32::from_be_bytes(code[4..8].try_into().unwrap());
    w1 = (w1 & 0xffff_0000) | (value & 0xffff);
    code[4..8].copy_from_slice(&w1.to_be_bytes());
}

/// Rewrite a `lis/ori/sldi/oris/ori` sequence in place.
pub(crate) fn patch_imm64(code: &mut [u8], value: u64) {
    let parts = [
        (0usize, (value >> 48) as u32 & 0xffff),
        (4, (value >> 32) as u32 & 0xffff),
        (12, (value >> 16) as u32 & 0xffff),
        (16, value as u32 & 0xffff),
    ];
    for (at, imm) in parts {
        let mut w = u32::from_be_bytes(code[at..at + 4].try_into().unwrap());
        w = (w & 0xffff_0000) | imm;
        code[at..at + 4].copy_from_slice(&w.to_be_bytes());
    }
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::operand::{r, s};

    fn emit(p64: bool, f: impl FnOnce(&mut PpcBackend, &mut CodeBuffer)) -> Vec<u32> {
        let mut backend = PpcBackend::new(p64);
        let mut buf = CodeBuffer::new();
        f(&mut backend, &mut buf);
        let image = buf.finalize(&mut backend).unwrap();
        image
            .code()
            .chunks(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn mov_and_add() {
        let words = emit(true, |b, buf| {
            b.op1(buf, Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(r(1)))
                .unwrap();
            b.op2(
                buf,
                Op2::Add,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Reg(r(0)),
                Operand::Reg(r(1)),
            )
            .unwrap();
        });
        // mr r3, r4 ; add r3, r3, r4
        assert_eq!(words, vec![enc_x(4, 3, 4, 444), 0x7c63_2214]);
    }

    #[test]
    fn small_imm_is_addi() {
        let words = emit(true, |b, buf| {
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
        // addi r3, r3, 100
        assert_eq!(words, vec![enc_d(14, 3, 3, 100)]);
    }

    #[test]
    fn locals_bias_applies() {
        let words = emit(true, |b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Mem(Mem::base(crate::operand::sp(), 8)),
            )
            .unwrap();
        });
        // ld r3, 40(r1): 8 + the 32-byte reserved area.
        assert_eq!(words, vec![enc_d(58, 3, 1, 40)]);
    }

    #[test]
    fn compare_picks_signedness() {
        let words = emit(true, |b, buf| {
            let mut mods = Mods::new();
            mods.cmp = Some(CondCode::Less);
            b.op2(buf, Op2::Sub, mods, None, Operand::Reg(r(0)), Operand::Reg(r(1)))
                .unwrap();
        });
        // cmpld cr0, r3, r4
        assert_eq!(words, vec![(31 << 26) | (1 << 21) | (3 << 16) | (4 << 11) | (32 << 1)]);
    }

    #[test]
    fn cond_branch_sizes() {
        let mut backend = PpcBackend::new(false);
        let mut buf = CodeBuffer::new();
        let j = backend
            .jump(&mut buf, JumpType::cond(CondCode::Equal))
            .unwrap();
        for _ in 0..4 {
            backend.op0(&mut buf, Op0::Nop).unwrap();
        }
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        let w = u32::from_be_bytes(image.code()[0..4].try_into().unwrap());
        // bc 12, eq, +20
        assert_eq!(w, (16 << 26) | (12 << 21) | (2 << 16) | 20);
    }

    #[test]
    fn rewritable_jump_sequence_32() {
        let mut backend = PpcBackend::new(false);
        let mut buf = CodeBuffer::new();
        let j = backend.jump(&mut buf, JumpType::jump().rewritable()).unwrap();
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        // lis/ori + mtctr + bctr = 16 bytes.
        assert_eq!(image.len(), 16);
        let mut code = image.code().to_vec();
        image.relocate(0x10000, &mut code);
        let w0 = u32::from_be_bytes(code[0..4].try_into().unwrap());
        let w1 = u32::from_be_bytes(code[4..8].try_into().unwrap());
        assert_eq!(w0 & 0xffff, 0x0001);
        assert_eq!(w1 & 0xffff, 0x0010);
    }
}
