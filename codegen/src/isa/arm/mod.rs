//! ARM v5/v7 (A32) ISA: binary code emission.
//!
//! One encoder serves both variants; v7 adds `movw`/`movt`, v5 falls back
//! to PC-relative literal pools for immediates outside the rotated-imm8
//! space. Pools are flushed at emission time: a pool is placed (behind an
//! unconditional branch, 8-byte aligned) whenever the oldest pending
//! literal use would otherwise drift out of the ±4095 `ldr` range, and
//! once more before layout. All jump stream sizes are fixed at emission,
//! which keeps emission-time offsets exact and makes that possible.
//!
//! Register map: `r0..r3` = r0..r3 (arguments and return in place),
//! `s0..s3` = r4..r7, locals base = sp, temporaries ip and lr (lr is
//! saved by the prologue).

use smallvec::SmallVec;

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

const IP: u8 = 12;
const SPR: u8 = 13;
const LR: u8 = 14;
const PC: u8 = 15;
// d0..d7 are caller-saved; the exposed file is d0..d3.
const FTMP: u8 = 6;
const FTMP2: u8 = 7;

/// Virtual-to-native map: r0..r3, s0..s3, sp.
const MAP: [u8; 9] = [0, 1, 2, 3, 4, 5, 6, 7, SPR];

const AL: u32 = 0xe;
const NOP: u32 = 0xe1a0_0000; // mov r0, r0

/// Flush when the oldest pending literal is this far behind.
const POOL_RANGE: u32 = 4000;

pub(crate) fn cond_bits(cc: CondCode) -> u32 {
    match cc {
        CondCode::Equal => 0x0,
        CondCode::NotEqual => 0x1,
        CondCode::Carry | CondCode::GreaterEqual => 0x2,
        CondCode::NotCarry | CondCode::Less => 0x3,
        CondCode::Overflow => 0x6,
        CondCode::NotOverflow => 0x7,
        CondCode::Greater => 0x8,
        CondCode::LessEqual => 0x9,
        CondCode::SigGreaterEqual => 0xa,
        CondCode::SigLess => 0xb,
        CondCode::SigGreater => 0xc,
        CondCode::SigLessEqual => 0xd,
    }
}

pub(crate) fn fcond_bits(cc: FloatCond) -> u32 {
    match cc {
        FloatCond::Equal => 0x0,
        FloatCond::NotEqual => 0x1,
        FloatCond::Less => 0x4,      // mi
        FloatCond::GreaterEqual => 0xa,
        FloatCond::Greater => 0xc,
        FloatCond::LessEqual => 0x9, // ls
        FloatCond::Ordered => 0x7,   // vc
        FloatCond::Unordered => 0x6, // vs
    }
}

/// Rotated-imm8 encoding of a 32-bit value, if one exists.
fn imm_rot(value: u32) -> Option<u32> {
    for rot in 0..16u32 {
        let v = value.rotate_left(rot * 2);
        if v < 256 {
            return Some((rot << 8) | v);
        }
    }
    None
}

/// Data-processing instruction word.
fn enc_dp(cond: u32, opcode: u32, s: bool, rn: u8, rd: u8, operand2: u32) -> u32 {
    (cond << 28)
        | (opcode << 21)
        | ((s as u32) << 20)
        | (u32::from(rn) << 16)
        | (u32::from(rd) << 12)
        | operand2
}

const OP_AND: u32 = 0x0;
const OP_EOR: u32 = 0x1;
const OP_SUB: u32 = 0x2;
const OP_ADD: u32 = 0x4;
const OP_ADC: u32 = 0x5;
const OP_SBC: u32 = 0x6;
const OP_TST: u32 = 0x8;
const OP_CMP: u32 = 0xa;
const OP_ORR: u32 = 0xc;
const OP_MOV: u32 = 0xd;
const OP_MVN: u32 = 0xf;

const IMM_BIT: u32 = 1 << 25;

struct PoolUse {
    chunk_pos: u32,
    voff: u32,
}

enum PoolPayload {
    /// A literal value written at flush time.
    Value(u32),
    /// The absolute target of a far jump, resolved at link.
    JumpTarget(Jump),
}

struct PoolEntry {
    payload: PoolPayload,
    /// Unique entries are never shared (patchable consts, jump targets).
    unique: bool,
    uses: SmallVec<[PoolUse; 2]>,
}

pub(crate) struct ArmBackend {
    v7: bool,
    pool: Vec<PoolEntry>,
    first_use: Option<u32>,
    ov_from_z: bool,
}

impl ArmBackend {
    pub(crate) fn new(v7: bool) -> Self {
        ArmBackend {
            v7,
            pool: Vec::new(),
            first_use: None,
            ov_from_z: false,
        }
    }

    fn hw(&self, r: Reg) -> u8 {
        MAP[r.index() as usize]
    }

    fn put(&self, buf: &mut dyn ByteSink, word: u32) {
        buf.put4(word);
    }

    // ---- literal pool ---------------------------------------------------

    /// Emit `ldr<cond> rd, [pc, #...]` against a pool entry.
    fn emit_pool_load(
        &mut self,
        buf: &mut CodeBuffer,
        cond: u32,
        rd: u8,
        payload: PoolPayload,
        unique: bool,
    ) {
        let use_rec = PoolUse {
            chunk_pos: buf.chunk_len(),
            voff: buf.cur_offset(),
        };
        self.first_use.get_or_insert(buf.cur_offset());
        let mut shared = false;
        if !unique {
            if let PoolPayload::Value(v) = payload {
                for entry in &mut self.pool {
                    if !entry.unique
                        && matches!(entry.payload, PoolPayload::Value(ev) if ev == v)
                    {
                        entry.uses.push(PoolUse {
                            chunk_pos: use_rec.chunk_pos,
                            voff: use_rec.voff,
                        });
                        shared = true;
                        break;
                    }
                }
            }
        }
        if !shared {
            self.pool.push(PoolEntry {
                payload,
                unique,
                uses: {
                    let mut v = SmallVec::new();
                    v.push(use_rec);
                    v
                },
            });
        }
        self.put(buf, (cond << 28) | 0x059f_0000 | (u32::from(rd) << 12));
    }

    /// Place the pending pool if the oldest use is running out of range.
    fn maybe_flush(&mut self, buf: &mut CodeBuffer, upcoming: u32) {
        if let Some(first) = self.first_use {
            let pool_bytes = 4 * self.pool.len() as u32 + 12;
            if buf.cur_offset() + upcoming + pool_bytes - first >= POOL_RANGE {
                self.flush_pool(buf);
            }
        }
    }

    fn flush_pool(&mut self, buf: &mut CodeBuffer) {
        if self.pool.is_empty() {
            return;
        }
        let b_voff = buf.cur_offset();
        let pool_start = (b_voff + 4 + 7) & !7;
        let pool_end = pool_start + 4 * self.pool.len() as u32;
        // Branch over the pool.
        let imm24 = (pool_end as i64 - i64::from(b_voff) - 8) / 4;
        self.put(buf, 0xea00_0000 | ((imm24 as u32) & 0x00ff_ffff));
        let mut pad = pool_start - (b_voff + 4);
        while pad > 0 {
            self.put(buf, NOP);
            pad -= 4;
        }
        let entries = core::mem::take(&mut self.pool);
        for entry in entries {
            let entry_voff = buf.cur_offset();
            for use_rec in &entry.uses {
                let imm12 = entry_voff - (use_rec.voff + 8);
                debug_assert!(imm12 < 4096, "literal drifted out of ldr range");
                let word = buf.read4(use_rec.chunk_pos) | (1 << 23) | imm12;
                buf.patch4(use_rec.chunk_pos, word);
            }
            match entry.payload {
                PoolPayload::Value(v) => self.put(buf, v),
                PoolPayload::JumpTarget(j) => {
                    buf.jump_data_mut(j).hint = entry_voff + 1;
                    buf.add_fixup(FixupKind::Abs32, FixTarget::Jump(j));
                    self.put(buf, 0);
                }
            }
        }
        self.first_use = None;
    }

    // ---- immediates and operands ---------------------------------------

    /// Materialize an arbitrary 32-bit immediate.
    fn load_imm(&mut self, buf: &mut CodeBuffer, rd: u8, value: u32) {
        if let Some(op2) = imm_rot(value) {
            self.put(buf, enc_dp(AL, OP_MOV, false, 0, rd, IMM_BIT | op2));
        } else if let Some(op2) = imm_rot(!value) {
            self.put(buf, enc_dp(AL, OP_MVN, false, 0, rd, IMM_BIT | op2));
        } else if self.v7 {
            self.movw_movt(buf, rd, value);
        } else {
            self.emit_pool_load(buf, AL, rd, PoolPayload::Value(value), false);
        }
    }

    fn movw_movt(&self, buf: &mut dyn ByteSink, rd: u8, value: u32) {
        let lo = value & 0xffff;
        let hi = value >> 16;
        self.put(
            buf,
            0xe300_0000 | ((lo >> 12) << 16) | (u32::from(rd) << 12) | (lo & 0xfff),
        );
        self.put(
            buf,
            0xe340_0000 | ((hi >> 12) << 16) | (u32::from(rd) << 12) | (hi & 0xfff),
        );
    }

    /// Load the value of an integer operand; `scratch` is a second
    /// register the address math may use.
    fn load_word(
        &mut self,
        buf: &mut CodeBuffer,
        want: u8,
        scratch: u8,
        src: Operand,
    ) -> CodegenResult<u8> {
        match src {
            Operand::Reg(s) => Ok(self.hw(s)),
            Operand::Imm(v) => {
                self.load_imm(buf, want, v as u32);
                Ok(want)
            }
            Operand::Mem(m) => {
                self.ldst_word(buf, true, false, want, scratch, &m)?;
                Ok(want)
            }
        }
    }

    /// Resolve a memory operand to `(base, disp)` with the index folded
    /// into `scratch`.
    fn lower_base(
        &mut self,
        buf: &mut CodeBuffer,
        scratch: u8,
        m: &Mem,
    ) -> CodegenResult<(u8, i64)> {
        match (m.base, m.index) {
            (None, None) => {
                self.load_imm(buf, scratch, m.disp as u32);
                Ok((scratch, 0))
            }
            (Some(base), None) => Ok((self.hw(base), m.disp)),
            (base, Some((index, shift))) => {
                let bn = match base {
                    Some(b) => self.hw(b),
                    None => {
                        self.load_imm(buf, scratch, 0);
                        scratch
                    }
                };
                // add scratch, base, index, lsl #shift
                let op2 = (u32::from(shift) << 7) | u32::from(self.hw(index));
                self.put(buf, enc_dp(AL, OP_ADD, false, bn, scratch, op2));
                Ok((scratch, m.disp))
            }
        }
    }

    /// Word/byte load or store with the offset12 form.
    fn ldst_word(
        &mut self,
        buf: &mut CodeBuffer,
        load: bool,
        byte: bool,
        rt: u8,
        scratch: u8,
        m: &Mem,
    ) -> CodegenResult<()> {
        let (base, disp) = self.lower_base(buf, scratch, m)?;
        let base_word = 0x0400_0000
            | (AL << 28)
            | (1 << 24)
            | ((load as u32) << 20)
            | ((byte as u32) << 22)
            | (u32::from(rt) << 12);
        if (-4095..=4095).contains(&disp) {
            let (u, off) = if disp >= 0 {
                (1u32, disp as u32)
            } else {
                (0, (-disp) as u32)
            };
            self.put(buf, base_word | (u << 23) | (u32::from(base) << 16) | off);
        } else if base == scratch {
            // The scratch already holds a folded base; accumulate the
            // displacement into it byte-by-byte (no free register).
            self.add_imm_chunks(buf, scratch, disp);
            self.put(buf, base_word | (1 << 23) | (u32::from(scratch) << 16));
        } else {
            self.load_imm(buf, scratch, disp as u32);
            self.put(buf, enc_dp(AL, OP_ADD, false, base, scratch, u32::from(scratch)));
            self.put(buf, base_word | (1 << 23) | (u32::from(scratch) << 16));
        }
        Ok(())
    }

    /// `reg += disp` using only rotated-imm8 adds (no scratch register).
    fn add_imm_chunks(&mut self, buf: &mut CodeBuffer, reg: u8, disp: i64) {
        let (op, mut v) = if disp >= 0 {
            (OP_ADD, disp as u32)
        } else {
            (OP_SUB, (-disp) as u32)
        };
        while v != 0 {
            let shift = v.trailing_zeros() & !1;
            let chunk = v & (0xff << shift);
            let op2 = imm_rot(chunk).unwrap();
            self.put(buf, enc_dp(AL, op, false, reg, reg, IMM_BIT | op2));
            v &= !chunk;
        }
    }

    /// Halfword / signed-narrow load or store (offset8 form).
    fn ldst_misc(
        &mut self,
        buf: &mut CodeBuffer,
        sh_bits: u32,
        load: bool,
        rt: u8,
        scratch: u8,
        m: &Mem,
    ) -> CodegenResult<()> {
        let (base, disp) = self.lower_base(buf, scratch, m)?;
        let base_word = (AL << 28)
            | (1 << 24)
            | (1 << 22)
            | ((load as u32) << 20)
            | (u32::from(rt) << 12)
            | 0x90
            | sh_bits;
        if (-255..=255).contains(&disp) {
            let (u, off) = if disp >= 0 {
                (1u32, disp as u32)
            } else {
                (0, (-disp) as u32)
            };
            self.put(
                buf,
                base_word
                    | (u << 23)
                    | (u32::from(base) << 16)
                    | ((off >> 4) << 8)
                    | (off & 0xf),
            );
        } else if base == scratch {
            self.add_imm_chunks(buf, scratch, disp);
            self.put(buf, base_word | (1 << 23) | (u32::from(scratch) << 16));
        } else {
            self.load_imm(buf, scratch, disp as u32);
            self.put(buf, enc_dp(AL, OP_ADD, false, base, scratch, u32::from(scratch)));
            self.put(buf, base_word | (1 << 23) | (u32::from(scratch) << 16));
        }
        Ok(())
    }

    fn store_result(
        &mut self,
        buf: &mut CodeBuffer,
        work: u8,
        dst: Operand,
    ) -> CodegenResult<()> {
        match dst {
            Operand::Reg(d) => {
                let native = self.hw(d);
                debug_assert!(native != SPR);
                if native != work {
                    self.put(buf, enc_dp(AL, OP_MOV, false, 0, native, u32::from(work)));
                }
            }
            Operand::Mem(m) => {
                let scratch = if work == IP { LR } else { IP };
                self.ldst_word(buf, false, false, work, scratch, &m)?;
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fhw(&self, r: FReg) -> u8 {
        r.index()
    }

    fn vldst(
        &mut self,
        buf: &mut CodeBuffer,
        load: bool,
        dd: u8,
        m: &Mem,
    ) -> CodegenResult<()> {
        let (base, disp) = self.lower_base(buf, IP, m)?;
        let word = (AL << 28)
            | 0x0d00_0b00
            | ((load as u32) << 20)
            | (u32::from(dd) << 12);
        if disp % 4 == 0 && (-1020..=1020).contains(&disp) {
            let (u, off) = if disp >= 0 {
                (1u32, (disp / 4) as u32)
            } else {
                (0, (-disp / 4) as u32)
            };
            self.put(buf, word | (u << 23) | (u32::from(base) << 16) | off);
        } else if base == IP {
            self.add_imm_chunks(buf, IP, disp);
            self.put(buf, word | (1 << 23) | (u32::from(IP) << 16));
        } else {
            self.load_imm(buf, IP, disp as u32);
            self.put(buf, enc_dp(AL, OP_ADD, false, base, IP, u32::from(IP)));
            self.put(buf, word | (1 << 23) | (u32::from(IP) << 16));
        }
        Ok(())
    }

    fn load_fop(&mut self, buf: &mut CodeBuffer, want: u8, src: FOperand) -> CodegenResult<u8> {
        match src {
            FOperand::Reg(s) => Ok(self.fhw(s)),
            FOperand::Mem(m) => {
                self.vldst(buf, true, want, &m)?;
                Ok(want)
            }
        }
    }

    fn saved_mask(&self, abi: &AbiProfile) -> u32 {
        let mut mask = 1 << LR;
        for i in 0..abi.saveds {
            mask |= 1 << MAP[4 + i as usize];
        }
        mask
    }

    fn local_frame(&self, abi: &AbiProfile) -> u32 {
        let pushes = (self.saved_mask(abi).count_ones() + 2 * u32::from(abi.fsaveds)) * 4;
        let mut l = (abi.local_size + 3) & !3;
        if (pushes + l) % 8 != 0 {
            l += 4;
        }
        l
    }

    fn add_sp_imm(&mut self, buf: &mut CodeBuffer, amount: u32, add: bool) {
        if amount == 0 {
            return;
        }
        let op = if add { OP_ADD } else { OP_SUB };
        if let Some(op2) = imm_rot(amount) {
            self.put(buf, enc_dp(AL, op, false, SPR, SPR, IMM_BIT | op2));
        } else {
            self.load_imm(buf, IP, amount);
            self.put(buf, enc_dp(AL, op, false, SPR, SPR, u32::from(IP)));
        }
    }
}

impl Backend for ArmBackend {
    fn arch(&self) -> Arch {
        if self.v7 {
            Arch::ArmV7
        } else {
            Arch::ArmV5
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
        // stmdb sp!, {saveds, lr}
        self.put(buf, 0xe92d_0000 | self.saved_mask(abi));
        if abi.fsaveds > 0 {
            // vpush {d8..}
            self.put(buf, 0xed2d_8b00 | u32::from(abi.fsaveds) * 2);
        }
        self.add_sp_imm(buf, self.local_frame(abi), false);
        for i in 0..abi.args.count() {
            let dst = MAP[4 + i as usize];
            self.put(buf, enc_dp(AL, OP_MOV, false, 0, dst, u32::from(MAP[i as usize])));
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
        self.maybe_flush(buf, 64);
        self.add_sp_imm(buf, self.local_frame(abi), true);
        if abi.fsaveds > 0 {
            self.put(buf, 0xecbd_8b00 | u32::from(abi.fsaveds) * 2);
        }
        // ldmia sp!, {saveds, pc}: lr was pushed, pc completes the return.
        let mask = (self.saved_mask(abi) & !(1 << LR)) | (1 << PC);
        self.put(buf, 0xe8bd_0000 | mask);
        Ok(())
    }

    fn op0(&mut self, buf: &mut CodeBuffer, op: Op0) -> CodegenResult<()> {
        self.maybe_flush(buf, 64);
        match op {
            Op0::Nop => self.put(buf, NOP),
            Op0::Breakpoint => self.put(buf, 0xe120_0070),
            Op0::LMulUw | Op0::LMulSw => {
                let base = if op == Op0::LMulUw { 0xe080_0090 } else { 0xe0c0_0090 };
                // xmull ip(lo), r1(hi), r0, r1; mov r0, ip
                self.put(buf, base | (1 << 16) | (u32::from(IP) << 12) | (1 << 8) | 0);
                self.put(buf, enc_dp(AL, OP_MOV, false, 0, 0, u32::from(IP)));
            }
            Op0::DivmodUw | Op0::DivmodSw => {
                // v5 has no divide instruction; callers there route
                // division through a call.
                if !self.v7 {
                    return Err(Error::Unsupported);
                }
                let div = if op == Op0::DivmodUw { 0xe730_f110 } else { 0xe710_f110 };
                // xdiv ip, r0, r1; mls r1, ip, r1, r0; mov r0, ip
                self.put(buf, div | (u32::from(IP) << 16) | (1 << 8));
                self.put(
                    buf,
                    0xe060_0090 | (1 << 16) | (0 << 12) | (1 << 8) | u32::from(IP),
                );
                self.put(buf, enc_dp(AL, OP_MOV, false, 0, 0, u32::from(IP)));
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
        self.maybe_flush(buf, 96);
        let dst = dst.ok_or(Error::BadArgument)?;
        if mods.sets_flags() && !op.is_mov() {
            self.ov_from_z = false;
        }
        match op {
            Op1::Mov | Op1::MovU32 | Op1::MovS32 => {
                match (dst, src) {
                    (Operand::Reg(d), Operand::Reg(s)) => {
                        let (d, s) = (self.hw(d), self.hw(s));
                        if d != s {
                            self.put(buf, enc_dp(AL, OP_MOV, false, 0, d, u32::from(s)));
                        }
                    }
                    (Operand::Reg(d), Operand::Imm(v)) => self.load_imm(buf, self.hw(d), v as u32),
                    (Operand::Reg(d), Operand::Mem(m)) => {
                        let d = self.hw(d);
                        self.ldst_word(buf, true, false, d, if d == IP { LR } else { IP }, &m)?;
                    }
                    (Operand::Mem(dm), _) => {
                        let work = self.load_word(buf, IP, LR, src)?;
                        let scratch = if work == IP { LR } else { IP };
                        self.ldst_word(buf, false, false, work, scratch, &dm)?;
                    }
                    (Operand::Imm(_), _) => return Err(Error::BadArgument),
                }
            }
            Op1::MovU8 | Op1::MovS8 | Op1::MovU16 | Op1::MovS16 => {
                let (width, signed) = op.mov_width().unwrap();
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => IP,
                };
                match src {
                    Operand::Mem(m) => match (width, signed) {
                        (1, false) => self.ldst_word(buf, true, true, work, LR, &m)?,
                        (1, true) => self.ldst_misc(buf, 0x40, true, work, LR, &m)?,
                        (2, false) => self.ldst_misc(buf, 0x20, true, work, LR, &m)?,
                        _ => self.ldst_misc(buf, 0x60, true, work, LR, &m)?,
                    },
                    Operand::Reg(s) => {
                        let s = self.hw(s);
                        // Shift up and back down.
                        let sh = 32 - 8 * u32::from(width);
                        let up = enc_dp(AL, OP_MOV, false, 0, work, (sh << 7) | u32::from(s));
                        let ty = if signed { 0b10u32 } else { 0b01 }; // asr/lsr
                        let down =
                            enc_dp(AL, OP_MOV, false, 0, work, (sh << 7) | (ty << 5) | u32::from(work));
                        self.put(buf, up);
                        self.put(buf, down);
                    }
                    Operand::Imm(v) => {
                        let v = match (width, signed) {
                            (1, false) => (v as u8) as i64,
                            (1, true) => (v as i8) as i64,
                            (2, false) => (v as u16) as i64,
                            _ => (v as i16) as i64,
                        };
                        self.load_imm(buf, work, v as u32);
                    }
                }
                if let Operand::Mem(dm) = dst {
                    match width {
                        1 => self.ldst_word(buf, false, true, work, LR, &dm)?,
                        _ => self.ldst_misc(buf, 0x20, false, work, LR, &dm)?,
                    }
                }
            }
            Op1::Not | Op1::Neg => {
                let s = self.load_word(buf, IP, LR, src)?;
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => IP,
                };
                let set = mods.sets_flags();
                if op == Op1::Not {
                    self.put(buf, enc_dp(AL, OP_MVN, set, 0, work, u32::from(s)));
                } else {
                    // rsb work, s, #0
                    self.put(buf, enc_dp(AL, 0x3, set, s, work, IMM_BIT));
                }
                self.store_result(buf, work, dst)?;
            }
            Op1::Clz => {
                let s = self.load_word(buf, IP, LR, src)?;
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => IP,
                };
                self.put(buf, 0xe16f_0f10 | (u32::from(work) << 12) | u32::from(s));
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
        self.maybe_flush(buf, 128);
        if mods.sets_flags() {
            self.ov_from_z = false;
        }
        let set = mods.sets_flags();
        let a = self.load_word(buf, IP, LR, src1)?;
        let work = match dst {
            Some(Operand::Reg(d)) => self.hw(d),
            _ => IP,
        };
        match op {
            Op2::Shl | Op2::Lshr | Op2::Ashr => {
                let ty: u32 = match op {
                    Op2::Shl => 0,
                    Op2::Lshr => 1,
                    _ => 2,
                };
                let op2 = match src2 {
                    Operand::Imm(v) => {
                        let sh = (v as u32) & 31;
                        (sh << 7) | (ty << 5) | u32::from(a)
                    }
                    _ => {
                        let b = self.load_word(buf, LR, LR, src2)?;
                        (u32::from(b) << 8) | (ty << 5) | 0x10 | u32::from(a)
                    }
                };
                self.put(buf, enc_dp(AL, OP_MOV, set, 0, work, op2));
            }
            Op2::Mul => {
                let b = self.load_word(buf, LR, LR, src2)?;
                if mods.set_overflow {
                    // smull lo, hi, a, b ; cmp hi, lo asr #31
                    self.put(
                        buf,
                        0xe0c0_0090
                            | (u32::from(LR) << 16)
                            | (u32::from(work) << 12)
                            | (u32::from(b) << 8)
                            | u32::from(a),
                    );
                    self.put(
                        buf,
                        enc_dp(AL, OP_CMP, true, LR, 0, (31 << 7) | (0b10 << 5) | u32::from(work)),
                    );
                    self.ov_from_z = true;
                } else {
                    // mul work, a, b (rd may not equal rm on v5: swap if so)
                    let (rm, rs) = if work == a { (b, a) } else { (a, b) };
                    let rd = if work == rm { LR } else { work };
                    self.put(
                        buf,
                        0xe000_0090
                            | ((set as u32) << 20)
                            | (u32::from(rd) << 16)
                            | (u32::from(rs) << 8)
                            | u32::from(rm),
                    );
                    if rd != work {
                        self.put(buf, enc_dp(AL, OP_MOV, false, 0, work, u32::from(rd)));
                    }
                }
            }
            _ => {
                let (opcode, rsb) = match op {
                    Op2::Add => (OP_ADD, false),
                    Op2::Addc => (OP_ADC, false),
                    Op2::Sub => (OP_SUB, false),
                    Op2::Subc => (OP_SBC, false),
                    Op2::And => (OP_AND, false),
                    Op2::Or => (OP_ORR, false),
                    Op2::Xor => (OP_EOR, false),
                    _ => unreachable!(),
                };
                let _ = rsb;
                // cmp/tst forms when there is no destination.
                let (opcode, rd, s) = if dst.is_none() {
                    match op {
                        Op2::Sub => (OP_CMP, 0, true),
                        Op2::And => (OP_TST, 0, true),
                        _ => (opcode, work, set),
                    }
                } else {
                    (opcode, work, set)
                };
                let op2 = match src2 {
                    Operand::Imm(v) if imm_rot(v as u32).is_some() => {
                        IMM_BIT | imm_rot(v as u32).unwrap()
                    }
                    _ => {
                        let b = self.load_word(buf, LR, LR, src2)?;
                        u32::from(b)
                    }
                };
                let discard = dst.is_none() && !matches!(opcode, OP_CMP | OP_TST);
                let rd = if discard { IP } else { rd };
                self.put(buf, enc_dp(AL, opcode, s, a, rd, op2));
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
        self.maybe_flush(buf, 96);
        match op {
            FOp1::Mov => match (dst, src) {
                (FOperand::Reg(d), FOperand::Reg(s)) => {
                    if d != s {
                        self.put(
                            buf,
                            0xeeb0_0b40 | (u32::from(self.fhw(d)) << 12) | u32::from(self.fhw(s)),
                        );
                    }
                }
                (FOperand::Reg(d), FOperand::Mem(m)) => self.vldst(buf, true, self.fhw(d), &m)?,
                (FOperand::Mem(m), FOperand::Reg(s)) => self.vldst(buf, false, self.fhw(s), &m)?,
                (FOperand::Mem(dm), FOperand::Mem(_)) => {
                    let s = self.load_fop(buf, FTMP, src)?;
                    self.vldst(buf, false, s, &dm)?;
                }
            },
            FOp1::Neg | FOp1::Abs => {
                let s = self.load_fop(buf, FTMP, src)?;
                let work = match dst {
                    FOperand::Reg(d) => self.fhw(d),
                    _ => FTMP,
                };
                let base = if op == FOp1::Neg { 0xeeb1_0b40 } else { 0xeeb0_0bc0 };
                self.put(buf, base | (u32::from(work) << 12) | u32::from(s));
                if let FOperand::Mem(dm) = dst {
                    self.vldst(buf, false, work, &dm)?;
                }
            }
            FOp1::Cmp => {
                let a = self.load_fop(buf, FTMP, dst)?;
                let b = self.load_fop(buf, FTMP2, src)?;
                self.put(buf, 0xeeb4_0b40 | (u32::from(a) << 12) | u32::from(b));
                // vmrs APSR_nzcv, fpscr
                self.put(buf, 0xeef1_fa10);
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
        self.maybe_flush(buf, 96);
        let base = match op {
            FOp2::Add => 0xee30_0b00,
            FOp2::Sub => 0xee30_0b40,
            FOp2::Mul => 0xee20_0b00,
            FOp2::Div => 0xee80_0b00,
        };
        let a = self.load_fop(buf, FTMP, src1)?;
        let b = self.load_fop(buf, FTMP2, src2)?;
        let work = match dst {
            FOperand::Reg(d) => self.fhw(d),
            _ => FTMP,
        };
        self.put(
            buf,
            base | (u32::from(a) << 16) | (u32::from(work) << 12) | u32::from(b),
        );
        if let FOperand::Mem(dm) = dst {
            self.vldst(buf, false, work, &dm)?;
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
        self.maybe_flush(buf, 64);
        let cond = if self.ov_from_z {
            match cc {
                CondCode::Overflow => 0x1,
                CondCode::NotOverflow => 0x0,
                _ => cond_bits(cc),
            }
        } else {
            cond_bits(cc)
        };
        match op {
            FlagsOp::Mov => {
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => IP,
                };
                self.put(buf, enc_dp(AL, OP_MOV, false, 0, work, IMM_BIT));
                self.put(buf, enc_dp(cond, OP_MOV, false, 0, work, IMM_BIT | 1));
                self.store_result(buf, work, dst)?;
            }
            FlagsOp::Or => {
                let cur = self.load_word(buf, IP, LR, dst)?;
                self.put(buf, enc_dp(cond, OP_ORR, false, cur, cur, IMM_BIT | 1));
                self.store_result(buf, cur, dst)?;
            }
        }
        Ok(())
    }

    fn fast_enter(&mut self, buf: &mut CodeBuffer, dst: Operand) -> CodegenResult<()> {
        self.maybe_flush(buf, 32);
        match dst {
            Operand::Reg(d) => {
                self.put(buf, enc_dp(AL, OP_MOV, false, 0, self.hw(d), u32::from(LR)))
            }
            Operand::Mem(m) => self.ldst_word(buf, false, false, LR, IP, &m)?,
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fast_return(&mut self, buf: &mut CodeBuffer, src: Operand) -> CodegenResult<()> {
        self.maybe_flush(buf, 32);
        let target = self.load_word(buf, IP, LR, src)?;
        // bx target
        self.put(buf, 0xe12f_ff10 | u32::from(target));
        Ok(())
    }

    fn add_no_flags(&mut self, buf: &mut CodeBuffer, reg: Reg, disp: i64) -> CodegenResult<()> {
        let r = self.hw(reg);
        let (op, amount) = if disp >= 0 {
            (OP_ADD, disp as u32)
        } else {
            (OP_SUB, (-disp) as u32)
        };
        if let Some(op2) = imm_rot(amount) {
            self.put(buf, enc_dp(AL, op, false, r, r, IMM_BIT | op2));
        } else {
            self.load_imm(buf, IP, amount);
            self.put(buf, enc_dp(AL, op, false, r, r, u32::from(IP)));
        }
        Ok(())
    }

    fn jump(&mut self, buf: &mut CodeBuffer, ty: JumpType) -> CodegenResult<Jump> {
        self.maybe_flush(buf, 64);
        let kind = match ty.kind {
            // A synthesized overflow lives in the zero flag.
            JumpKind::Cond(CondCode::Overflow) if self.ov_from_z => {
                JumpKind::Cond(CondCode::NotEqual)
            }
            JumpKind::Cond(CondCode::NotOverflow) if self.ov_from_z => {
                JumpKind::Cond(CondCode::Equal)
            }
            k => k,
        };
        let data = JumpData {
            kind,
            rewritable: ty.rewritable,
            target: JumpTarget::Unset,
            hint: 0,
            delay: None,
        };
        let size = *self.jump_encodings(&data).last().unwrap();
        let jump = buf.add_jump(data, size);
        if !self.v7 {
            // v5 far targets live in the pool; direct label branches
            // resolve without one, but a rewritable or absolute target
            // needs its slot registered now so the range tracking sees it.
            if ty.rewritable {
                self.first_use.get_or_insert(buf.cur_offset());
                self.pool.push(PoolEntry {
                    payload: PoolPayload::JumpTarget(jump),
                    unique: true,
                    uses: SmallVec::new(),
                });
            }
        }
        Ok(jump)
    }

    fn ijump(&mut self, buf: &mut CodeBuffer, ty: JumpType, src: Operand) -> CodegenResult<()> {
        self.maybe_flush(buf, 64);
        if let Operand::Imm(target) = src {
            let data = JumpData {
                kind: ty.kind,
                rewritable: false,
                target: JumpTarget::Addr(target as u64),
                hint: 0,
                delay: None,
            };
            let size = *self.jump_encodings(&data).last().unwrap();
            let jump = buf.add_jump(data, size);
            if !self.v7 {
                self.first_use.get_or_insert(buf.cur_offset());
                self.pool.push(PoolEntry {
                    payload: PoolPayload::JumpTarget(jump),
                    unique: true,
                    uses: SmallVec::new(),
                });
            }
            return Ok(());
        }
        let target = self.load_word(buf, IP, LR, src)?;
        let link = matches!(ty.kind, JumpKind::Call(_) | JumpKind::FastCall);
        let word = if link { 0xe12f_ff30 } else { 0xe12f_ff10 };
        self.put(buf, word | u32::from(target));
        Ok(())
    }

    fn const_(
        &mut self,
        buf: &mut CodeBuffer,
        dst: Option<Operand>,
        init: i64,
    ) -> CodegenResult<Const> {
        self.maybe_flush(buf, 64);
        let dst = dst.ok_or(Error::BadArgument)?;
        let work = match dst {
            Operand::Reg(d) => self.hw(d),
            _ => IP,
        };
        let konst;
        if self.v7 {
            self.movw_movt(buf, work, init as u32);
            konst = buf.add_const(8);
        } else {
            self.emit_pool_load(buf, AL, work, PoolPayload::Value(init as u32), true);
            konst = buf.add_const(4);
        }
        if let Operand::Mem(m) = dst {
            let scratch = if work == IP { LR } else { IP };
            self.ldst_word(buf, false, false, work, scratch, &m)?;
        }
        Ok(konst)
    }

    // ---- layout ---------------------------------------------------------

    fn before_layout(&mut self, buf: &mut CodeBuffer) -> CodegenResult<()> {
        self.flush_pool(buf);
        Ok(())
    }

    fn jump_encodings(&self, jump: &JumpData) -> &'static [u32] {
        let label = matches!(jump.target, JumpTarget::Label(_));
        if label && !jump.rewritable {
            &[4]
        } else if self.v7 {
            &[12]
        } else {
            match jump.kind {
                JumpKind::Call(_) | JumpKind::FastCall => &[8],
                _ => &[4],
            }
        }
    }

    fn jump_needed_size(
        &self,
        jump: &JumpData,
        _at: CodeOffset,
        _target: Option<CodeOffset>,
    ) -> u32 {
        self.jump_encodings(jump)[0]
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
            JumpKind::Cond(cc) => cond_bits(cc),
            JumpKind::FCond(cc) => fcond_bits(cc),
            _ => AL,
        };
        let label = matches!(jump.target, JumpTarget::Label(_));
        if label && !jump.rewritable {
            let target = target.unwrap();
            let link = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
            let imm24 = (i64::from(target) - i64::from(at) - 8) / 4;
            let op = if link { 0x0b00_0000 } else { 0x0a00_0000 };
            sink.put4((cond << 28) | op | ((imm24 as u32) & 0x00ff_ffff));
            return at;
        }
        if self.v7 {
            // movw/movt ip, target; bx/blx ip -- all conditional.
            let fix = match jump.target {
                JumpTarget::Label(_) => FixTarget::Offset(target.unwrap()),
                JumpTarget::Addr(a) => FixTarget::Addr(a),
                JumpTarget::Unset => FixTarget::Addr(0),
            };
            sink.fixup(FixupKind::ArmMovSeq, fix);
            let value = match fix {
                FixTarget::Addr(a) => a as u32,
                _ => 0,
            };
            let lo = value & 0xffff;
            let hi = value >> 16;
            sink.put4(
                (cond << 28) | 0x0300_0000 | ((lo >> 12) << 16) | (u32::from(IP) << 12) | (lo & 0xfff),
            );
            sink.put4(
                (cond << 28) | 0x0340_0000 | ((hi >> 12) << 16) | (u32::from(IP) << 12) | (hi & 0xfff),
            );
            let link = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
            let word = if link { 0x012f_ff30 } else { 0x012f_ff10 };
            sink.put4((cond << 28) | word | u32::from(IP));
            return at;
        }
        // v5: ldr<cond> pc, [pc, #pool] (with mov lr, pc first for calls).
        debug_assert!(jump.hint != 0, "far jump without a pool slot");
        let entry_voff = jump.hint - 1;
        let link = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
        let mut ldr_at = at;
        if link {
            // mov lr, pc (pc reads as the ldr address + 8 = return point)
            sink.put4(enc_dp(cond, OP_MOV, false, 0, LR, u32::from(PC)));
            ldr_at = at + 4;
        }
        let diff = i64::from(entry_voff) - (i64::from(ldr_at) + 8);
        let (u, off) = if diff >= 0 {
            (1u32, diff as u32)
        } else {
            (0u32, (-diff) as u32)
        };
        debug_assert!(off < 4096, "pool entry out of ldr range");
        sink.put4(
            (cond << 28) | 0x0510_0000 | (u << 23) | (u32::from(PC) << 16) | (u32::from(PC) << 12) | off,
        );
        let _ = size;
        ldr_at
    }

    fn pad_to(&self, target: CodeOffset, sink: &mut CodeSink) {
        while sink.cur_offset() < target {
            sink.put4(NOP);
        }
    }
}

/// Rewrite a v7 `movw`/`movt` pair in place.
pub(crate) fn patch_movw_movt(code: &mut [u8], value: u32) {
    let lo = value & 0xffff;
    let hi = value >> 16;
    let mut w0 = u32::from_le_bytes(code[0..4].try_into().unwrap());
    w0 = (w0 & 0xfff0_f000) | ((lo >> 12) << 16) | (lo & 0xfff);
    code[0..4].copy_from_slice(&w0.to_le_bytes());
    let mut w1 = u32::from_le_bytes(code[4..8].try_into().unwrap());
    w1 = (w1 & 0xfff0_f000) | ((hi >> 12) << 16) | (hi & 0xfff);
    code[4..8].copy_from_slice(&w1.to_le_bytes());
}

/// Follow a v5 `ldr` at `at` to its pool slot and rewrite the literal.
///
/// # Safety
/// `at` must point at a pool-referencing `ldr` emitted by this backend,
/// with the pool slot mapped writable.
pub(crate) unsafe fn patch_pool_load(at: *mut u8, value: u32) {
    let word = u32::from_le_bytes(core::slice::from_raw_parts(at, 4).try_into().unwrap());
    let off = (word & 0xfff) as isize;
    let up = word & (1 << 23) != 0;
    let slot = if up {
        at.offset(8 + off)
    } else {
        at.offset(8 - off)
    };
    core::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), slot, 4);
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::operand::{r, s};

    fn emit(v7: bool, f: impl FnOnce(&mut ArmBackend, &mut CodeBuffer)) -> Vec<u32> {
        let mut backend = ArmBackend::new(v7);
        let mut buf = CodeBuffer::new();
        f(&mut backend, &mut buf);
        let image = buf.finalize(&mut backend).unwrap();
        image
            .code()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn mov_and_add() {
        let words = emit(false, |b, buf| {
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
        // mov r0, r1 ; add r0, r0, r1
        assert_eq!(words, vec![0xe1a0_0001, 0xe080_0001]);
    }

    #[test]
    fn rotated_immediate() {
        let words = emit(false, |b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Imm(0xff00),
            )
            .unwrap();
        });
        // mov r0, #0xff00 (imm8=0xff ror 24)
        assert_eq!(words, vec![0xe3a0_0cff]);
    }

    #[test]
    fn v5_wide_imm_goes_to_pool() {
        let words = emit(false, |b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Imm(0x12345678),
            )
            .unwrap();
        });
        // ldr r0, [pc, #0] ; b over ; pool word
        assert_eq!(words[0], 0xe59f_0000);
        assert!(words.contains(&0x1234_5678));
    }

    #[test]
    fn v7_wide_imm_uses_movw_movt() {
        let words = emit(true, |b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Imm(0x12345678),
            )
            .unwrap();
        });
        // movw r0, #0x5678 ; movt r0, #0x1234
        assert_eq!(words, vec![0xe305_0678, 0xe341_0234]);
    }

    #[test]
    fn pool_shares_non_unique_values() {
        let words = emit(false, |b, buf| {
            for _ in 0..2 {
                b.op1(
                    buf,
                    Op1::Mov,
                    Mods::new(),
                    Some(Operand::Reg(r(0))),
                    Operand::Imm(0x12345678),
                )
                .unwrap();
            }
        });
        let pool_words = words.iter().filter(|w| **w == 0x1234_5678).count();
        assert_eq!(pool_words, 1);
    }

    #[test]
    fn load_with_offset() {
        let words = emit(false, |b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Mem(Mem::base(s(0), 16)),
            )
            .unwrap();
        });
        // ldr r0, [r4, #16]
        assert_eq!(words, vec![0xe594_0010]);
    }

    #[test]
    fn label_branch_is_single_word() {
        let mut backend = ArmBackend::new(false);
        let mut buf = CodeBuffer::new();
        let j = backend
            .jump(&mut buf, JumpType::cond(CondCode::Equal))
            .unwrap();
        for _ in 0..3 {
            backend.op0(&mut buf, Op0::Nop).unwrap();
        }
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        let w = u32::from_le_bytes(image.code()[0..4].try_into().unwrap());
        // beq +16: imm24 = (16 - 8) / 4 = 2
        assert_eq!(w, 0x0a00_0002);
    }

    #[test]
    fn rewritable_jump_uses_pool_slot() {
        let mut backend = ArmBackend::new(false);
        let mut buf = CodeBuffer::new();
        let j = backend.jump(&mut buf, JumpType::jump().rewritable()).unwrap();
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        // ldr pc, [pc, #...] followed by the branch-over and the slot.
        let w = u32::from_le_bytes(image.code()[0..4].try_into().unwrap());
        assert_eq!(w & 0xfff0_f000, 0xe590_f000);
        let mut code = image.code().to_vec();
        image.relocate(0x8000, &mut code);
        // The pool slot holds the label's absolute address.
        let slot = image.len() - 4;
        let val = u32::from_le_bytes(code[slot..slot + 4].try_into().unwrap());
        assert_eq!(val, 0x8000 + 4);
    }
}
