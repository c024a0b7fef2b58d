//! The compiler handle: state machine, sticky errors and emission entry
//! points.
//!
//! The compiler validates operands, drives the verbose sink and forwards to
//! the architecture backend; encoders never see ill-formed operands outside
//! debug builds. The first failure latches and every later emit call
//! returns it without touching the buffer, so clients typically check once
//! after `finish`.

use std::io::Write;

use log::debug;

use crate::abi::{AbiProfile, ArgTypes, EnterOptions, MAX_LOCAL_SIZE};
use crate::buffer::{CodeBuffer, CodeImage, Const, Jump, JumpTarget, Label};
use crate::condcodes::CondCode;
use crate::isa::{self, Arch, Backend};
use crate::lir::{FOp1, FOp2, FlagsOp, JumpKind, JumpType, Mods, Op0, Op1, Op2};
use crate::operand::{FOperand, Operand, Reg};
use crate::verbose::Verbose;
use crate::{CodegenResult, Error};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Fresh,
    Entered,
}

/// A short-lived code-emission context. Create one per function, feed it
/// ops, then call [`Compiler::finish`] to obtain the relocatable image.
pub struct Compiler {
    arch: Arch,
    backend: Box<dyn Backend>,
    buf: CodeBuffer,
    state: State,
    error: Option<Error>,
    abi: Option<AbiProfile>,
    verbose: Verbose,
}

impl Compiler {
    /// A compiler for the running machine.
    pub fn new() -> CodegenResult<Compiler> {
        let arch = Arch::host().map_err(|_| Error::Unsupported)?;
        Ok(Self::for_arch(arch))
    }

    /// A compiler for an explicit target. The produced image can be linked
    /// and inspected on any host; executing it requires `arch` to match
    /// the machine.
    pub fn for_arch(arch: Arch) -> Compiler {
        Compiler {
            arch,
            backend: isa::backend_for(arch),
            buf: CodeBuffer::new(),
            state: State::Fresh,
            error: None,
            abi: None,
            verbose: Verbose::new(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The latched error, if any emission has failed.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// Install or remove the verbose sink; one line per LIR op.
    pub fn set_verbose(&mut self, sink: Option<Box<dyn Write + Send>>) {
        self.verbose.set(sink);
    }

    fn guard(&self) -> CodegenResult<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn latch<T>(&mut self, r: CodegenResult<T>) -> CodegenResult<T> {
        if let Err(e) = &r {
            if self.error.is_none() {
                self.error = Some(*e);
            }
        }
        r
    }

    fn entered(&self) -> CodegenResult<&AbiProfile> {
        if self.state != State::Entered {
            return Err(Error::BadArgument);
        }
        self.abi.as_ref().ok_or(Error::BadArgument)
    }

    // ---- operand validation --------------------------------------------

    fn check_reg(&self, r: Reg, as_dst: bool) -> CodegenResult<()> {
        let abi = self.entered()?;
        if r.is_sp() {
            // The locals base is read-only.
            if as_dst {
                debug_assert!(false, "sp is not writable");
                return Err(Error::BadArgument);
            }
            return Ok(());
        }
        let ok = match (r.scratch_index(), r.saved_index()) {
            (Some(i), _) => i < abi.scratches,
            (_, Some(i)) => i < abi.saveds,
            _ => false,
        };
        if !ok {
            debug_assert!(false, "register outside the declared file");
            return Err(Error::BadArgument);
        }
        Ok(())
    }

    fn check_operand(&self, op: &Operand, as_dst: bool) -> CodegenResult<()> {
        match op {
            Operand::Reg(r) => self.check_reg(*r, as_dst),
            Operand::Imm(_) => {
                if as_dst {
                    debug_assert!(false, "immediate destination");
                    return Err(Error::BadArgument);
                }
                Ok(())
            }
            Operand::Mem(m) => {
                if let Some(base) = m.base {
                    self.check_reg(base, false)?;
                }
                if let Some((index, shift)) = m.index {
                    self.check_reg(index, false)?;
                    if index.is_sp() || shift > 3 {
                        debug_assert!(false, "bad memory index");
                        return Err(Error::BadArgument);
                    }
                }
                Ok(())
            }
        }
    }

    fn check_foperand(&self, op: &FOperand) -> CodegenResult<()> {
        match op {
            FOperand::Reg(r) => {
                let abi = self.entered()?;
                if r.index() >= abi.fscratches {
                    debug_assert!(false, "float register outside the declared file");
                    return Err(Error::BadArgument);
                }
                Ok(())
            }
            FOperand::Mem(m) => self.check_operand(&Operand::Mem(*m), false),
        }
    }

    // ---- lifecycle ------------------------------------------------------

    /// Emit the function prologue and latch the ABI profile.
    #[allow(clippy::too_many_arguments)]
    pub fn emit_enter(
        &mut self,
        _options: EnterOptions,
        arg_types: ArgTypes,
        scratches: u8,
        saveds: u8,
        fscratches: u8,
        fsaveds: u8,
        local_size: u32,
    ) -> CodegenResult<()> {
        self.guard()?;
        let r = self.enter_common(arg_types, scratches, saveds, fscratches, fsaveds, local_size, false);
        self.latch(r)
    }

    /// Latch the ABI profile without emitting the prologue, so a body can
    /// return from code entered elsewhere.
    #[allow(clippy::too_many_arguments)]
    pub fn fake_enter(
        &mut self,
        _options: EnterOptions,
        arg_types: ArgTypes,
        scratches: u8,
        saveds: u8,
        fscratches: u8,
        fsaveds: u8,
        local_size: u32,
    ) -> CodegenResult<()> {
        self.guard()?;
        let r = self.enter_common(arg_types, scratches, saveds, fscratches, fsaveds, local_size, true);
        self.latch(r)
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_common(
        &mut self,
        arg_types: ArgTypes,
        scratches: u8,
        saveds: u8,
        fscratches: u8,
        fsaveds: u8,
        local_size: u32,
        fake: bool,
    ) -> CodegenResult<()> {
        if self.state != State::Fresh {
            return Err(Error::BadArgument);
        }
        let limits = self.backend.limits();
        let ok = scratches <= limits.scratches_max
            && saveds <= limits.saveds_max
            && fscratches <= limits.fscratches_max
            && fsaveds <= limits.fsaveds_max
            && arg_types.count() <= saveds
            && local_size <= MAX_LOCAL_SIZE;
        if !ok {
            debug_assert!(false, "enter arguments out of range");
            return Err(Error::BadArgument);
        }
        let abi = AbiProfile {
            args: arg_types,
            scratches,
            saveds,
            fscratches,
            fsaveds,
            local_size,
        };
        self.verbose.enter(arg_types.count(), scratches, saveds, local_size);
        if fake {
            self.backend.fake_enter(&abi)?;
        } else {
            self.backend.enter(&mut self.buf, &abi)?;
        }
        self.abi = Some(abi);
        self.state = State::Entered;
        Ok(())
    }

    /// Emit the epilogue with a return value.
    pub fn emit_return(&mut self, op: Op1, src: Operand) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            if !op.is_mov() {
                debug_assert!(false, "return op must be a move");
                return Err(Error::BadArgument);
            }
            self.check_operand(&src, false)?;
            let abi = *self.entered()?;
            self.verbose.ret(Some((op, src)));
            self.backend.ret(&mut self.buf, &abi, Some((op, src)))
        })();
        self.latch(r)
    }

    /// Emit the epilogue without a return value.
    pub fn emit_return_void(&mut self) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            let abi = *self.entered()?;
            self.verbose.ret(None);
            self.backend.ret(&mut self.buf, &abi, None)
        })();
        self.latch(r)
    }

    // ---- plain ops ------------------------------------------------------

    pub fn emit_op0(&mut self, op: Op0) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            self.verbose.op0(op);
            self.backend.op0(&mut self.buf, op)
        })();
        self.latch(r)
    }

    pub fn emit_op1(
        &mut self,
        op: Op1,
        mods: Mods,
        dst: Option<Operand>,
        src: Operand,
    ) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            if let Some(d) = &dst {
                self.check_operand(d, true)?;
            }
            self.check_operand(&src, false)?;
            let op = self.normalize_op1(op);
            self.verbose.op1(op, mods, &dst, &src);
            self.backend.op1(&mut self.buf, op, mods, dst, src)
        })();
        self.latch(r)
    }

    pub fn emit_op2(
        &mut self,
        op: Op2,
        mods: Mods,
        dst: Option<Operand>,
        src1: Operand,
        src2: Operand,
    ) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            if let Some(d) = &dst {
                self.check_operand(d, true)?;
            }
            self.check_operand(&src1, false)?;
            self.check_operand(&src2, false)?;
            self.verbose.op2(op, mods, &dst, &src1, &src2);
            self.backend.op2(&mut self.buf, op, mods, dst, src1, src2)
        })();
        self.latch(r)
    }

    /// A move with base-register write-back: the memory operand's base is
    /// advanced by its displacement after the access, without disturbing
    /// the emulated flags.
    pub fn emit_mov_update(
        &mut self,
        op: Op1,
        dst: Operand,
        src: Operand,
    ) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            if !op.is_mov() {
                debug_assert!(false, "write-back needs a move op");
                return Err(Error::BadArgument);
            }
            let m = match (&dst, &src) {
                (Operand::Mem(_), Operand::Mem(_)) | (Operand::Reg(_), Operand::Reg(_)) => {
                    debug_assert!(false, "write-back needs exactly one memory operand");
                    return Err(Error::BadArgument);
                }
                (Operand::Mem(m), _) | (_, Operand::Mem(m)) => m,
                _ => {
                    debug_assert!(false, "write-back needs a memory operand");
                    return Err(Error::BadArgument);
                }
            };
            let (base, disp) = match (m.base, m.index) {
                (Some(b), None) if !b.is_sp() => (b, m.disp),
                _ => {
                    debug_assert!(false, "write-back needs [base + disp]");
                    return Err(Error::BadArgument);
                }
            };
            self.check_operand(&dst, true)?;
            self.check_operand(&src, false)?;
            self.verbose.op1(op, Mods::new(), &Some(dst), &src);
            self.backend.op1(&mut self.buf, op, Mods::new(), Some(dst), src)?;
            if disp != 0 {
                self.backend.add_no_flags(&mut self.buf, base, disp)?;
            }
            Ok(())
        })();
        self.latch(r)
    }

    pub fn emit_fop1(&mut self, op: FOp1, dst: FOperand, src: FOperand) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            self.check_foperand(&dst)?;
            self.check_foperand(&src)?;
            self.verbose.fop1(op, &dst, &src);
            self.backend.fop1(&mut self.buf, op, dst, src)
        })();
        self.latch(r)
    }

    pub fn emit_fop2(
        &mut self,
        op: FOp2,
        dst: FOperand,
        src1: FOperand,
        src2: FOperand,
    ) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            self.check_foperand(&dst)?;
            self.check_foperand(&src1)?;
            self.check_foperand(&src2)?;
            self.verbose.fop2(op, &dst, &src1, &src2);
            self.backend.fop2(&mut self.buf, op, dst, src1, src2)
        })();
        self.latch(r)
    }

    // ---- labels, jumps, consts -----------------------------------------

    pub fn emit_label(&mut self) -> CodegenResult<Label> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            self.verbose.label();
            self.backend.pre_label(&mut self.buf);
            Ok(self.buf.emit_label())
        })();
        self.latch(r)
    }

    /// A label aligned to `align` bytes, optionally followed by read-only
    /// data blocks copied verbatim into the code image. Control does not
    /// fall past the data: jump over it or place it after a return.
    pub fn emit_aligned_label(
        &mut self,
        align: u32,
        ro_buffers: &[&[u8]],
    ) -> CodegenResult<Label> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            if !align.is_power_of_two() || align > 4096 {
                debug_assert!(false, "bad alignment");
                return Err(Error::BadArgument);
            }
            self.backend.pre_label(&mut self.buf);
            self.buf.emit_align(align);
            self.verbose.label();
            let label = self.buf.emit_label();
            use crate::buffer::ByteSink;
            for data in ro_buffers {
                for b in *data {
                    self.buf.put1(*b);
                }
            }
            Ok(label)
        })();
        self.latch(r)
    }

    pub fn emit_jump(&mut self, ty: JumpType) -> CodegenResult<Jump> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            if let JumpKind::Call(n) = ty.kind {
                if n > 3 {
                    debug_assert!(false, "at most 3 call arguments");
                    return Err(Error::BadArgument);
                }
            }
            self.verbose.jump(ty);
            self.backend.jump(&mut self.buf, ty)
        })();
        self.latch(r)
    }

    pub fn emit_ijump(&mut self, ty: JumpType, src: Operand) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            if matches!(ty.kind, JumpKind::Cond(_) | JumpKind::FCond(_)) {
                debug_assert!(false, "indirect jumps are unconditional");
                return Err(Error::BadArgument);
            }
            self.check_operand(&src, false)?;
            self.verbose.ijump(ty, &src);
            self.backend.ijump(&mut self.buf, ty, src)
        })();
        self.latch(r)
    }

    /// Fused compare-and-branch: compares `src1` with `src2` and emits a
    /// conditional jump on `cc` (rewritable if requested).
    pub fn emit_cmp(
        &mut self,
        ty: JumpType,
        src1: Operand,
        src2: Operand,
    ) -> CodegenResult<Jump> {
        self.guard()?;
        let r = (|| {
            let cc = match ty.kind {
                JumpKind::Cond(cc) => cc,
                _ => {
                    debug_assert!(false, "emit_cmp needs an integer predicate");
                    return Err(Error::BadArgument);
                }
            };
            self.entered()?;
            self.check_operand(&src1, false)?;
            self.check_operand(&src2, false)?;
            self.verbose.cmp(cc, &src1, &src2);
            let mut mods = Mods::new();
            mods.set_z = matches!(cc, CondCode::Equal | CondCode::NotEqual);
            mods.cmp = Some(cc);
            self.backend.op2(&mut self.buf, Op2::Sub, mods, None, src1, src2)?;
            self.backend.jump(&mut self.buf, ty)
        })();
        self.latch(r)
    }

    /// Materialize 0/1 from an emulated predicate into `dst`.
    pub fn emit_op_flags(
        &mut self,
        op: FlagsOp,
        dst: Operand,
        cc: CondCode,
    ) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            self.check_operand(&dst, true)?;
            self.verbose.op_flags(op, &dst, cc);
            self.backend.op_flags(&mut self.buf, op, dst, cc)
        })();
        self.latch(r)
    }

    /// Fetch the fast-call return address into `dst`.
    pub fn emit_fast_enter(&mut self, dst: Operand) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            self.check_operand(&dst, true)?;
            self.verbose.fast_enter(&dst);
            self.backend.fast_enter(&mut self.buf, dst)
        })();
        self.latch(r)
    }

    /// Return through a fast-call return address in `src`.
    pub fn emit_fast_return(&mut self, src: Operand) -> CodegenResult<()> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            self.check_operand(&src, false)?;
            self.verbose.fast_return(&src);
            self.backend.fast_return(&mut self.buf, src)
        })();
        self.latch(r)
    }

    /// Emit a rewritable machine-word literal load into `dst`.
    pub fn emit_const(&mut self, dst: Operand, init: i64) -> CodegenResult<Const> {
        self.guard()?;
        let r = (|| {
            self.entered()?;
            self.check_operand(&dst, true)?;
            self.verbose.konst(&dst, init);
            self.backend.const_(&mut self.buf, Some(dst), init)
        })();
        self.latch(r)
    }

    /// Point `jump` at `label`.
    pub fn set_label(&mut self, jump: Jump, label: Label) {
        let data = self.buf.jump_data_mut(jump);
        data.target = JumpTarget::Label(label);
    }

    /// Point `jump` at a fixed address. Only meaningful for rewritable
    /// jumps and indirect-style fixed targets.
    pub fn set_target(&mut self, jump: Jump, target: u64) {
        let data = self.buf.jump_data_mut(jump);
        debug_assert!(
            data.rewritable || matches!(data.target, JumpTarget::Unset),
            "direct label jumps cannot be retargeted"
        );
        data.target = JumpTarget::Addr(target);
    }

    /// Finalize: run the two layout passes and produce the relocatable
    /// image. The compiler is consumed; its labels, jumps and consts are
    /// resolved through the returned image.
    pub fn finish(mut self) -> CodegenResult<CodeImage> {
        self.guard()?;
        if self.state != State::Entered {
            return Err(Error::BadArgument);
        }
        debug!(
            "finalizing {} code: {} bytes emitted",
            self.arch,
            self.buf.chunk_len()
        );
        let Compiler {
            mut backend, buf, ..
        } = self;
        buf.finalize(&mut *backend)
    }

    fn normalize_op1(&self, op: Op1) -> Op1 {
        // Word-sized extensions collapse to plain moves on 32-bit targets.
        if self.arch.word_bytes() == 4 && matches!(op, Op1::MovU32 | Op1::MovS32) {
            Op1::Mov
        } else {
            op
        }
    }
}
