//! Verbose tracing of emitted LIR.
//!
//! When a sink is installed, every emit call writes one line in the
//! original textual format (`  add r0, r0, s1`). Engine-internal decisions
//! (relaxation, pool flushes) go through `log` instead.

use std::io::Write;

use crate::condcodes::CondCode;
use crate::lir::{FOp1, FOp2, FlagsOp, JumpType, Mods, Op0, Op1, Op2};
use crate::operand::{FOperand, Operand};

pub(crate) struct Verbose {
    sink: Option<Box<dyn Write + Send>>,
}

impl Verbose {
    pub(crate) fn new() -> Self {
        Verbose { sink: None }
    }

    pub(crate) fn set(&mut self, sink: Option<Box<dyn Write + Send>>) {
        self.sink = sink;
    }

    fn line(&mut self, args: std::fmt::Arguments) {
        if let Some(w) = &mut self.sink {
            let _ = writeln!(w, "{}", args);
        }
    }

    fn mods_suffix(mods: Mods) -> &'static str {
        match (mods.i32_op, mods.sets_flags()) {
            (false, false) => "",
            (false, true) => ".f",
            (true, false) => "32",
            (true, true) => "32.f",
        }
    }

    pub(crate) fn enter(&mut self, args: u8, scratches: u8, saveds: u8, local_size: u32) {
        self.line(format_args!(
            "  enter args={} scratches={} saveds={} locals={}",
            args, scratches, saveds, local_size
        ));
    }

    pub(crate) fn ret(&mut self, value: Option<(Op1, Operand)>) {
        match value {
            Some((op, src)) => self.line(format_args!("  return.{} {}", op, src)),
            None => self.line(format_args!("  return")),
        }
    }

    pub(crate) fn op0(&mut self, op: Op0) {
        self.line(format_args!("  {}", op));
    }

    pub(crate) fn op1(&mut self, op: Op1, mods: Mods, dst: &Option<Operand>, src: &Operand) {
        match dst {
            Some(d) => self.line(format_args!("  {}{} {}, {}", op, Self::mods_suffix(mods), d, src)),
            None => self.line(format_args!("  {}{} -, {}", op, Self::mods_suffix(mods), src)),
        }
    }

    pub(crate) fn op2(
        &mut self,
        op: Op2,
        mods: Mods,
        dst: &Option<Operand>,
        src1: &Operand,
        src2: &Operand,
    ) {
        match dst {
            Some(d) => self.line(format_args!(
                "  {}{} {}, {}, {}",
                op,
                Self::mods_suffix(mods),
                d,
                src1,
                src2
            )),
            None => self.line(format_args!(
                "  {}{} -, {}, {}",
                op,
                Self::mods_suffix(mods),
                src1,
                src2
            )),
        }
    }

    pub(crate) fn fop1(&mut self, op: FOp1, dst: &FOperand, src: &FOperand) {
        self.line(format_args!("  {} {}, {}", op, dst, src));
    }

    pub(crate) fn fop2(&mut self, op: FOp2, dst: &FOperand, src1: &FOperand, src2: &FOperand) {
        self.line(format_args!("  {} {}, {}, {}", op, dst, src1, src2));
    }

    pub(crate) fn label(&mut self) {
        self.line(format_args!("label:"));
    }

    pub(crate) fn jump(&mut self, ty: JumpType) {
        self.line(format_args!(
            "  jump <{}>{}",
            ty.kind,
            if ty.rewritable { " (rewritable)" } else { "" }
        ));
    }

    pub(crate) fn ijump(&mut self, ty: JumpType, src: &Operand) {
        self.line(format_args!("  ijump <{}> {}", ty.kind, src));
    }

    pub(crate) fn cmp(&mut self, cc: CondCode, src1: &Operand, src2: &Operand) {
        self.line(format_args!("  cmp <{}> {}, {}", cc, src1, src2));
    }

    pub(crate) fn op_flags(&mut self, op: FlagsOp, dst: &Operand, cc: CondCode) {
        let name = match op {
            FlagsOp::Mov => "flags.mov",
            FlagsOp::Or => "flags.or",
        };
        self.line(format_args!("  {} {}, <{}>", name, dst, cc));
    }

    pub(crate) fn fast_enter(&mut self, dst: &Operand) {
        self.line(format_args!("  fast_enter {}", dst));
    }

    pub(crate) fn fast_return(&mut self, src: &Operand) {
        self.line(format_args!("  fast_return {}", src));
    }

    pub(crate) fn konst(&mut self, dst: &Operand, init: i64) {
        self.line(format_args!("  const {}, #{}", dst, init));
    }
}
