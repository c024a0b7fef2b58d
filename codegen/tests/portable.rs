//! Cross-architecture pipeline tests: every backend encodes, lays out and
//! relocates the same programs. No code is executed here, so the suite
//! runs on any host.

use kestrel_codegen::{
    condcodes, operand::fr, operand::r, operand::s, operand::sp, Arch, ArgTypes, Compiler,
    CondCode, EnterOptions, FOp1, FOp2, FOperand, JumpType, Mem, Mods, Op0, Op1, Op2, Operand,
};

const ALL_ARCHS: [Arch; 10] = [
    Arch::X86_32,
    Arch::X86_64,
    Arch::ArmV5,
    Arch::ArmV7,
    Arch::Thumb2,
    Arch::Aarch64,
    Arch::Ppc32,
    Arch::Ppc64,
    Arch::Sparc32,
    Arch::S390x,
];

fn compiler_for(arch: Arch) -> Compiler {
    let mut c = Compiler::for_arch(arch);
    c.emit_enter(EnterOptions::default(), ArgTypes::words(3), 3, 3, 2, 0, 64)
        .unwrap();
    c
}

#[test]
fn three_argument_add_encodes_everywhere() {
    for arch in ALL_ARCHS {
        let mut c = compiler_for(arch);
        c.emit_op1(Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(s(0)))
            .unwrap();
        c.emit_op2(
            Op2::Add,
            Mods::new(),
            Some(Operand::Reg(r(0))),
            Operand::Reg(r(0)),
            Operand::Reg(s(1)),
        )
        .unwrap();
        c.emit_op2(
            Op2::Add,
            Mods::new(),
            Some(Operand::Reg(r(0))),
            Operand::Reg(r(0)),
            Operand::Reg(s(2)),
        )
        .unwrap();
        c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
        let image = c.finish().unwrap_or_else(|e| panic!("{arch}: {e}"));
        assert!(!image.is_empty(), "{arch}: empty image");
        let mut code = image.code().to_vec();
        image.relocate(0x10_0000, &mut code);
    }
}

#[test]
fn loop_with_compare_encodes_everywhere() {
    for arch in ALL_ARCHS {
        let mut c = compiler_for(arch);
        let shift = arch.word_shift();
        c.emit_op2(
            Op2::Xor,
            Mods::new(),
            Some(Operand::Reg(r(2))),
            Operand::Reg(r(2)),
            Operand::Reg(r(2)),
        )
        .unwrap();
        c.emit_op1(Op1::Mov, Mods::new(), Some(Operand::Reg(r(1))), Operand::Imm(0))
            .unwrap();
        let head = c.emit_label().unwrap();
        let out = c
            .emit_cmp(
                JumpType::cond(CondCode::SigGreaterEqual),
                Operand::Reg(r(1)),
                Operand::Reg(s(1)),
            )
            .unwrap();
        c.emit_op1(
            Op1::Mov,
            Mods::new(),
            Some(Operand::Reg(r(0))),
            Operand::Mem(Mem::base_index_shift(s(0), r(1), shift, 0)),
        )
        .unwrap();
        c.emit_op2(
            Op2::Add,
            Mods::new(),
            Some(Operand::Reg(r(2))),
            Operand::Reg(r(2)),
            Operand::Reg(r(0)),
        )
        .unwrap();
        c.emit_op2(
            Op2::Add,
            Mods::new(),
            Some(Operand::Reg(r(1))),
            Operand::Reg(r(1)),
            Operand::Imm(1),
        )
        .unwrap();
        let back = c.emit_jump(JumpType::jump()).unwrap();
        c.set_label(back, head);
        let out_label = c.emit_label().unwrap();
        c.set_label(out, out_label);
        c.emit_return(Op1::Mov, Operand::Reg(r(2))).unwrap();
        let image = c.finish().unwrap_or_else(|e| panic!("{arch}: {e}"));
        let mut code = image.code().to_vec();
        image.relocate(0x4000_0000, &mut code);
        assert!(image.label_offset(head) <= image.label_offset(out_label));
    }
}

#[test]
fn consts_and_rewritable_jumps_encode_everywhere() {
    for arch in ALL_ARCHS {
        let mut c = compiler_for(arch);
        let konst = c.emit_const(Operand::Reg(r(0)), 1234).unwrap();
        let j = c.emit_jump(JumpType::jump().rewritable()).unwrap();
        c.emit_op0(Op0::Nop).unwrap();
        let l = c.emit_label().unwrap();
        c.set_label(j, l);
        c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
        let image = c.finish().unwrap_or_else(|e| panic!("{arch}: {e}"));
        assert!(image.jump_rewritable(j), "{arch}");
        let mut code = image.code().to_vec();
        image.relocate(0x7000_0000, &mut code);
        // The const and jump sites must sit inside the image.
        assert!((image.const_offset(konst) as usize) < image.len(), "{arch}");
        assert!((image.jump_offset(j) as usize) < image.len(), "{arch}");
    }
}

#[test]
fn float_ops_encode_everywhere() {
    for arch in ALL_ARCHS {
        let mut c = compiler_for(arch);
        c.emit_fop1(
            FOp1::Mov,
            FOperand::Reg(fr(0)),
            FOperand::Mem(Mem::base(sp(), 0)),
        )
        .unwrap();
        c.emit_fop2(
            FOp2::Add,
            FOperand::Reg(fr(1)),
            FOperand::Reg(fr(0)),
            FOperand::Reg(fr(0)),
        )
        .unwrap();
        c.emit_fop1(FOp1::Cmp, FOperand::Reg(fr(0)), FOperand::Reg(fr(1)))
            .unwrap();
        let j = c
            .emit_jump(JumpType::fcond(condcodes::FloatCond::Less))
            .unwrap();
        let l = c.emit_label().unwrap();
        c.set_label(j, l);
        c.emit_return_void().unwrap();
        let image = c.finish().unwrap_or_else(|e| panic!("{arch}: {e}"));
        assert!(!image.is_empty());
    }
}

#[test]
fn flag_materialization_encodes_everywhere() {
    use kestrel_codegen::FlagsOp;
    for arch in ALL_ARCHS {
        let mut c = compiler_for(arch);
        let mut mods = Mods::new();
        mods.set_z = true;
        c.emit_op2(Op2::Sub, mods, None, Operand::Reg(s(0)), Operand::Reg(s(1)))
            .unwrap();
        c.emit_op_flags(FlagsOp::Mov, Operand::Reg(r(0)), CondCode::Equal)
            .unwrap();
        c.emit_op_flags(FlagsOp::Or, Operand::Reg(r(0)), CondCode::NotEqual)
            .unwrap();
        c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
        c.finish().unwrap_or_else(|e| panic!("{arch}: {e}"));
    }
}

#[test]
fn sticky_error_latches() {
    let mut c = Compiler::for_arch(Arch::X86_64);
    // Emitting before enter is a latched argument error.
    let err = c.emit_op0(Op0::Nop).unwrap_err();
    assert_eq!(c.error(), Some(err));
    // Every later call short-circuits with the same error.
    assert_eq!(c.emit_label().unwrap_err(), err);
    assert!(c.finish().is_err());
}

#[test]
fn verbose_stream_records_ops() {
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct Sink(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let data = Arc::new(Mutex::new(Vec::new()));
    let mut c = Compiler::for_arch(Arch::X86_64);
    c.set_verbose(Some(Box::new(Sink(data.clone()))));
    c.emit_enter(EnterOptions::default(), ArgTypes::words(1), 2, 1, 0, 0, 0)
        .unwrap();
    c.emit_op2(
        Op2::Add,
        Mods::new(),
        Some(Operand::Reg(r(0))),
        Operand::Reg(s(0)),
        Operand::Imm(7),
    )
    .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    c.finish().unwrap();
    let text = String::from_utf8(data.lock().unwrap().clone()).unwrap();
    assert!(text.contains("enter args=1"));
    assert!(text.contains("add r0, s0, #7"));
    assert!(text.contains("return.mov r0"));
}
