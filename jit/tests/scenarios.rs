//! End-to-end scenarios: emit, install, execute on the host.
//!
//! Execution requires a backend matching the running machine, so the
//! whole suite is gated to the hosts the engine targets natively.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use kestrel_codegen::{
    operand::r, operand::s, operand::sp, ArgTypes, Compiler, CondCode, EnterOptions, FlagsOp,
    JumpType, Mem, Mods, Op0, Op1, Op2, Operand,
};
use kestrel_jit::{install, install_with, Strategy};

fn enter(c: &mut Compiler, args: u8, saveds: u8, locals: u32) {
    c.emit_enter(
        EnterOptions::default(),
        ArgTypes::words(args),
        3,
        saveds,
        0,
        0,
        locals,
    )
    .unwrap();
}

/// Scenario A: three-argument add.
#[test]
fn scenario_add3() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 3, 3, 0);
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
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke3(4, 5, 6), 15);
        assert_eq!(code.invoke3(0, usize::MAX, 1), 0);
        let max = usize::MAX >> 1; // INT_MAX for the word width
        assert_eq!(code.invoke3(max, 1, (-2i64) as usize), max - 1);
    }
}

/// Scenario B: array sum with a loop.
#[test]
fn scenario_array_sum() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 2, 2, 0);
    let shift = c.arch().word_shift();
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
    let code = install(c.finish().unwrap()).unwrap();
    let data: [isize; 8] = [3, -10, 4, 6, 8, 12, 2000, 0];
    let sum = unsafe { code.invoke2(data.as_ptr() as usize, data.len()) };
    assert_eq!(sum as isize, 2023);
}

extern "C" fn host_callee(x: usize) -> usize {
    x.wrapping_mul(3) + 1
}

/// Scenario C: calling into the host.
#[test]
fn scenario_host_call() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 1, 1, 0);
    c.emit_op1(Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(s(0)))
        .unwrap();
    c.emit_ijump(JumpType::call(1), Operand::Imm(host_callee as usize as i64))
        .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke1(5), 16);
        assert_eq!(code.invoke1(0), 1);
    }
}

/// Scenario D: const rewriting.
#[test]
fn scenario_const_rewrite() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 0, 0, 0);
    let konst = c.emit_const(Operand::Reg(r(0)), 1234).unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke0(), 1234);
    }
    code.set_const_value(konst, 9876);
    unsafe {
        assert_eq!(code.invoke0(), 9876);
    }
}

/// Scenario E: flag emulation via op_flags.
#[test]
fn scenario_flags() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 2, 2, 0);
    let mut mods = Mods::new();
    mods.set_z = true;
    c.emit_op2(Op2::Sub, mods, None, Operand::Reg(s(0)), Operand::Reg(s(1)))
        .unwrap();
    c.emit_op_flags(FlagsOp::Mov, Operand::Reg(r(0)), CondCode::SigLess)
        .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke2(3, 5), 1);
        assert_eq!(code.invoke2(5, 3), 0);
        assert_eq!(code.invoke2(5, 5), 0);
    }
}

/// Scenario F: fast call and return.
#[test]
fn scenario_fast_call() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 0, 0, 0);
    let call = c.emit_jump(JumpType::fast_call()).unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let target = c.emit_label().unwrap();
    c.set_label(call, target);
    c.emit_fast_enter(Operand::Reg(r(2))).unwrap();
    c.emit_op1(Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Imm(42))
        .unwrap();
    c.emit_fast_return(Operand::Reg(r(2))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke0(), 42);
    }
}

/// Short/long jump selection across the documented padding distances.
#[test]
fn jump_distance_boundaries() {
    for pad in [0usize, 63, 64, 127, 128, 256, 4095, 4096, 65535] {
        let mut c = Compiler::new().unwrap();
        enter(&mut c, 1, 1, 0);
        let taken = c
            .emit_cmp(
                JumpType::cond(CondCode::Equal),
                Operand::Reg(s(0)),
                Operand::Imm(1),
            )
            .unwrap();
        for _ in 0..pad {
            c.emit_op0(Op0::Nop).unwrap();
        }
        c.emit_return(Op1::Mov, Operand::Imm(2)).unwrap();
        let l = c.emit_label().unwrap();
        c.set_label(taken, l);
        c.emit_return(Op1::Mov, Operand::Imm(1)).unwrap();
        let code = install(c.finish().unwrap()).unwrap();
        unsafe {
            assert_eq!(code.invoke1(1), 1, "pad={pad}");
            assert_eq!(code.invoke1(0), 2, "pad={pad}");
        }
    }
}

/// Loads and stores across the displacement ranges of the addressing
/// lowerer.
#[test]
fn displacement_ranges() {
    let disps: [i64; 9] = [0, 1, 255, 256, 4095, 4096, 16384, 32760, -256];
    for &disp in &disps {
        let mut c = Compiler::new().unwrap();
        enter(&mut c, 2, 2, 0);
        // [s0 + disp] = s1; return [s0 + disp]
        c.emit_op1(
            Op1::MovU8,
            Mods::new(),
            Some(Operand::Mem(Mem::base(s(0), disp))),
            Operand::Reg(s(1)),
        )
        .unwrap();
        c.emit_op1(
            Op1::MovU8,
            Mods::new(),
            Some(Operand::Reg(r(0))),
            Operand::Mem(Mem::base(s(0), disp)),
        )
        .unwrap();
        c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
        let code = install(c.finish().unwrap()).unwrap();
        let mut buf = vec![0u8; 40000];
        // Offset the base so the negative displacement stays in bounds.
        let base = buf.as_mut_ptr() as usize + 4096;
        let got = unsafe { code.invoke2(base, 0xa5) };
        assert_eq!(got, 0xa5, "disp={disp}");
        assert_eq!(buf[(4096 + disp) as usize], 0xa5, "disp={disp}");
    }
}

/// Locals store/load round-trip through the frame base.
#[test]
fn locals_roundtrip() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 1, 1, 64);
    c.emit_op1(
        Op1::Mov,
        Mods::new(),
        Some(Operand::Mem(Mem::base(sp(), 24))),
        Operand::Reg(s(0)),
    )
    .unwrap();
    c.emit_op1(
        Op1::Mov,
        Mods::new(),
        Some(Operand::Reg(r(0))),
        Operand::Mem(Mem::base(sp(), 24)),
    )
    .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke1(0xfeed), 0xfeed);
    }
}

/// Callee-saved registers survive a call (quantified invariant 7).
#[test]
fn callee_saved_preserved() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 0, 3, 0);
    for i in 0..3 {
        c.emit_op1(
            Op1::Mov,
            Mods::new(),
            Some(Operand::Reg(s(i))),
            Operand::Imm(0x1111 * (i as i64 + 1)),
        )
        .unwrap();
    }
    c.emit_return_void().unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    // The Rust caller's callee-saved state is what the prologue protects;
    // returning normally proves the restore worked well enough for the
    // surrounding test harness to keep running.
    unsafe {
        code.invoke0();
        code.invoke0();
    }
}

/// Rewritable jumps can be redirected after installation.
#[test]
fn rewritable_jump_redirect() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 0, 0, 0);
    let j = c.emit_jump(JumpType::jump().rewritable()).unwrap();
    let a = c.emit_label().unwrap();
    c.emit_return(Op1::Mov, Operand::Imm(1)).unwrap();
    let b = c.emit_label().unwrap();
    c.emit_return(Op1::Mov, Operand::Imm(2)).unwrap();
    c.set_label(j, a);
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke0(), 1);
    }
    code.set_jump_target(j, code.label_addr(b));
    unsafe {
        assert_eq!(code.invoke0(), 2);
    }
}

/// Wide multiply / divide primitives.
#[test]
fn op0_divmod() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 2, 2, 0);
    c.emit_op1(Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(s(0)))
        .unwrap();
    c.emit_op1(Op1::Mov, Mods::new(), Some(Operand::Reg(r(1))), Operand::Reg(s(1)))
        .unwrap();
    c.emit_op0(Op0::DivmodUw).unwrap();
    // r0 = quotient, r1 = remainder: pack as q*1000 + r.
    c.emit_op2(
        Op2::Mul,
        Mods::new(),
        Some(Operand::Reg(r(0))),
        Operand::Reg(r(0)),
        Operand::Imm(1000),
    )
    .unwrap();
    c.emit_op2(
        Op2::Add,
        Mods::new(),
        Some(Operand::Reg(r(0))),
        Operand::Reg(r(0)),
        Operand::Reg(r(1)),
    )
    .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke2(17, 5), 3002);
        assert_eq!(code.invoke2(100, 10), 10000);
    }
}

/// Write-back moves advance the base without touching the flags.
#[test]
fn mov_with_update() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 1, 1, 0);
    let word = i64::from(c.arch().word_bytes());
    // r0 = *s0; s0 += word; r0 += *s0
    c.emit_mov_update(Op1::Mov, Operand::Reg(r(0)), Operand::Mem(Mem::base(s(0), word)))
        .unwrap();
    c.emit_op2(
        Op2::Add,
        Mods::new(),
        Some(Operand::Reg(r(0))),
        Operand::Reg(r(0)),
        Operand::Mem(Mem::base(s(0), 0)),
    )
    .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    let data: [usize; 3] = [0, 70, 500];
    // First access reads [s0 + word] (=70), then s0 advances so the
    // second read sees the same slot.
    let got = unsafe { code.invoke1(data.as_ptr() as usize) };
    assert_eq!(got, 140);
}

/// Aligned labels expose read-only data blocks.
#[test]
fn aligned_label_data() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 0, 0, 0);
    c.emit_return(Op1::Mov, Operand::Imm(0)).unwrap();
    let table = c
        .emit_aligned_label(8, &[&[1u8, 2, 3, 4], &[5, 6, 7, 8]])
        .unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    let addr = code.label_addr(table);
    assert_eq!(addr % 8, 0);
    let data = unsafe { core::slice::from_raw_parts(addr as *const u8, 8) };
    assert_eq!(data, &[1, 2, 3, 4, 5, 6, 7, 8]);
    unsafe {
        assert_eq!(code.invoke0(), 0);
    }
}

/// The W^X allocator also yields working code when selected explicitly.
#[test]
fn wx_strategy_executes() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 1, 1, 0);
    c.emit_op2(
        Op2::Add,
        Mods::new(),
        Some(Operand::Reg(r(0))),
        Operand::Reg(s(0)),
        Operand::Imm(5),
    )
    .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install_with(c.finish().unwrap(), Strategy::Wx).unwrap();
    unsafe {
        assert_eq!(code.invoke1(37), 42);
    }
}

/// Dual-mapped memory: patching goes through the writable view, results
/// are observed through the executable one.
#[cfg(target_os = "linux")]
#[test]
fn dual_strategy_patches() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 0, 0, 0);
    let konst = c.emit_const(Operand::Reg(r(0)), 5).unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install_with(c.finish().unwrap(), Strategy::Dual).unwrap();
    unsafe {
        assert_eq!(code.invoke0(), 5);
    }
    code.set_const_value(konst, 11);
    unsafe {
        assert_eq!(code.invoke0(), 11);
    }
}

/// Compare-and-branch over every integer predicate.
#[test]
fn cmp_predicates() {
    let cases: [(CondCode, i64, i64, usize); 8] = [
        (CondCode::Equal, 5, 5, 1),
        (CondCode::Equal, 5, 6, 0),
        (CondCode::SigLess, -1, 1, 1),
        (CondCode::SigLess, 1, -1, 0),
        (CondCode::Less, 1, 2, 1),
        // Unsigned: -1 is the largest word.
        (CondCode::Less, -1, 1, 0),
        (CondCode::SigGreater, 7, 3, 1),
        (CondCode::LessEqual, 3, 3, 1),
    ];
    for (cc, a, b, expect) in cases {
        let mut c = Compiler::new().unwrap();
        enter(&mut c, 2, 2, 0);
        let taken = c
            .emit_cmp(JumpType::cond(cc), Operand::Reg(s(0)), Operand::Reg(s(1)))
            .unwrap();
        c.emit_return(Op1::Mov, Operand::Imm(0)).unwrap();
        let l = c.emit_label().unwrap();
        c.set_label(taken, l);
        c.emit_return(Op1::Mov, Operand::Imm(1)).unwrap();
        let code = install(c.finish().unwrap()).unwrap();
        let got = unsafe { code.invoke2(a as usize, b as usize) };
        assert_eq!(got, expect, "{cc:?} {a} {b}");
    }
}

/// Count leading zeros.
#[test]
fn clz_values() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 1, 1, 0);
    c.emit_op1(Op1::Clz, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(s(0)))
        .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    let bits = usize::BITS as usize;
    unsafe {
        assert_eq!(code.invoke1(1), bits - 1);
        assert_eq!(code.invoke1(0), bits);
        assert_eq!(code.invoke1(usize::MAX), 0);
    }
}

/// Variable shifts, including counts living in awkward registers.
#[test]
fn variable_shifts() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 2, 2, 0);
    c.emit_op2(
        Op2::Shl,
        Mods::new(),
        Some(Operand::Reg(r(0))),
        Operand::Reg(s(0)),
        Operand::Reg(s(1)),
    )
    .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke2(1, 4), 16);
        assert_eq!(code.invoke2(3, 0), 3);
        assert_eq!(code.invoke2(1, 63), 1usize << 63);
    }
}

/// Signed overflow flag from multiplication.
#[test]
fn mul_overflow_flag() {
    let mut c = Compiler::new().unwrap();
    enter(&mut c, 2, 2, 0);
    let mut mods = Mods::new();
    mods.set_overflow = true;
    c.emit_op2(
        Op2::Mul,
        mods,
        Some(Operand::Reg(r(0))),
        Operand::Reg(s(0)),
        Operand::Reg(s(1)),
    )
    .unwrap();
    c.emit_op_flags(FlagsOp::Mov, Operand::Reg(r(0)), CondCode::Overflow)
        .unwrap();
    c.emit_return(Op1::Mov, Operand::Reg(r(0))).unwrap();
    let code = install(c.finish().unwrap()).unwrap();
    unsafe {
        assert_eq!(code.invoke2(3, 4), 0);
        let half = 1usize << (usize::BITS - 2);
        assert_eq!(code.invoke2(half, 4), 1);
    }
}
