//! Kestrel code generator library.
//!
//! Kestrel is a platform-abstraction just-in-time code generator: a client
//! composes a function by feeding architecture-neutral low-level IR (LIR)
//! operations to a [`Compiler`], and finalization produces a linear,
//! position-independent [`CodeImage`] plus the relocation information needed
//! to link it at an arbitrary base address. Executable-memory installation
//! lives in the companion `kestrel-jit` crate.
//!
//! The supported instruction sets are x86-32, x86-64, ARM v5/v7 (A32),
//! ARM Thumb-2, ARM-64, PowerPC-32/64, SPARC-32 and S390x. Every backend is
//! always compiled, so encoders can be exercised from any host; executing
//! the produced code naturally requires that the selected [`isa::Arch`]
//! matches the running machine.
//!
//! There is no dataflow optimization, no register allocation and no
//! instruction scheduling here: the emitted stream *is* the program, and
//! the only layout freedom the engine takes is branch-encoding selection,
//! constant-pool placement and delay-slot filling.

#![allow(clippy::new_without_default)]

use core::fmt;

pub mod buffer;
pub mod condcodes;
pub mod isa;
pub mod lir;
pub mod operand;

mod abi;
mod compiler;
mod verbose;

pub use crate::abi::{AbiProfile, ArgTypes, EnterOptions};
pub use crate::buffer::{CodeImage, CodeOffset, Const, Jump, Label};
pub use crate::compiler::Compiler;
pub use crate::condcodes::{CondCode, FloatCond};
pub use crate::isa::Arch;
pub use crate::lir::{FOp1, FOp2, FlagsOp, JumpKind, JumpType, Mods, Op0, Op1, Op2};
pub use crate::operand::{FOperand, FReg, Mem, Operand, Reg};

/// A kestrel error kind.
///
/// Errors are sticky on the compiler: the first failure latches and every
/// later emit call returns it without doing work.
// This is manually implementing Error and Display instead of using thiserror
// to reduce the amount of dependencies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The compiler already produced code; it only accepts being dropped.
    Compiled,
    /// A heap or executable-memory allocation failed.
    Memory,
    /// The op/operand combination cannot be encoded on the selected ISA.
    Unsupported,
    /// All executable-memory back-ends failed to initialize.
    AllocatorProbeFailed,
    /// An operand or state-machine precondition was violated.
    BadArgument,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Compiled => write!(f, "code has already been generated"),
            Error::Memory => write!(f, "memory allocation failed"),
            Error::Unsupported => write!(f, "operation not supported on this ISA"),
            Error::AllocatorProbeFailed => {
                write!(f, "no executable memory allocator is available")
            }
            Error::BadArgument => write!(f, "argument constraint violated"),
        }
    }
}

impl std::error::Error for Error {}

/// The result type used by every fallible kestrel operation.
pub type CodegenResult<T> = Result<T, Error>;
