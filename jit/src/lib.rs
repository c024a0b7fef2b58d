//! Executable-memory installation for kestrel.
//!
//! This crate turns a finalized [`kestrel_codegen::CodeImage`] into
//! callable native code. Three executable-memory strategies are probed in
//! order and latched for the process:
//!
//! 1. a chunked pool of `PROT_READ|WRITE|EXEC` mappings (with `MAP_JIT`
//!    and the per-thread write-protect toggle on macOS, `PROT_MAX` on
//!    FreeBSD),
//! 2. a per-allocation W^X mapping toggled between RW and RX,
//! 3. a dual-mapped `memfd` object with separate writable and executable
//!    views and a recorded executable offset.
//!
//! A failing strategy falls through to the next; selection and the pool
//! free lists are serialized behind one internal lock. Patching installed
//! code (`set_jump_target`, `set_const_value`) goes through the writable
//! view, with the instruction cache flushed afterwards; quiescing threads
//! that may be executing the patched range is the caller's business.

mod code;
mod icache;
mod memory;

pub use crate::code::CompiledCode;
pub use crate::memory::Strategy;

pub use kestrel_codegen as codegen;

use kestrel_codegen::{CodeImage, CodegenResult};

/// Install a finalized image into executable memory using the latched
/// process-wide strategy.
pub fn install(image: CodeImage) -> CodegenResult<CompiledCode> {
    CompiledCode::install(image)
}

/// Install with an explicit executable-memory strategy (testing and
/// special deployments; the probe order is right for normal use).
pub fn install_with(image: CodeImage, strategy: Strategy) -> CodegenResult<CompiledCode> {
    CompiledCode::install_with(image, Some(strategy))
}
