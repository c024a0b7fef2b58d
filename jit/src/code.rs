//! Installed code: the callable handle over an executable allocation.

use log::trace;

use kestrel_codegen::{Arch, CodeImage, CodegenResult, Const, Jump, Label};

use crate::icache;
use crate::memory::{self, Allocation, Strategy};

/// A function installed in executable memory.
///
/// The handle owns the allocation; dropping it releases the memory, so it
/// must outlive every call into the code. Entry points follow the host
/// ABI for the `ArgTypes` given at `emit_enter` (word arguments, word
/// result); the typed `invoke*` shims wrap the transmute.
pub struct CompiledCode {
    alloc: Allocation,
    image: CodeImage,
}

impl CompiledCode {
    pub(crate) fn install(image: CodeImage) -> CodegenResult<Self> {
        Self::install_with(image, None)
    }

    pub(crate) fn install_with(
        image: CodeImage,
        strategy: Option<Strategy>,
    ) -> CodegenResult<Self> {
        let alloc = memory::alloc(image.len(), strategy)?;
        trace!(
            "installing {} bytes of {} code at {:p} (exec {:p})",
            image.len(),
            image.arch(),
            alloc.write,
            alloc.exec
        );
        alloc.unprotect();
        let code = unsafe { core::slice::from_raw_parts_mut(alloc.write, image.len()) };
        code.copy_from_slice(image.code());
        // PC-relative and absolute values must describe the executable
        // view, wherever the writable alias lives.
        image.relocate(alloc.exec as u64, code);
        alloc.protect_exec();
        icache::flush(alloc.exec, image.len());
        Ok(CompiledCode { alloc, image })
    }

    pub fn arch(&self) -> Arch {
        self.image.arch()
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// The callable entry address (Thumb carries the interworking bit).
    pub fn entry(&self) -> *const u8 {
        unsafe { self.alloc.exec.add(self.image.arch().entry_bias()) }
    }

    /// Absolute executable address of a label.
    pub fn label_addr(&self, label: Label) -> usize {
        self.alloc.exec as usize + self.image.label_offset(label) as usize
    }

    /// Absolute executable address of a jump's patchable site.
    pub fn jump_addr(&self, jump: Jump) -> usize {
        self.alloc.exec as usize + self.image.jump_offset(jump) as usize
    }

    /// Absolute executable address of a const's literal.
    pub fn const_addr(&self, konst: Const) -> usize {
        self.alloc.exec as usize + self.image.const_offset(konst) as usize
    }

    /// Rewrite the target of a rewritable jump. The write goes through
    /// the writable view and the affected range is flushed; the caller
    /// must ensure no other thread is executing the patched sequence.
    pub fn set_jump_target(&self, jump: Jump, new_target: usize) {
        assert!(
            self.image.jump_rewritable(jump),
            "only rewritable jumps can be retargeted"
        );
        let off = self.image.jump_offset(jump) as usize;
        let exec_site = self.alloc.exec as usize + off;
        self.alloc.unprotect();
        unsafe {
            self.image.arch().patch_jump_target(
                self.alloc.write.add(off),
                exec_site as u64,
                new_target as u64,
            );
        }
        self.alloc.protect_exec();
        icache::flush(self.alloc.exec, self.image.len());
    }

    /// Rewrite the value of an embedded const.
    pub fn set_const_value(&self, konst: Const, value: usize) {
        let off = self.image.const_offset(konst) as usize;
        self.alloc.unprotect();
        unsafe {
            self.image
                .arch()
                .patch_const_value(self.alloc.write.add(off), value as u64);
        }
        self.alloc.protect_exec();
        icache::flush(self.alloc.exec, self.image.len());
    }

    /// Call the entry with no arguments.
    ///
    /// # Safety
    /// The code must have been entered with a matching signature and obey
    /// the host ABI (which generated prologues do).
    pub unsafe fn invoke0(&self) -> usize {
        let f: extern "C" fn() -> usize = core::mem::transmute(self.entry());
        f()
    }

    /// Call the entry with one word argument.
    ///
    /// # Safety
    /// See [`Self::invoke0`].
    pub unsafe fn invoke1(&self, a1: usize) -> usize {
        let f: extern "C" fn(usize) -> usize = core::mem::transmute(self.entry());
        f(a1)
    }

    /// Call the entry with two word arguments.
    ///
    /// # Safety
    /// See [`Self::invoke0`].
    pub unsafe fn invoke2(&self, a1: usize, a2: usize) -> usize {
        let f: extern "C" fn(usize, usize) -> usize = core::mem::transmute(self.entry());
        f(a1, a2)
    }

    /// Call the entry with three word arguments.
    ///
    /// # Safety
    /// See [`Self::invoke0`].
    pub unsafe fn invoke3(&self, a1: usize, a2: usize, a3: usize) -> usize {
        let f: extern "C" fn(usize, usize, usize) -> usize = core::mem::transmute(self.entry());
        f(a1, a2, a3)
    }
}
