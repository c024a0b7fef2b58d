//! Instruction-cache coherence.
//!
//! x86 keeps its instruction cache coherent with stores; every other
//! supported ISA needs an explicit flush between writing code and
//! executing it. Patching installed code relies on the same call.

#[cfg(all(
    not(any(target_arch = "x86", target_arch = "x86_64")),
    not(all(target_os = "macos", target_arch = "aarch64"))
))]
extern "C" {
    // Provided by compiler-builtins on every supported non-x86 target.
    fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
extern "C" {
    fn sys_icache_invalidate(start: *mut core::ffi::c_void, len: usize);
}

/// Flush the instruction cache for `[ptr, ptr + len)`.
pub(crate) fn flush(ptr: *const u8, len: usize) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        let _ = (ptr, len);
    }
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    unsafe {
        sys_icache_invalidate(ptr as *mut core::ffi::c_void, len);
    }
    #[cfg(all(
        not(any(target_arch = "x86", target_arch = "x86_64")),
        not(all(target_os = "macos", target_arch = "aarch64"))
    ))]
    unsafe {
        __clear_cache(
            ptr as *mut core::ffi::c_char,
            ptr.add(len) as *mut core::ffi::c_char,
        );
    }
}
