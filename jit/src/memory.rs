//! Executable-memory allocation strategies.
//!
//! The pool strategy sub-allocates from 64 KiB RWX chunks with a best-fit
//! free list and coalescing; a chunk whose blocks are all free is returned
//! to the system when the pool's free-to-used ratio passes 3/2. The W^X
//! strategy gives every allocation its own mapping and toggles protection
//! around writes. The dual strategy maps one memfd object twice and hands
//! out distinct writable and executable views.

use std::sync::Mutex;

use log::debug;

use kestrel_codegen::{CodegenResult, Error};

/// An executable-memory strategy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Strategy {
    /// Chunked RWX pool (the generic allocator).
    Pool,
    /// Per-allocation RW↔RX toggling.
    Wx,
    /// Dual-mapped writable + executable views.
    Dual,
}

/// A live executable allocation.
pub(crate) struct Allocation {
    /// Writable view.
    pub write: *mut u8,
    /// Executable view (equals `write` for Pool; differs for Dual).
    pub exec: *const u8,
    pub size: usize,
    pub strategy: Strategy,
    /// Backing handles for unmapping.
    backing: Backing,
}

unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

enum Backing {
    /// Offset within a pool chunk.
    Pool,
    /// Whole private mapping.
    Map { base: *mut u8, len: usize },
    /// Two views over one object.
    Dual {
        write_base: *mut u8,
        exec_base: *mut u8,
        len: usize,
    },
}

impl Allocation {
    /// The writable→executable delta added to addresses embedded in code.
    pub fn exec_offset(&self) -> isize {
        (self.exec as isize) - (self.write as isize)
    }

    /// Make the region writable for a patch (W^X strategy only; the
    /// others always have a writable view).
    pub fn unprotect(&self) {
        if self.strategy == Strategy::Wx {
            unsafe {
                let _ = region::protect(
                    self.write,
                    self.size,
                    region::Protection::READ_WRITE,
                );
            }
        }
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        if self.strategy == Strategy::Pool {
            unsafe { libc::pthread_jit_write_protect_np(0) };
        }
    }

    /// Seal the region for execution.
    pub fn protect_exec(&self) {
        if self.strategy == Strategy::Wx {
            unsafe {
                let _ = region::protect(
                    self.write,
                    self.size,
                    region::Protection::READ_EXECUTE,
                );
            }
        }
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        if self.strategy == Strategy::Pool {
            unsafe { libc::pthread_jit_write_protect_np(1) };
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        match self.backing {
            Backing::Pool => pool_free(self.write, self.size),
            Backing::Map { base, len } => unsafe {
                unmap(base, len);
            },
            Backing::Dual {
                write_base,
                exec_base,
                len,
            } => unsafe {
                unmap(write_base, len);
                unmap(exec_base, len);
            },
        }
    }
}

/// Process-wide latch for the selected strategy plus the pool state.
struct AllocatorState {
    selected: Option<Strategy>,
    chunks: Vec<Chunk>,
    free_total: usize,
    used_total: usize,
}

struct Chunk {
    base: *mut u8,
    size: usize,
    blocks: Vec<Block>,
}

unsafe impl Send for Chunk {}

#[derive(Clone, Copy, Debug)]
struct Block {
    off: usize,
    len: usize,
    free: bool,
}

const CHUNK_SIZE: usize = 0x10000;

static STATE: Mutex<AllocatorState> = Mutex::new(AllocatorState {
    selected: None,
    chunks: Vec::new(),
    free_total: 0,
    used_total: 0,
});

/// Allocate executable memory, probing and latching a strategy on first
/// use. `force` bypasses the latch (explicit-strategy installs).
pub(crate) fn alloc(size: usize, force: Option<Strategy>) -> CodegenResult<Allocation> {
    let size = (size.max(1) + 15) & !15;
    let mut state = STATE.lock().unwrap();
    if let Some(strategy) = force.or(state.selected) {
        return alloc_by(&mut state, strategy, size).ok_or(Error::Memory);
    }
    // The same allocator should keep working for the whole process, so
    // the first success latches.
    for strategy in [Strategy::Pool, Strategy::Wx, Strategy::Dual] {
        if let Some(alloc) = alloc_by(&mut state, strategy, size) {
            state.selected = Some(strategy);
            debug!("selected executable-memory strategy {:?}", strategy);
            return Ok(alloc);
        }
    }
    Err(Error::AllocatorProbeFailed)
}

fn alloc_by(state: &mut AllocatorState, strategy: Strategy, size: usize) -> Option<Allocation> {
    match strategy {
        Strategy::Pool => pool_alloc(state, size),
        Strategy::Wx => wx_alloc(size),
        Strategy::Dual => dual_alloc(size),
    }
}

// ---- pool strategy ------------------------------------------------------

fn pool_alloc(state: &mut AllocatorState, size: usize) -> Option<Allocation> {
    // Best-fit over the free blocks.
    let mut best: Option<(usize, usize, usize)> = None; // (chunk, block, len)
    for (ci, chunk) in state.chunks.iter().enumerate() {
        for (bi, block) in chunk.blocks.iter().enumerate() {
            if block.free && block.len >= size {
                if best.map_or(true, |(_, _, l)| block.len < l) {
                    best = Some((ci, bi, block.len));
                }
            }
        }
    }
    if best.is_none() {
        let chunk_size = CHUNK_SIZE.max((size + 0xffff) & !0xffff);
        let base = map_rwx(chunk_size)?;
        state.chunks.push(Chunk {
            base,
            size: chunk_size,
            blocks: vec![Block {
                off: 0,
                len: chunk_size,
                free: true,
            }],
        });
        state.free_total += chunk_size;
        best = Some((state.chunks.len() - 1, 0, chunk_size));
    }
    let (ci, bi, len) = best.unwrap();
    let chunk = &mut state.chunks[ci];
    let off = chunk.blocks[bi].off;
    if len > size {
        chunk.blocks[bi] = Block {
            off,
            len: size,
            free: false,
        };
        chunk.blocks.insert(
            bi + 1,
            Block {
                off: off + size,
                len: len - size,
                free: true,
            },
        );
    } else {
        chunk.blocks[bi].free = false;
    }
    let ptr = unsafe { chunk.base.add(off) };
    state.free_total -= size;
    state.used_total += size;
    Some(Allocation {
        write: ptr,
        exec: ptr,
        size,
        strategy: Strategy::Pool,
        backing: Backing::Pool,
    })
}

fn pool_free(ptr: *mut u8, size: usize) {
    let mut state = STATE.lock().unwrap();
    state.free_total += size;
    state.used_total -= size;
    let mut release: Option<usize> = None;
    for (ci, chunk) in state.chunks.iter_mut().enumerate() {
        let off = (ptr as usize).wrapping_sub(chunk.base as usize);
        if off >= chunk.size {
            continue;
        }
        if let Some(bi) = chunk.blocks.iter().position(|b| b.off == off && !b.free) {
            chunk.blocks[bi].free = true;
            // Coalesce with the neighbors.
            if bi + 1 < chunk.blocks.len() && chunk.blocks[bi + 1].free {
                chunk.blocks[bi].len += chunk.blocks[bi + 1].len;
                chunk.blocks.remove(bi + 1);
            }
            if bi > 0 && chunk.blocks[bi - 1].free {
                chunk.blocks[bi - 1].len += chunk.blocks[bi].len;
                chunk.blocks.remove(bi);
            }
            if chunk.blocks.len() == 1 && chunk.blocks[0].free {
                release = Some(ci);
            }
            break;
        }
    }
    // Return a fully free chunk once the pool is mostly idle.
    if let Some(ci) = release {
        if state.used_total == 0 || state.free_total * 2 > state.used_total * 3 {
            let chunk = state.chunks.remove(ci);
            state.free_total -= chunk.size;
            unsafe { unmap(chunk.base, chunk.size) };
        }
    }
}

// ---- W^X strategy -------------------------------------------------------

fn wx_alloc(size: usize) -> Option<Allocation> {
    let page = region::page::size();
    let len = (size + page - 1) & !(page - 1);
    let base = map_rw(len)?;
    Some(Allocation {
        write: base,
        exec: base,
        size: len,
        strategy: Strategy::Wx,
        backing: Backing::Map { base, len },
    })
}

// ---- dual-mapped strategy ----------------------------------------------

#[cfg(target_os = "linux")]
fn dual_alloc(size: usize) -> Option<Allocation> {
    let page = region::page::size();
    let len = (size + page - 1) & !(page - 1);
    unsafe {
        let fd = libc::memfd_create(b"kestrel-jit\0".as_ptr() as *const libc::c_char, 0);
        if fd < 0 {
            return None;
        }
        if libc::ftruncate(fd, len as libc::off_t) != 0 {
            libc::close(fd);
            return None;
        }
        let write = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        let exec = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_EXEC,
            libc::MAP_SHARED,
            fd,
            0,
        );
        libc::close(fd);
        if write == libc::MAP_FAILED || exec == libc::MAP_FAILED {
            if write != libc::MAP_FAILED {
                libc::munmap(write, len);
            }
            if exec != libc::MAP_FAILED {
                libc::munmap(exec, len);
            }
            return None;
        }
        Some(Allocation {
            write: write as *mut u8,
            exec: exec as *const u8,
            size: len,
            strategy: Strategy::Dual,
            backing: Backing::Dual {
                write_base: write as *mut u8,
                exec_base: exec as *mut u8,
                len,
            },
        })
    }
}

#[cfg(not(target_os = "linux"))]
fn dual_alloc(_size: usize) -> Option<Allocation> {
    None
}

// ---- platform mapping shims --------------------------------------------

#[cfg(unix)]
fn map_rwx(len: usize) -> Option<*mut u8> {
    unsafe {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        #[cfg(target_os = "macos")]
        {
            flags |= libc::MAP_JIT;
        }
        let mut prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
        #[cfg(target_os = "freebsd")]
        {
            // PROT_MAX on hardened systems: allow later rwx toggling.
            prot |= (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) << 16;
        }
        let ptr = libc::mmap(core::ptr::null_mut(), len, prot, flags, -1, 0);
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr as *mut u8)
        }
    }
}

#[cfg(unix)]
fn map_rw(len: usize) -> Option<*mut u8> {
    unsafe {
        let ptr = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr as *mut u8)
        }
    }
}

#[cfg(unix)]
unsafe fn unmap(base: *mut u8, len: usize) {
    libc::munmap(base as *mut libc::c_void, len);
}

#[cfg(windows)]
fn map_rwx(len: usize) -> Option<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };
    let ptr = unsafe {
        VirtualAlloc(
            core::ptr::null(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if ptr.is_null() {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

#[cfg(windows)]
fn map_rw(len: usize) -> Option<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
    };
    let ptr = unsafe {
        VirtualAlloc(core::ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
    };
    if ptr.is_null() {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

#[cfg(windows)]
unsafe fn unmap(base: *mut u8, _len: usize) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
    VirtualFree(base as _, 0, MEM_RELEASE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_alloc_and_coalesce() {
        let (a, b) = {
            let mut state = STATE.lock().unwrap();
            let a = pool_alloc(&mut state, 256).unwrap();
            let b = pool_alloc(&mut state, 512).unwrap();
            (a, b)
        };
        let base = a.write;
        let (aw, asz) = (a.write, a.size);
        let (bw, bsz) = (b.write, b.size);
        core::mem::forget(a);
        core::mem::forget(b);
        pool_free(aw, asz);
        pool_free(bw, bsz);
        // Everything freed: the owning chunk collapses into one block
        // (unless the ratio check already released it entirely).
        let state = STATE.lock().unwrap();
        for chunk in state.chunks.iter() {
            let off = (base as usize).wrapping_sub(chunk.base as usize);
            if off < chunk.size {
                assert_eq!(chunk.blocks.len(), 1);
                assert!(chunk.blocks[0].free);
            }
        }
    }

    #[test]
    fn wx_round_trips_protection() {
        let a = wx_alloc(64).unwrap();
        unsafe {
            a.write.write(0xc3);
        }
        a.protect_exec();
        a.unprotect();
        unsafe {
            assert_eq!(a.write.read(), 0xc3);
        }
    }
}
