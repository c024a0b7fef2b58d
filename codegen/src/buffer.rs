//! The code buffer: chunked byte store, tagged metadata stream, branch
//! relaxation and image layout.
//!
//! During emission the buffer accumulates encoder-produced bytes in
//! fixed-capacity chunks (no chunk ever reallocates) and, in parallel, a
//! tagged item stream recording where labels, jumps, consts and alignment
//! pads sit between byte ranges. Jumps occupy no bytes at emission time;
//! their encoding is chosen by a grow-only relaxation loop at finalization,
//! then the whole stream is laid out into a linear [`CodeImage`] together
//! with the absolute-address fixups that `link` resolves once a base
//! address is known.

use core::fmt;

use crate::isa::{Arch, Backend};
use crate::lir::JumpKind;
use crate::CodegenResult;

/// Offset in bytes from the beginning of the emitted function.
///
/// Kestrel can encode for a foreign target, so we don't use a type like
/// `usize` which depends on the *host* platform.
pub type CodeOffset = u32;

const CHUNK_SIZE: usize = 2048;

/// Reference to a label. Resolves to an address after finalization.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Label(u32);

/// Reference to a jump. Resolves to its patchable site after finalization.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Jump(u32);

/// Reference to an embedded constant.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Const(u32);

impl Label {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Jump {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Const {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a jump resolves against: exactly one label xor one absolute target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JumpTarget {
    /// Not yet attached; treated as absolute zero if never set.
    Unset,
    Label(Label),
    Addr(u64),
}

/// A pending jump record.
#[derive(Clone, Debug)]
pub struct JumpData {
    pub kind: JumpKind,
    pub rewritable: bool,
    pub target: JumpTarget,
    /// Arch-private bits (e.g. Thumb IT prefixing decisions).
    pub hint: u32,
    /// A staged delay-slot instruction word (SPARC).
    pub delay: Option<u32>,
}

#[derive(Clone, Debug)]
struct ConstData {
    /// The patchable region begins this many bytes before the item position.
    back: u32,
}

/// One byte-sink put interface shared by emission (into the chunked buffer)
/// and layout (into the linear image).
pub trait ByteSink {
    /// Current offset. During emission this is the *virtual* offset: chunk
    /// bytes plus the reserved sizes of already-recorded jumps.
    fn cur_offset(&self) -> CodeOffset;

    /// Add 1 byte.
    fn put1(&mut self, b: u8);

    /// Add 2 bytes, little-endian.
    fn put2(&mut self, h: u16) {
        self.put1(h as u8);
        self.put1((h >> 8) as u8);
    }

    /// Add 4 bytes, little-endian.
    fn put4(&mut self, w: u32) {
        self.put2(w as u16);
        self.put2((w >> 16) as u16);
    }

    /// Add 8 bytes, little-endian.
    fn put8(&mut self, d: u64) {
        self.put4(d as u32);
        self.put4((d >> 32) as u32);
    }

    /// Add 2 bytes, big-endian.
    fn put2_be(&mut self, h: u16) {
        self.put1((h >> 8) as u8);
        self.put1(h as u8);
    }

    /// Add 4 bytes, big-endian.
    fn put4_be(&mut self, w: u32) {
        self.put2_be((w >> 16) as u16);
        self.put2_be(w as u16);
    }

    /// Add 6 bytes, big-endian (S390x long format).
    fn put6_be(&mut self, w: u64) {
        self.put2_be((w >> 32) as u16);
        self.put4_be(w as u32);
    }
}

/// Metadata stream element.
#[derive(Clone, Debug)]
enum Item {
    /// `len` bytes of already-encoded instruction stream.
    Bytes { len: u32 },
    /// Position of a label.
    Label { index: u32 },
    /// A branch whose final encoding is chosen at layout time.
    Jump { index: u32 },
    /// The patchable literal of the preceding const-load ends here.
    Const { index: u32 },
    /// Pad with encoder fill bytes up to `align`.
    Align { align: u32 },
}

struct Chunk {
    bytes: Vec<u8>,
}

impl Chunk {
    fn new() -> Self {
        Chunk {
            bytes: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn remaining(&self) -> usize {
        CHUNK_SIZE - self.bytes.len()
    }
}

/// The append-only fragmented code buffer plus label/jump/const tables.
pub struct CodeBuffer {
    chunks: Vec<Chunk>,
    /// Total bytes stored in chunks.
    byte_len: u32,
    /// Bytes plus reserved jump sizes: the offset the next byte will land
    /// at, assuming every jump keeps its reserved size. Exact on
    /// fixed-width ISAs, a lower bound on x86.
    virtual_len: u32,
    items: Vec<Item>,
    num_labels: u32,
    jumps: Vec<JumpData>,
    consts: Vec<ConstData>,
    /// Fixups recorded during emission (constant pools). Only valid on
    /// backends whose emission-time offsets are exact.
    emit_fixups: Vec<AbsFixup>,
}

impl CodeBuffer {
    pub(crate) fn new() -> Self {
        CodeBuffer {
            chunks: vec![Chunk::new()],
            byte_len: 0,
            virtual_len: 0,
            items: Vec::new(),
            num_labels: 0,
            jumps: Vec::new(),
            consts: Vec::new(),
            emit_fixups: Vec::new(),
        }
    }

    /// Record an absolute fixup at the current (virtual) offset. Backends
    /// calling this must have fixed-size jump encodings, so that virtual
    /// offsets equal final offsets.
    pub(crate) fn add_fixup(&mut self, kind: FixupKind, target: FixTarget) {
        self.emit_fixups.push(AbsFixup {
            at: self.virtual_len,
            kind,
            target,
        });
    }

    fn push_bytes_item(&mut self, len: u32) {
        match self.items.last_mut() {
            Some(Item::Bytes { len: l }) => *l += len,
            _ => self.items.push(Item::Bytes { len }),
        }
    }

    /// Append a label at the current position.
    pub(crate) fn emit_label(&mut self) -> Label {
        let index = self.num_labels;
        self.num_labels += 1;
        self.items.push(Item::Label { index });
        Label(index)
    }

    /// Request alignment of the next item to `align` bytes (a power of two).
    pub(crate) fn emit_align(&mut self, align: u32) {
        debug_assert!(align.is_power_of_two());
        self.items.push(Item::Align { align });
        // Keep the virtual offset aligned too; padding length is only
        // exact when all preceding jumps keep their reserved sizes.
        self.virtual_len = align_up(self.virtual_len, align);
    }

    /// Record a jump whose encoding is decided at layout time. `reserved`
    /// is the size the emission-time offset accounting assumes; backends
    /// with fixed-width jump sequences pass the exact size.
    pub(crate) fn add_jump(&mut self, data: JumpData, reserved: u32) -> Jump {
        let index = self.jumps.len() as u32;
        self.jumps.push(data);
        self.items.push(Item::Jump { index });
        self.virtual_len += reserved;
        Jump(index)
    }

    /// Record that the last `back` bytes just emitted end in a patchable
    /// constant region.
    pub(crate) fn add_const(&mut self, back: u32) -> Const {
        let index = self.consts.len() as u32;
        self.consts.push(ConstData { back });
        self.items.push(Item::Const { index });
        Const(index)
    }

    pub(crate) fn jump_data_mut(&mut self, jump: Jump) -> &mut JumpData {
        &mut self.jumps[jump.index()]
    }

    /// Total bytes currently stored in chunks (patch positions).
    pub(crate) fn chunk_len(&self) -> u32 {
        self.byte_len
    }

    /// Rewrite a 32-bit little-endian word at a chunk position.
    pub(crate) fn patch4(&mut self, pos: u32, word: u32) {
        self.patch_bytes(pos, &word.to_le_bytes());
    }

    fn patch_bytes(&mut self, pos: u32, bytes: &[u8]) {
        let mut pos = pos as usize;
        let mut src = bytes;
        for chunk in &mut self.chunks {
            let len = chunk.bytes.len();
            if pos < len {
                let n = src.len().min(len - pos);
                chunk.bytes[pos..pos + n].copy_from_slice(&src[..n]);
                src = &src[n..];
                if src.is_empty() {
                    return;
                }
                pos = 0;
            } else {
                pos -= len;
            }
        }
        debug_assert!(src.is_empty(), "patch beyond buffer end");
    }

    /// Read back a 32-bit little-endian word from a chunk position.
    pub(crate) fn read4(&self, pos: u32) -> u32 {
        let mut out = [0u8; 4];
        let mut pos = pos as usize;
        let mut filled = 0;
        for chunk in &self.chunks {
            let len = chunk.bytes.len();
            if pos < len {
                let n = (out.len() - filled).min(len - pos);
                out[filled..filled + n].copy_from_slice(&chunk.bytes[pos..pos + n]);
                filled += n;
                if filled == out.len() {
                    break;
                }
                pos = 0;
            } else {
                pos -= len;
            }
        }
        u32::from_le_bytes(out)
    }

    /// Finalize: run relaxation, lay the stream out linearly and produce a
    /// relocatable image.
    pub(crate) fn finalize(mut self, backend: &mut dyn Backend) -> CodegenResult<CodeImage> {
        backend.before_layout(&mut self)?;

        // Pass 1: compute label offsets and jump encodings with a grow-only
        // fixed-point. Every jump starts at its smallest candidate size;
        // distances computed from a previous iteration can only grow a
        // jump, never shrink it, so the loop terminates.
        let mut sizes: Vec<u32> = self
            .jumps
            .iter()
            .map(|j| backend.jump_encodings(j)[0])
            .collect();
        let mut label_offs = vec![0 as CodeOffset; self.num_labels as usize];
        let mut total;
        loop {
            let mut changed = false;
            let mut off: CodeOffset = 0;
            for item in &self.items {
                match item {
                    Item::Bytes { len } => off += len,
                    Item::Label { index } => {
                        if label_offs[*index as usize] != off {
                            label_offs[*index as usize] = off;
                            changed = true;
                        }
                    }
                    Item::Jump { index } => {
                        let i = *index as usize;
                        let j = &self.jumps[i];
                        let target = match j.target {
                            JumpTarget::Label(l) => Some(label_offs[l.index()]),
                            _ => None,
                        };
                        let needed = backend.jump_needed_size(j, off, target);
                        if needed > sizes[i] {
                            sizes[i] = needed;
                            changed = true;
                        }
                        off += sizes[i];
                    }
                    Item::Const { .. } => {}
                    Item::Align { align } => off = align_up(off, *align),
                }
            }
            total = off;
            if !changed {
                break;
            }
        }

        // Pass 2: stream the chunks into the linear image, emitting final
        // jump encodings and collecting label/jump/const offsets plus the
        // absolute fixups that linking resolves.
        let mut sink = CodeSink {
            code: Vec::with_capacity(total as usize),
            fixups: core::mem::take(&mut self.emit_fixups),
        };
        debug_assert!(sink.fixups.iter().all(|f| f.at <= total));
        // Emission-time fixups may reference jumps whose targets were
        // attached after the pool slot was laid down; resolve them now.
        for fixup in &mut sink.fixups {
            if let FixTarget::Jump(j) = fixup.target {
                fixup.target = match self.jumps[j.index()].target {
                    JumpTarget::Label(l) => FixTarget::Offset(label_offs[l.index()]),
                    JumpTarget::Addr(a) => FixTarget::Addr(a),
                    JumpTarget::Unset => FixTarget::Addr(0),
                };
            }
        }
        let mut jump_offs = vec![JumpOut::default(); self.jumps.len()];
        let mut const_offs = vec![0 as CodeOffset; self.consts.len()];
        let mut cursor = ChunkCursor::new(&self.chunks);
        for item in &self.items {
            match item {
                Item::Bytes { len } => cursor.copy_to(&mut sink.code, *len),
                Item::Label { index } => {
                    debug_assert_eq!(label_offs[*index as usize], sink.code.len() as u32);
                }
                Item::Jump { index } => {
                    let i = *index as usize;
                    let j = &self.jumps[i];
                    let at = sink.code.len() as CodeOffset;
                    let target = match j.target {
                        JumpTarget::Label(l) => Some(label_offs[l.index()]),
                        _ => None,
                    };
                    let before = sink.code.len();
                    jump_offs[i] = JumpOut {
                        offset: backend.emit_jump(j, sizes[i], at, target, &mut sink),
                        rewritable: j.rewritable,
                    };
                    debug_assert_eq!(
                        sink.code.len() - before,
                        sizes[i] as usize,
                        "jump encoding does not match its declared size"
                    );
                }
                Item::Const { index } => {
                    let i = *index as usize;
                    const_offs[i] = sink.code.len() as CodeOffset - self.consts[i].back;
                }
                Item::Align { align } => {
                    let target = align_up(sink.code.len() as u32, *align);
                    backend.pad_to(target, &mut sink);
                    debug_assert_eq!(sink.code.len() as u32, target);
                }
            }
        }
        debug_assert_eq!(sink.code.len() as CodeOffset, total);

        Ok(CodeImage {
            arch: backend.arch(),
            code: sink.code,
            fixups: sink.fixups,
            labels: label_offs,
            jumps: jump_offs,
            consts: const_offs,
        })
    }
}

impl ByteSink for CodeBuffer {
    fn cur_offset(&self) -> CodeOffset {
        self.virtual_len
    }

    fn put1(&mut self, b: u8) {
        if self.chunks.last().unwrap().remaining() == 0 {
            self.chunks.push(Chunk::new());
        }
        self.chunks.last_mut().unwrap().bytes.push(b);
        self.byte_len += 1;
        self.virtual_len += 1;
        self.push_bytes_item(1);
    }
}

struct ChunkCursor<'a> {
    chunks: &'a [Chunk],
    chunk: usize,
    pos: usize,
}

impl<'a> ChunkCursor<'a> {
    fn new(chunks: &'a [Chunk]) -> Self {
        ChunkCursor {
            chunks,
            chunk: 0,
            pos: 0,
        }
    }

    fn copy_to(&mut self, out: &mut Vec<u8>, mut len: u32) {
        while len > 0 {
            let chunk = &self.chunks[self.chunk].bytes;
            if self.pos == chunk.len() {
                self.chunk += 1;
                self.pos = 0;
                continue;
            }
            let n = (len as usize).min(chunk.len() - self.pos);
            out.extend_from_slice(&chunk[self.pos..self.pos + n]);
            self.pos += n;
            len -= n as u32;
        }
    }
}

fn align_up(off: CodeOffset, align: u32) -> CodeOffset {
    (off + (align - 1)) & !(align - 1)
}

/// Sink used during layout; collects final code bytes and absolute fixups.
pub struct CodeSink {
    pub(crate) code: Vec<u8>,
    pub(crate) fixups: Vec<AbsFixup>,
}

impl CodeSink {
    /// Record a fixup starting at the current position.
    pub(crate) fn fixup(&mut self, kind: FixupKind, target: FixTarget) {
        self.fixups.push(AbsFixup {
            at: self.code.len() as CodeOffset,
            kind,
            target,
        });
    }
}

impl ByteSink for CodeSink {
    fn cur_offset(&self) -> CodeOffset {
        self.code.len() as CodeOffset
    }

    fn put1(&mut self, b: u8) {
        self.code.push(b);
    }
}

/// What an absolute fixup resolves to.
#[derive(Clone, Copy, Debug)]
pub(crate) enum FixTarget {
    /// A label position: final value is `base + offset`.
    Offset(CodeOffset),
    /// A fixed address known before linking.
    Addr(u64),
    /// A jump's eventual target (label or address); resolved once layout
    /// has fixed the label offsets. Used by pool slots registered before
    /// `set_label` could have run.
    Jump(Jump),
}

/// Architecture-tagged absolute fixup kinds. The patchers live with their
/// backends; this enum only routes.
#[derive(Clone, Copy, Debug)]
pub(crate) enum FixupKind {
    /// Raw 32-bit absolute, target endianness.
    Abs32,
    /// Raw 64-bit absolute, little-endian.
    Abs64,
    /// x86: 32-bit PC-relative, next instruction at `at + 4`.
    X86Rel32,
    /// ARM-64 `movz/movk` sequence, `count` total instructions.
    A64MovSeq { count: u8 },
    /// ARM v7 `movw/movt` pair.
    ArmMovSeq,
    /// Thumb-2 `movw/movt` pair.
    Thumb2MovSeq,
    /// PPC `lis/ori` pair (32-bit value).
    PpcImm32,
    /// PPC64 `lis/ori/sldi/oris/ori` sequence.
    PpcImm64,
    /// SPARC `sethi/or` pair.
    SparcHiLo,
    /// S390x `iihf/iilf` pair.
    S390xImm64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct AbsFixup {
    pub at: CodeOffset,
    pub kind: FixupKind,
    pub target: FixTarget,
}

/// Where a jump's patchable site landed.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct JumpOut {
    pub offset: CodeOffset,
    pub rewritable: bool,
}

/// The finalized, relocatable function image.
///
/// `code` holds target bytes valid once `relocate` has been applied for the
/// base address the image will execute at. Label/jump/const positions are
/// byte offsets from the image base.
pub struct CodeImage {
    arch: Arch,
    code: Vec<u8>,
    fixups: Vec<AbsFixup>,
    labels: Vec<CodeOffset>,
    jumps: Vec<JumpOut>,
    consts: Vec<CodeOffset>,
}

impl CodeImage {
    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Byte offset of a label from the image base.
    pub fn label_offset(&self, label: Label) -> CodeOffset {
        self.labels[label.index()]
    }

    /// Byte offset of a jump's patchable site from the image base.
    pub fn jump_offset(&self, jump: Jump) -> CodeOffset {
        self.jumps[jump.index()].offset
    }

    /// Whether a jump was emitted in the rewritable (long) form.
    pub fn jump_rewritable(&self, jump: Jump) -> bool {
        self.jumps[jump.index()].rewritable
    }

    /// Byte offset of a const's patchable literal from the image base.
    pub fn const_offset(&self, konst: Const) -> CodeOffset {
        self.consts[konst.index()]
    }

    /// Apply every absolute fixup to `code` (a copy of [`Self::code`])
    /// assuming the image will execute at `base`.
    ///
    /// On dual-mapped memory, `base` must be the *executable* view's
    /// address even though `code` aliases the writable view: PC-relative
    /// and absolute values embedded in the code must describe where the
    /// code runs, not where it is written.
    pub fn relocate(&self, base: u64, code: &mut [u8]) {
        assert_eq!(code.len(), self.code.len());
        for fixup in &self.fixups {
            let value = match fixup.target {
                FixTarget::Offset(off) => base + u64::from(off),
                FixTarget::Addr(addr) => addr,
                FixTarget::Jump(_) => unreachable!("jump fixups resolve at layout"),
            };
            let at = fixup.at as usize;
            crate::isa::apply_fixup(self.arch, fixup.kind, &mut code[at..], base + fixup.at as u64, value);
        }
    }
}

impl fmt::Debug for CodeImage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CodeImage")
            .field("arch", &self.arch)
            .field("len", &self.code.len())
            .field("labels", &self.labels.len())
            .field("jumps", &self.jumps.len())
            .field("consts", &self.consts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_append_crosses_chunks() {
        let mut buf = CodeBuffer::new();
        for i in 0..3000u32 {
            buf.put1(i as u8);
        }
        assert_eq!(buf.chunk_len(), 3000);
        assert!(buf.chunks.len() >= 2);
        assert_eq!(buf.read4(0), u32::from_le_bytes([0, 1, 2, 3]));
        // Crossing the 2048-byte chunk boundary.
        buf.patch4(2046, 0xdead_beef);
        assert_eq!(buf.read4(2046), 0xdead_beef);
    }

    #[test]
    fn bytes_items_merge() {
        let mut buf = CodeBuffer::new();
        buf.put4(0x1234_5678);
        buf.put4(0x9abc_def0);
        assert_eq!(buf.items.len(), 1);
        match buf.items[0] {
            Item::Bytes { len } => assert_eq!(len, 8),
            _ => panic!("expected a byte range"),
        }
    }
}
