// In-memory stand-ins for the loader's collaborators, plus a byte-level
// image builder. Test-only; the real kernel provides these services.

use std::cell::{Cell, RefCell};

use crate::error::{ExecError, ExecResult};
use crate::process::{DescriptorTable, EntryTransfer, ProcessImage, ProcessTable};
use crate::segment::{SegKind, SegmentAllocator, SegmentHandle, SegmentMemory};
use crate::store::{BackingStore, StoreId};

/// Whole image held in a byte vector.
pub struct MockStore {
    bytes: Vec<u8>,
    pos: u32,
    id: StoreId,
}

impl MockStore {
    pub fn new(bytes: Vec<u8>, id: StoreId) -> Self {
        MockStore { bytes, pos: 0, id }
    }
}

impl BackingStore for MockStore {
    fn identity(&self) -> StoreId {
        self.id
    }

    fn pos(&self) -> u32 {
        self.pos
    }

    fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    fn read(&mut self, buf: &mut [u8]) -> crate::error::ExecResult<usize> {
        let start = (self.pos as usize).min(self.bytes.len());
        let n = buf.len().min(self.bytes.len() - start);
        buf[..n].copy_from_slice(&self.bytes[start..start + n]);
        self.pos += n as u32;
        Ok(n)
    }
}

struct MockSegment {
    base: u16,
    refs: u32,
    bytes: Vec<u8>,
}

/// Refcounting allocator plus byte/word memory access. Fresh segments are
/// filled with 0x55 so tests catch missed zeroing.
pub struct MockMemory {
    segments: RefCell<Vec<MockSegment>>,
    next_base: Cell<u16>,
    allocations: Cell<usize>,
    fail_after: Cell<Option<usize>>,
    compression: Cell<bool>,
}

impl MockMemory {
    pub fn new() -> Self {
        MockMemory {
            segments: RefCell::new(Vec::new()),
            next_base: Cell::new(0x0100),
            allocations: Cell::new(0),
            fail_after: Cell::new(None),
            compression: Cell::new(false),
        }
    }

    /// Make every allocation after the first `n` fail.
    pub fn fail_after_allocations(&self, n: usize) {
        self.fail_after.set(Some(n));
    }

    /// Wire in the run-length decompressor.
    pub fn enable_compression(&self) {
        self.compression.set(true);
    }

    pub fn refcount(&self, seg: &SegmentHandle) -> u32 {
        self.with_segment(seg, |s| s.refs)
    }

    pub fn segment_bytes(&self, seg: &SegmentHandle) -> Vec<u8> {
        self.with_segment(seg, |s| s.bytes.clone())
    }

    /// Segments still holding at least one reference.
    pub fn live_segments(&self) -> usize {
        self.segments.borrow().iter().filter(|s| s.refs > 0).count()
    }

    fn with_segment<R>(&self, seg: &SegmentHandle, f: impl FnOnce(&mut MockSegment) -> R) -> R {
        let mut segments = self.segments.borrow_mut();
        let found = segments
            .iter_mut()
            .find(|s| s.base == seg.base())
            .unwrap_or_else(|| panic!("unknown segment {:#06x}", seg.base()));
        f(found)
    }
}

impl SegmentAllocator for MockMemory {
    fn allocate(&self, paras: u16, kind: SegKind) -> Option<SegmentHandle> {
        let _ = kind;
        if let Some(limit) = self.fail_after.get() {
            if self.allocations.get() >= limit {
                return None;
            }
        }
        self.allocations.set(self.allocations.get() + 1);
        let base = self.next_base.get();
        self.next_base.set(base + paras + 1);
        self.segments.borrow_mut().push(MockSegment {
            base,
            refs: 1,
            bytes: vec![0x55; paras as usize * 16],
        });
        Some(SegmentHandle::new(base))
    }

    fn retain(&self, seg: &SegmentHandle) {
        self.with_segment(seg, |s| s.refs += 1);
    }

    fn release(&self, seg: &SegmentHandle) {
        self.with_segment(seg, |s| s.refs = s.refs.saturating_sub(1));
    }
}

impl SegmentMemory for MockMemory {
    fn write(&self, seg: &SegmentHandle, offset: u16, bytes: &[u8]) {
        self.with_segment(seg, |s| {
            let off = offset as usize;
            s.bytes[off..off + bytes.len()].copy_from_slice(bytes);
        });
    }

    fn zero(&self, seg: &SegmentHandle, offset: u16, len: usize) {
        self.with_segment(seg, |s| {
            let off = offset as usize;
            s.bytes[off..off + len].fill(0);
        });
    }

    fn peekw(&self, seg: &SegmentHandle, offset: u16) -> u16 {
        self.with_segment(seg, |s| {
            let off = offset as usize;
            u16::from_le_bytes([s.bytes[off], s.bytes[off + 1]])
        })
    }

    fn pokew(&self, seg: &SegmentHandle, offset: u16, value: u16) {
        self.with_segment(seg, |s| {
            let off = offset as usize;
            s.bytes[off..off + 2].copy_from_slice(&value.to_le_bytes());
        });
    }

    fn supports_compression(&self) -> bool {
        self.compression.get()
    }

    /// Run-length pairs (count, byte), expanded in place over the packed
    /// form. Returns the expanded length for the caller to verify.
    fn decompress(
        &self,
        seg: &SegmentHandle,
        offset: u16,
        packed: u16,
        _unpacked: u16,
    ) -> ExecResult<u16> {
        if !self.compression.get() {
            return Err(ExecError::CompressionUnsupported);
        }
        let off = offset as usize;
        let pairs =
            self.with_segment(seg, |s| s.bytes[off..off + packed as usize].to_vec());
        if pairs.len() % 2 != 0 {
            return Err(ExecError::BadCompressedData);
        }
        let mut out = Vec::new();
        for pair in pairs.chunks(2) {
            out.resize(out.len() + pair[0] as usize, pair[1]);
        }
        let len = out.len() as u16;
        self.write(seg, offset, &out);
        Ok(len)
    }
}

/// Task table with at most one resident image. Takes a reference on behalf
/// of the caller when the scan hits, like the real table does.
pub struct MockTable<'a> {
    mem: &'a MockMemory,
    resident: Option<(StoreId, SegmentHandle)>,
}

impl<'a> MockTable<'a> {
    pub fn empty(mem: &'a MockMemory) -> Self {
        MockTable {
            mem,
            resident: None,
        }
    }

    pub fn resident(mem: &'a MockMemory, id: StoreId, seg: SegmentHandle) -> Self {
        MockTable {
            mem,
            resident: Some((id, seg)),
        }
    }
}

impl ProcessTable for MockTable<'_> {
    fn find_resident_image(&self, id: StoreId) -> Option<SegmentHandle> {
        match self.resident {
            Some((rid, seg)) if rid == id => {
                self.mem.retain(&seg);
                Some(seg)
            }
            _ => None,
        }
    }
}

/// Records descriptors closed over exec.
pub struct MockFiles {
    closed: Vec<usize>,
}

impl MockFiles {
    pub fn new() -> Self {
        MockFiles { closed: Vec::new() }
    }

    pub fn closed(&self) -> Vec<usize> {
        self.closed.clone()
    }
}

impl DescriptorTable for MockFiles {
    fn close(&mut self, fd: usize) {
        self.closed.push(fd);
    }
}

/// Captures the final control transfer instead of performing it.
pub struct MockArch {
    entry: Cell<Option<(u16, u16)>>,
}

impl MockArch {
    pub fn new() -> Self {
        MockArch {
            entry: Cell::new(None),
        }
    }

    /// (code segment base, entry offset) of the last transfer, if any.
    pub fn last_entry(&self) -> Option<(u16, u16)> {
        self.entry.get()
    }
}

impl EntryTransfer for MockArch {
    fn setup_user_stack(&self, _proc: &mut ProcessImage, code: &SegmentHandle, entry: u16) {
        self.entry.set(Some((code.base(), entry)));
    }
}

/// Argument block in its on-stack layout: argc, then two zero-terminated
/// word lists of in-block offsets.
pub fn arg_block(argc: u16, argv: &[u16], envp: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&argc.to_le_bytes());
    for off in argv {
        bytes.extend_from_slice(&off.to_le_bytes());
    }
    bytes.extend_from_slice(&0u16.to_le_bytes());
    for off in envp {
        bytes.extend_from_slice(&off.to_le_bytes());
    }
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes
}

const STUB_SIZE: usize = 0x40;
const EXT_SIZE: usize = 0x40;

/// Byte-level builder for executable images and relocation streams.
pub struct ImageBuilder {
    bytes: Vec<u8>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder { bytes: Vec::new() }
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u32(mut self, value: u32) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Zero-pad up to an absolute image offset.
    pub fn pad_to(mut self, pos: usize) -> Self {
        assert!(self.bytes.len() <= pos, "image already past {:#x}", pos);
        self.bytes.resize(pos, 0);
        self
    }

    /// Full 0x20-byte split-ID primary header.
    #[allow(clippy::too_many_arguments)]
    pub fn split_id_header(
        self,
        typ: u32,
        hlen: u8,
        version: u16,
        tseg: u32,
        dseg: u32,
        bseg: u32,
        entry: u32,
        chmem: u16,
        minstack: u16,
    ) -> Self {
        self.u32(typ)
            .bytes(&[hlen, 0])
            .u16(version)
            .u32(tseg)
            .u32(dseg)
            .u32(bseg)
            .u32(entry)
            .u16(chmem)
            .u16(minstack)
            .u32(0) // symbol table size
    }

    /// Full 0x20-byte supplement header.
    #[allow(clippy::too_many_arguments)]
    pub fn supplement(
        self,
        trsize: u32,
        drsize: u32,
        tbase: u32,
        dbase: u32,
        ftseg: u32,
        ftrsize: u32,
        compr_tseg: u16,
        compr_dseg: u16,
        compr_ftseg: u16,
    ) -> Self {
        self.u32(trsize)
            .u32(drsize)
            .u32(tbase)
            .u32(dbase)
            .u32(ftseg)
            .u32(ftrsize)
            .u16(compr_tseg)
            .u16(compr_dseg)
            .u16(compr_ftseg)
            .u16(0)
    }

    /// 8-byte split-ID relocation record.
    pub fn reloc(self, vaddr: u32, symndx: u16, rtype: u16) -> Self {
        self.u32(vaddr).u16(symndx).u16(rtype)
    }

    /// Stub header pointing at the extension header.
    pub fn ne_stub(self, ext_off: u32) -> Self {
        let mut stub = [0u8; STUB_SIZE];
        stub[0] = 0x4D;
        stub[1] = 0x5A;
        stub[0x3C..0x40].copy_from_slice(&ext_off.to_le_bytes());
        self.bytes(&stub)
    }

    /// Extension header accepted by the segmented loader: multiple-data
    /// model, no module references, no movable or resource entries.
    #[allow(clippy::too_many_arguments)]
    pub fn ne_ext_header(
        self,
        num_segments: u16,
        auto_data: u16,
        heap: u16,
        stack: u16,
        reg_ip: u16,
        reg_cs: u16,
        seg_table_off: u16,
        align_shift: u16,
    ) -> Self {
        self.ne_ext_header_with(
            num_segments,
            auto_data,
            heap,
            stack,
            reg_ip,
            reg_cs,
            seg_table_off,
            align_shift,
            |_| {},
        )
    }

    /// Like `ne_ext_header` but lets the test corrupt fields afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn ne_ext_header_with(
        self,
        num_segments: u16,
        auto_data: u16,
        heap: u16,
        stack: u16,
        reg_ip: u16,
        reg_cs: u16,
        seg_table_off: u16,
        align_shift: u16,
        tweak: impl FnOnce(&mut [u8; EXT_SIZE]),
    ) -> Self {
        let mut buf = [0u8; EXT_SIZE];
        let put = |buf: &mut [u8; EXT_SIZE], off: usize, v: u16| {
            buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
        };
        put(&mut buf, 0x00, 0x454E);
        buf[0x0C] = 0x02; // multiple-data memory model
        put(&mut buf, 0x0E, auto_data);
        put(&mut buf, 0x10, heap);
        put(&mut buf, 0x12, stack);
        put(&mut buf, 0x14, reg_ip);
        put(&mut buf, 0x16, reg_cs);
        put(&mut buf, 0x1C, num_segments);
        put(&mut buf, 0x22, seg_table_off);
        put(&mut buf, 0x32, align_shift);
        buf[0x36] = 1; // target OS
        tweak(&mut buf);
        self.bytes(&buf)
    }

    /// 8-byte segment table descriptor.
    pub fn ne_segment(self, offset: u16, size: u16, flags: u16, min_alloc: u16) -> Self {
        self.u16(offset).u16(size).u16(flags).u16(min_alloc)
    }

    /// 8-byte fixup record.
    pub fn ne_fixup(self, src_type: u8, flags: u8, src_chain: u16, segment: u8, offset: u16) -> Self {
        let chain = src_chain.to_le_bytes();
        let off = offset.to_le_bytes();
        self.bytes(&[src_type, flags, chain[0], chain[1], segment, 0, off[0], off[1]])
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}
