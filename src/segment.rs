// Segment handles and the paragraph-granular memory collaborator contracts.
//
// All segment memory is addressed through (handle, offset) pairs. Raw
// numeric addresses never cross these interfaces; a handle's base value is
// exposed only because relocation must write it into patched words.

use crate::error::{ExecError, ExecResult};

/// 16-byte allocation granule.
pub const PARA_SIZE: usize = 16;

/// Paragraph count of a full 64 KiB segment.
pub const MAX_SEGMENT_PARAS: u16 = 0x1000;

/// Round a byte count up to whole paragraphs.
pub fn bytes_to_paras(bytes: u16) -> u16 {
    ((bytes as u32 + 15) >> 4) as u16
}

/// What a segment holds, for the allocator's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegKind {
    Code,
    Data,
}

/// Opaque handle to an allocator-owned segment.
///
/// The base is the paragraph address loaded into a segment register when
/// the process runs; it is meaningful as a relocation value but is never
/// dereferenced by the loader itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHandle {
    base: u16,
}

impl SegmentHandle {
    pub fn new(base: u16) -> Self {
        SegmentHandle { base }
    }

    pub fn base(&self) -> u16 {
        self.base
    }
}

/// Paragraph-granular segment allocator.
///
/// Reference counting must be atomic with respect to concurrent release by
/// the segment's other holders; a shared code segment is freed exactly once,
/// when its last holder releases it.
pub trait SegmentAllocator {
    fn allocate(&self, paras: u16, kind: SegKind) -> Option<SegmentHandle>;

    /// Take another reference to a live segment.
    fn retain(&self, seg: &SegmentHandle);

    /// Drop one reference; the segment is freed when the last one goes.
    fn release(&self, seg: &SegmentHandle);
}

/// Byte and word access into allocated segments.
///
/// Callers guarantee `offset + len` stays within the segment (at most
/// 64 KiB); the implementation may treat a violation as a kernel bug.
pub trait SegmentMemory {
    fn write(&self, seg: &SegmentHandle, offset: u16, bytes: &[u8]);

    fn zero(&self, seg: &SegmentHandle, offset: u16, len: usize);

    fn peekw(&self, seg: &SegmentHandle, offset: u16) -> u16;

    fn pokew(&self, seg: &SegmentHandle, offset: u16, value: u16);

    /// Whether compressed segment images can be loaded at all.
    fn supports_compression(&self) -> bool {
        false
    }

    /// Unpack `packed` bytes sitting at `(seg, offset)` in place, returning
    /// the unpacked length. The loader verifies it against the declared
    /// uncompressed size.
    fn decompress(
        &self,
        _seg: &SegmentHandle,
        _offset: u16,
        _packed: u16,
        _unpacked: u16,
    ) -> ExecResult<u16> {
        Err(ExecError::CompressionUnsupported)
    }
}
