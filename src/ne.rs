// The segmented-executable path: a stub header locates an extension
// header, which declares a table of up to MAX_EXE_SEGMENTS segments, one
// of which is the automatic data segment and one the entry code segment.
// Structurally unrelated to the split-ID family but it converges on the
// same LoadPlan/commit contract.

use crate::config::{INIT_HEAP, INIT_STACK, MAX_EXE_SEGMENTS};
use crate::console_println;
use crate::error::{ExecError, ExecResult};
use crate::finalize::LoadPlan;
use crate::header::{rd16, rd32};
use crate::process::ImageCredentials;
use crate::reloc;
use crate::segment::{SegKind, SegmentAllocator, SegmentHandle, SegmentMemory, MAX_SEGMENT_PARAS};
use crate::store::{read_exact, read_into_segment, BackingStore};

pub const EXT_MAGIC: u16 = 0x454E;
pub const TARGET_OS: u8 = 1;
/// Low five bits of the program flags: required memory model.
pub const FLG_MULTIPLEDATA: u8 = 0x02;
pub const FLG_MODEL_MASK: u8 = 0x1F;

pub const SEG_FLAG_DATA: u16 = 0x0001;
pub const SEG_FLAG_RELOCINFO: u16 = 0x0100;

/// Offset of the extension-header pointer in the stub header.
const EXT_OFFSET_FIELD: u32 = 0x3C;
const EXT_HDR_SIZE: usize = 0x40;
const SEG_DESC_SIZE: usize = 8;

/// Fields of the extension header this loader consumes.
#[derive(Debug, Clone, Copy)]
struct ExtHeader {
    num_segments: u16,
    auto_data_segment: u16,
    heap_size: u16,
    stack_size: u16,
    reg_ip: u16,
    reg_cs: u16,
    segment_table_offset: u16,
    alignment_shift: u16,
}

/// One on-disk segment descriptor.
#[derive(Debug, Clone, Copy)]
struct SegDesc {
    offset: u16,
    size: u16,
    flags: u16,
    min_alloc: u16,
}

impl SegDesc {
    /// Declared allocation in bytes; 0 means a full 64 KiB.
    fn alloc_bytes(&self) -> u32 {
        if self.min_alloc == 0 {
            0x1_0000
        } else {
            self.min_alloc as u32
        }
    }
}

/// Load a segmented executable from offset 0 of the store.
pub fn load<S, M>(
    store: &mut S,
    mem: &M,
    slen: u16,
    creds: ImageCredentials,
) -> ExecResult<LoadPlan>
where
    S: BackingStore + ?Sized,
    M: SegmentAllocator + SegmentMemory,
{
    let (ext, ext_off) = read_ext_header(store)?;
    let descs = read_segment_table(store, &ext, ext_off)?;

    let mut segments: heapless::Vec<SegmentHandle, MAX_EXE_SEGMENTS> = heapless::Vec::new();
    match load_segments(store, mem, &ext, &descs, slen, &mut segments) {
        Ok(plan_parts) => {
            let (code, data, endseg, enddata, minstack) = plan_parts;
            Ok(LoadPlan {
                code,
                data,
                entry: ext.reg_ip,
                endseg,
                enddata,
                minstack,
                stack_base: None,
                // BSS was zero-filled at allocation time
                bss_start: 0,
                bss_len: 0,
                image: store.identity(),
                creds,
            })
        }
        Err(e) => {
            for seg in &segments {
                mem.release(seg);
            }
            Err(e)
        }
    }
}

fn read_ext_header<S: BackingStore + ?Sized>(store: &mut S) -> ExecResult<(ExtHeader, u32)> {
    let mut stub = [0u8; 0x40];
    store.seek(0);
    read_exact(store, &mut stub).map_err(|_| ExecError::BadHeader)?;
    let ext_off = rd32(&stub, EXT_OFFSET_FIELD as usize);

    let mut buf = [0u8; EXT_HDR_SIZE];
    store.seek(ext_off);
    read_exact(store, &mut buf).map_err(|_| ExecError::BadHeader)?;

    let magic = rd16(&buf, 0x00);
    let num_modules = rd16(&buf, 0x1E);
    let num_movable_entries = rd16(&buf, 0x30);
    let num_resource_entries = rd16(&buf, 0x34);
    let program_flags = buf[0x0C];
    let target_os = buf[0x36];
    let ext = ExtHeader {
        num_segments: rd16(&buf, 0x1C),
        auto_data_segment: rd16(&buf, 0x0E),
        heap_size: rd16(&buf, 0x10),
        stack_size: rd16(&buf, 0x12),
        reg_ip: rd16(&buf, 0x14),
        reg_cs: rd16(&buf, 0x16),
        segment_table_offset: rd16(&buf, 0x22),
        alignment_shift: rd16(&buf, 0x32),
    };

    if magic != EXT_MAGIC
        || target_os != TARGET_OS
        || program_flags & FLG_MODEL_MASK != FLG_MULTIPLEDATA
        || ext.auto_data_segment == 0
        || ext.auto_data_segment > ext.num_segments
        || num_modules != 0
        || num_movable_entries != 0
        || num_resource_entries != 0
    {
        console_println!("[x] EXEC: unsupported segmented executable");
        return Err(ExecError::UnsupportedFormat);
    }

    console_println!(
        "[i] EXEC: {} segments, auto data {}, heap {}, stack {}",
        ext.num_segments,
        ext.auto_data_segment,
        ext.heap_size,
        ext.stack_size
    );
    Ok((ext, ext_off))
}

fn read_segment_table<S: BackingStore + ?Sized>(
    store: &mut S,
    ext: &ExtHeader,
    ext_off: u32,
) -> ExecResult<heapless::Vec<SegDesc, MAX_EXE_SEGMENTS>> {
    if ext.num_segments as usize > MAX_EXE_SEGMENTS {
        console_println!(
            "[x] EXEC: {} segments exceeds {} max",
            ext.num_segments,
            MAX_EXE_SEGMENTS
        );
        return Err(ExecError::TableOverflow);
    }

    store.seek(ext_off + ext.segment_table_offset as u32);
    let mut descs = heapless::Vec::new();
    let mut buf = [0u8; SEG_DESC_SIZE];
    for _ in 0..ext.num_segments {
        read_exact(store, &mut buf)?;
        let desc = SegDesc {
            offset: rd16(&buf, 0),
            size: rd16(&buf, 2),
            flags: rd16(&buf, 4),
            min_alloc: rd16(&buf, 6),
        };
        // push cannot fail: count was bounded above
        let _ = descs.push(desc);
    }
    Ok(descs)
}

type PlanParts = (SegmentHandle, SegmentHandle, u16, u16, u16);

fn load_segments<S, M>(
    store: &mut S,
    mem: &M,
    ext: &ExtHeader,
    descs: &heapless::Vec<SegDesc, MAX_EXE_SEGMENTS>,
    slen: u16,
    segments: &mut heapless::Vec<SegmentHandle, MAX_EXE_SEGMENTS>,
) -> ExecResult<PlanParts>
where
    S: BackingStore + ?Sized,
    M: SegmentAllocator + SegmentMemory,
{
    let heap = if ext.heap_size != 0 { ext.heap_size } else { INIT_HEAP };
    let stack = if ext.stack_size != 0 { ext.stack_size } else { INIT_STACK };

    let mut seg_code = None;
    let mut seg_data = None;
    let mut auto_paras = 0u16;

    // Allocate every segment, reserving stack/arguments/heap on top of the
    // automatic data segment.
    for (i, desc) in descs.iter().enumerate() {
        if (desc.min_alloc as u32) < desc.size as u32 && desc.min_alloc != 0 {
            return Err(ExecError::InvalidHeaderField);
        }
        let mut paras = ((desc.alloc_bytes() + 15) >> 4) as u16;
        if i + 1 == ext.auto_data_segment as usize {
            let h = if ext.heap_size == 0xFFFF { 1 } else { heap as u32 };
            let extra = ((stack as u32 + slen as u32 + 15) >> 4) + ((h + 15) >> 4);
            let total = paras as u32 + extra;
            if total >= MAX_SEGMENT_PARAS as u32 {
                return Err(ExecError::TooBig);
            }
            paras = if ext.heap_size == 0xFFFF {
                // All remaining space becomes heap; clamp to the largest
                // segment we can address.
                MAX_SEGMENT_PARAS - 1
            } else {
                total as u16
            };
            auto_paras = paras;
        }
        console_println!(
            "[i] EXEC: segment {} size {} minalloc {} flags {:#06x} -> {:#06x} paras",
            i + 1,
            desc.size,
            desc.min_alloc,
            desc.flags,
            paras
        );

        let kind = if desc.flags & SEG_FLAG_DATA != 0 {
            SegKind::Data
        } else {
            SegKind::Code
        };
        let seg = mem.allocate(paras, kind).ok_or(ExecError::OutOfMemory)?;
        // cannot overflow: descs and segments share a capacity bound
        let _ = segments.push(seg);

        if i + 1 == ext.reg_cs as usize {
            seg_code = Some(seg);
        }
        if i + 1 == ext.auto_data_segment as usize {
            seg_data = Some(seg);
        }

        // Zero the BSS gap between on-disk bytes and the declared
        // allocation, covering the full 64 KiB when nothing is on disk.
        let gap = desc.alloc_bytes().saturating_sub(desc.size as u32);
        if gap > 0 {
            mem.zero(&seg, desc.size, gap as usize);
        }
    }

    let (seg_code, seg_data) = match (seg_code, seg_data) {
        (Some(c), Some(d)) => (c, d),
        _ => {
            console_println!("[x] EXEC: missing code or data segment");
            return Err(ExecError::UnsupportedFormat);
        }
    };

    // Read segment contents in file order and apply their fixups.
    for (i, desc) in descs.iter().enumerate() {
        if desc.size == 0 {
            // nothing on disk; the segment is all BSS
            continue;
        }
        let pos = (desc.offset as u32) << ext.alignment_shift;
        store.seek(pos);
        console_println!(
            "[i] EXEC: reading segment {} ({} bytes at {:#x})",
            i + 1,
            desc.size,
            pos
        );
        read_into_segment(store, mem, &segments[i], 0, desc.size as usize)?;

        if desc.flags & SEG_FLAG_RELOCINFO != 0 {
            reloc::apply_segment_fixups(store, mem, &segments[i], segments)?;
        }
    }

    let endseg = (auto_paras as u32 * 16) as u16;
    let enddata = descs[ext.auto_data_segment as usize - 1].min_alloc;
    Ok((seg_code, seg_data, endseg, enddata, stack))
}
