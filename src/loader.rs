// Split-ID image loading and the exec entry point.
//
// The load is a strict prefix of fallible, allocate-only work producing a
// LoadPlan, followed by the infallible commit. Any failure on the way
// releases exactly the segments this attempt acquired and leaves the
// calling process untouched.

use crate::console_println;
use crate::error::{ExecError, ExecResult};
use crate::finalize::{self, LoadPlan};
use crate::header::{self, ExecHeader, ImageFormat};
use crate::layout;
use crate::ne;
use crate::process::{
    DescriptorTable, EntryTransfer, ImageCredentials, ProcessImage, ProcessTable,
};
use crate::segment::{bytes_to_paras, SegKind, SegmentAllocator, SegmentHandle, SegmentMemory};
use crate::store::{read_into_segment, BackingStore};

/// Replace `proc`'s image with the executable on `store`.
///
/// `argv_env` is the SP-relative argument block assembled by the syscall
/// layer; `creds` carry the image's mode and ownership for the suid/sgid
/// transition. On error the process is left exactly as it was.
pub fn execve<S, M, T, D, E>(
    store: &mut S,
    mem: &M,
    table: &T,
    proc: &mut ProcessImage,
    files: &mut D,
    arch: &E,
    argv_env: &[u8],
    creds: ImageCredentials,
) -> ExecResult<()>
where
    S: BackingStore + ?Sized,
    M: SegmentAllocator + SegmentMemory,
    T: ProcessTable + ?Sized,
    D: DescriptorTable,
    E: EntryTransfer,
{
    if argv_env.len() > u16::MAX as usize {
        return Err(ExecError::ArgTooBig);
    }
    let slen = argv_env.len() as u16;

    store.seek(0);
    let plan = match header::parse(store, mem.supports_compression())? {
        ImageFormat::Segmented => ne::load(store, mem, slen, creds)?,
        ImageFormat::SplitId(hdr) => load_split_id(store, mem, table, &hdr, slen, creds)?,
    };

    finalize::commit(&plan, proc, mem, files, arch, argv_env);
    Ok(())
}

/// Load a split-ID image. The store is positioned just past the header(s).
pub fn load_split_id<S, M, T>(
    store: &mut S,
    mem: &M,
    table: &T,
    hdr: &ExecHeader,
    slen: u16,
    creds: ImageCredentials,
) -> ExecResult<LoadPlan>
where
    S: BackingStore + ?Sized,
    M: SegmentAllocator + SegmentMemory,
    T: ProcessTable + ?Sized,
{
    let plan = layout::plan(hdr, slen)?;

    // A live at-rest process already running this image lets us share its
    // code segment instead of re-reading and re-relocating the text.
    let (seg_code, reused) = match table.find_resident_image(store.identity()) {
        Some(seg) => {
            console_println!("[i] EXEC: sharing resident text at {:#06x}", seg.base());
            let skip = text_bytes_on_disk(hdr) + ftext_bytes_on_disk(hdr);
            store.seek(store.pos() + skip);
            (seg, true)
        }
        None => match load_text(store, mem, hdr) {
            Ok(seg) => (seg, false),
            Err(e) => return Err(e),
        },
    };

    console_println!(
        "[i] EXEC: allocating {:#06x} paras for data segment",
        plan.total_paras
    );
    let seg_data = match mem.allocate(plan.total_paras, SegKind::Data) {
        Some(seg) => seg,
        None => {
            mem.release(&seg_code);
            return Err(ExecError::OutOfMemory);
        }
    };

    if let Err(e) = load_data_and_relocate(store, mem, hdr, &seg_code, &seg_data, reused) {
        mem.release(&seg_data);
        mem.release(&seg_code);
        return Err(e);
    }

    Ok(LoadPlan {
        code: seg_code,
        data: seg_data,
        entry: hdr.entry,
        endseg: plan.total_len,
        enddata: hdr.dseg + hdr.bseg + hdr.supl.dbase,
        minstack: plan.stack,
        stack_base: (hdr.supl.dbase != 0).then_some(hdr.supl.dbase),
        bss_start: hdr.dseg + hdr.supl.dbase,
        bss_len: hdr.bseg,
        image: store.identity(),
        creds,
    })
}

fn text_bytes_on_disk(hdr: &ExecHeader) -> u32 {
    if hdr.supl.compr_tseg != 0 {
        hdr.supl.compr_tseg as u32
    } else {
        hdr.tseg as u32
    }
}

fn ftext_bytes_on_disk(hdr: &ExecHeader) -> u32 {
    if hdr.supl.compr_ftseg != 0 {
        hdr.supl.compr_ftseg as u32
    } else {
        hdr.supl.ftseg as u32
    }
}

/// Byte offset of far text within the code segment. Text rounded up to a
/// full 64 KiB leaves no 16-bit offset for far text to live at; that image
/// cannot be loaded, only rejected.
fn far_text_offset(hdr: &ExecHeader) -> ExecResult<u16> {
    let off = bytes_to_paras(hdr.tseg) as u32 * 16;
    let needs_region = hdr.supl.ftseg != 0 || hdr.supl.ftrsize != 0;
    if needs_region && (off >= 0x1_0000 || off + hdr.supl.ftseg as u32 > 0x1_0000) {
        console_println!(
            "[x] EXEC: far text at {:#x}+{:#x} exceeds the segment",
            off,
            hdr.supl.ftseg
        );
        return Err(ExecError::TooBig);
    }
    Ok(off as u16)
}

/// Allocate the code segment and read text (and far text) into it.
fn load_text<S, M>(store: &mut S, mem: &M, hdr: &ExecHeader) -> ExecResult<SegmentHandle>
where
    S: BackingStore + ?Sized,
    M: SegmentAllocator + SegmentMemory,
{
    let ftext_off = far_text_offset(hdr)?;
    let mut paras = bytes_to_paras(hdr.tseg);
    if hdr.supl.compr_tseg != 0 || hdr.supl.compr_ftseg != 0 {
        paras += 1; // safety paragraph for in-place decompression
    }
    paras = paras
        .checked_add(bytes_to_paras(hdr.supl.ftseg))
        .ok_or(ExecError::TooBig)?;

    console_println!("[i] EXEC: allocating {:#06x} paras for text segment(s)", paras);
    let seg = mem
        .allocate(paras, SegKind::Code)
        .ok_or(ExecError::OutOfMemory)?;

    let result: ExecResult<()> = (|| {
        read_region(store, mem, &seg, 0, hdr.tseg, hdr.supl.compr_tseg)?;
        if hdr.supl.ftseg != 0 {
            read_region(store, mem, &seg, ftext_off, hdr.supl.ftseg, hdr.supl.compr_ftseg)?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(seg),
        Err(e) => {
            mem.release(&seg);
            Err(e)
        }
    }
}

/// Read one segment region, decompressing in place when the image stores
/// it compressed. The decompressed length must match the declared size
/// exactly.
fn read_region<S, M>(
    store: &mut S,
    mem: &M,
    seg: &SegmentHandle,
    offset: u16,
    declared: u16,
    compressed: u16,
) -> ExecResult<()>
where
    S: BackingStore + ?Sized,
    M: SegmentMemory + ?Sized,
{
    let on_disk = if compressed != 0 { compressed } else { declared };
    read_into_segment(store, mem, seg, offset, on_disk as usize)?;
    if compressed != 0 {
        let unpacked = mem.decompress(seg, offset, compressed, declared)?;
        if unpacked != declared {
            console_println!("[x] EXEC: unpacked {} bytes, expected {}", unpacked, declared);
            return Err(ExecError::BadCompressedData);
        }
    }
    Ok(())
}

fn load_data_and_relocate<S, M>(
    store: &mut S,
    mem: &M,
    hdr: &ExecHeader,
    seg_code: &SegmentHandle,
    seg_data: &SegmentHandle,
    reused_code: bool,
) -> ExecResult<()>
where
    S: BackingStore + ?Sized,
    M: SegmentMemory + ?Sized,
{
    read_region(
        store,
        mem,
        seg_data,
        hdr.supl.dbase,
        hdr.dseg,
        hdr.supl.compr_dseg,
    )?;

    if reused_code {
        // The shared text was relocated at its first load; just keep the
        // read cursor aligned for the data relocations that follow.
        store.seek(store.pos() + hdr.supl.trsize + hdr.supl.ftrsize);
    } else {
        crate::reloc::apply_stream(
            store,
            mem,
            seg_code,
            0,
            hdr.supl.trsize,
            seg_code,
            seg_data,
            hdr.tseg,
        )?;
        let ftext_off = far_text_offset(hdr)?;
        crate::reloc::apply_stream(
            store,
            mem,
            seg_code,
            ftext_off,
            hdr.supl.ftrsize,
            seg_code,
            seg_data,
            hdr.tseg,
        )?;
    }
    crate::reloc::apply_stream(
        store,
        mem,
        seg_data,
        0,
        hdr.supl.drsize,
        seg_code,
        seg_data,
        hdr.tseg,
    )?;
    Ok(())
}
