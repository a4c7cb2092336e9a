// Relocation fixup interpreters for both executable families.
//
// Split-ID streams are flat arrays of 8-byte records naming a symbol
// class; segmented-executable fixups are counted per segment and name a
// target segment index directly.

use crate::config::MAX_EXE_SEGMENTS;
use crate::console_println;
use crate::error::{ExecError, ExecResult};
use crate::header::{rd16, rd32};
use crate::segment::{bytes_to_paras, SegmentHandle, SegmentMemory};
use crate::store::{read_exact, BackingStore};

pub const RELOC_RECORD_SIZE: usize = 8;

/// The only record type supported: patch a 16-bit word with a segment base.
pub const R_SEGWORD: u16 = 80;

/// Symbol classes a segment-word record can name.
pub const S_TEXT: u16 = 0xFFFE;
pub const S_FTEXT: u16 = 0xFFFD;
pub const S_DATA: u16 = 0xFFFC;

/// Apply one split-ID relocation stream of `rsize` bytes to the segment
/// region at `(place, place_disp)`. `tseg` is the text size in bytes,
/// used to resolve far-text references to just past the text region.
pub fn apply_stream<S, M>(
    store: &mut S,
    mem: &M,
    place: &SegmentHandle,
    place_disp: u16,
    rsize: u32,
    seg_code: &SegmentHandle,
    seg_data: &SegmentHandle,
    tseg: u16,
) -> ExecResult<()>
where
    S: BackingStore + ?Sized,
    M: SegmentMemory + ?Sized,
{
    if rsize as usize % RELOC_RECORD_SIZE != 0 {
        return Err(ExecError::BadRelocation);
    }
    let mut remaining = rsize;
    let mut rec = [0u8; RELOC_RECORD_SIZE];
    while remaining >= RELOC_RECORD_SIZE as u32 {
        read_exact(store, &mut rec)?;
        let vaddr = rd32(&rec, 0) as u16;
        let symndx = rd16(&rec, 4);
        let rtype = rd16(&rec, 6);
        if rtype != R_SEGWORD {
            console_println!("[x] EXEC: bad relocation type {:#06x}", rtype);
            return Err(ExecError::BadRelocation);
        }
        let value = match symndx {
            S_TEXT => seg_code.base(),
            S_FTEXT => seg_code.base().wrapping_add(bytes_to_paras(tseg)),
            S_DATA => seg_data.base(),
            _ => {
                console_println!("[x] EXEC: bad relocation symbol {:#06x}", symndx);
                return Err(ExecError::BadRelocation);
            }
        };
        mem.pokew(place, place_disp.wrapping_add(vaddr), value);
        remaining -= RELOC_RECORD_SIZE as u32;
    }
    Ok(())
}

// Segmented-executable fixup encoding.
pub const FIXUP_RECORD_SIZE: usize = 8;
pub const FIXSRC_SEGMENT: u8 = 2;
pub const FIXSRC_FARADDR: u8 = 3;
pub const FIXFLG_TARGET_MASK: u8 = 0x03;
pub const FIXFLG_INTERNALREF: u8 = 0x00;
pub const FIXFLG_ADDITIVE: u8 = 0x04;

/// Apply one segment's fixup block: a leading u16 record count followed by
/// that many 8-byte records, read from the store's current position.
pub fn apply_segment_fixups<S, M>(
    store: &mut S,
    mem: &M,
    place: &SegmentHandle,
    segments: &heapless::Vec<SegmentHandle, MAX_EXE_SEGMENTS>,
) -> ExecResult<()>
where
    S: BackingStore + ?Sized,
    M: SegmentMemory + ?Sized,
{
    let mut count = [0u8; 2];
    read_exact(store, &mut count)?;
    let count = u16::from_le_bytes(count);
    console_println!("[i] EXEC: {} fixup records", count);

    let mut rec = [0u8; FIXUP_RECORD_SIZE];
    for _ in 0..count {
        read_exact(store, &mut rec)?;
        let src_type = rec[0];
        let flags = rec[1];
        let src_chain = rd16(&rec, 2);
        let segment = rec[4];
        let offset = rd16(&rec, 6);

        if flags & FIXFLG_TARGET_MASK != FIXFLG_INTERNALREF
            || (src_type != FIXSRC_SEGMENT && src_type != FIXSRC_FARADDR)
        {
            console_println!("[x] EXEC: unsupported fixup type {} flags {}", src_type, flags);
            return Err(ExecError::BadRelocation);
        }
        let target = segment
            .checked_sub(1)
            .and_then(|i| segments.get(i as usize))
            .ok_or(ExecError::BadRelocation)?;

        match src_type {
            FIXSRC_SEGMENT => mem.pokew(place, src_chain, target.base()),
            _ => {
                // Far address: offset word first (add or overwrite), then
                // the following word gets the target segment base.
                if flags & FIXFLG_ADDITIVE != 0 {
                    let prev = mem.peekw(place, src_chain);
                    mem.pokew(place, src_chain, prev.wrapping_add(offset));
                } else {
                    mem.pokew(place, src_chain, offset);
                }
                mem.pokew(place, src_chain.wrapping_add(2), target.base());
            }
        }
    }
    Ok(())
}
