// Data-segment layout planning. Two mutually exclusive sizing policies,
// selected by the header version field; every addition is overflow-checked
// and every total is rounded up to a paragraph boundary.

use crate::config::{HEAP_MAX, INIT_HEAP, INIT_STACK};
use crate::console_println;
use crate::error::{ExecError, ExecResult};
use crate::header::ExecHeader;

/// Computed extents for the new data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutPlan {
    /// Total data segment length, paragraph rounded.
    pub total_len: u16,
    /// Allocation size in paragraphs (`total_len >> 4`).
    pub total_paras: u16,
    /// Initialized data + BSS (+ data relocation base), the brk floor.
    pub min_len: u16,
    /// Stack reserved above data; 0 when the stack lives below the data
    /// relocation base or the legacy policy packs it into chmem.
    pub stack: u16,
}

/// Size the new data segment.
///
/// Version 1: chmem is the heap size (0 = default, >= HEAP_MAX = all
/// available). Version 0: chmem is the combined data+bss+heap+stack size
/// as the old linker emitted it (0 = defaults).
pub fn plan(hdr: &ExecHeader, arg_len: u16) -> ExecResult<LayoutPlan> {
    let dbase = hdr.supl.dbase;

    let mut min_len = hdr
        .dseg
        .checked_add(hdr.bseg)
        .ok_or(ExecError::InvalidHeaderField)?;
    // With the stack below data, the region under dbase is part of the
    // minimum footprint.
    min_len = min_len
        .checked_add(dbase)
        .ok_or(ExecError::InvalidHeaderField)?;

    let mut stack = 0u16;
    let mut len;
    match hdr.version {
        1 => {
            len = min_len;
            if dbase == 0 {
                stack = if hdr.minstack != 0 { hdr.minstack } else { INIT_STACK };
                len = len.checked_add(stack).ok_or(ExecError::TooBig)?;
                len = len.checked_add(arg_len).ok_or(ExecError::ArgTooBig)?;
            }
            let heap = if hdr.chmem != 0 { hdr.chmem } else { INIT_HEAP };
            if heap >= HEAP_MAX {
                // Maximum heap requested: grow to the ceiling instead of
                // adding (len may already sit near it).
                if len < HEAP_MAX {
                    len = HEAP_MAX;
                }
            } else {
                len = len.checked_add(heap).ok_or(ExecError::TooBig)?;
            }
            console_println!(
                "[i] EXEC: stack {} heap {} arg {} total {}",
                stack,
                heap,
                arg_len,
                len
            );
        }
        0 => {
            len = hdr.chmem;
            if len != 0 {
                // The combined size must cover data+bss and still leave
                // room for the argument block; no protected stack space.
                if len <= min_len {
                    return Err(ExecError::InvalidHeaderField);
                }
                if len - min_len < arg_len {
                    return Err(ExecError::ArgTooBig);
                }
            } else {
                stack = INIT_STACK;
                len = min_len;
                if dbase != 0 {
                    len = len.checked_add(INIT_HEAP).ok_or(ExecError::TooBig)?;
                } else {
                    len = len
                        .checked_add(INIT_HEAP + INIT_STACK)
                        .ok_or(ExecError::TooBig)?;
                }
                len = len.checked_add(arg_len).ok_or(ExecError::ArgTooBig)?;
            }
            console_println!("[i] EXEC: legacy chmem {} total {}", hdr.chmem, len);
        }
        _ => return Err(ExecError::BadHeader),
    }

    // Round up to a paragraph boundary. If this overflows, blame the
    // argument block.
    len = len.checked_add(15).ok_or(ExecError::ArgTooBig)? & !15u16;

    Ok(LayoutPlan {
        total_len: len,
        total_paras: len >> 4,
        min_len,
        stack,
    })
}
