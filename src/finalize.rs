// The commit step. Everything here runs after the point of no return:
// every fallible operation has already succeeded, and the only remaining
// work is in-memory and register state that cannot fail.

use crate::config::MAX_OPEN_FILES;
use crate::console_println;
use crate::process::{
    DescriptorTable, EntryTransfer, ImageCredentials, ProcessImage, S_ISGID, S_ISUID,
};
use crate::segment::{SegmentAllocator, SegmentHandle, SegmentMemory};
use crate::store::StoreId;

/// Everything a successful load produced, assembled before any process
/// state is touched. Applying it to the process record is infallible.
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub code: SegmentHandle,
    pub data: SegmentHandle,
    /// Entry offset within the code segment.
    pub entry: u16,
    /// Data segment length in bytes (the brk ceiling).
    pub endseg: u16,
    /// End of initialized data + BSS.
    pub enddata: u16,
    /// Reserved stack size.
    pub minstack: u16,
    /// `Some(dbase)` when the stack lives below the data region; the
    /// argument block then sits just under `dbase` instead of `endseg`.
    pub stack_base: Option<u16>,
    /// BSS region still to be zeroed within the data segment. The
    /// segmented-executable path zero-fills during allocation and leaves
    /// this empty.
    pub bss_start: u16,
    pub bss_len: u16,
    pub image: StoreId,
    pub creds: ImageCredentials,
}

/// Atomically replace `proc`'s image with the loaded one.
///
/// `argv_env` is the caller-assembled argument block: a leading argc
/// cell, the argv offset array with its zero terminator, the envp offset
/// array with its zero terminator, then the string bytes the offsets
/// point at.
pub fn commit<M, D, E>(
    plan: &LoadPlan,
    proc: &mut ProcessImage,
    mem: &M,
    files: &mut D,
    arch: &E,
    argv_env: &[u8],
) where
    M: SegmentAllocator + SegmentMemory,
    D: DescriptorTable,
    E: EntryTransfer,
{
    // 1. Wipe the BSS.
    if plan.bss_len != 0 {
        mem.zero(&plan.data, plan.bss_start, plan.bss_len as usize);
    }

    // 2. New stack/brk boundaries. An even break address helps the loaded
    // program's allocator.
    proc.endseg = plan.endseg;
    proc.enddata = plan.enddata;
    proc.endbrk = plan.enddata;
    if proc.endbrk & 1 != 0 {
        proc.endbrk += 1;
    }
    proc.minstack = plan.minstack;

    // 3. Copy the argument block just below the stack top, even-aligned.
    let top = plan.stack_base.unwrap_or(plan.endseg);
    proc.begstack = top.wrapping_sub(argv_env.len() as u16) & !1u16;
    mem.write(&plan.data, proc.begstack, argv_env);

    // 4. The old image is no longer needed; swap in the new segments.
    if let Some(old) = proc.seg_code.take() {
        mem.release(&old);
    }
    if let Some(old) = proc.seg_data.take() {
        mem.release(&old);
    }
    proc.seg_code = Some(plan.code);
    proc.seg_data = Some(plan.data);
    proc.regs.cs = plan.code.base();
    proc.regs.ds = plan.data.base();
    proc.regs.ss = plan.data.base();
    proc.regs.es = plan.data.base();
    proc.regs.sp = proc.begstack;
    console_println!("[o] EXEC: entry {:#06x}:{:#06x}", plan.code.base(), plan.entry);

    // 5. Rebase the argv/envp pointer tables inside the copied block.
    // An empty block means no arguments at all; there is nothing to walk.
    if !argv_env.is_empty() {
        fixup_arg_block(mem, &plan.data, proc.begstack);
    }

    // 6. Fresh signal state.
    proc.signals.reset();

    // 7. Close-on-exec descriptors go away with the old image.
    for fd in 0..MAX_OPEN_FILES {
        if proc.cloexec.contains(fd) {
            files.close(fd);
        }
    }
    proc.cloexec.clear_all();

    // 8. The process now runs this backing-store image.
    proc.image = Some(plan.image);

    // 9. Privilege transition for suid/sgid executables.
    if plan.creds.mode & S_ISUID != 0 {
        proc.euid = plan.creds.uid;
    }
    if plan.creds.mode & S_ISGID != 0 {
        proc.egid = plan.creds.gid;
    }

    // 10. Arrange resumption at the new entry point.
    arch.setup_user_stack(proc, &plan.code, plan.entry);
}

/// argv and envp are two null-terminated arrays of offsets located right
/// after argc. Rebase every non-null entry by the block's new base so the
/// loaded program sees real pointers.
fn fixup_arg_block<M: SegmentMemory + ?Sized>(mem: &M, data: &SegmentHandle, base: u16) {
    let mut off = 0u16;
    let mut terminated = 0;
    while terminated < 2 {
        off = off.wrapping_add(2); // first step skips argc
        let v = mem.peekw(data, base.wrapping_add(off));
        if v != 0 {
            mem.pokew(data, base.wrapping_add(off), base.wrapping_add(v));
        } else {
            terminated += 1;
        }
    }
}
