// The process-image record mutated by commit, and the task-table side
// collaborator contracts the loader consumes.

use crate::config::{MAX_OPEN_FILES, NUM_SIGNALS};
use crate::segment::SegmentHandle;
use crate::store::StoreId;

/// Set-user-ID mode bit on the executable.
pub const S_ISUID: u16 = 0o4000;
/// Set-group-ID mode bit on the executable.
pub const S_ISGID: u16 = 0o2000;

/// Disposition of one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigDisposition {
    Default,
    Ignore,
    /// User handler entry offset within the code segment.
    Handler(u16),
}

/// Per-process signal state. Exec resets every disposition and drops the
/// registered delivery trampoline.
#[derive(Debug, Clone)]
pub struct SignalTable {
    pub action: [SigDisposition; NUM_SIGNALS],
    pub trampoline: Option<u16>,
}

impl SignalTable {
    pub const fn new() -> Self {
        SignalTable {
            action: [SigDisposition::Default; NUM_SIGNALS],
            trampoline: None,
        }
    }

    pub fn reset(&mut self) {
        for slot in self.action.iter_mut() {
            *slot = SigDisposition::Default;
        }
        self.trampoline = None;
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        SignalTable::new()
    }
}

/// Fixed-capacity set of descriptor indices flagged close-on-exec.
#[derive(Debug, Clone)]
pub struct CloexecSet {
    member: [bool; MAX_OPEN_FILES],
}

impl CloexecSet {
    pub const fn new() -> Self {
        CloexecSet {
            member: [false; MAX_OPEN_FILES],
        }
    }

    pub fn insert(&mut self, fd: usize) {
        if fd < MAX_OPEN_FILES {
            self.member[fd] = true;
        }
    }

    pub fn remove(&mut self, fd: usize) {
        if fd < MAX_OPEN_FILES {
            self.member[fd] = false;
        }
    }

    pub fn contains(&self, fd: usize) -> bool {
        fd < MAX_OPEN_FILES && self.member[fd]
    }

    pub fn clear_all(&mut self) {
        self.member = [false; MAX_OPEN_FILES];
    }
}

impl Default for CloexecSet {
    fn default() -> Self {
        CloexecSet::new()
    }
}

/// User-visible register file touched by commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserRegisters {
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub ss: u16,
    pub sp: u16,
}

/// Mode and ownership of the executable, for the suid/sgid transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageCredentials {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
}

/// The live process record. Created at process creation, mutated in place
/// by exec's commit step, destroyed at process exit. No field here is
/// touched until every fallible load step has succeeded.
#[derive(Debug, Clone)]
pub struct ProcessImage {
    pub seg_code: Option<SegmentHandle>,
    pub seg_data: Option<SegmentHandle>,
    /// Data segment length in bytes; the brk ceiling.
    pub endseg: u16,
    /// End of initialized data + BSS.
    pub enddata: u16,
    /// Current program break; starts at `enddata`, rounded even.
    pub endbrk: u16,
    /// Base of the argument block; initial stack pointer.
    pub begstack: u16,
    /// Reserved stack size below `begstack`.
    pub minstack: u16,
    pub regs: UserRegisters,
    /// Backing-store identity of the running binary.
    pub image: Option<StoreId>,
    pub signals: SignalTable,
    pub cloexec: CloexecSet,
    pub euid: u16,
    pub egid: u16,
}

impl ProcessImage {
    pub fn new() -> Self {
        ProcessImage {
            seg_code: None,
            seg_data: None,
            endseg: 0,
            enddata: 0,
            endbrk: 0,
            begstack: 0,
            minstack: 0,
            regs: UserRegisters::default(),
            image: None,
            signals: SignalTable::new(),
            cloexec: CloexecSet::new(),
            euid: 0,
            egid: 0,
        }
    }
}

impl Default for ProcessImage {
    fn default() -> Self {
        ProcessImage::new()
    }
}

/// Task-table query capability for the text-reuse cache. Implementations
/// scan live, at-rest processes and, on a hit, take a reference to the
/// matching code segment before returning it.
pub trait ProcessTable {
    fn find_resident_image(&self, id: StoreId) -> Option<SegmentHandle>;
}

/// Per-process open-file table; commit closes descriptors flagged
/// close-on-exec through this.
pub trait DescriptorTable {
    fn close(&mut self, fd: usize);
}

/// Architecture-specific transfer primitive: arranges that the process's
/// next resumption executes at `entry` in the new code segment on the
/// prepared stack.
pub trait EntryTransfer {
    fn setup_user_stack(&self, proc: &mut ProcessImage, code: &SegmentHandle, entry: u16);
}
