// Build-time tunables for the exec subsystem.

/// Default stack reservation when the header declares none (bytes).
pub const INIT_STACK: u16 = 0x1000;

/// Default heap reservation when the header declares none (bytes).
pub const INIT_HEAP: u16 = 0x1000;

/// A declared heap at or above this value requests "all available heap":
/// the data segment is grown to this length instead of adding the heap.
pub const HEAP_MAX: u16 = 0xFFF0;

/// Open descriptors per process.
pub const MAX_OPEN_FILES: usize = 20;

/// Signal slots per process.
pub const NUM_SIGNALS: usize = 32;

/// Segment table limit for segmented executables.
pub const MAX_EXE_SEGMENTS: usize = 16;

/// Bounce buffer for store-to-segment copies (bytes).
pub const COPY_CHUNK: usize = 512;
