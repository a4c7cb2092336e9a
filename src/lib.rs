#![cfg_attr(not(test), no_std)]

//! exec16 - process image loader for a segmented 16-bit kernel
//!
//! Replaces a running process's code and data with a new executable image
//! read from the backing store. Two on-disk formats are supported: the
//! split-ID a.out family (with an optional supplement header carrying
//! relocation tables and a far-text region) and the segmented-executable
//! format with its own segment table and chained fixups.
//!
//! The loader touches the calling process only in the final commit step;
//! every fallible operation (header validation, layout arithmetic,
//! allocation, reads, relocation) happens before that, and any failure
//! releases exactly what this attempt acquired.

pub mod console;
pub mod config;
pub mod error;
pub mod finalize;
pub mod header;
pub mod layout;
pub mod loader;
pub mod ne;
pub mod process;
pub mod reloc;
pub mod segment;
pub mod store;

#[cfg(test)]
pub(crate) mod testkit;

pub use error::{ExecError, ExecResult};
pub use finalize::LoadPlan;
pub use loader::execve;
pub use process::{ImageCredentials, ProcessImage};
pub use segment::{SegKind, SegmentAllocator, SegmentHandle, SegmentMemory};
pub use store::{BackingStore, StoreId};
