// Backing-store collaborator: positioned sequential reads from the image.
// Any short read is fatal to the current load attempt.

use crate::config::COPY_CHUNK;
use crate::error::{ExecError, ExecResult};
use crate::segment::{SegmentHandle, SegmentMemory};

/// Identity of an image on the backing store (device/inode pair folded
/// into one value by the filesystem layer). Used by the text-reuse cache
/// and recorded on the process at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreId(pub u32);

pub trait BackingStore {
    fn identity(&self) -> StoreId;

    /// Current read position, in bytes from the start of the image.
    fn pos(&self) -> u32;

    fn seek(&mut self, pos: u32);

    /// Read up to `buf.len()` bytes at the current position, advancing it.
    /// Returns the number of bytes read; 0 means end of image.
    fn read(&mut self, buf: &mut [u8]) -> ExecResult<usize>;
}

/// Fill `buf` completely or fail the load.
pub fn read_exact<S: BackingStore + ?Sized>(store: &mut S, buf: &mut [u8]) -> ExecResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = store.read(&mut buf[done..])?;
        if n == 0 {
            return Err(ExecError::ShortRead);
        }
        done += n;
    }
    Ok(())
}

/// Stream `len` bytes from the store into segment memory at
/// `(seg, offset)`. `offset + len` must stay within the 64 KiB segment.
pub fn read_into_segment<S, M>(
    store: &mut S,
    mem: &M,
    seg: &SegmentHandle,
    offset: u16,
    len: usize,
) -> ExecResult<()>
where
    S: BackingStore + ?Sized,
    M: SegmentMemory + ?Sized,
{
    let mut chunk = [0u8; COPY_CHUNK];
    let mut cursor = offset as u32;
    let mut remaining = len;
    while remaining > 0 {
        let take = remaining.min(COPY_CHUNK);
        read_exact(store, &mut chunk[..take])?;
        mem.write(seg, cursor as u16, &chunk[..take]);
        cursor += take as u32;
        remaining -= take;
    }
    Ok(())
}
