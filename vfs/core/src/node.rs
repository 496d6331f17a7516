//! The object contract every format backend implements.

use std::fmt;
use std::time::SystemTime;

use crate::{BlockStorage, FileMode, FileStat, VfsError, VfsErrorKind, VfsResult};

/// Backend-owned identity of one file, directory or symlink.
///
/// Handles are fetched per lookup and never cached by the core. Methods take
/// `&self`; backends keep their mutable state behind shared ownership.
pub trait ObjectHandle: fmt::Debug {
    fn stat(&self) -> VfsResult<FileStat>;

    /// Set the size in bytes, allocating or releasing space as needed.
    fn resize(&self, new_size: u64) -> VfsResult<()>;

    /// Fill `buf` from consecutive blocks starting at `first`. `buf.len()` is
    /// a positive multiple of the block size and the range has been checked
    /// against the object's current size.
    fn read_blocks(&self, first: u64, buf: &mut [u8]) -> VfsResult<()>;

    /// Counterpart of [`read_blocks`](Self::read_blocks).
    fn write_blocks(&self, first: u64, data: &[u8]) -> VfsResult<()>;

    /// The blocks must read back as zeros afterwards.
    fn zero_out_blocks(&self, start: u64, count: u64) -> VfsResult<()>;

    /// Remove the object from its parent. Directories are only unlinked once
    /// they hold nothing but dot entries.
    fn unlink(&self) -> VfsResult<()>;

    /// Names of the children of a directory. Whether `.` and `..` are
    /// included is up to the backend.
    fn list_dir(&self) -> VfsResult<Vec<String>>;

    /// Name within the parent; the root reports `/`.
    fn name(&self) -> String;

    fn chmod(&self, _mode: FileMode) -> VfsResult<()> {
        Ok(())
    }

    fn chown(&self, _uid: u32, _gid: u32) -> VfsResult<()> {
        Ok(())
    }

    fn chtimes(&self, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Ok(())
    }
}

/// Exposes an object's blocks as cache storage.
#[derive(Debug)]
pub struct ObjectStorage<H> {
    handle: H,
    block_size: usize,
}

impl<H: ObjectHandle> ObjectStorage<H> {
    pub fn new(handle: H, block_size: usize) -> Self {
        Self { handle, block_size }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn into_handle(self) -> H {
        self.handle
    }
}

impl<H: ObjectHandle> BlockStorage for ObjectStorage<H> {
    fn fetch_block(&mut self, index: u64, buf: &mut [u8]) -> VfsResult<()> {
        self.handle.read_blocks(index, buf)
    }

    fn flush_block(&mut self, index: u64, data: &[u8]) -> VfsResult<()> {
        self.handle.write_blocks(index, data)
    }

    fn resize(&mut self, new_total_blocks: u64) -> VfsResult<()> {
        let bytes = new_total_blocks
            .checked_mul(self.block_size as u64)
            .ok_or_else(|| VfsError::new(VfsErrorKind::InvalidInput, "object.resize"))?;
        self.handle.resize(bytes)
    }

    fn set_len(&mut self, len: u64) -> VfsResult<()> {
        self.handle.resize(len)
    }
}
