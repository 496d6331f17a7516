use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use imagefs_core::{FileMode, FileStat, ObjectHandle, VfsResult};
use parking_lot::Mutex;

use crate::fs::MemFsInner;

/// Handle to one inode of a [`MemFs`](crate::MemFs).
///
/// Handles outlive unlinking; every operation on a removed inode fails
/// with `BadHandle`.
#[derive(Clone)]
pub struct MemNode {
    fs: Arc<Mutex<MemFsInner>>,
    id: u64,
}

impl MemNode {
    pub(crate) fn new(fs: Arc<Mutex<MemFsInner>>, id: u64) -> Self {
        Self { fs, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for MemNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemNode").field("id", &self.id).finish()
    }
}

impl ObjectHandle for MemNode {
    fn stat(&self) -> VfsResult<FileStat> {
        self.fs.lock().stat(self.id)
    }

    fn resize(&self, new_size: u64) -> VfsResult<()> {
        self.fs.lock().resize(self.id, new_size)
    }

    fn read_blocks(&self, first: u64, buf: &mut [u8]) -> VfsResult<()> {
        self.fs.lock().read_blocks(self.id, first, buf)
    }

    fn write_blocks(&self, first: u64, data: &[u8]) -> VfsResult<()> {
        self.fs.lock().write_blocks(self.id, first, data)
    }

    fn zero_out_blocks(&self, start: u64, count: u64) -> VfsResult<()> {
        self.fs.lock().zero_out_blocks(self.id, start, count)
    }

    fn unlink(&self) -> VfsResult<()> {
        self.fs.lock().unlink(self.id)
    }

    fn list_dir(&self) -> VfsResult<Vec<String>> {
        self.fs.lock().list_dir(self.id)
    }

    fn name(&self) -> String {
        self.fs.lock().name(self.id)
    }

    fn chmod(&self, mode: FileMode) -> VfsResult<()> {
        self.fs.lock().update(self.id, "memfs.chmod", |node| {
            node.mode = FileMode::new(node.mode.file_type(), mode.perm());
        })
    }

    fn chown(&self, uid: u32, gid: u32) -> VfsResult<()> {
        self.fs.lock().update(self.id, "memfs.chown", |node| {
            node.uid = uid;
            node.gid = gid;
        })
    }

    fn chtimes(&self, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        self.fs.lock().update(self.id, "memfs.chtimes", |node| {
            node.atime = atime;
            node.mtime = mtime;
        })
    }
}
