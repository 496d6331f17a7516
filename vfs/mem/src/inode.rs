use std::time::SystemTime;

use imagefs_core::{FileMode, FileStat};

pub(crate) const ROOT_INODE: u64 = 0;

#[derive(Debug)]
pub(crate) struct Inode {
    pub id: u64,
    pub name: String,
    pub parent: u64,
    pub mode: FileMode,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Physical device block of each file block, in order.
    pub blocks: Vec<u64>,
    /// Children in creation order.
    pub children: Vec<(String, u64)>,
}

impl Inode {
    pub fn new(id: u64, name: String, parent: u64, mode: FileMode) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            name,
            parent,
            mode,
            uid: 0,
            gid: 0,
            nlink: if mode.is_dir() { 2 } else { 1 },
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            blocks: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn stat(&self) -> FileStat {
        FileStat {
            id: self.id,
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }

    pub fn child(&self, name: &str) -> Option<u64> {
        self.children
            .iter()
            .find(|(child, _)| child == name)
            .map(|&(_, id)| id)
    }

    pub fn touch(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }
}
