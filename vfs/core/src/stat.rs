//! File metadata snapshots and the fixed mode-bit encoding.

use std::fmt;
use std::time::SystemTime;

/// Mask selecting the type nibble of a mode.
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;
/// Mask of the bits `chmod` may change.
pub const S_IPERM: u32 = 0o7777;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    CharDevice,
    Unknown,
}

impl FileType {
    /// Type bits for this file type (`Unknown` has none).
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::RegularFile => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
            FileType::CharDevice => S_IFCHR,
            FileType::Unknown => 0,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileType::RegularFile => "regular file",
            FileType::Directory => "directory",
            FileType::Symlink => "symbolic link",
            FileType::CharDevice => "character device",
            FileType::Unknown => "unknown",
        })
    }
}

/// Mode bits: a type nibble plus setuid/setgid and the rwx triplets.
///
/// Every backend reports modes in this layout so that the type predicates
/// behave the same whatever the on-disk format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileMode(pub u32);

impl FileMode {
    pub fn new(file_type: FileType, perm: u32) -> Self {
        Self(file_type.mode_bits() | (perm & S_IPERM))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn file_type(self) -> FileType {
        match self.0 & S_IFMT {
            S_IFREG => FileType::RegularFile,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            S_IFCHR => FileType::CharDevice,
            _ => FileType::Unknown,
        }
    }

    pub fn is_dir(self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_symlink(self) -> bool {
        self.file_type() == FileType::Symlink
    }

    pub fn is_regular(self) -> bool {
        self.file_type() == FileType::RegularFile
    }

    pub fn perm(self) -> u32 {
        self.0 & S_IPERM
    }

    pub fn is_setuid(self) -> bool {
        self.0 & S_ISUID != 0
    }

    pub fn is_setgid(self) -> bool {
        self.0 & S_ISGID != 0
    }

    /// Replace the permission bits, keeping the type nibble.
    pub fn with_perm(self, perm: u32) -> Self {
        Self((self.0 & S_IFMT) | (perm & S_IPERM))
    }
}

impl fmt::Debug for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileMode({:#o})", self.0)
    }
}

/// Point-in-time metadata of one object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    /// Backend-unique identity, stable for the lifetime of the mount.
    pub id: u64,
    pub mode: FileMode,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileStat {
    pub fn file_type(&self) -> FileType {
        self.mode.file_type()
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.is_symlink()
    }

    pub fn is_regular(&self) -> bool {
        self.mode.is_regular()
    }

    /// Whether both snapshots describe the same object.
    ///
    /// Identity is the backend id; names and paths play no part.
    pub fn same_file(&self, other: &FileStat) -> bool {
        self.id == other.id
    }
}

/// A directory listing entry, detached from the object it describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

impl DirEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_type(&self) -> FileType {
        self.stat.file_type()
    }

    pub fn is_dir(&self) -> bool {
        self.stat.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_predicates_follow_the_type_nibble() {
        let dir = FileMode::new(FileType::Directory, 0o755);
        assert!(dir.is_dir());
        assert!(!dir.is_regular());
        assert_eq!(dir.bits(), 0o040_755);

        let link = FileMode(S_IFLNK | 0o777);
        assert!(link.is_symlink());
        assert_eq!(link.perm(), 0o777);

        let suid = FileMode(S_IFREG | S_ISUID | 0o755);
        assert!(suid.is_regular());
        assert!(suid.is_setuid());
        assert!(!suid.is_setgid());

        assert_eq!(FileMode(0o070_000).file_type(), FileType::Unknown);
    }

    #[test]
    fn with_perm_keeps_type() {
        let mode = FileMode::new(FileType::RegularFile, 0o644).with_perm(0o2600);
        assert!(mode.is_regular());
        assert!(mode.is_setgid());
        assert_eq!(mode.perm(), 0o2600);
    }
}
