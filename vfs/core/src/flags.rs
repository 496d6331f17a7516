//! Open and mount flag sets.

use bitflags::bitflags;

bitflags! {
    /// Flags accepted by `Driver::open_file` and carried by a `ByteStream`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        /// Together with `CREATE`: the file must not exist yet.
        const EXCL = 1 << 3;
        /// Every `write` lands at the current end of the stream.
        const APPEND = 1 << 4;
        /// Truncate to zero length on open.
        const TRUNC = 1 << 5;
        /// Flush the affected blocks after every write or truncate.
        const SYNC = 1 << 6;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl OpenFlags {
    /// Whether opening with these flags can modify the filesystem.
    pub fn requires_write(self) -> bool {
        self.intersects(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND | OpenFlags::TRUNC)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Open every file with `OpenFlags::SYNC`.
        const SYNC = 1 << 3;
        /// Changing the flags of an existing mount.
        const REMOUNT = 1 << 4;

        const READ_ONLY = Self::READ.bits();
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl MountFlags {
    pub fn is_read_only(self) -> bool {
        !self.contains(MountFlags::WRITE)
    }
}
