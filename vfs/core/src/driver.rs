//! POSIX-like path operations over one mounted backend.

use std::time::SystemTime;

use tracing::{debug, warn};

use crate::path::{self, ROOT};
use crate::path_walker::{PathWalker, Resolved};
use crate::{
    DirEntry, DriverConfig, FileMode, FileStat, FileType, FsBackend, MountFlags, ObjectHandle,
    ObjectStream, OpenFlags, VfsError, VfsErrorKind, VfsResult,
};

/// A mounted filesystem: the backend plus the per-mount working directory
/// and mount flags. Independent drivers share no state.
pub struct Driver<B: FsBackend> {
    backend: B,
    config: DriverConfig,
    cwd: String,
    flags: MountFlags,
}

impl<B: FsBackend> Driver<B> {
    pub fn mount(backend: B, flags: MountFlags) -> VfsResult<Self> {
        Self::mount_with_config(backend, flags, DriverConfig::default())
    }

    pub fn mount_with_config(
        mut backend: B,
        flags: MountFlags,
        config: DriverConfig,
    ) -> VfsResult<Self> {
        let flags = flags - MountFlags::REMOUNT;
        check_mount_flags(&backend, flags)?;
        backend.mount(flags)?;
        debug!(provider = backend.provider_name(), ?flags, "mounted");
        Ok(Self {
            backend,
            config,
            cwd: ROOT.to_string(),
            flags,
        })
    }

    /// Change the flags of this mount. `flags` must include `REMOUNT`.
    pub fn remount(&mut self, flags: MountFlags) -> VfsResult<()> {
        if !flags.contains(MountFlags::REMOUNT) {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "driver.remount")
                .with_message("REMOUNT flag missing"));
        }
        let flags = flags - MountFlags::REMOUNT;
        check_mount_flags(&self.backend, flags)?;
        self.backend.mount(flags)?;
        debug!(?flags, "remounted");
        self.flags = flags;
        Ok(())
    }

    /// Detach from the backend and hand it back.
    pub fn unmount(mut self) -> VfsResult<B> {
        self.backend.unmount()?;
        debug!(provider = self.backend.provider_name(), "unmounted");
        Ok(self.backend)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn mount_flags(&self) -> MountFlags {
        self.flags
    }

    pub fn getwd(&self) -> &str {
        &self.cwd
    }

    pub fn normalize(&self, path: &str) -> String {
        path::normalize(&self.cwd, path)
    }

    /// Resolve `path`, following a final symlink.
    pub fn lookup(&self, path: &str) -> VfsResult<Resolved<B::Handle>> {
        self.walker().resolve_following(path)
    }

    /// Resolve `path` without following a final symlink.
    pub fn lookup_no_follow(&self, path: &str) -> VfsResult<Resolved<B::Handle>> {
        self.walker().resolve_no_follow(path)
    }

    pub fn chdir(&mut self, path: &str) -> VfsResult<()> {
        let target = self.walker().resolve_following(path)?;
        if !target.stat.is_dir() {
            return Err(VfsError::new(VfsErrorKind::NotDir, "driver.chdir")
                .with_message(target.path));
        }
        debug!(cwd = %target.path, "changed working directory");
        self.cwd = target.path;
        Ok(())
    }

    /// Open a regular file.
    ///
    /// A missing file is created in its (existing) parent only when
    /// `CREATE` is set; `CREATE | EXCL` fails if the file exists. `TRUNC`
    /// empties the file before the stream is built.
    pub fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        perm: u32,
    ) -> VfsResult<ObjectStream<B::Handle>> {
        if flags.requires_write() {
            self.require_writable("driver.open_file")?;
        }
        let mut flags = flags;
        if self.flags.contains(MountFlags::SYNC) {
            flags |= OpenFlags::SYNC;
        }

        let mut walker = self.walker();
        let object = match walker.resolve_following(path) {
            Ok(object) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                    return Err(VfsError::new(VfsErrorKind::AlreadyExists, "driver.open_file")
                        .with_message(object.path));
                }
                object
            }
            Err(err) if err.is_not_found() && flags.contains(OpenFlags::CREATE) => {
                let (parent, name) = walker.resolve_parent(path)?;
                // A dangling symlink occupies the name.
                if parent.handle.list_dir()?.contains(&name) {
                    if flags.contains(OpenFlags::EXCL) {
                        return Err(VfsError::new(VfsErrorKind::AlreadyExists, "driver.open_file")
                            .with_message(path::join(&parent.path, &name)));
                    }
                    return Err(err);
                }
                let mode = FileMode::new(FileType::RegularFile, perm);
                let handle = self.backend.create_object(&name, &parent.handle, mode)?;
                let path = path::join(&parent.path, &name);
                debug!(%path, ?mode, "created file");
                let stat = handle.stat()?;
                Resolved { handle, path, stat }
            }
            Err(err) => return Err(err),
        };

        match object.stat.file_type() {
            FileType::RegularFile => {}
            FileType::Directory => {
                return Err(VfsError::new(VfsErrorKind::IsDir, "driver.open_file")
                    .with_message(object.path));
            }
            other => {
                return Err(VfsError::new(VfsErrorKind::InvalidInput, "driver.open_file")
                    .with_message(format!("{} is a {other}", object.path)));
            }
        }

        if flags.contains(OpenFlags::TRUNC) && object.stat.size > 0 {
            object.handle.resize(0)?;
        }
        ObjectStream::from_object(object.handle, self.backend.block_size(), flags)
    }

    /// Read-only open.
    pub fn open(&self, path: &str) -> VfsResult<ObjectStream<B::Handle>> {
        self.open_file(path, OpenFlags::READ, 0)
    }

    /// Open for reading and writing, creating or truncating.
    pub fn create(&self, path: &str) -> VfsResult<ObjectStream<B::Handle>> {
        self.open_file(
            path,
            OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::TRUNC,
            0o666,
        )
    }

    pub fn read_file(&self, path: &str) -> VfsResult<Vec<u8>> {
        let mut stream = self.open(path)?;
        let mut contents = vec![0u8; stream.size() as usize];
        let read = stream.read_at(&mut contents, 0)?;
        contents.truncate(read);
        Ok(contents)
    }

    pub fn write_file(&self, path: &str, contents: &[u8], perm: u32) -> VfsResult<()> {
        let mut stream = self.open_file(
            path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC,
            perm,
        )?;
        stream.write(contents)?;
        stream.close()
    }

    /// Metadata of `path`, following a final symlink.
    pub fn stat(&self, path: &str) -> VfsResult<FileStat> {
        Ok(self.walker().resolve_following(path)?.stat)
    }

    /// Metadata of `path` itself, even when it is a symlink.
    pub fn lstat(&self, path: &str) -> VfsResult<FileStat> {
        Ok(self.walker().resolve_no_follow(path)?.stat)
    }

    pub fn readlink(&self, path: &str) -> VfsResult<String> {
        let mut walker = self.walker();
        let object = walker.resolve_no_follow(path)?;
        walker.read_link(&object)
    }

    /// Whether both paths name the same object, compared by identity.
    pub fn same_file(&self, a: &str, b: &str) -> VfsResult<bool> {
        Ok(self.stat(a)?.same_file(&self.stat(b)?))
    }

    /// Children of a directory, without `.` and `..`.
    pub fn read_dir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let dir = self.walker().resolve_following(path)?;
        if !dir.stat.is_dir() {
            return Err(VfsError::new(VfsErrorKind::NotDir, "driver.read_dir")
                .with_message(dir.path));
        }

        let mut entries = Vec::new();
        for name in dir.handle.list_dir()? {
            if path::is_dot_entry(&name) {
                continue;
            }
            let child = self.backend.get_object(&name, &dir.handle)?;
            let stat = child.stat()?;
            entries.push(DirEntry { name, stat });
        }
        Ok(entries)
    }

    pub fn mkdir(&self, path: &str, perm: u32) -> VfsResult<()> {
        self.require_writable("driver.mkdir")?;
        let (parent, name) = self.walker().resolve_parent(path)?;
        if parent.handle.list_dir()?.contains(&name) {
            return Err(VfsError::new(VfsErrorKind::AlreadyExists, "driver.mkdir")
                .with_message(path::join(&parent.path, &name)));
        }
        let mode = FileMode::new(FileType::Directory, perm);
        self.backend.create_object(&name, &parent.handle, mode)?;
        debug!(path = %path::join(&parent.path, &name), ?mode, "created directory");
        Ok(())
    }

    /// Create `path` and any missing ancestors. Succeeds if `path` already
    /// is a directory.
    pub fn mkdir_all(&self, path: &str, perm: u32) -> VfsResult<()> {
        let abs = self.normalize(path);

        // Missing directories, deepest first. Walking up stops at the first
        // existing ancestor; the root always exists.
        let mut missing = Vec::new();
        let mut cursor = abs.as_str();
        loop {
            match self.stat(cursor) {
                Ok(stat) if stat.is_dir() => break,
                Ok(_) => {
                    return Err(VfsError::new(VfsErrorKind::NotDir, "driver.mkdir_all")
                        .with_message(cursor.to_string()));
                }
                Err(err) if err.is_not_found() => missing.push(cursor),
                Err(err) => return Err(err),
            }
            match path::split_parent(cursor) {
                Some((parent, _)) => cursor = parent,
                None => break,
            }
        }

        for dir in missing.into_iter().rev() {
            self.mkdir(dir, perm)?;
        }
        Ok(())
    }

    /// Remove a file, symlink, or a directory that holds only dot entries.
    pub fn remove(&self, path: &str) -> VfsResult<()> {
        self.require_writable("driver.remove")?;
        let object = self.walker().resolve_no_follow(path)?;
        if object.path == ROOT {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "driver.remove.root"));
        }
        if object.stat.is_dir()
            && object
                .handle
                .list_dir()?
                .iter()
                .any(|name| !path::is_dot_entry(name))
        {
            return Err(VfsError::new(VfsErrorKind::DirNotEmpty, "driver.remove")
                .with_message(object.path));
        }
        object.handle.unlink()?;
        debug!(path = %object.path, "removed");
        Ok(())
    }

    /// Remove `path` and everything below it, depth first. Stops at the
    /// first error.
    pub fn remove_all(&self, path: &str) -> VfsResult<()> {
        let object = self.walker().resolve_no_follow(path)?;
        if object.stat.is_dir() {
            for name in object.handle.list_dir()? {
                if path::is_dot_entry(&name) {
                    continue;
                }
                self.remove_all(&path::join(&object.path, &name))?;
            }
        }
        self.remove(&object.path)
    }

    /// Create a symlink at `link` whose content is `target`.
    pub fn symlink(&self, target: &str, link: &str) -> VfsResult<()> {
        self.require_writable("driver.symlink")?;
        if target.is_empty() {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "driver.symlink")
                .with_message("empty target"));
        }
        let (parent, name) = self.walker().resolve_parent(link)?;
        if parent.handle.list_dir()?.contains(&name) {
            return Err(VfsError::new(VfsErrorKind::AlreadyExists, "driver.symlink")
                .with_message(path::join(&parent.path, &name)));
        }

        let mode = FileMode::new(FileType::Symlink, 0o777);
        let handle = self.backend.create_object(&name, &parent.handle, mode)?;
        if let Err(err) = self.write_link_target(&handle, target) {
            handle.unlink()?;
            return Err(err);
        }
        debug!(link = %path::join(&parent.path, &name), target, "created symlink");
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: u64) -> VfsResult<()> {
        let mut stream = self.open_file(path, OpenFlags::WRITE, 0)?;
        stream.truncate(size)?;
        stream.close()
    }

    pub fn chmod(&self, path: &str, perm: u32) -> VfsResult<()> {
        self.require_writable("driver.chmod")?;
        let object = self.walker().resolve_following(path)?;
        object.handle.chmod(object.stat.mode.with_perm(perm))
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> VfsResult<()> {
        self.require_writable("driver.chown")?;
        let object = self.walker().resolve_following(path)?;
        object.handle.chown(uid, gid)
    }

    pub fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        self.require_writable("driver.chtimes")?;
        let object = self.walker().resolve_following(path)?;
        object.handle.chtimes(atime, mtime)
    }

    fn write_link_target(&self, handle: &B::Handle, target: &str) -> VfsResult<()> {
        let mut stream = ObjectStream::from_object(
            handle.clone(),
            self.backend.block_size(),
            OpenFlags::WRITE,
        )?;
        stream.write(target.as_bytes())?;
        stream.close()
    }

    fn walker(&self) -> PathWalker<'_, B> {
        PathWalker::new(&self.backend, &self.cwd, &self.config)
    }

    fn require_writable(&self, context: &'static str) -> VfsResult<()> {
        if self.flags.is_read_only() {
            warn!(context, "write rejected on read-only mount");
            return Err(VfsError::new(VfsErrorKind::ReadOnlyFs, context));
        }
        Ok(())
    }
}

fn check_mount_flags<B: FsBackend>(backend: &B, flags: MountFlags) -> VfsResult<()> {
    let unsupported = flags - backend.supported_mount_flags();
    if unsupported.contains(MountFlags::WRITE) {
        return Err(VfsError::new(VfsErrorKind::ReadOnlyFs, "driver.mount")
            .with_message(format!("{} is read-only", backend.provider_name())));
    }
    if !unsupported.is_empty() {
        return Err(VfsError::new(VfsErrorKind::NotSupported, "driver.mount")
            .with_message(format!("{unsupported:?}")));
    }
    Ok(())
}
