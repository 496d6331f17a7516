use crate::{FileMode, MountFlags, ObjectHandle, VfsResult};

/// A mounted on-disk format: the root provider plus by-name lookup and
/// creation inside a directory.
pub trait FsBackend {
    type Handle: ObjectHandle + Clone;

    fn provider_name(&self) -> &'static str;

    /// Block size used by every object of this filesystem.
    fn block_size(&self) -> usize;

    fn root(&self) -> VfsResult<Self::Handle>;

    /// Only called for names present in `parent`'s listing.
    fn get_object(&self, name: &str, parent: &Self::Handle) -> VfsResult<Self::Handle>;

    /// Only called for names absent from `parent`, a directory. `mode`
    /// carries both the type nibble and the permission bits.
    fn create_object(
        &self,
        name: &str,
        parent: &Self::Handle,
        mode: FileMode,
    ) -> VfsResult<Self::Handle>;

    fn supported_mount_flags(&self) -> MountFlags {
        MountFlags::all()
    }

    fn mount(&mut self, _flags: MountFlags) -> VfsResult<()> {
        Ok(())
    }

    fn unmount(&mut self) -> VfsResult<()> {
        Ok(())
    }
}
