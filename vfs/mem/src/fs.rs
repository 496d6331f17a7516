use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::SystemTime;

use imagefs_core::{
    BitmapAllocator, BitmapPolarity, BlockCache, DeviceStorage, FileMode, FileStat, FileType,
    FsBackend, ImageDevice, MountFlags, VfsError, VfsErrorKind, VfsResult,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::inode::{Inode, ROOT_INODE};
use crate::node::MemNode;
use crate::MemFsConfig;

type DeviceCache = BlockCache<DeviceStorage<Box<dyn ImageDevice>>>;

/// A filesystem whose metadata lives in memory and whose file data lives
/// in the blocks of an image device.
///
/// Clones share the same filesystem.
#[derive(Clone)]
pub struct MemFs {
    inner: Arc<Mutex<MemFsInner>>,
}

pub(crate) struct MemFsInner {
    config: MemFsConfig,
    device: DeviceCache,
    blocks: BitmapAllocator,
    inodes: BitmapAllocator,
    nodes: HashMap<u64, Inode>,
}

impl MemFs {
    /// Filesystem over a zeroed in-memory image.
    pub fn new(config: MemFsConfig) -> VfsResult<Self> {
        let len = config
            .total_blocks
            .checked_mul(config.block_size as u64)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| {
                VfsError::new(VfsErrorKind::InvalidInput, "memfs.new")
                    .with_message("image size overflows")
            })?;
        Self::with_device(config, Cursor::new(vec![0u8; len]))
    }

    /// Filesystem over `device`, which is treated as blank.
    pub fn with_device<D: ImageDevice + 'static>(config: MemFsConfig, device: D) -> VfsResult<Self> {
        if config.max_inodes == 0 {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "memfs.new")
                .with_message("no inode for the root"));
        }
        let total_units = usize::try_from(config.total_blocks).map_err(|_| {
            VfsError::new(VfsErrorKind::InvalidInput, "memfs.new")
                .with_message("too many blocks")
        })?;

        let device: Box<dyn ImageDevice> = Box::new(device);
        let storage =
            DeviceStorage::new(device, config.block_size).with_max_blocks(config.total_blocks);
        let device = BlockCache::new(config.block_size, config.total_blocks, storage)?;

        let mut inodes = BitmapAllocator::new(config.max_inodes);
        let root = inodes.allocate_single()? as u64;
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Inode::new(
                root,
                "/".to_string(),
                root,
                FileMode::new(FileType::Directory, 0o755),
            ),
        );

        debug!(
            block_size = config.block_size,
            total_blocks = config.total_blocks,
            "created memfs"
        );
        Ok(Self {
            inner: Arc::new(Mutex::new(MemFsInner {
                blocks: BitmapAllocator::new(total_units),
                config,
                device,
                inodes,
                nodes,
            })),
        })
    }

    pub fn config(&self) -> MemFsConfig {
        self.inner.lock().config.clone()
    }

    /// Write every dirty device block back to the image.
    pub fn sync(&self) -> VfsResult<()> {
        self.inner.lock().device.flush_all()
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.lock().blocks.free_count()
    }

    pub fn free_inodes(&self) -> usize {
        self.inner.lock().inodes.free_count()
    }

    /// In-use bitmap of the data blocks, LSB first.
    pub fn block_bitmap(&self) -> Vec<u8> {
        self.inner.lock().blocks.to_bitmap(BitmapPolarity::InUse)
    }

    fn node(&self, id: u64) -> MemNode {
        MemNode::new(self.inner.clone(), id)
    }
}

impl fmt::Debug for MemFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemFs")
            .field("config", &inner.config)
            .field("nodes", &inner.nodes.len())
            .field("free_blocks", &inner.blocks.free_count())
            .finish()
    }
}

impl FsBackend for MemFs {
    type Handle = MemNode;

    fn provider_name(&self) -> &'static str {
        "memfs"
    }

    fn block_size(&self) -> usize {
        self.inner.lock().config.block_size
    }

    fn root(&self) -> VfsResult<MemNode> {
        Ok(self.node(ROOT_INODE))
    }

    fn get_object(&self, name: &str, parent: &MemNode) -> VfsResult<MemNode> {
        let id = self.inner.lock().lookup(parent.id(), name)?;
        Ok(self.node(id))
    }

    fn create_object(&self, name: &str, parent: &MemNode, mode: FileMode) -> VfsResult<MemNode> {
        let id = self.inner.lock().create(parent.id(), name, mode)?;
        Ok(self.node(id))
    }

    fn supported_mount_flags(&self) -> MountFlags {
        if self.inner.lock().config.read_only {
            MountFlags::all() - MountFlags::WRITE
        } else {
            MountFlags::all()
        }
    }

    fn mount(&mut self, flags: MountFlags) -> VfsResult<()> {
        debug!(?flags, "memfs mount");
        Ok(())
    }

    fn unmount(&mut self) -> VfsResult<()> {
        self.sync()
    }
}

impl MemFsInner {
    fn block_size(&self) -> usize {
        self.config.block_size
    }

    fn node(&self, id: u64, context: &'static str) -> VfsResult<&Inode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| VfsError::new(VfsErrorKind::BadHandle, context))
    }

    fn node_mut(&mut self, id: u64, context: &'static str) -> VfsResult<&mut Inode> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| VfsError::new(VfsErrorKind::BadHandle, context))
    }

    fn dir(&self, id: u64, context: &'static str) -> VfsResult<&Inode> {
        let node = self.node(id, context)?;
        if !node.mode.is_dir() {
            return Err(VfsError::new(VfsErrorKind::NotDir, context).with_message(node.name.clone()));
        }
        Ok(node)
    }

    pub(crate) fn stat(&self, id: u64) -> VfsResult<FileStat> {
        Ok(self.node(id, "memfs.stat")?.stat())
    }

    pub(crate) fn name(&self, id: u64) -> String {
        self.nodes.get(&id).map(|node| node.name.clone()).unwrap_or_default()
    }

    pub(crate) fn lookup(&self, parent: u64, name: &str) -> VfsResult<u64> {
        let dir = self.dir(parent, "memfs.lookup")?;
        match name {
            "." => Ok(dir.id),
            ".." => Ok(dir.parent),
            _ => dir.child(name).ok_or_else(|| {
                VfsError::new(VfsErrorKind::NotFound, "memfs.lookup").with_message(name.to_string())
            }),
        }
    }

    pub(crate) fn create(&mut self, parent: u64, name: &str, mode: FileMode) -> VfsResult<u64> {
        let dir = self.dir(parent, "memfs.create")?;
        if dir.child(name).is_some() {
            return Err(VfsError::new(VfsErrorKind::AlreadyExists, "memfs.create")
                .with_message(name.to_string()));
        }

        let id = self.inodes.allocate_single()? as u64;
        self.nodes
            .insert(id, Inode::new(id, name.to_string(), parent, mode));
        let dir = self.node_mut(parent, "memfs.create")?;
        dir.children.push((name.to_string(), id));
        if mode.is_dir() {
            dir.nlink += 1;
        }
        dir.touch();
        trace!(id, parent, name, ?mode, "allocated inode");
        Ok(id)
    }

    pub(crate) fn list_dir(&self, id: u64) -> VfsResult<Vec<String>> {
        let dir = self.dir(id, "memfs.list_dir")?;
        let mut children: Vec<String> = dir.children.iter().map(|(name, _)| name.clone()).collect();
        if self.config.deterministic_readdir {
            children.sort();
        }
        let mut names = vec![".".to_string(), "..".to_string()];
        names.extend(children);
        Ok(names)
    }

    pub(crate) fn resize(&mut self, id: u64, new_size: u64) -> VfsResult<()> {
        let block_size = self.block_size() as u64;
        let node = self.node(id, "memfs.resize")?;
        if node.mode.is_dir() {
            return Err(VfsError::new(VfsErrorKind::IsDir, "memfs.resize")
                .with_message(node.name.clone()));
        }
        let have = node.blocks.len() as u64;
        let want = new_size.div_ceil(block_size);

        if want > have {
            let fresh = self.allocate_blocks(want - have)?;
            let zeros = vec![0u8; block_size as usize];
            for &block in &fresh {
                if let Err(err) = self.device.write(block * block_size, &zeros) {
                    self.release_blocks(&fresh)?;
                    return Err(err);
                }
            }
            self.node_mut(id, "memfs.resize")?.blocks.extend(fresh);
        } else if want < have {
            let dropped = self
                .node_mut(id, "memfs.resize")?
                .blocks
                .split_off(want as usize);
            self.release_blocks(&dropped)?;
        }

        let node = self.node_mut(id, "memfs.resize")?;
        node.size = new_size;
        node.touch();
        trace!(id, new_size, blocks = want, "resized object");
        Ok(())
    }

    pub(crate) fn read_blocks(&mut self, id: u64, first: u64, buf: &mut [u8]) -> VfsResult<()> {
        let block_size = self.block_size();
        let physical = self.physical_blocks(id, first, buf.len(), "memfs.read_blocks")?;
        for (chunk, block) in buf.chunks_mut(block_size).zip(physical) {
            self.device.read(block * block_size as u64, chunk)?;
        }
        Ok(())
    }

    pub(crate) fn write_blocks(&mut self, id: u64, first: u64, data: &[u8]) -> VfsResult<()> {
        let block_size = self.block_size();
        let physical = self.physical_blocks(id, first, data.len(), "memfs.write_blocks")?;
        for (chunk, block) in data.chunks(block_size).zip(physical) {
            self.device.write(block * block_size as u64, chunk)?;
        }
        self.node_mut(id, "memfs.write_blocks")?.touch();
        Ok(())
    }

    pub(crate) fn zero_out_blocks(&mut self, id: u64, start: u64, count: u64) -> VfsResult<()> {
        let block_size = self.block_size();
        let len = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(block_size))
            .ok_or_else(|| VfsError::new(VfsErrorKind::InvalidInput, "memfs.zero_out_blocks"))?;
        let physical = self.physical_blocks(id, start, len, "memfs.zero_out_blocks")?;
        let zeros = vec![0u8; block_size];
        for block in physical {
            self.device.write(block * block_size as u64, &zeros)?;
        }
        Ok(())
    }

    pub(crate) fn unlink(&mut self, id: u64) -> VfsResult<()> {
        if id == ROOT_INODE {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "memfs.unlink.root"));
        }
        let node = self.node(id, "memfs.unlink")?;
        if node.mode.is_dir() && !node.children.is_empty() {
            return Err(VfsError::new(VfsErrorKind::DirNotEmpty, "memfs.unlink")
                .with_message(node.name.clone()));
        }

        let Some(node) = self.nodes.remove(&id) else {
            return Err(VfsError::new(VfsErrorKind::BadHandle, "memfs.unlink"));
        };
        if let Some(parent) = self.nodes.get_mut(&node.parent) {
            parent.children.retain(|&(_, child)| child != id);
            if node.mode.is_dir() {
                parent.nlink -= 1;
            }
            parent.touch();
        }
        self.release_blocks(&node.blocks)?;
        self.inodes.free_single(id as usize)?;
        trace!(id, name = %node.name, "released inode");
        Ok(())
    }

    pub(crate) fn update(
        &mut self,
        id: u64,
        context: &'static str,
        apply: impl FnOnce(&mut Inode),
    ) -> VfsResult<()> {
        let node = self.node_mut(id, context)?;
        apply(node);
        node.ctime = SystemTime::now();
        Ok(())
    }

    /// Device blocks behind file blocks `first..` covering `len` bytes.
    fn physical_blocks(
        &self,
        id: u64,
        first: u64,
        len: usize,
        context: &'static str,
    ) -> VfsResult<Vec<u64>> {
        let block_size = self.block_size();
        if len == 0 || len % block_size != 0 {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, context)
                .with_message(format!("{len} bytes is not a whole number of blocks")));
        }
        let count = len / block_size;
        let node = self.node(id, context)?;
        usize::try_from(first)
            .ok()
            .and_then(|start| Some(start..start.checked_add(count)?))
            .and_then(|range| node.blocks.get(range))
            .map(<[u64]>::to_vec)
            .ok_or_else(|| {
                VfsError::new(VfsErrorKind::InvalidInput, context).with_message(format!(
                    "blocks {first}+{count} past end of {} blocks",
                    node.blocks.len()
                ))
            })
    }

    /// First-fit blocks one at a time; all or nothing.
    fn allocate_blocks(&mut self, count: u64) -> VfsResult<Vec<u64>> {
        let mut fresh = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.blocks.allocate_single() {
                Ok(block) => fresh.push(block as u64),
                Err(err) => {
                    self.release_blocks(&fresh)?;
                    return Err(err.with_message(format!("{count} blocks requested")));
                }
            }
        }
        Ok(fresh)
    }

    fn release_blocks(&mut self, blocks: &[u64]) -> VfsResult<()> {
        for &block in blocks {
            self.blocks.free_single(block as usize)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagefs_core::ObjectHandle;
    use pretty_assertions::assert_eq;

    fn small_fs(total_blocks: u64) -> MemFs {
        MemFs::new(MemFsConfig {
            block_size: 16,
            total_blocks,
            ..MemFsConfig::default()
        })
        .unwrap()
    }

    fn file_mode() -> FileMode {
        FileMode::new(FileType::RegularFile, 0o644)
    }

    #[tracing_test::traced_test]
    #[test]
    fn listing_includes_dot_entries() {
        let fs = small_fs(8);
        let root = fs.root().unwrap();
        fs.create_object("b", &root, file_mode()).unwrap();
        fs.create_object("a", &root, FileMode::new(FileType::Directory, 0o755))
            .unwrap();

        assert_eq!(root.list_dir().unwrap(), vec![".", "..", "a", "b"]);
        assert_eq!(root.stat().unwrap().nlink, 3);
        let dotdot = fs.get_object("..", &root).unwrap();
        assert_eq!(dotdot.stat().unwrap().id, 0);
        assert!(logs_contain("allocated inode"));
    }

    #[test]
    fn creation_order_when_not_sorted() {
        let fs = MemFs::new(MemFsConfig {
            deterministic_readdir: false,
            ..MemFsConfig::default()
        })
        .unwrap();
        let root = fs.root().unwrap();
        for name in ["zeta", "alpha", "mid"] {
            fs.create_object(name, &root, file_mode()).unwrap();
        }
        assert_eq!(root.list_dir().unwrap(), vec![".", "..", "zeta", "alpha", "mid"]);
    }

    #[tracing_test::traced_test]
    #[test]
    fn resize_allocates_and_releases_blocks() {
        let fs = small_fs(8);
        let root = fs.root().unwrap();
        let file = fs.create_object("f", &root, file_mode()).unwrap();

        file.resize(40).unwrap();
        assert_eq!(file.stat().unwrap().size, 40);
        assert_eq!(fs.free_blocks(), 5);
        assert_eq!(fs.block_bitmap(), vec![0b0000_0111]);

        file.resize(16).unwrap();
        assert_eq!(fs.free_blocks(), 7);
        file.resize(0).unwrap();
        assert_eq!(fs.free_blocks(), 8);
        assert!(logs_contain("resized object"));
    }

    #[test]
    fn failed_growth_rolls_back() {
        let fs = small_fs(4);
        let root = fs.root().unwrap();
        let a = fs.create_object("a", &root, file_mode()).unwrap();
        let b = fs.create_object("b", &root, file_mode()).unwrap();
        a.resize(32).unwrap();

        let err = b.resize(48).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::NoSpace);
        assert_eq!(fs.free_blocks(), 2);
        assert_eq!(b.stat().unwrap().size, 0);
    }

    #[test]
    fn block_io_is_range_checked() {
        let fs = small_fs(8);
        let root = fs.root().unwrap();
        let file = fs.create_object("f", &root, file_mode()).unwrap();
        file.resize(32).unwrap();

        file.write_blocks(1, &[5u8; 16]).unwrap();
        let mut buf = [0u8; 32];
        file.read_blocks(0, &mut buf).unwrap();
        assert_eq!(&buf[..16], &[0u8; 16]);
        assert_eq!(&buf[16..], &[5u8; 16]);

        let mut past = [0u8; 16];
        assert_eq!(
            file.read_blocks(2, &mut past).unwrap_err().kind(),
            VfsErrorKind::InvalidInput
        );
        let mut ragged = [0u8; 10];
        assert_eq!(
            file.read_blocks(0, &mut ragged).unwrap_err().kind(),
            VfsErrorKind::InvalidInput
        );

        file.zero_out_blocks(1, 1).unwrap();
        file.read_blocks(1, &mut past).unwrap();
        assert_eq!(past, [0u8; 16]);
    }

    #[tracing_test::traced_test]
    #[test]
    fn unlink_refuses_populated_directories() {
        let fs = small_fs(8);
        let root = fs.root().unwrap();
        let dir = fs
            .create_object("d", &root, FileMode::new(FileType::Directory, 0o755))
            .unwrap();
        let file = fs.create_object("f", &dir, file_mode()).unwrap();
        file.resize(20).unwrap();

        assert_eq!(dir.unlink().unwrap_err().kind(), VfsErrorKind::DirNotEmpty);
        file.unlink().unwrap();
        dir.unlink().unwrap();

        assert_eq!(root.list_dir().unwrap(), vec![".", ".."]);
        assert_eq!(fs.free_blocks(), 8);
        assert_eq!(file.stat().unwrap_err().kind(), VfsErrorKind::BadHandle);
        assert_eq!(root.unlink().unwrap_err().kind(), VfsErrorKind::InvalidInput);
        assert!(logs_contain("released inode"));
    }

    #[test]
    fn inode_slots_are_reused() {
        let fs = MemFs::new(MemFsConfig {
            max_inodes: 2,
            ..MemFsConfig::default()
        })
        .unwrap();
        let root = fs.root().unwrap();
        let first = fs.create_object("a", &root, file_mode()).unwrap();
        assert_eq!(
            fs.create_object("b", &root, file_mode()).unwrap_err().kind(),
            VfsErrorKind::NoSpace
        );
        first.unlink().unwrap();
        let second = fs.create_object("b", &root, file_mode()).unwrap();
        assert_eq!(second.stat().unwrap().id, 1);
        assert_eq!(fs.free_inodes(), 0);
    }

    #[test]
    fn read_only_config_drops_write() {
        let fs = MemFs::new(MemFsConfig {
            read_only: true,
            ..MemFsConfig::default()
        })
        .unwrap();
        assert!(!fs.supported_mount_flags().contains(MountFlags::WRITE));
        assert!(fs.supported_mount_flags().contains(MountFlags::READ));
    }
}
