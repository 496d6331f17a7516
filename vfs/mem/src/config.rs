#[derive(Clone, Debug)]
pub struct MemFsConfig {
    /// Bytes per block, shared by the device and every object.
    pub block_size: usize,
    /// Device capacity in blocks.
    pub total_blocks: u64,
    /// Inode slots, the root included.
    pub max_inodes: usize,
    /// If true, writable mounts are refused.
    pub read_only: bool,
    /// If true, `list_dir` is sorted by name; otherwise it follows creation
    /// order.
    pub deterministic_readdir: bool,
}

impl Default for MemFsConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            total_blocks: 2048,
            max_inodes: 1024,
            read_only: false,
            deterministic_readdir: true,
        }
    }
}
