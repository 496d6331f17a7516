/// Per-mount limits applied by the path walker.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Symlink hops allowed in one top-level resolution, nested lookups of
    /// intermediate components included.
    pub max_symlinks: u16,
    /// Longest absolute path, and longest symlink target, in bytes.
    pub max_path_len: usize,
    /// Longest single path component in bytes.
    pub max_name_len: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_symlinks: 40,
            max_path_len: 4096,
            max_name_len: 255,
        }
    }
}
