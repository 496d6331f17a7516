//! Reference backend for `imagefs-core`: metadata kept in memory, file data
//! stored in the blocks of an image device.

mod config;
mod fs;
mod inode;
mod node;

pub use config::MemFsConfig;
pub use fs::MemFs;
pub use node::MemNode;
