//! Format-agnostic filesystem engine for disk images.
//!
//! A backend describes one on-disk format through [`FsBackend`] and
//! [`ObjectHandle`]. On top of that the crate provides block caching,
//! byte streams, bitmap allocation and path resolution, and [`Driver`]
//! exposes the result as POSIX-like path operations.

pub mod allocator;
pub mod cache;
pub mod context;
pub mod driver;
pub mod error;
pub mod flags;
pub mod fs;
pub mod node;
pub mod path;
pub mod path_walker;
pub mod stat;
pub mod storage;
pub mod stream;

pub use allocator::{BitmapAllocator, BitmapPolarity};
pub use cache::BlockCache;
pub use context::DriverConfig;
pub use driver::Driver;
pub use error::{VfsError, VfsErrorKind, VfsResult};
pub use flags::{MountFlags, OpenFlags};
pub use fs::FsBackend;
pub use node::{ObjectHandle, ObjectStorage};
pub use path_walker::{PathWalker, Resolved};
pub use stat::{
    DirEntry, FileMode, FileStat, FileType, S_IFCHR, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, S_IPERM,
    S_ISGID, S_ISUID,
};
pub use storage::{BlockStorage, DeviceStorage, ImageDevice};
pub use stream::{ByteStream, CacheRef, ObjectStream};
