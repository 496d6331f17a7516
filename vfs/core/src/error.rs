//! Error taxonomy shared by the core and every backend.
//!
//! Backends translate their format-specific faults onto [`VfsErrorKind`];
//! the core never invents kinds of its own beyond this list.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

pub type VfsResult<T> = Result<T, VfsError>;

/// POSIX-equivalent error kinds.
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VfsErrorKind {
    /// The requested file or directory could not be found
    #[error("entity not found")]
    NotFound,
    /// A path component used as a directory is not one
    #[error("not a directory")]
    NotDir,
    /// Expected a non-directory but found a directory
    #[error("is a directory")]
    IsDir,
    /// Symlink resolution revisited a path or ran out of hops
    #[error("too many levels of symbolic links")]
    TooManySymlinks,
    /// No free units are left in the allocator or on the device
    #[error("no space left on device")]
    NoSpace,
    /// File exists
    #[error("file exists")]
    AlreadyExists,
    /// Mutation attempted on a read-only mount
    #[error("read-only filesystem")]
    ReadOnlyFs,
    /// Directory still holds entries other than `.` and `..`
    #[error("directory not empty")]
    DirNotEmpty,
    /// Caller was not allowed to perform this operation
    #[error("permission denied")]
    PermissionDenied,
    /// Something failed when doing IO on the backing storage
    #[error("io error")]
    Io,
    /// The provided arguments are invalid
    #[error("invalid input")]
    InvalidInput,
    /// On-disk structures are inconsistent
    #[error("filesystem corrupted")]
    Corrupted,
    /// The unit being released is already free
    #[error("operation already done")]
    AlreadyFree,
    /// The stream was not opened with the access the operation needs
    #[error("bad file handle")]
    BadHandle,
    /// A path or a path component exceeds the configured limit
    #[error("name too long")]
    NameTooLong,
    /// The backend cannot perform this operation
    #[error("operation not supported")]
    NotSupported,
}

impl VfsErrorKind {
    /// POSIX errno for this kind.
    ///
    /// This is the only place the kind → errno mapping lives.
    pub fn errno(self) -> i32 {
        match self {
            VfsErrorKind::NotFound => libc::ENOENT,
            VfsErrorKind::NotDir => libc::ENOTDIR,
            VfsErrorKind::IsDir => libc::EISDIR,
            VfsErrorKind::TooManySymlinks => libc::ELOOP,
            VfsErrorKind::NoSpace => libc::ENOSPC,
            VfsErrorKind::AlreadyExists => libc::EEXIST,
            VfsErrorKind::ReadOnlyFs => libc::EROFS,
            VfsErrorKind::DirNotEmpty => libc::ENOTEMPTY,
            VfsErrorKind::PermissionDenied => libc::EACCES,
            VfsErrorKind::Io => libc::EIO,
            VfsErrorKind::InvalidInput => libc::EINVAL,
            // Linux reports corrupted filesystems as EUCLEAN; EIO is the
            // portable fallback.
            VfsErrorKind::Corrupted => libc::EIO,
            VfsErrorKind::AlreadyFree => libc::EALREADY,
            VfsErrorKind::BadHandle => libc::EBADF,
            VfsErrorKind::NameTooLong => libc::ENAMETOOLONG,
            VfsErrorKind::NotSupported => libc::ENOTSUP,
        }
    }

    /// Stable string name (logging only).
    pub fn as_str(self) -> &'static str {
        match self {
            VfsErrorKind::NotFound => "not_found",
            VfsErrorKind::NotDir => "not_dir",
            VfsErrorKind::IsDir => "is_dir",
            VfsErrorKind::TooManySymlinks => "too_many_symlinks",
            VfsErrorKind::NoSpace => "no_space",
            VfsErrorKind::AlreadyExists => "already_exists",
            VfsErrorKind::ReadOnlyFs => "read_only_fs",
            VfsErrorKind::DirNotEmpty => "dir_not_empty",
            VfsErrorKind::PermissionDenied => "permission_denied",
            VfsErrorKind::Io => "io",
            VfsErrorKind::InvalidInput => "invalid_input",
            VfsErrorKind::Corrupted => "corrupted",
            VfsErrorKind::AlreadyFree => "already_free",
            VfsErrorKind::BadHandle => "bad_handle",
            VfsErrorKind::NameTooLong => "name_too_long",
            VfsErrorKind::NotSupported => "not_supported",
        }
    }
}

/// An error raised by the core or a backend.
///
/// `context` names the operation that failed (`"cache.write"`,
/// `"path.resolve.not_dir"`, ...); `message` carries dynamic detail such as
/// the offending range.
#[derive(Error, Debug)]
#[error("{context}: {kind}{}", display_message(.message))]
pub struct VfsError {
    kind: VfsErrorKind,
    context: &'static str,
    message: Option<String>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

fn display_message(message: &Option<String>) -> String {
    match message {
        Some(message) => format!(" ({message})"),
        None => String::new(),
    }
}

impl VfsError {
    pub fn new(kind: VfsErrorKind, context: &'static str) -> Self {
        Self {
            kind,
            context,
            message: None,
            source: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> VfsErrorKind {
        self.kind
    }

    pub fn context(&self) -> &'static str {
        self.context
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn errno(&self) -> i32 {
        self.kind.errno()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == VfsErrorKind::NotFound
    }
}

impl From<io::Error> for VfsError {
    fn from(io_error: io::Error) -> Self {
        let kind = match io_error.kind() {
            io::ErrorKind::NotFound => VfsErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => VfsErrorKind::AlreadyExists,
            io::ErrorKind::PermissionDenied => VfsErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput => VfsErrorKind::InvalidInput,
            io::ErrorKind::InvalidData => VfsErrorKind::Corrupted,
            io::ErrorKind::Unsupported => VfsErrorKind::NotSupported,
            io::ErrorKind::StorageFull => VfsErrorKind::NoSpace,
            io::ErrorKind::ReadOnlyFilesystem => VfsErrorKind::ReadOnlyFs,
            io::ErrorKind::NotADirectory => VfsErrorKind::NotDir,
            io::ErrorKind::IsADirectory => VfsErrorKind::IsDir,
            io::ErrorKind::DirectoryNotEmpty => VfsErrorKind::DirNotEmpty,
            _ => VfsErrorKind::Io,
        };
        VfsError::new(kind, "io").with_source(io_error)
    }
}

impl From<VfsError> for io::Error {
    fn from(err: VfsError) -> Self {
        let kind = match err.kind() {
            VfsErrorKind::NotFound => io::ErrorKind::NotFound,
            VfsErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            VfsErrorKind::PermissionDenied | VfsErrorKind::BadHandle => {
                io::ErrorKind::PermissionDenied
            }
            VfsErrorKind::InvalidInput => io::ErrorKind::InvalidInput,
            VfsErrorKind::Corrupted => io::ErrorKind::InvalidData,
            VfsErrorKind::NotSupported => io::ErrorKind::Unsupported,
            VfsErrorKind::NoSpace => io::ErrorKind::StorageFull,
            VfsErrorKind::ReadOnlyFs => io::ErrorKind::ReadOnlyFilesystem,
            VfsErrorKind::NotDir => io::ErrorKind::NotADirectory,
            VfsErrorKind::IsDir => io::ErrorKind::IsADirectory,
            VfsErrorKind::DirNotEmpty => io::ErrorKind::DirectoryNotEmpty,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_message() {
        let err = VfsError::new(VfsErrorKind::InvalidInput, "cache.bounds")
            .with_message("blocks 8..12 exceed 10");
        assert_eq!(
            err.to_string(),
            "cache.bounds: invalid input (blocks 8..12 exceed 10)"
        );

        let err = VfsError::new(VfsErrorKind::NotFound, "path.lookup");
        assert_eq!(err.to_string(), "path.lookup: entity not found");
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(VfsErrorKind::NotFound.errno(), libc::ENOENT);
        assert_eq!(VfsErrorKind::TooManySymlinks.errno(), libc::ELOOP);
        assert_eq!(VfsErrorKind::AlreadyFree.errno(), libc::EALREADY);
        assert_eq!(VfsErrorKind::DirNotEmpty.errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn io_round_trip_keeps_kind() {
        let io_err: io::Error = VfsError::new(VfsErrorKind::NotFound, "test").into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);

        let back = VfsError::from(io::Error::new(io::ErrorKind::InvalidData, "bad table"));
        assert_eq!(back.kind(), VfsErrorKind::Corrupted);
        assert!(back.source().is_some());
    }
}
