//! Symbolic error domain shared by every layer of the VFS.

use thiserror::Error;

/// Result type used throughout the VFS layer.
pub type VfsResult<T> = Result<T, VfsError>;

/// POSIX-style symbolic error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum VfsError {
    /// No such file or directory
    #[error("no such file or directory")]
    NotFound,
    /// Permission denied by DAC bits or the veil
    #[error("permission denied")]
    AccessDenied,
    /// Operation restricted to the owner or the superuser
    #[error("operation not permitted")]
    NotPermitted,
    /// File exists
    #[error("file exists")]
    Exists,
    /// Not a directory
    #[error("not a directory")]
    NotADirectory,
    /// Is a directory
    #[error("is a directory")]
    IsADirectory,
    /// Read-only filesystem
    #[error("read-only filesystem")]
    ReadOnlyFilesystem,
    /// Cross-device link
    #[error("cross-device link")]
    CrossDevice,
    /// Directory not empty
    #[error("directory not empty")]
    NotEmpty,
    /// Too many levels of symbolic links
    #[error("too many levels of symbolic links")]
    TooManyLevelsOfSymlinks,
    /// Operation not supported
    #[error("operation not supported")]
    NotSupported,
    /// No such device
    #[error("no such device")]
    NoSuchDevice,
    /// Block device required
    #[error("block device required")]
    NotBlockDevice,
    /// Device or resource busy
    #[error("device or resource busy")]
    Busy,
    /// Invalid argument
    #[error("invalid argument")]
    InvalidArgument,
    /// Attempt to move a directory into its own subtree
    #[error("cannot move a directory into itself")]
    DirectoryIntoSelf,
    /// File name too long
    #[error("file name too long")]
    NameTooLong,
    /// File would exceed the size a driver can hold
    #[error("file too large")]
    FileTooLarge,
    /// Input/output error reported by a driver
    #[error("input/output error")]
    Io,
}

impl VfsError {
    /// Returns the errno value matching this error.
    pub fn errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AccessDenied => libc::EACCES,
            Self::NotPermitted => libc::EPERM,
            Self::Exists => libc::EEXIST,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::ReadOnlyFilesystem => libc::EROFS,
            Self::CrossDevice => libc::EXDEV,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::TooManyLevelsOfSymlinks => libc::ELOOP,
            Self::NotSupported => libc::ENOTSUP,
            Self::NoSuchDevice => libc::ENODEV,
            Self::NotBlockDevice => libc::ENOTBLK,
            Self::Busy => libc::EBUSY,
            Self::InvalidArgument | Self::DirectoryIntoSelf => libc::EINVAL,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::FileTooLarge => libc::EFBIG,
            Self::Io => libc::EIO,
        }
    }
}

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::AccessDenied,
            std::io::ErrorKind::InvalidInput => Self::InvalidArgument,
            _ => Self::Io,
        }
    }
}
