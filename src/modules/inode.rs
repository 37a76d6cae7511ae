//! Filesystem driver interface.
//!
//! Drivers own their inodes; the VFS only borrows them through
//! `Arc<dyn Inode>` handles and never reaches back from an inode to its
//! filesystem. Filesystem identity is carried by [`InodeIdentifier::fsid`].

use super::credentials::Credentials;
use super::error::VfsResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a live filesystem instance.
pub type FileSystemId = u32;

/// Identity of an inode: owning filesystem plus per-filesystem index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeIdentifier {
    pub fsid: FileSystemId,
    pub index: u64,
}

impl InodeIdentifier {
    pub const fn new(fsid: FileSystemId, index: u64) -> Self {
        Self { fsid, index }
    }
}

impl fmt::Display for InodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fsid, self.index)
    }
}

/// File type and permission bits in the POSIX layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileMode(pub u16);

impl FileMode {
    // File types
    pub const S_IFMT: u16 = 0o170000;
    pub const S_IFSOCK: u16 = 0o140000;
    pub const S_IFLNK: u16 = 0o120000;
    pub const S_IFREG: u16 = 0o100000;
    pub const S_IFBLK: u16 = 0o060000;
    pub const S_IFDIR: u16 = 0o040000;
    pub const S_IFCHR: u16 = 0o020000;
    pub const S_IFIFO: u16 = 0o010000;

    // Special bits
    pub const S_ISUID: u16 = 0o4000;
    pub const S_ISGID: u16 = 0o2000;
    pub const S_ISVTX: u16 = 0o1000;

    pub const PERMISSION_MASK: u16 = 0o7777;

    pub const fn new(mode: u16) -> Self {
        Self(mode)
    }

    pub const fn directory(permissions: u16) -> Self {
        Self(Self::S_IFDIR | (permissions & Self::PERMISSION_MASK))
    }

    pub const fn regular(permissions: u16) -> Self {
        Self(Self::S_IFREG | (permissions & Self::PERMISSION_MASK))
    }

    pub const fn symlink() -> Self {
        Self(Self::S_IFLNK | 0o777)
    }

    pub const fn file_type(&self) -> u16 {
        self.0 & Self::S_IFMT
    }

    pub const fn permissions(&self) -> u16 {
        self.0 & Self::PERMISSION_MASK
    }

    /// Same file type, different permission bits.
    pub const fn with_permissions(&self, permissions: u16) -> Self {
        Self(self.file_type() | (permissions & Self::PERMISSION_MASK))
    }

    pub const fn is_regular(&self) -> bool {
        self.file_type() == Self::S_IFREG
    }

    pub const fn is_directory(&self) -> bool {
        self.file_type() == Self::S_IFDIR
    }

    pub const fn is_symlink(&self) -> bool {
        self.file_type() == Self::S_IFLNK
    }

    pub const fn is_char_device(&self) -> bool {
        self.file_type() == Self::S_IFCHR
    }

    pub const fn is_block_device(&self) -> bool {
        self.file_type() == Self::S_IFBLK
    }

    pub const fn is_device(&self) -> bool {
        self.is_char_device() || self.is_block_device()
    }

    pub const fn is_fifo(&self) -> bool {
        self.file_type() == Self::S_IFIFO
    }

    pub const fn is_socket(&self) -> bool {
        self.file_type() == Self::S_IFSOCK
    }

    pub const fn is_sticky(&self) -> bool {
        self.0 & Self::S_ISVTX != 0
    }

    pub const fn is_setuid(&self) -> bool {
        self.0 & Self::S_ISUID != 0
    }

    pub const fn is_setgid(&self) -> bool {
        self.0 & Self::S_ISGID != 0
    }
}

/// Snapshot of an inode's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeMetadata {
    pub inode: InodeIdentifier,
    pub mode: FileMode,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub link_count: u32,
    pub major: u32,
    pub minor: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl InodeMetadata {
    pub fn is_directory(&self) -> bool {
        self.mode.is_directory()
    }

    pub fn is_regular(&self) -> bool {
        self.mode.is_regular()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.is_symlink()
    }

    pub fn is_sticky(&self) -> bool {
        self.mode.is_sticky()
    }

    pub fn is_setuid(&self) -> bool {
        self.mode.is_setuid()
    }

    pub fn is_setgid(&self) -> bool {
        self.mode.is_setgid()
    }

    // Owner, group or other triplet applying to `credentials`.
    fn permission_class(&self, credentials: &Credentials) -> u16 {
        let mode = self.mode.0;
        if self.uid == credentials.euid {
            (mode >> 6) & 0o7
        } else if credentials.in_group(self.gid) {
            (mode >> 3) & 0o7
        } else {
            mode & 0o7
        }
    }

    pub fn may_read(&self, credentials: &Credentials) -> bool {
        credentials.is_superuser() || self.permission_class(credentials) & 0o4 != 0
    }

    pub fn may_write(&self, credentials: &Credentials) -> bool {
        credentials.is_superuser() || self.permission_class(credentials) & 0o2 != 0
    }

    /// Execute for files, search for directories. The superuser may search any
    /// directory but only execute files carrying at least one execute bit.
    pub fn may_execute(&self, credentials: &Credentials) -> bool {
        if credentials.is_superuser() {
            return self.is_directory() || self.mode.0 & 0o111 != 0;
        }
        self.permission_class(credentials) & 0o1 != 0
    }
}

/// One entry produced by [`Inode::traverse_as_directory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub inode: InodeIdentifier,
    pub file_type: u16,
}

/// An inode provided by a filesystem driver.
pub trait Inode: Send + Sync {
    fn identifier(&self) -> InodeIdentifier;

    fn metadata(&self) -> InodeMetadata;

    /// Looks up `name` in this directory. `.` and `..` are handled by the driver.
    fn lookup(&self, name: &str) -> VfsResult<Arc<dyn Inode>>;

    /// Calls `callback` for every entry, including `.` and `..`, until it
    /// returns `false`.
    fn traverse_as_directory(
        &self,
        callback: &mut dyn FnMut(&DirectoryEntry) -> bool,
    ) -> VfsResult<()>;

    /// Creates a new inode and links it into this directory as `name`.
    fn create_child(
        &self,
        name: &str,
        mode: FileMode,
        device: (u32, u32),
        uid: u32,
        gid: u32,
    ) -> VfsResult<Arc<dyn Inode>>;

    /// Links an existing inode of the same filesystem into this directory.
    fn add_child(&self, child: &Arc<dyn Inode>, name: &str) -> VfsResult<()>;

    fn remove_child(&self, name: &str) -> VfsResult<()>;

    fn truncate(&self, size: u64) -> VfsResult<()>;

    fn chmod(&self, mode: FileMode) -> VfsResult<()>;

    fn chown(&self, uid: u32, gid: u32) -> VfsResult<()>;

    fn set_times(&self, atime: Option<i64>, mtime: Option<i64>) -> VfsResult<()>;

    /// Target text of a symbolic link.
    fn read_link(&self) -> VfsResult<String>;

    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> VfsResult<usize>;

    fn write_bytes(&self, offset: u64, data: &[u8]) -> VfsResult<usize>;
}

/// A constructed filesystem driver instance.
pub trait FileSystem: Send + Sync {
    fn fsid(&self) -> FileSystemId;

    fn class_name(&self) -> &'static str;

    fn root_inode(&self) -> Arc<dyn Inode>;

    /// Called once after construction, before the instance is published.
    fn initialize(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Called before a mount of `guest` is removed. May refuse with `Busy`.
    fn prepare_to_unmount(&self, _guest: &dyn Inode) -> VfsResult<()> {
        Ok(())
    }

    /// Writes cached state back to the backing store.
    fn flush_writes(&self) -> VfsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(mode: FileMode, uid: u32, gid: u32) -> InodeMetadata {
        InodeMetadata {
            inode: InodeIdentifier::new(1, 2),
            mode,
            uid,
            gid,
            size: 0,
            link_count: 1,
            major: 0,
            minor: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }

    #[test]
    fn test_file_mode_types() {
        let dir = FileMode::directory(0o1777);
        assert!(dir.is_directory());
        assert!(dir.is_sticky());
        assert_eq!(dir.permissions(), 0o1777);

        let file = FileMode::regular(0o4755);
        assert!(file.is_regular());
        assert!(file.is_setuid());
        assert_eq!(file.with_permissions(0o644).0, FileMode::S_IFREG | 0o644);
        assert!(FileMode::symlink().is_symlink());
    }

    #[test]
    fn test_permission_classes() {
        let meta = metadata(FileMode::regular(0o640), 1000, 100);

        let owner = Credentials::user(1000, 1);
        assert!(meta.may_read(&owner));
        assert!(meta.may_write(&owner));
        assert!(!meta.may_execute(&owner));

        let group = Credentials::user(2000, 100);
        assert!(group.in_group(100));
        assert!(meta.may_read(&group));
        assert!(!meta.may_write(&group));

        let other = Credentials::user(3000, 300);
        assert!(!meta.may_read(&other));
    }

    #[test]
    fn test_superuser_execute_rules() {
        let root = Credentials::root();
        assert!(!metadata(FileMode::regular(0o644), 1000, 100).may_execute(&root));
        assert!(metadata(FileMode::regular(0o744), 1000, 100).may_execute(&root));
        assert!(metadata(FileMode::directory(0o700), 1000, 100).may_execute(&root));
        assert!(metadata(FileMode::regular(0o000), 1000, 100).may_write(&root));
    }
}
