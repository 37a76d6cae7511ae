use super::error::{VfsError, VfsResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

/// Host-level identity of a backing file: `(st_dev, st_ino)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackingIdentity {
    pub device: u64,
    pub inode: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Regular,
    BlockDevice,
    CharacterDevice,
    Fifo,
    Other,
}

/// An opened host file used as the source of a file-backed filesystem.
#[derive(Debug)]
pub struct OpenFileDescription {
    path: PathBuf,
    file: Mutex<File>,
    identity: BackingIdentity,
    kind: BackingKind,
    writable: bool,
}

impl OpenFileDescription {
    /// Opens `path`, read-write when `writable` is set.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> VfsResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let meta = file.metadata()?;
        let file_type = meta.file_type();

        let kind = if file_type.is_file() {
            BackingKind::Regular
        } else if file_type.is_block_device() {
            BackingKind::BlockDevice
        } else if file_type.is_char_device() {
            BackingKind::CharacterDevice
        } else if file_type.is_fifo() {
            BackingKind::Fifo
        } else {
            BackingKind::Other
        };

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            identity: BackingIdentity {
                device: meta.dev(),
                inode: meta.ino(),
            },
            kind,
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> BackingIdentity {
        self.identity
    }

    pub fn kind(&self) -> BackingKind {
        self.kind
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_block_device(&self) -> bool {
        self.kind == BackingKind::BlockDevice
    }

    /// Regular files and block devices support random access.
    pub fn is_seekable(&self) -> bool {
        matches!(self.kind, BackingKind::Regular | BackingKind::BlockDevice)
    }

    /// Reads the whole backing content from offset zero.
    pub fn read_all(&self) -> VfsResult<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Replaces the backing content with `data`.
    pub fn replace_contents(&self, data: &[u8]) -> VfsResult<()> {
        if !self.writable {
            return Err(VfsError::ReadOnlyFilesystem);
        }
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }
}
