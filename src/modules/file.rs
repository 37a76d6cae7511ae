use parking_lot::Mutex;
use std::sync::Arc;

use super::custody::Custody;
use super::error::{VfsError, VfsResult};
use super::inode::InodeMetadata;
use super::resolver::OpenOptions;

/// Which end of a FIFO an open file represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoEnd {
    Reader,
    Writer,
    Both,
}

/// What an open file refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFileKind {
    Regular,
    Directory,
    /// Only produced when the final link was not followed.
    Symlink,
    Device { major: u32, minor: u32 },
    Fifo(FifoEnd),
}

impl OpenFileKind {
    fn classify(metadata: &InodeMetadata, options: OpenOptions) -> Self {
        let mode = metadata.mode;
        if mode.is_directory() {
            Self::Directory
        } else if mode.is_symlink() {
            Self::Symlink
        } else if mode.is_device() {
            Self::Device {
                major: metadata.major,
                minor: metadata.minor,
            }
        } else if mode.is_fifo() {
            let end = match (
                options.contains(OpenOptions::READ),
                options.contains(OpenOptions::WRITE),
            ) {
                (true, true) => FifoEnd::Both,
                (false, true) => FifoEnd::Writer,
                _ => FifoEnd::Reader,
            };
            Self::Fifo(end)
        } else {
            Self::Regular
        }
    }
}

/// A file opened through a process.
#[derive(Debug)]
pub struct OpenFile {
    custody: Arc<Custody>,
    options: OpenOptions,
    kind: OpenFileKind,
    offset: Mutex<u64>,
}

impl OpenFile {
    pub(crate) fn new(custody: Arc<Custody>, options: OpenOptions) -> Self {
        let kind = OpenFileKind::classify(&custody.inode().metadata(), options);
        Self {
            custody,
            options,
            kind,
            offset: Mutex::new(0),
        }
    }

    pub fn custody(&self) -> &Arc<Custody> {
        &self.custody
    }

    pub fn options(&self) -> OpenOptions {
        self.options
    }

    pub fn kind(&self) -> OpenFileKind {
        self.kind
    }

    pub fn metadata(&self) -> InodeMetadata {
        self.custody.inode().metadata()
    }

    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    pub fn seek(&self, offset: u64) {
        *self.offset.lock() = offset;
    }

    fn check_data_access(&self) -> VfsResult<()> {
        match self.kind {
            OpenFileKind::Regular | OpenFileKind::Symlink => Ok(()),
            OpenFileKind::Directory => Err(VfsError::IsADirectory),
            // Device and FIFO I/O belongs to their drivers.
            OpenFileKind::Device { .. } | OpenFileKind::Fifo(_) => Err(VfsError::NotSupported),
        }
    }

    /// Reads at the current offset and advances it.
    pub fn read(&self, buffer: &mut [u8]) -> VfsResult<usize> {
        if !self.options.contains(OpenOptions::READ) {
            return Err(VfsError::InvalidArgument);
        }
        self.check_data_access()?;
        let mut offset = self.offset.lock();
        let count = self.custody.inode().read_bytes(*offset, buffer)?;
        *offset += count as u64;
        Ok(count)
    }

    /// Reads from the current offset to the end of the file.
    pub fn read_to_end(&self) -> VfsResult<Vec<u8>> {
        let mut contents = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let count = self.read(&mut chunk)?;
            if count == 0 {
                return Ok(contents);
            }
            contents.extend_from_slice(&chunk[..count]);
        }
    }

    /// Writes at the current offset and advances it.
    pub fn write(&self, data: &[u8]) -> VfsResult<usize> {
        if !self.options.contains(OpenOptions::WRITE) {
            return Err(VfsError::InvalidArgument);
        }
        self.check_data_access()?;
        if self.custody.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }
        let mut offset = self.offset.lock();
        let count = self.custody.inode().write_bytes(*offset, data)?;
        *offset += count as u64;
        Ok(count)
    }
}
