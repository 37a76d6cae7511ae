//! Static table of known filesystem types and their mount options.

use super::description::OpenFileDescription;
use super::error::{VfsError, VfsResult};
use super::imagefs::ImageFileSystem;
use super::inode::{FileSystem, FileSystemId};
use super::ramfs::RamFileSystem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Value of a single filesystem-specific mount option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MountOptionValue {
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    String(String),
}

pub type MountOptions = BTreeMap<String, MountOptionValue>;

pub type CreateFn = fn(FileSystemId, &MountOptions) -> VfsResult<Arc<dyn FileSystem>>;
pub type CreateWithDescriptionFn =
    fn(FileSystemId, Arc<OpenFileDescription>, &MountOptions) -> VfsResult<Arc<dyn FileSystem>>;

/// One entry of the filesystem type table.
pub struct FileSystemType {
    pub short_name: &'static str,
    pub long_name: &'static str,
    pub requires_open_file_description: bool,
    pub requires_block_device: bool,
    pub requires_seekable_file: bool,
    pub create: Option<CreateFn>,
    pub create_with_description: Option<CreateWithDescriptionFn>,
    pub validate_flag: fn(&str, bool) -> VfsResult<()>,
    pub validate_unsigned: fn(&str, u64) -> VfsResult<()>,
    pub validate_signed: fn(&str, i64) -> VfsResult<()>,
    pub validate_string: fn(&str, &str) -> VfsResult<()>,
}

impl std::fmt::Debug for FileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemType")
            .field("short_name", &self.short_name)
            .field("long_name", &self.long_name)
            .finish_non_exhaustive()
    }
}

fn reject_flag(_key: &str, _value: bool) -> VfsResult<()> {
    Err(VfsError::InvalidArgument)
}

fn reject_unsigned(_key: &str, _value: u64) -> VfsResult<()> {
    Err(VfsError::InvalidArgument)
}

fn reject_signed(_key: &str, _value: i64) -> VfsResult<()> {
    Err(VfsError::InvalidArgument)
}

fn reject_string(_key: &str, _value: &str) -> VfsResult<()> {
    Err(VfsError::InvalidArgument)
}

fn ramfs_unsigned(key: &str, value: u64) -> VfsResult<()> {
    match key {
        "mode" if value <= 0o7777 => Ok(()),
        "uid" | "gid" if value <= u64::from(u32::MAX) => Ok(()),
        _ => Err(VfsError::InvalidArgument),
    }
}

fn imagefs_flag(key: &str, _value: bool) -> VfsResult<()> {
    match key {
        "format" => Ok(()),
        _ => Err(VfsError::InvalidArgument),
    }
}

fn imagefs_string(key: &str, _value: &str) -> VfsResult<()> {
    match key {
        "label" => Ok(()),
        _ => Err(VfsError::InvalidArgument),
    }
}

pub static FILESYSTEM_TYPES: &[FileSystemType] = &[
    FileSystemType {
        short_name: "ramfs",
        long_name: "RAMFS",
        requires_open_file_description: false,
        requires_block_device: false,
        requires_seekable_file: false,
        create: Some(RamFileSystem::create),
        create_with_description: None,
        validate_flag: reject_flag,
        validate_unsigned: ramfs_unsigned,
        validate_signed: reject_signed,
        validate_string: reject_string,
    },
    FileSystemType {
        short_name: "imagefs",
        long_name: "ImageFS",
        requires_open_file_description: true,
        requires_block_device: false,
        requires_seekable_file: true,
        create: None,
        create_with_description: Some(ImageFileSystem::create),
        validate_flag: imagefs_flag,
        validate_unsigned: reject_unsigned,
        validate_signed: reject_signed,
        validate_string: imagefs_string,
    },
];

/// Looks up a filesystem type by its short name.
pub fn find_type(name: &str) -> VfsResult<&'static FileSystemType> {
    FILESYSTEM_TYPES
        .iter()
        .find(|fs_type| fs_type.short_name == name)
        .ok_or(VfsError::NoSuchDevice)
}

impl FileSystemType {
    /// Runs every option through the validator for its kind. Unknown keys are rejected.
    pub fn validate_options(&self, options: &MountOptions) -> VfsResult<()> {
        for (key, value) in options {
            match value {
                MountOptionValue::Bool(flag) => (self.validate_flag)(key, *flag)?,
                MountOptionValue::Unsigned(n) => (self.validate_unsigned)(key, *n)?,
                MountOptionValue::Signed(n) => (self.validate_signed)(key, *n)?,
                MountOptionValue::String(s) => (self.validate_string)(key, s)?,
            }
        }
        Ok(())
    }

    /// Constructs an uninitialised instance after checking source requirements.
    ///
    /// # Arguments
    ///
    /// * `fsid` - Identifier for the new instance
    /// * `description` - Backing file, required by file-backed types
    /// * `options` - Already validated mount options
    pub fn construct(
        &self,
        fsid: FileSystemId,
        description: Option<Arc<OpenFileDescription>>,
        options: &MountOptions,
    ) -> VfsResult<Arc<dyn FileSystem>> {
        if !self.requires_open_file_description {
            let create = self.create.ok_or(VfsError::NotSupported)?;
            return create(fsid, options);
        }

        let description = description.ok_or(VfsError::NoSuchDevice)?;
        if self.requires_block_device && !description.is_block_device() {
            return Err(VfsError::NotBlockDevice);
        }
        if self.requires_seekable_file && !description.is_seekable() {
            return Err(VfsError::NotSupported);
        }
        let create = self.create_with_description.ok_or(VfsError::NotSupported)?;
        create(fsid, description, options)
    }
}

pub fn unsigned_option(options: &MountOptions, key: &str) -> VfsResult<Option<u64>> {
    match options.get(key) {
        None => Ok(None),
        Some(MountOptionValue::Unsigned(n)) => Ok(Some(*n)),
        Some(MountOptionValue::Signed(n)) if *n >= 0 => Ok(Some(*n as u64)),
        Some(_) => Err(VfsError::InvalidArgument),
    }
}

pub fn flag_option(options: &MountOptions, key: &str) -> VfsResult<Option<bool>> {
    match options.get(key) {
        None => Ok(None),
        Some(MountOptionValue::Bool(flag)) => Ok(Some(*flag)),
        Some(_) => Err(VfsError::InvalidArgument),
    }
}

pub fn string_option(options: &MountOptions, key: &str) -> VfsResult<Option<String>> {
    match options.get(key) {
        None => Ok(None),
        Some(MountOptionValue::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(VfsError::InvalidArgument),
    }
}
