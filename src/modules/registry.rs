//! Process-wide list of live filesystem instances.
//!
//! File-backed instances are additionally tracked in a second list keyed by
//! backing identity, so the same image is never parsed twice. The
//! find-or-create-and-register sequence for those runs entirely under the
//! blocking file-backed lock.

use super::description::{BackingIdentity, OpenFileDescription};
use super::error::{VfsError, VfsResult};
use super::fstype::{FileSystemType, MountOptions};
use super::inode::{FileSystem, FileSystemId, Inode};
use super::sync::{BlockingMutex, LockRank, SpinLock};
use log::{debug, warn};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// A constructed, initialised filesystem shared by all of its mounts.
pub struct FileSystemInstance {
    fsid: FileSystemId,
    type_name: &'static str,
    filesystem: Arc<dyn FileSystem>,
    description: Option<Arc<OpenFileDescription>>,
    mounted_count: AtomicUsize,
}

impl FileSystemInstance {
    pub fn fsid(&self) -> FileSystemId {
        self.fsid
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn filesystem(&self) -> &Arc<dyn FileSystem> {
        &self.filesystem
    }

    pub fn root_inode(&self) -> Arc<dyn Inode> {
        self.filesystem.root_inode()
    }

    pub fn description(&self) -> Option<&Arc<OpenFileDescription>> {
        self.description.as_ref()
    }

    pub fn backing_identity(&self) -> Option<BackingIdentity> {
        self.description.as_ref().map(|d| d.identity())
    }

    pub fn is_file_backed(&self) -> bool {
        self.description.is_some()
    }

    pub fn mounted_count(&self) -> usize {
        self.mounted_count.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for FileSystemInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemInstance")
            .field("fsid", &self.fsid)
            .field("type_name", &self.type_name)
            .field("mounted_count", &self.mounted_count())
            .finish()
    }
}

pub struct FileSystemRegistry {
    file_backed: BlockingMutex<Vec<Arc<FileSystemInstance>>>,
    instances: SpinLock<Vec<Arc<FileSystemInstance>>>,
    next_fsid: AtomicU32,
}

impl Default for FileSystemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystemRegistry {
    pub fn new() -> Self {
        Self {
            file_backed: BlockingMutex::new(LockRank::FileBackedFileSystemList, Vec::new()),
            instances: SpinLock::new(LockRank::FileSystemList, Vec::new()),
            next_fsid: AtomicU32::new(1),
        }
    }

    fn allocate_fsid(&self) -> FileSystemId {
        self.next_fsid.fetch_add(1, Ordering::Relaxed)
    }

    fn build(
        &self,
        fs_type: &'static FileSystemType,
        description: Option<Arc<OpenFileDescription>>,
        options: &MountOptions,
    ) -> VfsResult<Arc<FileSystemInstance>> {
        let fsid = self.allocate_fsid();
        let filesystem = fs_type.construct(fsid, description.clone(), options)?;
        filesystem.initialize()?;
        debug!(
            "Constructed {} filesystem {} ({})",
            fs_type.short_name,
            fsid,
            filesystem.class_name()
        );
        Ok(Arc::new(FileSystemInstance {
            fsid,
            type_name: fs_type.short_name,
            filesystem,
            description,
            mounted_count: AtomicUsize::new(1),
        }))
    }

    /// Returns an instance for a new mount, counting that mount.
    ///
    /// Sourceless types are constructed fresh every time. File-backed types
    /// reuse the instance already built from the same backing file.
    ///
    /// # Arguments
    ///
    /// * `fs_type` - Entry of the filesystem type table
    /// * `source` - Backing file for file-backed types
    /// * `options` - Filesystem-specific mount options
    pub fn create_or_reuse(
        &self,
        fs_type: &'static FileSystemType,
        source: Option<Arc<OpenFileDescription>>,
        options: &MountOptions,
    ) -> VfsResult<Arc<FileSystemInstance>> {
        fs_type.validate_options(options)?;

        if !fs_type.requires_open_file_description {
            let instance = self.build(fs_type, None, options)?;
            self.instances.lock().push(Arc::clone(&instance));
            return Ok(instance);
        }

        let description = source.ok_or(VfsError::NoSuchDevice)?;
        let identity = description.identity();

        let mut file_backed = self.file_backed.lock();
        if let Some(existing) = file_backed
            .iter()
            .find(|instance| instance.backing_identity() == Some(identity))
        {
            if existing.type_name != fs_type.short_name {
                return Err(VfsError::Busy);
            }
            existing.mounted_count.fetch_add(1, Ordering::AcqRel);
            debug!(
                "Reusing filesystem {} for {}",
                existing.fsid,
                description.path().display()
            );
            return Ok(Arc::clone(existing));
        }

        let instance = self.build(fs_type, Some(description), options)?;
        file_backed.push(Arc::clone(&instance));
        self.instances.lock().push(Arc::clone(&instance));
        Ok(instance)
    }

    /// Counts one more mount of an instance that is still registered.
    pub fn attach(&self, instance: &Arc<FileSystemInstance>) -> VfsResult<()> {
        let instances = self.instances.lock();
        if !instances.iter().any(|i| Arc::ptr_eq(i, instance)) {
            return Err(VfsError::NoSuchDevice);
        }
        instance.mounted_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drops one mount of `instance`. Returns `true` when that was the last
    /// mount and the instance left both lists.
    pub fn release(&self, instance: &Arc<FileSystemInstance>) -> bool {
        let mut file_backed = self.file_backed.lock();
        let mut instances = self.instances.lock();

        let previous = instance.mounted_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "released filesystem {} with no mounts", instance.fsid);
        if previous > 1 {
            return false;
        }

        instances.retain(|i| !Arc::ptr_eq(i, instance));
        file_backed.retain(|i| !Arc::ptr_eq(i, instance));
        debug!("Filesystem {} no longer mounted", instance.fsid);
        true
    }

    pub fn find_by_fsid(&self, fsid: FileSystemId) -> Option<Arc<FileSystemInstance>> {
        self.instances
            .lock()
            .iter()
            .find(|instance| instance.fsid == fsid)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<FileSystemInstance>> {
        self.instances.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    pub fn file_backed_len(&self) -> usize {
        self.file_backed.lock().len()
    }

    /// Flushes every live instance. The list lock is not held while flushing.
    pub fn flush_all(&self) {
        for instance in self.snapshot() {
            if let Err(e) = instance.filesystem.flush_writes() {
                warn!("Failed to flush filesystem {}: {}", instance.fsid, e);
            }
        }
    }
}
