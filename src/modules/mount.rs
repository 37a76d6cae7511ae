use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

use super::credentials::Credentials;
use super::custody::Custody;
use super::description::OpenFileDescription;
use super::error::{VfsError, VfsResult};
use super::fstype::{find_type, MountOptions};
use super::namespace::{Mount, MountFlags, MountId, NamespaceContext};
use super::registry::{FileSystemInstance, FileSystemRegistry};
use super::sync::{LockRank, SpinLock};

/// Everything needed to construct (or reuse) a filesystem for a new mount.
#[derive(Debug, Clone, Default)]
pub struct MountRequest {
    /// Short name from the filesystem type table
    pub fs_type: String,
    /// Backing file for file-backed types
    pub source: Option<Arc<OpenFileDescription>>,
    /// Filesystem-specific options
    pub options: MountOptions,
    pub flags: MountFlags,
}

impl MountRequest {
    pub fn new(fs_type: &str) -> Self {
        Self {
            fs_type: fs_type.to_string(),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: Arc<OpenFileDescription>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_options(mut self, options: MountOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_flags(mut self, flags: MountFlags) -> Self {
        self.flags = flags;
        self
    }
}

fn require_superuser(credentials: &Credentials) -> VfsResult<()> {
    if credentials.is_superuser() {
        Ok(())
    } else {
        Err(VfsError::NotPermitted)
    }
}

/// Owns the filesystem registry and every namespace context.
pub struct FilesystemManager {
    registry: FileSystemRegistry,
    contexts: SpinLock<Vec<Arc<NamespaceContext>>>,
}

impl Default for FilesystemManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemManager {
    pub fn new() -> Self {
        Self {
            registry: FileSystemRegistry::new(),
            contexts: SpinLock::new(LockRank::ContextList, Vec::new()),
        }
    }

    pub fn registry(&self) -> &FileSystemRegistry {
        &self.registry
    }

    fn instantiate(&self, request: &MountRequest) -> VfsResult<Arc<FileSystemInstance>> {
        let fs_type = find_type(&request.fs_type)?;
        if let Some(source) = &request.source {
            if !source.is_writable() && !request.flags.contains(MountFlags::READ_ONLY) {
                return Err(VfsError::ReadOnlyFilesystem);
            }
        }
        self.registry
            .create_or_reuse(fs_type, request.source.clone(), &request.options)
    }

    // Final step of every unmount path.
    fn retire(&self, mount: &Mount) {
        if let Err(e) = mount.instance.filesystem().prepare_to_unmount(&*mount.guest) {
            warn!("Filesystem {} failed to prepare for unmount: {}", mount.instance.fsid(), e);
        }
        self.registry.release(&mount.instance);
    }

    fn is_context_root(context: &NamespaceContext, target: &Custody) -> bool {
        target.is_root() && target.identifier() == context.root_custody().identifier()
    }

    /// Creates a namespace context rooted on a freshly mounted filesystem.
    ///
    /// # Arguments
    ///
    /// * `request` - Filesystem to use as the root
    ///
    /// # Returns
    ///
    /// The new context, already registered in the context list
    pub fn create_context(&self, request: &MountRequest) -> VfsResult<Arc<NamespaceContext>> {
        let instance = self.instantiate(request)?;
        let context = NamespaceContext::new(instance, request.flags);
        self.contexts.lock().push(Arc::clone(&context));
        info!(
            "Created namespace context {} on {}",
            context.id(),
            request.fs_type
        );
        Ok(context)
    }

    pub fn create_context_with_empty_ramfs(&self) -> VfsResult<Arc<NamespaceContext>> {
        self.create_context(&MountRequest::new("ramfs"))
    }

    pub fn contexts(&self) -> Vec<Arc<NamespaceContext>> {
        self.contexts.lock().clone()
    }

    pub fn find_context(&self, id: Uuid) -> Option<Arc<NamespaceContext>> {
        self.contexts
            .lock()
            .iter()
            .find(|context| context.id() == id)
            .cloned()
    }

    /// Removes a context that no process is attached to and releases its mounts.
    pub fn destroy_context(&self, context: &Arc<NamespaceContext>) -> VfsResult<()> {
        if context.attach_count() > 0 {
            return Err(VfsError::Busy);
        }
        {
            let mut contexts = self.contexts.lock();
            let position = contexts
                .iter()
                .position(|c| Arc::ptr_eq(c, context))
                .ok_or(VfsError::InvalidArgument)?;
            contexts.remove(position);
        }

        for mount in context.all_mounts().into_iter().rev() {
            if context.remove_mount(mount.id).is_some() {
                self.retire(&mount);
            }
        }
        info!("Destroyed namespace context {}", context.id());
        Ok(())
    }

    /// Mounts a filesystem at `target`. Mounting onto the context root
    /// replaces the root.
    pub fn mount(
        &self,
        context: &NamespaceContext,
        credentials: &Credentials,
        target: &Arc<Custody>,
        request: &MountRequest,
    ) -> VfsResult<MountId> {
        require_superuser(credentials)?;
        if !target.inode().metadata().is_directory() {
            return Err(VfsError::NotADirectory);
        }

        let instance = self.instantiate(request)?;
        let guest = instance.root_inode();

        if Self::is_context_root(context, target) {
            let (id, removed) = context.swap_root(guest, instance, request.flags, false);
            for mount in &removed {
                self.retire(mount);
            }
            info!(
                "Mounted {} as new root of {} ({} mounts pruned)",
                request.fs_type,
                context.id(),
                removed.len()
            );
            return Ok(id);
        }

        let id = context.add_mount(guest, instance, Arc::clone(target), request.flags, false);
        info!("Mounted {} at {}", request.fs_type, target.absolute_path());
        Ok(id)
    }

    /// Shows the filesystem rooted at the already resolved `source` at
    /// `target` without constructing anything.
    pub fn bind_mount(
        &self,
        context: &NamespaceContext,
        credentials: &Credentials,
        source: &Arc<Custody>,
        target: &Arc<Custody>,
        flags: MountFlags,
    ) -> VfsResult<MountId> {
        require_superuser(credentials)?;
        if Self::is_context_root(context, target) {
            return Err(VfsError::Busy);
        }

        let instance = self
            .registry
            .find_by_fsid(source.identifier().fsid)
            .ok_or(VfsError::NoSuchDevice)?;
        // Sub-tree binds are not supported.
        if source.identifier() != instance.root_inode().identifier() {
            return Err(VfsError::InvalidArgument);
        }
        if !target.inode().metadata().is_directory() {
            return Err(VfsError::NotADirectory);
        }
        self.registry.attach(&instance)?;

        let id = context.add_mount(
            Arc::clone(source.inode()),
            instance,
            Arc::clone(target),
            flags,
            true,
        );
        info!(
            "Bind-mounted {} at {}",
            source.absolute_path(),
            target.absolute_path()
        );
        Ok(id)
    }

    /// Mounts the whole filesystem whose root is `source` again at `target`.
    /// Copying onto the context root replaces the root.
    pub fn copy_mount(
        &self,
        context: &NamespaceContext,
        credentials: &Credentials,
        source: &Arc<Custody>,
        target: &Arc<Custody>,
        flags: MountFlags,
    ) -> VfsResult<MountId> {
        require_superuser(credentials)?;
        let instance = self
            .registry
            .find_by_fsid(source.identifier().fsid)
            .ok_or(VfsError::NoSuchDevice)?;
        if source.identifier() != instance.root_inode().identifier() {
            return Err(VfsError::InvalidArgument);
        }
        if !target.inode().metadata().is_directory() {
            return Err(VfsError::NotADirectory);
        }
        self.registry.attach(&instance)?;
        let guest = instance.root_inode();

        if Self::is_context_root(context, target) {
            let (id, removed) = context.swap_root(guest, instance, flags, true);
            for mount in &removed {
                self.retire(mount);
            }
            info!(
                "Copied {} onto the root of {} ({} mounts pruned)",
                source.absolute_path(),
                context.id(),
                removed.len()
            );
            return Ok(id);
        }

        let id = context.add_mount(guest, instance, Arc::clone(target), flags, true);
        info!(
            "Copy-mounted {} at {}",
            source.absolute_path(),
            target.absolute_path()
        );
        Ok(id)
    }

    /// Makes the filesystem rooted at `new_root` the context root.
    pub fn pivot_root(
        &self,
        context: &NamespaceContext,
        credentials: &Credentials,
        new_root: &Arc<Custody>,
    ) -> VfsResult<MountId> {
        let root = context.root_custody();
        self.copy_mount(context, credentials, new_root, &root, new_root.mount_flags())
    }

    fn mounts_hosted_on(&self, fsid: u32) -> usize {
        self.contexts()
            .iter()
            .map(|context| context.mounts_hosted_on(fsid))
            .sum()
    }

    /// Removes the mount showing `guest`.
    ///
    /// The instance stays alive while other mounts still reference it.
    pub fn unmount(
        &self,
        context: &NamespaceContext,
        credentials: &Credentials,
        guest: &Arc<Custody>,
    ) -> VfsResult<()> {
        require_superuser(credentials)?;
        let mount = context
            .find_mount_for(guest)
            .ok_or(VfsError::InvalidArgument)?;
        if mount.host.is_none() {
            return Err(VfsError::Busy);
        }

        let instance = Arc::clone(&mount.instance);
        if instance.mounted_count() == 1 && self.mounts_hosted_on(instance.fsid()) > 0 {
            return Err(VfsError::Busy);
        }

        instance.filesystem().prepare_to_unmount(&*mount.guest)?;
        if context.remove_mount(mount.id).is_none() {
            return Err(VfsError::InvalidArgument);
        }
        let destroyed = self.registry.release(&instance);
        info!(
            "Unmounted {} from {}{}",
            instance.type_name(),
            guest.absolute_path(),
            if destroyed { " (last mount)" } else { "" }
        );
        Ok(())
    }

    /// Changes the flags of the mount showing `guest`.
    pub fn remount(
        &self,
        context: &NamespaceContext,
        credentials: &Credentials,
        guest: &Arc<Custody>,
        flags: MountFlags,
    ) -> VfsResult<()> {
        require_superuser(credentials)?;
        let mount = context
            .find_mount_for(guest)
            .ok_or(VfsError::InvalidArgument)?;
        if let Some(source) = mount.instance.description() {
            if !source.is_writable() && !flags.contains(MountFlags::READ_ONLY) {
                return Err(VfsError::ReadOnlyFilesystem);
            }
        }
        context.set_mount_flags(mount.id, flags)?;
        info!("Remounted {} with {:?}", guest.absolute_path(), flags);
        Ok(())
    }

    /// Flushes every live filesystem. Failures are logged, not returned.
    pub fn sync(&self) {
        self.registry.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::process::Process;
    use crate::modules::resolver::OpenOptions;
    use crate::modules::testing::Fixture;
    use anyhow::Result;
    use tempfile::NamedTempFile;

    fn image(writable: bool, file: &NamedTempFile) -> Result<Arc<OpenFileDescription>> {
        Ok(Arc::new(OpenFileDescription::open(file.path(), writable)?))
    }

    #[test]
    fn test_mount_requires_superuser() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/mnt")?;
        let target = fixture.custody("/mnt")?;
        let user = Credentials::user(1000, 1000);

        let result = fixture
            .manager
            .mount(&fixture.context, &user, &target, &MountRequest::new("ramfs"));
        assert_eq!(result, Err(VfsError::NotPermitted));
        Ok(())
    }

    #[test]
    fn test_unknown_filesystem_type() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/mnt")?;
        let target = fixture.custody("/mnt")?;
        let result = fixture.manager.mount(
            &fixture.context,
            &Credentials::root(),
            &target,
            &MountRequest::new("ext4"),
        );
        assert_eq!(result, Err(VfsError::NoSuchDevice));
        Ok(())
    }

    #[test]
    fn test_same_image_at_two_points_shares_instance() -> Result<()> {
        let fixture = Fixture::new()?;
        let file = NamedTempFile::new()?;
        fixture.mkdir("/a")?;
        fixture.mkdir("/b")?;
        let baseline = fixture.manager.registry().len();

        fixture.mount_image("/a", image(true, &file)?)?;
        fixture.mount_image("/b", image(true, &file)?)?;
        assert_eq!(fixture.manager.registry().len(), baseline + 1);
        assert_eq!(fixture.manager.registry().file_backed_len(), 1);

        fixture.write_file("/a/shared", b"visible twice")?;
        assert_eq!(fixture.read_file("/b/shared")?, b"visible twice");

        let root = Credentials::root();
        fixture
            .manager
            .unmount(&fixture.context, &root, &fixture.custody("/a")?)?;
        let instance = fixture.custody("/b")?.identifier().fsid;
        let instance = fixture
            .manager
            .registry()
            .find_by_fsid(instance)
            .expect("instance still registered");
        assert_eq!(instance.mounted_count(), 1);

        fixture
            .manager
            .unmount(&fixture.context, &root, &fixture.custody("/b")?)?;
        assert_eq!(fixture.manager.registry().len(), baseline);
        assert_eq!(fixture.manager.registry().file_backed_len(), 0);

        // Unmount flushed the image.
        assert!(std::fs::read_to_string(file.path())?.contains("shared"));
        Ok(())
    }

    #[test]
    fn test_read_only_source_needs_read_only_flag() -> Result<()> {
        let fixture = Fixture::new()?;
        let file = NamedTempFile::new()?;
        fixture.mkdir("/ro")?;
        let target = fixture.custody("/ro")?;
        let root = Credentials::root();

        let request = MountRequest::new("imagefs").with_source(image(false, &file)?);
        assert_eq!(
            fixture.manager.mount(&fixture.context, &root, &target, &request),
            Err(VfsError::ReadOnlyFilesystem)
        );

        let request = request.with_flags(MountFlags::READ_ONLY);
        fixture.manager.mount(&fixture.context, &root, &target, &request)?;
        assert!(fixture.custody("/ro")?.is_readonly());
        Ok(())
    }

    #[test]
    fn test_unmount_root_is_busy() -> Result<()> {
        let fixture = Fixture::new()?;
        let root = fixture.context.root_custody();
        let result = fixture
            .manager
            .unmount(&fixture.context, &Credentials::root(), &root);
        assert_eq!(result, Err(VfsError::Busy));
        Ok(())
    }

    #[test]
    fn test_unmount_with_nested_mount_is_busy() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/outer")?;
        fixture.mount_ramfs("/outer")?;
        fixture.mkdir("/outer/inner")?;
        fixture.mount_ramfs("/outer/inner")?;

        let root = Credentials::root();
        let outer = fixture.custody("/outer")?;
        assert_eq!(
            fixture.manager.unmount(&fixture.context, &root, &outer),
            Err(VfsError::Busy)
        );

        fixture
            .manager
            .unmount(&fixture.context, &root, &fixture.custody("/outer/inner")?)?;
        fixture.manager.unmount(&fixture.context, &root, &outer)?;
        assert_eq!(fixture.context.mount_count(), 1);
        Ok(())
    }

    #[test]
    fn test_unmount_of_unmounted_path() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/plain")?;
        let result = fixture.manager.unmount(
            &fixture.context,
            &Credentials::root(),
            &fixture.custody("/plain")?,
        );
        assert_eq!(result, Err(VfsError::InvalidArgument));
        Ok(())
    }

    #[test]
    fn test_bind_mount_filesystem_root() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/data")?;
        fixture.mount_ramfs("/data")?;
        fixture.write_file("/data/file", b"bound")?;
        fixture.mkdir("/view")?;

        let root = Credentials::root();
        let source = fixture.custody("/data")?;
        let target = fixture.custody("/view")?;
        fixture
            .manager
            .bind_mount(&fixture.context, &root, &source, &target, MountFlags::READ_ONLY)?;

        assert_eq!(fixture.read_file("/view/file")?, b"bound");
        assert!(fixture.custody("/view/file")?.is_readonly());
        assert!(!fixture.custody("/data/file")?.is_readonly());

        let info = fixture.context.mounts();
        assert!(info.iter().any(|m| m.bind && m.mount_point == "/view"));
        Ok(())
    }

    #[test]
    fn test_bind_mount_rejections() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/dir")?;
        fixture.mkdir("/mnt")?;
        fixture.mount_ramfs("/mnt")?;
        fixture.write_file("/file", b"")?;
        let root = Credentials::root();
        let dir = fixture.custody("/dir")?;
        let mnt = fixture.custody("/mnt")?;
        let file = fixture.custody("/file")?;

        let context = &fixture.context;
        let manager = &fixture.manager;
        assert_eq!(
            manager.bind_mount(context, &root, &dir, &mnt, MountFlags::empty()),
            Err(VfsError::InvalidArgument)
        );
        assert_eq!(
            manager.bind_mount(context, &root, &mnt, &file, MountFlags::empty()),
            Err(VfsError::NotADirectory)
        );
        assert_eq!(
            manager.bind_mount(context, &root, &mnt, &context.root_custody(), MountFlags::empty()),
            Err(VfsError::Busy)
        );
        Ok(())
    }

    #[test]
    fn test_copy_mount_requires_filesystem_root() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/sub")?;
        fixture.mkdir("/copy")?;
        let root = Credentials::root();

        let result = fixture.manager.copy_mount(
            &fixture.context,
            &root,
            &fixture.custody("/sub")?,
            &fixture.custody("/copy")?,
            MountFlags::empty(),
        );
        assert_eq!(result, Err(VfsError::InvalidArgument));

        fixture.mkdir("/mnt")?;
        fixture.mount_ramfs("/mnt")?;
        fixture.write_file("/mnt/x", b"")?;
        fixture.manager.copy_mount(
            &fixture.context,
            &root,
            &fixture.custody("/mnt")?,
            &fixture.custody("/copy")?,
            MountFlags::empty(),
        )?;
        assert_eq!(
            fixture.custody("/copy/x")?.identifier(),
            fixture.custody("/mnt/x")?.identifier()
        );
        Ok(())
    }

    #[test]
    fn test_pivot_root_prunes_old_tree() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/other")?;
        fixture.mkdir("/newroot")?;
        fixture.mount_ramfs("/other")?;
        fixture.mount_ramfs("/newroot")?;
        fixture.mkdir("/newroot/etc")?;
        fixture.mount_ramfs("/newroot/etc")?;
        let baseline = fixture.manager.registry().len();

        let new_root = fixture.custody("/newroot")?;
        fixture
            .manager
            .pivot_root(&fixture.context, &Credentials::root(), &new_root)?;

        assert_eq!(fixture.context.root_custody().identifier(), new_root.identifier());
        // The old root filesystem and /other are gone; /etc survives.
        assert_eq!(fixture.context.mount_count(), 2);
        assert_eq!(fixture.manager.registry().len(), baseline - 2);
        assert!(fixture.custody("/etc").is_ok());
        assert!(fixture.custody("/other").is_err());
        Ok(())
    }

    #[test]
    fn test_mount_onto_root_swaps_root() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.write_file("/old", b"")?;
        let root = fixture.context.root_custody();
        fixture.manager.mount(
            &fixture.context,
            &Credentials::root(),
            &root,
            &MountRequest::new("ramfs"),
        )?;
        assert_ne!(fixture.context.root_custody().identifier(), root.identifier());
        assert!(fixture.custody("/old").is_err());
        assert_eq!(fixture.context.mount_count(), 1);
        Ok(())
    }

    #[test]
    fn test_remount_changes_flags_in_place() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/mnt")?;
        let id = fixture.mount_ramfs("/mnt")?;
        let guest = fixture.custody("/mnt")?;

        fixture.manager.remount(
            &fixture.context,
            &Credentials::root(),
            &guest,
            MountFlags::READ_ONLY | MountFlags::NO_EXEC,
        )?;
        let mount = fixture.context.find_mount(id).expect("mount survives remount");
        assert_eq!(mount.flags, MountFlags::READ_ONLY | MountFlags::NO_EXEC);
        assert!(fixture.custody("/mnt")?.is_readonly());
        assert_eq!(
            fixture.root_process().mkdir("/mnt/new", 0o755).err(),
            Some(VfsError::ReadOnlyFilesystem)
        );
        Ok(())
    }

    #[test]
    fn test_destroy_context_lifecycle() -> Result<()> {
        let manager = FilesystemManager::new();
        let context = manager.create_context_with_empty_ramfs()?;
        assert!(manager.find_context(context.id()).is_some());

        let process = Process::new(1, Credentials::root(), Arc::clone(&context));
        assert_eq!(manager.destroy_context(&context), Err(VfsError::Busy));
        drop(process);

        manager.destroy_context(&context)?;
        assert!(manager.contexts().is_empty());
        assert!(manager.registry().is_empty());
        Ok(())
    }

    #[test]
    fn test_contexts_are_isolated() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/mnt")?;
        fixture.mount_ramfs("/mnt")?;

        let other = fixture.manager.create_context_with_empty_ramfs()?;
        let process = Process::new(9, Credentials::root(), other);
        assert_eq!(
            process.resolve("/mnt", OpenOptions::empty()).err(),
            Some(VfsError::NotFound)
        );
        assert_eq!(fixture.manager.contexts().len(), 2);
        Ok(())
    }

    #[test]
    fn test_sync_flushes_images() -> Result<()> {
        let fixture = Fixture::new()?;
        let file = NamedTempFile::new()?;
        fixture.mkdir("/img")?;
        fixture.mount_image("/img", image(true, &file)?)?;
        fixture.write_file("/img/synced", b"1")?;

        fixture.manager.sync();
        assert!(std::fs::read_to_string(file.path())?.contains("synced"));
        Ok(())
    }
}
