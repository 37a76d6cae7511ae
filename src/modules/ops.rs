//! Path-based operations performed on behalf of a [`Process`].
//!
//! Every operation resolves its paths through the process's namespace
//! context, checks the veil on the resolved location, then applies the
//! discretionary access rules before touching the filesystem driver.

use log::debug;
use std::sync::Arc;

use super::constants::DEFAULT_SYMLINK_PERMISSION;
use super::custody::Custody;
use super::error::{VfsError, VfsResult};
use super::file::OpenFile;
use super::inode::{DirectoryEntry, FileMode, InodeMetadata};
use super::namespace::MountFlags;
use super::process::{join_path, Process};
use super::resolver::{MissingEntry, OpenOptions, ResolveFailure};

// Last component of `path`, ignoring trailing slashes.
fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

fn reject_dot_entries(path: &str) -> VfsResult<()> {
    match basename(path) {
        "" | "." | ".." => Err(VfsError::InvalidArgument),
        _ => Ok(()),
    }
}

fn child_count(custody: &Custody) -> VfsResult<usize> {
    let mut count = 0;
    custody.inode().traverse_as_directory(&mut |_| {
        count += 1;
        true
    })?;
    Ok(count)
}

impl Process {
    // Sticky directories restrict removal to the owner of the entry, the
    // owner of the directory and the superuser.
    fn may_remove_from(&self, directory: &InodeMetadata, victim: &InodeMetadata) -> bool {
        let credentials = self.credentials();
        !directory.is_sticky()
            || credentials.is_superuser()
            || victim.uid == credentials.euid
            || directory.uid == credentials.euid
    }

    fn check_can_modify_directory(&self, directory: &Custody) -> VfsResult<()> {
        if !directory.inode().metadata().may_write(self.credentials()) {
            return Err(VfsError::AccessDenied);
        }
        if directory.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }
        Ok(())
    }

    /// Locates the directory and name for an entry that must not exist yet.
    ///
    /// An existing entry is reported as `Exists` only when the veil lets the
    /// process see it.
    fn resolve_new_entry(&self, path: &str) -> VfsResult<MissingEntry> {
        match self.resolve_without_veil(path, OpenOptions::NOFOLLOW_NOERROR) {
            Ok(resolved) => {
                self.validate_veil(&resolved.custody.absolute_path(), OpenOptions::empty())?;
                Err(VfsError::Exists)
            }
            Err(ResolveFailure {
                error: VfsError::NotFound,
                missing: Some(missing),
            }) => {
                let full_path = join_path(&missing.parent.absolute_path(), &missing.name);
                self.validate_veil(&full_path, OpenOptions::CREATE)?;
                Ok(missing)
            }
            Err(failure) => Err(failure.error),
        }
    }

    /// Opens `path`, creating it when `CREATE` is set and it is missing.
    ///
    /// # Arguments
    ///
    /// * `path` - Path relative to the working directory unless absolute
    /// * `options` - Access mode, creation and symlink handling
    /// * `mode` - Permission bits for a newly created file, before the umask
    pub fn open(&self, path: &str, options: OpenOptions, mode: u16) -> VfsResult<OpenFile> {
        if options.contains(OpenOptions::CREATE | OpenOptions::DIRECTORY) {
            return Err(VfsError::InvalidArgument);
        }

        let resolved = match self.resolve_without_veil(path, options) {
            Ok(resolved) => resolved,
            Err(ResolveFailure {
                error: VfsError::NotFound,
                missing: Some(missing),
            }) if options.contains(OpenOptions::CREATE) => {
                return self.create_in(&missing, options, FileMode::regular(mode));
            }
            Err(failure) => return Err(failure.error),
        };
        let custody = resolved.custody;
        self.validate_veil(&custody.absolute_path(), options)?;

        if options.contains(OpenOptions::CREATE | OpenOptions::EXCLUSIVE) {
            return Err(VfsError::Exists);
        }

        let metadata = custody.inode().metadata();
        let flags = custody.mount_flags();
        if metadata.is_regular() && flags.contains(MountFlags::NO_REGULAR_FILES) {
            return Err(VfsError::AccessDenied);
        }
        if options.contains(OpenOptions::DIRECTORY) && !metadata.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        if options.contains(OpenOptions::READ) && !metadata.may_read(self.credentials()) {
            return Err(VfsError::AccessDenied);
        }
        let mut should_truncate = false;
        if options.contains(OpenOptions::WRITE) {
            if !metadata.may_write(self.credentials()) {
                return Err(VfsError::AccessDenied);
            }
            if metadata.is_directory() {
                return Err(VfsError::IsADirectory);
            }
            should_truncate = options.contains(OpenOptions::TRUNCATE);
        }
        if options.contains(OpenOptions::EXEC)
            && (!metadata.may_execute(self.credentials()) || flags.contains(MountFlags::NO_EXEC))
        {
            return Err(VfsError::AccessDenied);
        }
        if metadata.mode.is_device() && flags.contains(MountFlags::NO_DEVICE_NODES) {
            return Err(VfsError::AccessDenied);
        }
        if metadata.mode.is_socket() {
            return Err(VfsError::NotSupported);
        }

        if options.contains(OpenOptions::WRITE) && custody.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }
        if should_truncate && metadata.is_regular() {
            custody.inode().truncate(0)?;
        }

        Ok(OpenFile::new(custody, options))
    }

    /// Creates and opens a file that must not exist yet.
    pub fn create(&self, path: &str, options: OpenOptions, mode: u16) -> VfsResult<OpenFile> {
        self.open(
            path,
            options | OpenOptions::CREATE | OpenOptions::EXCLUSIVE,
            mode,
        )
    }

    fn create_in(
        &self,
        missing: &MissingEntry,
        options: OpenOptions,
        mode: FileMode,
    ) -> VfsResult<OpenFile> {
        let parent = &missing.parent;
        self.validate_veil(
            &join_path(&parent.absolute_path(), &missing.name),
            options,
        )?;
        self.check_can_modify_directory(parent)?;

        let mode = if mode.is_socket() || mode.is_fifo() || mode.is_device() {
            mode
        } else {
            FileMode::regular(mode.permissions())
        };
        if mode.is_regular() && parent.mount_flags().contains(MountFlags::NO_REGULAR_FILES) {
            return Err(VfsError::AccessDenied);
        }
        let mode = mode.with_permissions(mode.permissions() & !self.umask());

        let credentials = self.credentials();
        let inode = parent.inode().create_child(
            &missing.name,
            mode,
            (0, 0),
            credentials.euid,
            credentials.egid,
        )?;
        debug!("Created {} in {}", missing.name, parent.absolute_path());
        let custody = Custody::new(
            Some(Arc::clone(parent)),
            &missing.name,
            inode,
            parent.mount_flags(),
        );
        Ok(OpenFile::new(custody, options))
    }

    /// Creates a directory. Trailing slashes are accepted.
    pub fn mkdir(&self, path: &str, mode: u16) -> VfsResult<()> {
        let trimmed = path.trim_end_matches('/');
        let path = if trimmed.is_empty() && !path.is_empty() {
            "/"
        } else {
            trimmed
        };

        let missing = self.resolve_new_entry(path)?;
        self.check_can_modify_directory(&missing.parent)?;

        let credentials = self.credentials();
        missing.parent.inode().create_child(
            &missing.name,
            FileMode::directory(mode & !self.umask()),
            (0, 0),
            credentials.euid,
            credentials.egid,
        )?;
        Ok(())
    }

    /// Creates a filesystem node of any type. Devices need the superuser.
    pub fn mknod(&self, path: &str, mode: FileMode, device: (u32, u32)) -> VfsResult<()> {
        let supported = mode.is_regular()
            || mode.is_device()
            || mode.is_fifo()
            || mode.is_socket();
        if !supported {
            return Err(VfsError::InvalidArgument);
        }
        if mode.is_device() && !self.credentials().is_superuser() {
            return Err(VfsError::NotPermitted);
        }

        let missing = self.resolve_new_entry(path)?;
        self.check_can_modify_directory(&missing.parent)?;
        if mode.is_regular() && missing.parent.mount_flags().contains(MountFlags::NO_REGULAR_FILES) {
            return Err(VfsError::AccessDenied);
        }

        let credentials = self.credentials();
        missing.parent.inode().create_child(
            &missing.name,
            mode.with_permissions(mode.permissions() & !self.umask()),
            device,
            credentials.euid,
            credentials.egid,
        )?;
        Ok(())
    }

    /// Creates a symbolic link at `linkpath` whose text is `target`.
    pub fn symlink(&self, target: &str, linkpath: &str) -> VfsResult<()> {
        if target.is_empty() {
            return Err(VfsError::NotFound);
        }
        // Relative targets are looked up from the directory holding the link.
        let lookup = match (target.starts_with('/'), linkpath.rfind('/')) {
            (false, Some(slash)) => format!("{}/{}", &linkpath[..slash], target),
            _ => target.to_string(),
        };
        // A dangling target is fine, an unreadable or unsearchable one is not.
        match self.resolve(&lookup, OpenOptions::READ) {
            Ok(_) | Err(VfsError::NotFound) => {}
            Err(error) => return Err(error),
        }
        let missing = self.resolve_new_entry(linkpath)?;
        self.check_can_modify_directory(&missing.parent)?;

        let credentials = self.credentials();
        let inode = missing.parent.inode().create_child(
            &missing.name,
            FileMode::new(FileMode::S_IFLNK | DEFAULT_SYMLINK_PERMISSION),
            (0, 0),
            credentials.euid,
            credentials.egid,
        )?;
        inode.write_bytes(0, target.as_bytes())?;
        Ok(())
    }

    /// Creates a hard link to `old_path` at `new_path`.
    pub fn link(&self, old_path: &str, new_path: &str) -> VfsResult<()> {
        let old = self.resolve(old_path, OpenOptions::empty())?.custody;
        let missing = self.resolve_new_entry(new_path)?;
        let parent = &missing.parent;

        let old_metadata = old.inode().metadata();
        if parent.identifier().fsid != old.identifier().fsid {
            return Err(VfsError::CrossDevice);
        }
        if !parent.inode().metadata().may_write(self.credentials()) {
            return Err(VfsError::AccessDenied);
        }
        if old_metadata.is_directory() {
            return Err(VfsError::NotPermitted);
        }
        if parent.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }
        if !self.hard_link_allowed(&old_metadata) {
            return Err(VfsError::NotPermitted);
        }

        parent.inode().add_child(old.inode(), &missing.name)
    }

    // Protected hard links: non-owners may only link plain writable files.
    fn hard_link_allowed(&self, metadata: &InodeMetadata) -> bool {
        let credentials = self.credentials();
        if credentials.euid == metadata.uid {
            return true;
        }
        let group_exec_setgid = metadata.is_setgid() && metadata.mode.0 & 0o010 != 0;
        metadata.is_regular()
            && !metadata.is_setuid()
            && !group_exec_setgid
            && metadata.may_write(credentials)
    }

    /// Removes a non-directory entry.
    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        let resolved = self.resolve(
            path,
            OpenOptions::NOFOLLOW_NOERROR | OpenOptions::UNLINK_INTERNAL,
        )?;
        let custody = resolved.custody;
        let metadata = custody.inode().metadata();
        if metadata.is_directory() {
            return Err(VfsError::IsADirectory);
        }

        // Only directories can be a namespace root.
        let parent = resolved
            .parent
            .expect("non-directory custody always has a parent");
        let parent_metadata = parent.inode().metadata();
        if !parent_metadata.may_write(self.credentials()) {
            return Err(VfsError::AccessDenied);
        }
        if !self.may_remove_from(&parent_metadata, &metadata) {
            return Err(VfsError::AccessDenied);
        }
        if parent.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }

        parent.inode().remove_child(custody.name())
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        match basename(path) {
            "." => return Err(VfsError::InvalidArgument),
            ".." => return Err(VfsError::NotEmpty),
            _ => {}
        }

        let resolved = self.resolve(path, OpenOptions::UNLINK_INTERNAL)?;
        let custody = resolved.custody;
        let metadata = custody.inode().metadata();
        if !metadata.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        let Some(parent) = custody.parent().cloned() else {
            return Err(VfsError::Busy);
        };
        if self.context().is_mount_guest(custody.identifier()) {
            return Err(VfsError::Busy);
        }

        let parent_metadata = parent.inode().metadata();
        if !parent_metadata.may_write(self.credentials()) {
            return Err(VfsError::AccessDenied);
        }
        if !self.may_remove_from(&parent_metadata, &metadata) {
            return Err(VfsError::AccessDenied);
        }
        // Only `.` and `..` may remain.
        if child_count(&custody)? != 2 {
            return Err(VfsError::NotEmpty);
        }
        if custody.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }

        parent.inode().remove_child(custody.name())
    }

    /// Moves `old_path` to `new_path`, replacing a compatible target.
    pub fn rename(&self, old_path: &str, new_path: &str) -> VfsResult<()> {
        reject_dot_entries(old_path)?;
        reject_dot_entries(new_path)?;

        let old = self.resolve(
            old_path,
            OpenOptions::NOFOLLOW_NOERROR | OpenOptions::UNLINK_INTERNAL,
        )?;
        let old_custody = old.custody;
        let old_parent = old.parent.ok_or(VfsError::NotPermitted)?;
        if self.context().is_mount_guest(old_custody.identifier()) {
            return Err(VfsError::Busy);
        }

        let (new_parent, new_name, existing) = match self.resolve_without_veil(new_path, OpenOptions::NOFOLLOW_NOERROR) {
            Ok(resolved) => {
                self.validate_veil(&resolved.custody.absolute_path(), OpenOptions::CREATE)?;
                let parent = resolved.parent.ok_or(VfsError::NotPermitted)?;
                let name = resolved.custody.name().to_string();
                (parent, name, Some(resolved.custody))
            }
            Err(ResolveFailure {
                error: VfsError::NotFound,
                missing: Some(missing),
            }) => {
                let full_path = join_path(&missing.parent.absolute_path(), &missing.name);
                self.validate_veil(&full_path, OpenOptions::CREATE)?;
                (missing.parent, missing.name, None)
            }
            Err(failure) => return Err(failure.error),
        };

        let old_inode = old_custody.inode();
        let old_metadata = old_inode.metadata();
        if let Some(existing) = &existing {
            let existing_metadata = existing.inode().metadata();
            if existing.identifier() != old_custody.identifier()
                && old_metadata.is_directory()
                && existing_metadata.is_directory()
                && child_count(existing)? > 2
            {
                return Err(VfsError::NotEmpty);
            }
        }

        if old_parent.identifier().fsid != new_parent.identifier().fsid {
            return Err(VfsError::CrossDevice);
        }
        let mut ancestor = Some(&new_parent);
        while let Some(custody) = ancestor {
            if custody.identifier() == old_custody.identifier() {
                return Err(VfsError::DirectoryIntoSelf);
            }
            ancestor = custody.parent();
        }

        let old_parent_metadata = old_parent.inode().metadata();
        let new_parent_metadata = new_parent.inode().metadata();
        if !new_parent_metadata.may_write(self.credentials())
            || !old_parent_metadata.may_write(self.credentials())
        {
            return Err(VfsError::AccessDenied);
        }
        if !self.may_remove_from(&old_parent_metadata, &old_metadata) {
            return Err(VfsError::AccessDenied);
        }
        if old_parent.is_readonly() || new_parent.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }

        let old_name = old_custody.name().to_string();
        if old_name == new_name && old_parent.identifier() == new_parent.identifier() {
            return Ok(());
        }

        if let Some(existing) = existing {
            if existing.identifier() == old_custody.identifier() {
                return Ok(());
            }
            let existing_metadata = existing.inode().metadata();
            if !self.may_remove_from(&new_parent_metadata, &existing_metadata) {
                return Err(VfsError::AccessDenied);
            }
            if existing_metadata.is_directory() && !old_metadata.is_directory() {
                return Err(VfsError::IsADirectory);
            }
            if !existing_metadata.is_directory() && old_metadata.is_directory() {
                return Err(VfsError::NotADirectory);
            }
            if self.context().is_mount_guest(existing.identifier()) {
                return Err(VfsError::Busy);
            }
            new_parent.inode().remove_child(&new_name)?;
        }

        new_parent.inode().add_child(old_inode, &new_name)?;
        old_parent.inode().remove_child(&old_name)?;
        debug!(
            "Renamed {} to {}",
            join_path(&old_parent.absolute_path(), &old_name),
            join_path(&new_parent.absolute_path(), &new_name)
        );
        Ok(())
    }

    /// Changes the permission bits of `path`. The file type is preserved.
    pub fn chmod(&self, path: &str, mode: u16) -> VfsResult<()> {
        let custody = self.resolve(path, OpenOptions::empty())?.custody;
        let metadata = custody.inode().metadata();
        let credentials = self.credentials();
        if credentials.euid != metadata.uid && !credentials.is_superuser() {
            return Err(VfsError::NotPermitted);
        }
        if custody.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }
        custody
            .inode()
            .chmod(metadata.mode.with_permissions(mode & FileMode::PERMISSION_MASK))
    }

    /// Changes ownership of `path`; `None` leaves that id unchanged.
    ///
    /// Setuid and setgid bits are cleared on every ownership change.
    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> VfsResult<()> {
        let custody = self.resolve(path, OpenOptions::empty())?.custody;
        let metadata = custody.inode().metadata();
        let credentials = self.credentials();
        if credentials.euid != metadata.uid && !credentials.is_superuser() {
            return Err(VfsError::NotPermitted);
        }

        let mut new_uid = metadata.uid;
        let mut new_gid = metadata.gid;
        if let Some(uid) = uid {
            if credentials.euid != uid && !credentials.is_superuser() {
                return Err(VfsError::NotPermitted);
            }
            new_uid = uid;
        }
        if let Some(gid) = gid {
            if !credentials.in_group(gid) && !credentials.is_superuser() {
                return Err(VfsError::NotPermitted);
            }
            new_gid = gid;
        }
        if custody.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }

        debug!("chown {} <- uid={} gid={}", custody.identifier(), new_uid, new_gid);
        if metadata.is_setuid() || metadata.is_setgid() {
            let stripped = metadata.mode.0 & !(FileMode::S_ISUID | FileMode::S_ISGID);
            custody.inode().chmod(FileMode::new(stripped))?;
        }
        custody.inode().chown(new_uid, new_gid)
    }

    /// Sets access and modification times; `None` leaves a time unchanged.
    pub fn utime(&self, path: &str, atime: Option<i64>, mtime: Option<i64>) -> VfsResult<()> {
        let custody = self.resolve(path, OpenOptions::empty())?.custody;
        let credentials = self.credentials();
        if !credentials.is_superuser() && custody.inode().metadata().uid != credentials.euid {
            return Err(VfsError::AccessDenied);
        }
        if custody.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }
        custody.inode().set_times(atime, mtime)
    }

    pub fn stat(&self, path: &str) -> VfsResult<InodeMetadata> {
        Ok(self.resolve(path, OpenOptions::empty())?.custody.inode().metadata())
    }

    /// Like [`Process::stat`] but does not follow a final symbolic link.
    pub fn lstat(&self, path: &str) -> VfsResult<InodeMetadata> {
        Ok(self
            .resolve(path, OpenOptions::NOFOLLOW_NOERROR)?
            .custody
            .inode()
            .metadata())
    }

    pub fn readlink(&self, path: &str) -> VfsResult<String> {
        let custody = self
            .resolve(path, OpenOptions::READ | OpenOptions::NOFOLLOW_NOERROR)?
            .custody;
        if !custody.inode().metadata().is_symlink() {
            return Err(VfsError::InvalidArgument);
        }
        custody.inode().read_link()
    }

    /// Changes the working directory.
    pub fn chdir(&mut self, path: &str) -> VfsResult<()> {
        let custody = self.resolve(path, OpenOptions::empty())?.custody;
        let metadata = custody.inode().metadata();
        if !metadata.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        if !metadata.may_execute(self.credentials()) {
            return Err(VfsError::AccessDenied);
        }
        self.set_cwd(custody);
        Ok(())
    }

    /// Lists a directory, including `.` and `..`.
    pub fn list_directory(&self, path: &str) -> VfsResult<Vec<DirectoryEntry>> {
        let custody = self
            .resolve(path, OpenOptions::READ | OpenOptions::DIRECTORY)?
            .custody;
        let metadata = custody.inode().metadata();
        if !metadata.is_directory() {
            return Err(VfsError::NotADirectory);
        }
        if !metadata.may_read(self.credentials()) {
            return Err(VfsError::AccessDenied);
        }

        let mut entries = Vec::new();
        custody.inode().traverse_as_directory(&mut |entry| {
            entries.push(entry.clone());
            true
        })?;
        Ok(entries)
    }

    /// Sets the size of a regular file.
    pub fn truncate(&self, path: &str, size: u64) -> VfsResult<()> {
        let custody = self.resolve(path, OpenOptions::WRITE)?.custody;
        let metadata = custody.inode().metadata();
        if metadata.is_directory() {
            return Err(VfsError::IsADirectory);
        }
        if !metadata.may_write(self.credentials()) {
            return Err(VfsError::AccessDenied);
        }
        if custody.is_readonly() {
            return Err(VfsError::ReadOnlyFilesystem);
        }
        custody.inode().truncate(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testing::Fixture;
    use anyhow::Result;

    #[test]
    fn test_basename() {
        assert_eq!(basename("/a/b"), "b");
        assert_eq!(basename("/a/b//"), "b");
        assert_eq!(basename("name"), "name");
        assert_eq!(basename("/"), "");
    }

    #[test]
    fn test_open_create_applies_umask() -> Result<()> {
        let fixture = Fixture::new()?;
        let mut process = fixture.root_process();
        process.set_umask(0o027);
        process.open("/new", OpenOptions::WRITE | OpenOptions::CREATE, 0o666)?;

        let metadata = process.stat("/new")?;
        assert!(metadata.is_regular());
        assert_eq!(metadata.mode.permissions(), 0o640);
        Ok(())
    }

    #[test]
    fn test_open_exclusive_and_truncate() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.write_file("/data", b"contents")?;
        let process = fixture.root_process();

        assert_eq!(
            process.create("/data", OpenOptions::WRITE, 0o644).err(),
            Some(VfsError::Exists)
        );
        process.open("/data", OpenOptions::WRITE | OpenOptions::TRUNCATE, 0)?;
        assert_eq!(process.stat("/data")?.size, 0);
        Ok(())
    }

    #[test]
    fn test_open_checks_access() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.write_file("/secret", b"x")?;
        fixture.root_process().chmod("/secret", 0o600)?;
        let user = fixture.user_process(1000, 1000);

        assert_eq!(
            user.open("/secret", OpenOptions::READ, 0).err(),
            Some(VfsError::AccessDenied)
        );
        assert_eq!(
            user.open("/secret", OpenOptions::READ | OpenOptions::DIRECTORY, 0).err(),
            Some(VfsError::NotADirectory)
        );
        assert_eq!(
            user.open("/", OpenOptions::WRITE, 0).err(),
            Some(VfsError::AccessDenied)
        );
        assert_eq!(
            fixture.root_process().open("/", OpenOptions::WRITE, 0).err(),
            Some(VfsError::IsADirectory)
        );
        assert_eq!(
            user.open("/x", OpenOptions::CREATE | OpenOptions::DIRECTORY, 0).err(),
            Some(VfsError::InvalidArgument)
        );
        Ok(())
    }

    #[test]
    fn test_mount_flags_restrict_open() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/mnt")?;
        fixture.mount_ramfs("/mnt")?;
        fixture.write_file("/mnt/tool", b"#!")?;
        let process = fixture.root_process();
        process.chmod("/mnt/tool", 0o755)?;
        process.mknod("/mnt/null", FileMode::new(FileMode::S_IFCHR | 0o666), (1, 3))?;

        let guest = fixture.custody("/mnt")?;
        fixture.manager.remount(
            &fixture.context,
            process.credentials(),
            &guest,
            MountFlags::NO_EXEC | MountFlags::NO_DEVICE_NODES | MountFlags::NO_REGULAR_FILES,
        )?;

        assert_eq!(
            process.open("/mnt/tool", OpenOptions::EXEC, 0).err(),
            Some(VfsError::AccessDenied)
        );
        assert_eq!(
            process.open("/mnt/null", OpenOptions::READ, 0).err(),
            Some(VfsError::AccessDenied)
        );
        assert_eq!(
            process.open("/mnt/fresh", OpenOptions::WRITE | OpenOptions::CREATE, 0o644).err(),
            Some(VfsError::AccessDenied)
        );
        Ok(())
    }

    #[test]
    fn test_mkdir_cases() -> Result<()> {
        let fixture = Fixture::new()?;
        let process = fixture.root_process();
        process.mkdir("/dir/", 0o755)?;
        assert!(process.stat("/dir")?.is_directory());
        assert_eq!(process.mkdir("/dir", 0o755), Err(VfsError::Exists));
        assert_eq!(process.mkdir("///", 0o755), Err(VfsError::Exists));
        assert_eq!(process.mkdir("/missing/dir", 0o755), Err(VfsError::NotFound));

        let user = fixture.user_process(1000, 1000);
        assert_eq!(user.mkdir("/mine", 0o755), Err(VfsError::AccessDenied));
        Ok(())
    }

    #[test]
    fn test_mkdir_under_veil() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/hidden")?;
        fixture.mkdir("/work")?;
        let mut process = fixture.root_process();
        process.unveil("/work", "rc")?;

        process.mkdir("/work/sub", 0o755)?;
        assert_eq!(process.mkdir("/hidden", 0o755), Err(VfsError::NotFound));
        assert_eq!(process.mkdir("/elsewhere", 0o755), Err(VfsError::NotFound));
        Ok(())
    }

    #[test]
    fn test_mknod_requires_superuser_for_devices() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/dev")?;
        fixture.root_process().chmod("/dev", 0o777)?;
        let user = fixture.user_process(1000, 1000);

        assert_eq!(
            user.mknod("/dev/sda", FileMode::new(FileMode::S_IFBLK | 0o600), (8, 0)),
            Err(VfsError::NotPermitted)
        );
        user.mknod("/dev/fifo", FileMode::new(FileMode::S_IFIFO | 0o600), (0, 0))?;
        assert_eq!(
            user.mknod("/dev/dir", FileMode::directory(0o755), (0, 0)),
            Err(VfsError::InvalidArgument)
        );

        let root = fixture.root_process();
        root.mknod("/dev/sda", FileMode::new(FileMode::S_IFBLK | 0o600), (8, 0))?;
        let metadata = root.stat("/dev/sda")?;
        assert!(metadata.mode.is_block_device());
        assert_eq!((metadata.major, metadata.minor), (8, 0));
        Ok(())
    }

    #[test]
    fn test_symlink_and_readlink() -> Result<()> {
        let fixture = Fixture::new()?;
        let process = fixture.root_process();
        process.symlink("/nowhere", "/dangling")?;
        assert_eq!(process.readlink("/dangling")?, "/nowhere");
        assert!(process.lstat("/dangling")?.is_symlink());
        assert_eq!(process.stat("/dangling").err(), Some(VfsError::NotFound));
        assert_eq!(process.symlink("/other", "/dangling"), Err(VfsError::Exists));
        assert_eq!(process.readlink("/"), Err(VfsError::InvalidArgument));
        Ok(())
    }

    #[test]
    fn test_symlink_target_must_be_visible() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/private")?;
        fixture.write_file("/private/secret", b"")?;
        fixture.mkdir("/tmp")?;
        let root = fixture.root_process();
        root.chmod("/private", 0o700)?;
        root.chmod("/tmp", 0o777)?;

        let user = fixture.user_process(1000, 1000);
        assert_eq!(
            user.symlink("/private/secret", "/tmp/secret"),
            Err(VfsError::AccessDenied)
        );
        assert_eq!(user.lstat("/tmp/secret").err(), Some(VfsError::NotFound));

        let mut veiled = fixture.root_process();
        veiled.unveil("/tmp", "rwc")?;
        veiled.unveil("/private", "b")?;
        assert_eq!(
            veiled.symlink("/private/secret", "/tmp/secret"),
            Err(VfsError::AccessDenied)
        );
        veiled.symlink("/tmp/later", "/tmp/dangling")?;
        assert_eq!(veiled.readlink("/tmp/dangling")?, "/tmp/later");

        fixture.write_file("/tmp/visible", b"")?;
        veiled.symlink("visible", "/tmp/relative")?;
        assert_eq!(
            veiled.symlink("../private/secret", "/tmp/sneaky"),
            Err(VfsError::AccessDenied)
        );
        Ok(())
    }

    #[test]
    fn test_hard_links() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.write_file("/file", b"shared")?;
        fixture.mkdir("/dir")?;
        let process = fixture.root_process();

        process.link("/file", "/alias")?;
        assert_eq!(process.stat("/file")?.link_count, 2);
        assert_eq!(fixture.read_file("/alias")?, b"shared");
        assert_eq!(process.link("/dir", "/dir2"), Err(VfsError::NotPermitted));
        assert_eq!(process.link("/file", "/alias"), Err(VfsError::Exists));

        fixture.mkdir("/mnt")?;
        fixture.mount_ramfs("/mnt")?;
        assert_eq!(process.link("/file", "/mnt/file"), Err(VfsError::CrossDevice));
        Ok(())
    }

    #[test]
    fn test_protected_hard_links() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/tmp")?;
        let root = fixture.root_process();
        root.chmod("/tmp", 0o777)?;
        fixture.write_file("/tmp/suid", b"")?;
        root.chmod("/tmp/suid", 0o4777)?;

        let user = fixture.user_process(1000, 1000);
        assert_eq!(user.link("/tmp/suid", "/tmp/copy"), Err(VfsError::NotPermitted));
        Ok(())
    }

    #[test]
    fn test_unlink() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.write_file("/file", b"")?;
        fixture.mkdir("/dir")?;
        let process = fixture.root_process();
        process.symlink("/dir", "/link")?;

        assert_eq!(process.unlink("/dir"), Err(VfsError::IsADirectory));
        process.unlink("/link")?;
        assert!(process.stat("/dir")?.is_directory());
        process.unlink("/file")?;
        assert_eq!(process.stat("/file").err(), Some(VfsError::NotFound));
        Ok(())
    }

    #[test]
    fn test_sticky_directory_protects_entries() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/tmp")?;
        fixture.root_process().chmod("/tmp", 0o1777)?;

        let owner = fixture.user_process(1000, 1000);
        owner.open("/tmp/mine", OpenOptions::WRITE | OpenOptions::CREATE, 0o666)?;
        let other = fixture.user_process(1001, 1001);
        assert_eq!(other.unlink("/tmp/mine"), Err(VfsError::AccessDenied));
        assert_eq!(
            other.rename("/tmp/mine", "/tmp/stolen"),
            Err(VfsError::AccessDenied)
        );
        owner.unlink("/tmp/mine")?;
        Ok(())
    }

    #[test]
    fn test_rmdir() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/full")?;
        fixture.write_file("/full/file", b"")?;
        fixture.mkdir("/empty")?;
        fixture.mkdir("/mnt")?;
        fixture.mount_ramfs("/mnt")?;
        let process = fixture.root_process();

        assert_eq!(process.rmdir("/full"), Err(VfsError::NotEmpty));
        assert_eq!(process.rmdir("/full/file"), Err(VfsError::NotADirectory));
        assert_eq!(process.rmdir("/"), Err(VfsError::Busy));
        assert_eq!(process.rmdir("/mnt"), Err(VfsError::Busy));
        assert_eq!(process.rmdir("/empty/."), Err(VfsError::InvalidArgument));
        assert_eq!(process.rmdir("/empty/.."), Err(VfsError::NotEmpty));
        process.rmdir("/empty")?;
        assert_eq!(process.stat("/empty").err(), Some(VfsError::NotFound));
        Ok(())
    }

    #[test]
    fn test_rename_rules() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/a")?;
        fixture.mkdir("/a/b")?;
        fixture.mkdir("/target")?;
        fixture.write_file("/target/keep", b"")?;
        fixture.write_file("/file", b"moved")?;
        let process = fixture.root_process();

        assert_eq!(process.rename("/a", "/a/b/c"), Err(VfsError::DirectoryIntoSelf));
        assert_eq!(process.rename("/a", "/target"), Err(VfsError::NotEmpty));
        assert_eq!(process.rename("/file", "/a"), Err(VfsError::IsADirectory));
        assert_eq!(process.rename("/a", "/file"), Err(VfsError::NotADirectory));
        assert_eq!(process.rename("/a/.", "/x"), Err(VfsError::InvalidArgument));
        let parent_before = process.stat("/")?;
        let file_before = process.stat("/file")?;
        process.rename("/file", "/file")?;
        let parent_after = process.stat("/")?;
        assert_eq!(
            (parent_after.mtime, parent_after.ctime),
            (parent_before.mtime, parent_before.ctime)
        );
        assert_eq!(process.stat("/file")?.ctime, file_before.ctime);
        assert_eq!(fixture.read_file("/file")?, b"moved");

        process.rename("/file", "/a/b/renamed")?;
        assert_eq!(fixture.read_file("/a/b/renamed")?, b"moved");
        assert_eq!(process.stat("/file").err(), Some(VfsError::NotFound));

        process.rename("/a/b", "/moved")?;
        assert_eq!(process.resolve("/moved/..", OpenOptions::empty())?.custody.absolute_path(), "/");
        Ok(())
    }

    #[test]
    fn test_rename_across_mounts() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/mnt")?;
        fixture.mount_ramfs("/mnt")?;
        fixture.write_file("/file", b"")?;
        let process = fixture.root_process();

        assert_eq!(process.rename("/file", "/mnt/file"), Err(VfsError::CrossDevice));
        assert_eq!(process.rename("/mnt", "/elsewhere"), Err(VfsError::Busy));

        fixture.mkdir("/empty")?;
        assert_eq!(process.rename("/empty", "/mnt"), Err(VfsError::Busy));
        assert!(process.stat("/empty")?.is_directory());
        assert_eq!(fixture.context.mount_count(), 2);
        fixture
            .manager
            .unmount(&fixture.context, process.credentials(), &fixture.custody("/mnt")?)?;
        assert_eq!(fixture.context.mount_count(), 1);
        Ok(())
    }

    #[test]
    fn test_chmod_and_chown() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.write_file("/tool", b"")?;
        let root = fixture.root_process();
        root.chmod("/tool", 0o6755)?;
        root.chown("/tool", Some(1000), Some(1000))?;

        let metadata = root.stat("/tool")?;
        assert_eq!((metadata.uid, metadata.gid), (1000, 1000));
        assert_eq!(metadata.mode.permissions(), 0o755);
        assert!(metadata.is_regular());

        let stranger = fixture.user_process(1001, 1001);
        assert_eq!(stranger.chmod("/tool", 0o777), Err(VfsError::NotPermitted));

        let owner = fixture.user_process(1000, 1000);
        owner.chmod("/tool", 0o700)?;
        assert_eq!(owner.chown("/tool", Some(0), None), Err(VfsError::NotPermitted));
        assert_eq!(owner.chown("/tool", None, Some(5)), Err(VfsError::NotPermitted));
        Ok(())
    }

    #[test]
    fn test_utime() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.write_file("/file", b"")?;
        let root = fixture.root_process();
        root.utime("/file", Some(100), Some(200))?;
        let metadata = root.stat("/file")?;
        assert_eq!((metadata.atime, metadata.mtime), (100, 200));

        let user = fixture.user_process(1000, 1000);
        assert_eq!(user.utime("/file", None, Some(1)), Err(VfsError::AccessDenied));
        Ok(())
    }

    #[test]
    fn test_chdir_and_relative_paths() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/home")?;
        fixture.write_file("/home/profile", b"settings")?;
        let mut process = fixture.root_process();
        process.chdir("/home")?;

        assert!(process.stat("profile")?.is_regular());
        assert_eq!(process.chdir("profile"), Err(VfsError::NotADirectory));
        Ok(())
    }

    #[test]
    fn test_list_directory() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/dir")?;
        fixture.write_file("/dir/a", b"")?;
        let process = fixture.root_process();

        let names: Vec<String> = process
            .list_directory("/dir")?
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec![".", "..", "a"]);
        assert_eq!(
            process.list_directory("/dir/a").err(),
            Some(VfsError::NotADirectory)
        );
        Ok(())
    }

    #[test]
    fn test_truncate() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.write_file("/file", b"0123456789")?;
        let process = fixture.root_process();
        process.truncate("/file", 4)?;
        assert_eq!(fixture.read_file("/file")?, b"0123");
        assert_eq!(process.truncate("/", 0), Err(VfsError::IsADirectory));
        assert_eq!(process.truncate("/file", u64::MAX), Err(VfsError::FileTooLarge));
        assert_eq!(fixture.read_file("/file")?, b"0123");
        Ok(())
    }

    #[test]
    fn test_veil_blocks_operations() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.mkdir("/ro")?;
        fixture.write_file("/ro/file", b"x")?;
        let mut process = fixture.root_process();
        process.unveil("/ro", "r")?;

        assert!(process.open("/ro/file", OpenOptions::READ, 0).is_ok());
        assert_eq!(
            process.open("/ro/file", OpenOptions::WRITE, 0).err(),
            Some(VfsError::AccessDenied)
        );
        assert_eq!(process.unlink("/ro/file"), Err(VfsError::AccessDenied));
        assert_eq!(
            process.open("/ro/new", OpenOptions::WRITE | OpenOptions::CREATE, 0o644).err(),
            Some(VfsError::AccessDenied)
        );
        Ok(())
    }
}
