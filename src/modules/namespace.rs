use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::custody::Custody;
use super::error::{VfsError, VfsResult};
use super::inode::{FileSystemId, Inode, InodeIdentifier};
use super::registry::FileSystemInstance;
use super::sync::{LockRank, SpinLock};

bitflags! {
    /// Per-mount flags, inherited by every custody below the mount.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MountFlags: u32 {
        const READ_ONLY = 1 << 0;
        const NO_DEVICE_NODES = 1 << 1;
        const NO_EXEC = 1 << 2;
        const NO_REGULAR_FILES = 1 << 3;
    }
}

pub type MountId = u32;

/// A guest inode made visible at a host location.
#[derive(Clone)]
pub struct Mount {
    /// Identifier unique within its context
    pub id: MountId,
    /// Inode shown at the mount point
    pub guest: Arc<dyn Inode>,
    /// Filesystem the guest belongs to
    pub instance: Arc<FileSystemInstance>,
    /// Mount point; `None` for the root mount
    pub host: Option<Arc<Custody>>,
    pub flags: MountFlags,
    pub is_bind: bool,
}

impl Mount {
    pub fn host_identifier(&self) -> Option<InodeIdentifier> {
        self.host.as_ref().map(|host| host.identifier())
    }

    pub fn guest_identifier(&self) -> InodeIdentifier {
        self.guest.identifier()
    }

    pub fn info(&self) -> MountInfo {
        MountInfo {
            id: self.id,
            fsid: self.instance.fsid(),
            filesystem: self.instance.type_name().to_string(),
            source: self
                .instance
                .description()
                .map(|d| d.path().display().to_string()),
            mount_point: self
                .host
                .as_ref()
                .map_or_else(|| "/".to_string(), |host| host.absolute_path()),
            flags: self.flags,
            bind: self.is_bind,
        }
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("guest", &self.guest_identifier())
            .field("host", &self.host_identifier())
            .field("flags", &self.flags)
            .field("is_bind", &self.is_bind)
            .finish()
    }
}

/// Serialisable description of a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub id: MountId,
    pub fsid: FileSystemId,
    pub filesystem: String,
    pub source: Option<String>,
    pub mount_point: String,
    pub flags: MountFlags,
    pub bind: bool,
}

struct ContextState {
    mounts: Vec<Arc<Mount>>,
    root_custody: Arc<Custody>,
    next_mount_id: MountId,
}

impl ContextState {
    fn allocate_id(&mut self) -> MountId {
        let id = self.next_mount_id;
        self.next_mount_id += 1;
        id
    }
}

/// An isolated mount table plus its root.
pub struct NamespaceContext {
    id: Uuid,
    state: SpinLock<ContextState>,
    attach_count: AtomicUsize,
}

impl NamespaceContext {
    /// Creates a context whose root is `instance`'s root inode.
    ///
    /// # Arguments
    ///
    /// * `instance` - Filesystem to use as root; its mount is already counted
    /// * `flags` - Flags of the root mount
    pub fn new(instance: Arc<FileSystemInstance>, flags: MountFlags) -> Arc<Self> {
        let guest = instance.root_inode();
        let root_mount = Arc::new(Mount {
            id: 1,
            guest: Arc::clone(&guest),
            instance,
            host: None,
            flags,
            is_bind: false,
        });
        Arc::new(Self {
            id: Uuid::new_v4(),
            state: SpinLock::new(
                LockRank::MountList,
                ContextState {
                    mounts: vec![root_mount],
                    root_custody: Custody::root(guest, flags),
                    next_mount_id: 2,
                },
            ),
            attach_count: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root_custody(&self) -> Arc<Custody> {
        Arc::clone(&self.state.lock().root_custody)
    }

    pub fn attach(&self) {
        self.attach_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn detach(&self) {
        self.attach_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn attach_count(&self) -> usize {
        self.attach_count.load(Ordering::Acquire)
    }

    /// Substitutes mount guests for `inode`, following stacked mounts.
    ///
    /// The newest mount on a host wins. The walk is bounded by the number of
    /// mounts so a guest mounted onto itself cannot loop.
    pub fn cross_mounts(
        &self,
        inode: Arc<dyn Inode>,
        flags: MountFlags,
    ) -> (Arc<dyn Inode>, MountFlags) {
        let state = self.state.lock();
        let mut current = (inode, flags);
        for _ in 0..state.mounts.len() {
            let identifier = current.0.identifier();
            let Some(mount) = state
                .mounts
                .iter()
                .rev()
                .find(|mount| mount.host_identifier() == Some(identifier))
            else {
                break;
            };
            if mount.guest_identifier() == identifier {
                current.1 = mount.flags;
                break;
            }
            current = (Arc::clone(&mount.guest), mount.flags);
        }
        current
    }

    /// Records a new mount and returns its identifier.
    pub fn add_mount(
        &self,
        guest: Arc<dyn Inode>,
        instance: Arc<FileSystemInstance>,
        host: Arc<Custody>,
        flags: MountFlags,
        is_bind: bool,
    ) -> MountId {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.mounts.push(Arc::new(Mount {
            id,
            guest,
            instance,
            host: Some(host),
            flags,
            is_bind,
        }));
        id
    }

    /// Mount whose guest is shown at `custody`.
    ///
    /// One guest can be visible at several points, so a mount whose mount
    /// point matches the custody's path is preferred over any other mount of
    /// the same guest.
    pub fn find_mount_for(&self, custody: &Custody) -> Option<Arc<Mount>> {
        let identifier = custody.identifier();
        let path = custody.absolute_path();
        let state = self.state.lock();
        let mut candidates = state
            .mounts
            .iter()
            .rev()
            .filter(|mount| mount.guest_identifier() == identifier);

        candidates
            .clone()
            .find(|mount| match &mount.host {
                Some(host) => host.absolute_path() == path,
                None => custody.is_root(),
            })
            .or_else(|| candidates.next())
            .cloned()
    }

    pub fn find_mount(&self, id: MountId) -> Option<Arc<Mount>> {
        self.state
            .lock()
            .mounts
            .iter()
            .find(|mount| mount.id == id)
            .cloned()
    }

    pub fn remove_mount(&self, id: MountId) -> Option<Arc<Mount>> {
        let mut state = self.state.lock();
        let position = state.mounts.iter().position(|mount| mount.id == id)?;
        Some(state.mounts.remove(position))
    }

    /// Replaces the flags of a mount in place.
    pub fn set_mount_flags(&self, id: MountId, flags: MountFlags) -> VfsResult<()> {
        let mut state = self.state.lock();
        let position = state
            .mounts
            .iter()
            .position(|mount| mount.id == id)
            .ok_or(VfsError::InvalidArgument)?;

        let mut updated = Mount::clone(&state.mounts[position]);
        updated.flags = flags;
        if updated.host.is_none() {
            state.root_custody = Custody::root(Arc::clone(&updated.guest), flags);
        }
        state.mounts[position] = Arc::new(updated);
        Ok(())
    }

    /// Makes `guest` the new root and prunes every mount no longer reachable
    /// from it. Returns the new root mount's id and the removed mounts; their
    /// instances still need to be released by the caller.
    pub fn swap_root(
        &self,
        guest: Arc<dyn Inode>,
        instance: Arc<FileSystemInstance>,
        flags: MountFlags,
        is_bind: bool,
    ) -> (MountId, Vec<Arc<Mount>>) {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let new_root = Arc::new(Mount {
            id,
            guest: Arc::clone(&guest),
            instance,
            host: None,
            flags,
            is_bind,
        });

        let mut reachable = vec![guest.identifier().fsid];
        loop {
            let before = reachable.len();
            for mount in &state.mounts {
                let Some(host) = mount.host_identifier() else {
                    continue;
                };
                let fsid = mount.guest_identifier().fsid;
                if reachable.contains(&host.fsid) && !reachable.contains(&fsid) {
                    reachable.push(fsid);
                }
            }
            if reachable.len() == before {
                break;
            }
        }

        let (kept, removed): (Vec<_>, Vec<_>) = state.mounts.drain(..).partition(|mount| {
            mount
                .host_identifier()
                .is_some_and(|host| reachable.contains(&host.fsid))
        });
        state.mounts = std::iter::once(new_root).chain(kept).collect();
        state.root_custody = Custody::root(guest, flags);
        (id, removed)
    }

    /// Every mount, root mount first.
    pub fn all_mounts(&self) -> Vec<Arc<Mount>> {
        self.state.lock().mounts.clone()
    }

    pub fn mounts(&self) -> Vec<MountInfo> {
        self.all_mounts().iter().map(|mount| mount.info()).collect()
    }

    pub fn mount_count(&self) -> usize {
        self.state.lock().mounts.len()
    }

    /// Whether some mount shows `identifier` as its guest.
    pub fn is_mount_guest(&self, identifier: InodeIdentifier) -> bool {
        self.state
            .lock()
            .mounts
            .iter()
            .any(|mount| mount.guest_identifier() == identifier)
    }

    /// Number of mounts whose mount point lies on filesystem `fsid`.
    pub fn mounts_hosted_on(&self, fsid: FileSystemId) -> usize {
        self.state
            .lock()
            .mounts
            .iter()
            .filter(|mount| mount.host_identifier().is_some_and(|host| host.fsid == fsid))
            .count()
    }
}

impl std::fmt::Debug for NamespaceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceContext")
            .field("id", &self.id)
            .field("attach_count", &self.attach_count())
            .finish_non_exhaustive()
    }
}
