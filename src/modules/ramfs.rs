//! In-memory filesystem driver.
//!
//! The node table ([`NodeStore`]) is shared with `imagefs`, which persists
//! the same table as a JSON image.

use super::constants::{
    DEFAULT_DIRECTORY_PERMISSION, MAX_FILE_SIZE, MAX_NAME_LEN, ROOT_INODE_INDEX,
};
use super::error::{VfsError, VfsResult};
use super::fstype::{unsigned_option, MountOptions};
use super::inode::{
    DirectoryEntry, FileMode, FileSystem, FileSystemId, Inode, InodeIdentifier, InodeMetadata,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Grows or shrinks `data` to `size` bytes, zero-filling new space.
fn resize(data: &mut Vec<u8>, size: u64) -> VfsResult<()> {
    if size > MAX_FILE_SIZE {
        return Err(VfsError::FileTooLarge);
    }
    let size = usize::try_from(size).map_err(|_| VfsError::FileTooLarge)?;
    if size > data.len() {
        data
            .try_reserve(size - data.len())
            .map_err(|_| VfsError::FileTooLarge)?;
    }
    data.resize(size, 0);
    Ok(())
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn validate_name(name: &str) -> VfsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(VfsError::InvalidArgument);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VfsError::NameTooLong);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum NodeBody {
    Directory(BTreeMap<String, u64>),
    File(Vec<u8>),
    Symlink(String),
    Special,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamNode {
    pub mode: FileMode,
    pub uid: u32,
    pub gid: u32,
    /// Number of directory entries naming this node.
    pub links: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    #[serde(default)]
    pub device: (u32, u32),
    /// Containing directory; the root is its own parent.
    pub parent: u64,
    pub body: NodeBody,
}

/// Serialisable copy of a node table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub next_index: u64,
    pub nodes: BTreeMap<u64, RamNode>,
}

struct StoreState {
    nodes: BTreeMap<u64, RamNode>,
    next_index: u64,
}

impl StoreState {
    fn node(&self, index: u64) -> VfsResult<&RamNode> {
        self.nodes.get(&index).ok_or(VfsError::NotFound)
    }

    fn node_mut(&mut self, index: u64) -> VfsResult<&mut RamNode> {
        self.nodes.get_mut(&index).ok_or(VfsError::NotFound)
    }

    fn directory(&self, index: u64) -> VfsResult<&BTreeMap<String, u64>> {
        match &self.node(index)?.body {
            NodeBody::Directory(entries) => Ok(entries),
            _ => Err(VfsError::NotADirectory),
        }
    }

    fn directory_mut(&mut self, index: u64) -> VfsResult<&mut BTreeMap<String, u64>> {
        match &mut self.node_mut(index)?.body {
            NodeBody::Directory(entries) => Ok(entries),
            _ => Err(VfsError::NotADirectory),
        }
    }

    fn touch_directory(&mut self, index: u64) -> VfsResult<()> {
        let node = self.node_mut(index)?;
        let stamp = now();
        node.mtime = stamp;
        node.ctime = stamp;
        Ok(())
    }
}

/// Node table of one filesystem instance.
pub struct NodeStore {
    fsid: FileSystemId,
    state: Mutex<StoreState>,
    dirty: AtomicBool,
}

impl NodeStore {
    /// Creates a table holding only the root directory.
    pub fn new(fsid: FileSystemId, root_mode: FileMode, uid: u32, gid: u32) -> Self {
        let stamp = now();
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_INODE_INDEX,
            RamNode {
                mode: FileMode::directory(root_mode.permissions()),
                uid,
                gid,
                links: 1,
                atime: stamp,
                mtime: stamp,
                ctime: stamp,
                device: (0, 0),
                parent: ROOT_INODE_INDEX,
                body: NodeBody::Directory(BTreeMap::new()),
            },
        );
        Self {
            fsid,
            state: Mutex::new(StoreState {
                nodes,
                next_index: ROOT_INODE_INDEX + 1,
            }),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn from_snapshot(fsid: FileSystemId, snapshot: StoreSnapshot) -> Self {
        Self {
            fsid,
            state: Mutex::new(StoreState {
                nodes: snapshot.nodes,
                next_index: snapshot.next_index,
            }),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock();
        StoreSnapshot {
            next_index: state.next_index,
            nodes: state.nodes.clone(),
        }
    }

    pub fn fsid(&self) -> FileSystemId {
        self.fsid
    }

    /// Clears the dirty flag, returning its previous value.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn metadata(&self, index: u64) -> VfsResult<InodeMetadata> {
        let state = self.state.lock();
        let node = state.node(index)?;
        let (size, link_count) = match &node.body {
            NodeBody::Directory(entries) => {
                let subdirectories = entries
                    .values()
                    .filter(|child| {
                        state
                            .nodes
                            .get(child)
                            .is_some_and(|n| n.mode.is_directory())
                    })
                    .count() as u32;
                (entries.len() as u64, 2 + subdirectories)
            }
            NodeBody::File(data) => (data.len() as u64, node.links),
            NodeBody::Symlink(target) => (target.len() as u64, node.links),
            NodeBody::Special => (0, node.links),
        };
        Ok(InodeMetadata {
            inode: InodeIdentifier::new(self.fsid, index),
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            size,
            link_count,
            major: node.device.0,
            minor: node.device.1,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
        })
    }

    pub fn lookup(&self, dir: u64, name: &str) -> VfsResult<u64> {
        let state = self.state.lock();
        let entries = state.directory(dir)?;
        match name {
            "." => Ok(dir),
            ".." => Ok(state.node(dir)?.parent),
            _ => entries.get(name).copied().ok_or(VfsError::NotFound),
        }
    }

    pub fn entries(&self, dir: u64) -> VfsResult<Vec<DirectoryEntry>> {
        let state = self.state.lock();
        let entries = state.directory(dir)?;
        let parent = state.node(dir)?.parent;
        let dir_type = FileMode::S_IFDIR;

        let mut listing = vec![
            DirectoryEntry {
                name: ".".to_string(),
                inode: InodeIdentifier::new(self.fsid, dir),
                file_type: dir_type,
            },
            DirectoryEntry {
                name: "..".to_string(),
                inode: InodeIdentifier::new(self.fsid, parent),
                file_type: dir_type,
            },
        ];
        for (name, &child) in entries {
            let file_type = state.node(child)?.mode.file_type();
            listing.push(DirectoryEntry {
                name: name.clone(),
                inode: InodeIdentifier::new(self.fsid, child),
                file_type,
            });
        }
        Ok(listing)
    }

    pub fn create(
        &self,
        dir: u64,
        name: &str,
        mode: FileMode,
        device: (u32, u32),
        uid: u32,
        gid: u32,
    ) -> VfsResult<u64> {
        validate_name(name)?;
        let mut state = self.state.lock();
        if state.directory(dir)?.contains_key(name) {
            return Err(VfsError::Exists);
        }

        let index = state.next_index;
        state.next_index += 1;

        let body = if mode.is_directory() {
            NodeBody::Directory(BTreeMap::new())
        } else if mode.is_regular() {
            NodeBody::File(Vec::new())
        } else if mode.is_symlink() {
            NodeBody::Symlink(String::new())
        } else {
            NodeBody::Special
        };
        let stamp = now();
        state.nodes.insert(
            index,
            RamNode {
                mode,
                uid,
                gid,
                links: 1,
                atime: stamp,
                mtime: stamp,
                ctime: stamp,
                device,
                parent: dir,
                body,
            },
        );
        state.directory_mut(dir)?.insert(name.to_string(), index);
        state.touch_directory(dir)?;
        self.mark_dirty();
        Ok(index)
    }

    pub fn add(&self, dir: u64, child: u64, name: &str) -> VfsResult<()> {
        validate_name(name)?;
        let mut state = self.state.lock();
        state.node(child)?;
        if state.directory(dir)?.contains_key(name) {
            return Err(VfsError::Exists);
        }
        state.directory_mut(dir)?.insert(name.to_string(), child);
        let node = state.node_mut(child)?;
        node.links += 1;
        node.ctime = now();
        if node.mode.is_directory() {
            node.parent = dir;
        }
        state.touch_directory(dir)?;
        self.mark_dirty();
        Ok(())
    }

    pub fn remove(&self, dir: u64, name: &str) -> VfsResult<()> {
        if name == "." || name == ".." {
            return Err(VfsError::InvalidArgument);
        }
        let mut state = self.state.lock();
        let child = *state
            .directory(dir)?
            .get(name)
            .ok_or(VfsError::NotFound)?;

        let node = state.node(child)?;
        if node.links == 1 {
            if let NodeBody::Directory(entries) = &node.body {
                if !entries.is_empty() {
                    return Err(VfsError::NotEmpty);
                }
            }
        }

        state.directory_mut(dir)?.remove(name);
        state.touch_directory(dir)?;
        let node = state.node_mut(child)?;
        node.links -= 1;
        node.ctime = now();
        if node.links == 0 {
            state.nodes.remove(&child);
        }
        self.mark_dirty();
        Ok(())
    }

    fn modify(&self, index: u64, f: impl FnOnce(&mut RamNode) -> VfsResult<()>) -> VfsResult<()> {
        let mut state = self.state.lock();
        let node = state.node_mut(index)?;
        f(node)?;
        node.ctime = now();
        self.mark_dirty();
        Ok(())
    }

    pub fn truncate(&self, index: u64, size: u64) -> VfsResult<()> {
        self.modify(index, |node| match &mut node.body {
            NodeBody::File(data) => {
                resize(data, size)?;
                node.mtime = now();
                Ok(())
            }
            NodeBody::Directory(_) => Err(VfsError::IsADirectory),
            _ => Err(VfsError::InvalidArgument),
        })
    }

    pub fn chmod(&self, index: u64, mode: FileMode) -> VfsResult<()> {
        self.modify(index, |node| {
            node.mode = node.mode.with_permissions(mode.permissions());
            Ok(())
        })
    }

    pub fn chown(&self, index: u64, uid: u32, gid: u32) -> VfsResult<()> {
        self.modify(index, |node| {
            node.uid = uid;
            node.gid = gid;
            Ok(())
        })
    }

    pub fn set_times(&self, index: u64, atime: Option<i64>, mtime: Option<i64>) -> VfsResult<()> {
        self.modify(index, |node| {
            if let Some(atime) = atime {
                node.atime = atime;
            }
            if let Some(mtime) = mtime {
                node.mtime = mtime;
            }
            Ok(())
        })
    }

    pub fn read_link(&self, index: u64) -> VfsResult<String> {
        let state = self.state.lock();
        match &state.node(index)?.body {
            NodeBody::Symlink(target) => Ok(target.clone()),
            _ => Err(VfsError::InvalidArgument),
        }
    }

    pub fn read(&self, index: u64, offset: u64, buffer: &mut [u8]) -> VfsResult<usize> {
        let state = self.state.lock();
        let data = match &state.node(index)?.body {
            NodeBody::File(data) => data.as_slice(),
            NodeBody::Symlink(target) => target.as_bytes(),
            NodeBody::Directory(_) => return Err(VfsError::IsADirectory),
            NodeBody::Special => return Err(VfsError::InvalidArgument),
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let count = buffer.len().min(data.len() - start);
        buffer[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    pub fn write(&self, index: u64, offset: u64, bytes: &[u8]) -> VfsResult<usize> {
        fn splice(data: &mut Vec<u8>, offset: u64, bytes: &[u8]) -> VfsResult<()> {
            let end = offset
                .checked_add(bytes.len() as u64)
                .ok_or(VfsError::FileTooLarge)?;
            if (data.len() as u64) < end {
                resize(data, end)?;
            }
            // Both bounds fit in usize once the resize above succeeded.
            let (start, end) = (offset as usize, end as usize);
            data[start..end].copy_from_slice(bytes);
            Ok(())
        }

        self.modify(index, |node| {
            match &mut node.body {
                NodeBody::File(data) => splice(data, offset, bytes)?,
                NodeBody::Symlink(target) => {
                    let mut data = target.clone().into_bytes();
                    splice(&mut data, offset, bytes)?;
                    *target = String::from_utf8_lossy(&data).into_owned();
                }
                NodeBody::Directory(_) => return Err(VfsError::IsADirectory),
                NodeBody::Special => return Err(VfsError::InvalidArgument),
            }
            node.mtime = now();
            Ok(())
        })?;
        Ok(bytes.len())
    }
}

/// Handle to one node of a [`NodeStore`].
pub struct RamInode {
    store: Arc<NodeStore>,
    index: u64,
}

impl RamInode {
    pub fn new(store: Arc<NodeStore>, index: u64) -> Arc<dyn Inode> {
        Arc::new(Self { store, index })
    }

    fn handle(&self, index: u64) -> Arc<dyn Inode> {
        Self::new(Arc::clone(&self.store), index)
    }
}

impl Inode for RamInode {
    fn identifier(&self) -> InodeIdentifier {
        InodeIdentifier::new(self.store.fsid(), self.index)
    }

    fn metadata(&self) -> InodeMetadata {
        self.store.metadata(self.index).unwrap_or_else(|_| InodeMetadata {
            // Unlinked while still referenced.
            inode: self.identifier(),
            mode: FileMode::new(0),
            uid: 0,
            gid: 0,
            size: 0,
            link_count: 0,
            major: 0,
            minor: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        })
    }

    fn lookup(&self, name: &str) -> VfsResult<Arc<dyn Inode>> {
        let index = self.store.lookup(self.index, name)?;
        Ok(self.handle(index))
    }

    fn traverse_as_directory(
        &self,
        callback: &mut dyn FnMut(&DirectoryEntry) -> bool,
    ) -> VfsResult<()> {
        for entry in self.store.entries(self.index)? {
            if !callback(&entry) {
                break;
            }
        }
        Ok(())
    }

    fn create_child(
        &self,
        name: &str,
        mode: FileMode,
        device: (u32, u32),
        uid: u32,
        gid: u32,
    ) -> VfsResult<Arc<dyn Inode>> {
        let index = self.store.create(self.index, name, mode, device, uid, gid)?;
        Ok(self.handle(index))
    }

    fn add_child(&self, child: &Arc<dyn Inode>, name: &str) -> VfsResult<()> {
        let id = child.identifier();
        if id.fsid != self.store.fsid() {
            return Err(VfsError::CrossDevice);
        }
        self.store.add(self.index, id.index, name)
    }

    fn remove_child(&self, name: &str) -> VfsResult<()> {
        self.store.remove(self.index, name)
    }

    fn truncate(&self, size: u64) -> VfsResult<()> {
        self.store.truncate(self.index, size)
    }

    fn chmod(&self, mode: FileMode) -> VfsResult<()> {
        self.store.chmod(self.index, mode)
    }

    fn chown(&self, uid: u32, gid: u32) -> VfsResult<()> {
        self.store.chown(self.index, uid, gid)
    }

    fn set_times(&self, atime: Option<i64>, mtime: Option<i64>) -> VfsResult<()> {
        self.store.set_times(self.index, atime, mtime)
    }

    fn read_link(&self) -> VfsResult<String> {
        self.store.read_link(self.index)
    }

    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> VfsResult<usize> {
        self.store.read(self.index, offset, buffer)
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> VfsResult<usize> {
        self.store.write(self.index, offset, data)
    }
}

/// Sourceless in-memory filesystem.
pub struct RamFileSystem {
    store: Arc<NodeStore>,
}

impl RamFileSystem {
    pub fn new(fsid: FileSystemId, root_mode: FileMode, uid: u32, gid: u32) -> Self {
        Self {
            store: Arc::new(NodeStore::new(fsid, root_mode, uid, gid)),
        }
    }

    /// Constructor registered in the filesystem type table.
    ///
    /// # Arguments
    ///
    /// * `fsid` - Identifier allocated by the registry
    /// * `options` - Accepts `mode`, `uid` and `gid`
    pub fn create(fsid: FileSystemId, options: &MountOptions) -> VfsResult<Arc<dyn FileSystem>> {
        let mode = match unsigned_option(options, "mode")? {
            Some(mode) => u16::try_from(mode).map_err(|_| VfsError::InvalidArgument)?,
            None => DEFAULT_DIRECTORY_PERMISSION,
        };
        let uid = match unsigned_option(options, "uid")? {
            Some(uid) => u32::try_from(uid).map_err(|_| VfsError::InvalidArgument)?,
            None => 0,
        };
        let gid = match unsigned_option(options, "gid")? {
            Some(gid) => u32::try_from(gid).map_err(|_| VfsError::InvalidArgument)?,
            None => 0,
        };
        Ok(Arc::new(Self::new(fsid, FileMode::directory(mode), uid, gid)))
    }
}

impl FileSystem for RamFileSystem {
    fn fsid(&self) -> FileSystemId {
        self.store.fsid()
    }

    fn class_name(&self) -> &'static str {
        "RAMFS"
    }

    fn root_inode(&self) -> Arc<dyn Inode> {
        RamInode::new(Arc::clone(&self.store), ROOT_INODE_INDEX)
    }
}
