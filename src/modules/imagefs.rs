//! File-backed filesystem persisted as a JSON image.

use super::constants::{DEFAULT_DIRECTORY_PERMISSION, IMAGE_FORMAT_VERSION, ROOT_INODE_INDEX};
use super::description::OpenFileDescription;
use super::error::{VfsError, VfsResult};
use super::fstype::{flag_option, string_option, MountOptions};
use super::inode::{FileMode, FileSystem, FileSystemId, Inode};
use super::ramfs::{NodeStore, RamInode, RamNode, StoreSnapshot};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// On-disk layout of an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDocument {
    pub format: u32,
    #[serde(default)]
    pub label: Option<String>,
    pub next_index: u64,
    pub nodes: BTreeMap<u64, RamNode>,
}

pub struct ImageFileSystem {
    store: Arc<NodeStore>,
    description: Arc<OpenFileDescription>,
    label: Option<String>,
}

impl ImageFileSystem {
    /// Parses the backing image, or starts an empty one when the backing file
    /// is empty or the `format` option is set.
    pub fn create(
        fsid: FileSystemId,
        description: Arc<OpenFileDescription>,
        options: &MountOptions,
    ) -> VfsResult<Arc<dyn FileSystem>> {
        let format = flag_option(options, "format")?.unwrap_or(false);
        let data = description.read_all()?;

        let (store, stored_label) = if format || data.iter().all(u8::is_ascii_whitespace) {
            debug!("Formatting new image in {}", description.path().display());
            let store = NodeStore::new(
                fsid,
                FileMode::directory(DEFAULT_DIRECTORY_PERMISSION),
                0,
                0,
            );
            if description.is_writable() {
                store.mark_dirty();
            }
            (store, None)
        } else {
            let document: ImageDocument = serde_json::from_slice(&data).map_err(|e| {
                warn!("Corrupt image {}: {}", description.path().display(), e);
                VfsError::InvalidArgument
            })?;
            if document.format != IMAGE_FORMAT_VERSION {
                return Err(VfsError::NotSupported);
            }
            let snapshot = StoreSnapshot {
                next_index: document.next_index,
                nodes: document.nodes,
            };
            (NodeStore::from_snapshot(fsid, snapshot), document.label)
        };

        let label = string_option(options, "label")?.or(stored_label);
        Ok(Arc::new(Self {
            store: Arc::new(store),
            description,
            label,
        }))
    }
}

impl FileSystem for ImageFileSystem {
    fn fsid(&self) -> FileSystemId {
        self.store.fsid()
    }

    fn class_name(&self) -> &'static str {
        "ImageFS"
    }

    fn root_inode(&self) -> Arc<dyn Inode> {
        RamInode::new(Arc::clone(&self.store), ROOT_INODE_INDEX)
    }

    fn initialize(&self) -> VfsResult<()> {
        let root = self.store.metadata(ROOT_INODE_INDEX)?;
        if !root.is_directory() {
            return Err(VfsError::InvalidArgument);
        }
        Ok(())
    }

    fn prepare_to_unmount(&self, _guest: &dyn Inode) -> VfsResult<()> {
        self.flush_writes()
    }

    fn flush_writes(&self) -> VfsResult<()> {
        if !self.store.take_dirty() {
            return Ok(());
        }
        let snapshot = self.store.snapshot();
        let document = ImageDocument {
            format: IMAGE_FORMAT_VERSION,
            label: self.label.clone(),
            next_index: snapshot.next_index,
            nodes: snapshot.nodes,
        };
        let result = serde_json::to_vec_pretty(&document)
            .map_err(|_| VfsError::Io)
            .and_then(|bytes| self.description.replace_contents(&bytes));
        if result.is_err() {
            self.store.mark_dirty();
        }
        result
    }
}
