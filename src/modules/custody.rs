use super::inode::{Inode, InodeIdentifier};
use super::namespace::MountFlags;
use std::fmt;
use std::sync::Arc;

/// One step of a resolved absolute path.
///
/// Custodies are immutable once built and only ever point at their parent,
/// so a chain is always acyclic. A custody without a parent is a namespace
/// root.
pub struct Custody {
    parent: Option<Arc<Custody>>,
    name: String,
    inode: Arc<dyn Inode>,
    mount_flags: MountFlags,
}

impl Custody {
    pub fn root(inode: Arc<dyn Inode>, mount_flags: MountFlags) -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            name: String::new(),
            inode,
            mount_flags,
        })
    }

    pub fn new(
        parent: Option<Arc<Custody>>,
        name: &str,
        inode: Arc<dyn Inode>,
        mount_flags: MountFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            parent,
            name: name.to_string(),
            inode,
            mount_flags,
        })
    }

    pub fn parent(&self) -> Option<&Arc<Custody>> {
        self.parent.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> &Arc<dyn Inode> {
        &self.inode
    }

    pub fn identifier(&self) -> InodeIdentifier {
        self.inode.identifier()
    }

    pub fn mount_flags(&self) -> MountFlags {
        self.mount_flags
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_readonly(&self) -> bool {
        self.mount_flags.contains(MountFlags::READ_ONLY)
    }

    pub fn absolute_path(&self) -> String {
        let mut names = Vec::new();
        let mut current = Some(self);
        while let Some(custody) = current {
            if custody.parent.is_some() {
                names.push(custody.name.as_str());
            }
            current = custody.parent.as_deref();
        }
        if names.is_empty() {
            return "/".to_string();
        }
        names.iter().rev().fold(String::new(), |mut path, name| {
            path.push('/');
            path.push_str(name);
            path
        })
    }

    /// Whether `ancestor` appears on this custody's parent chain, itself included.
    pub fn is_descendant_of(&self, ancestor: InodeIdentifier) -> bool {
        let mut current = Some(self);
        while let Some(custody) = current {
            if custody.identifier() == ancestor {
                return true;
            }
            current = custody.parent.as_deref();
        }
        false
    }
}

impl fmt::Debug for Custody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Custody")
            .field("path", &self.absolute_path())
            .field("inode", &self.identifier())
            .field("mount_flags", &self.mount_flags)
            .finish()
    }
}
