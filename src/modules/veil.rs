//! Per-process path veil.
//!
//! A veil is a trie of path components. Each explicitly unveiled node
//! carries a permission set; a path is judged by the longest explicitly
//! unveiled prefix covering it. Once anything is unveiled the process stays
//! veiled for good, and later declarations may only narrow what an
//! enclosing declaration already grants.

use super::error::{VfsError, VfsResult};
use super::resolver::OpenOptions;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UnveilAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const CREATE_OR_REMOVE = 1 << 3;
        const BROWSE = 1 << 4;
    }
}

impl UnveilAccess {
    /// Parses permission letters (`r`, `w`, `x`, `c`, `b`).
    pub fn parse(letters: &str) -> VfsResult<Self> {
        letters.chars().try_fold(Self::empty(), |access, letter| {
            let bit = match letter {
                'r' => Self::READ,
                'w' => Self::WRITE,
                'x' => Self::EXECUTE,
                'c' => Self::CREATE_OR_REMOVE,
                'b' => Self::BROWSE,
                _ => return Err(VfsError::InvalidArgument),
            };
            Ok(access | bit)
        })
    }

    pub fn letters(&self) -> String {
        [
            (Self::READ, 'r'),
            (Self::WRITE, 'w'),
            (Self::EXECUTE, 'x'),
            (Self::CREATE_OR_REMOVE, 'c'),
            (Self::BROWSE, 'b'),
        ]
        .iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, letter)| *letter)
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VeilState {
    /// Nothing unveiled yet; every path is visible.
    #[default]
    None,
    /// Declarations present; further narrowing allowed.
    Dropped,
    /// Sealed; no further declarations.
    Locked,
}

/// One explicit declaration, as reported by [`Veil::entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnveilEntry {
    pub path: String,
    pub permissions: String,
}

#[derive(Debug, Default, Clone)]
struct UnveilNode {
    permissions: UnveilAccess,
    explicitly_unveiled: bool,
    children: BTreeMap<String, UnveilNode>,
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty() && *part != ".")
}

#[derive(Debug, Default, Clone)]
pub struct Veil {
    state: VeilState,
    root: UnveilNode,
}

impl Veil {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> VeilState {
        self.state
    }

    // Longest explicitly unveiled prefix of `path`, or the bare root.
    fn longest_unveiled_prefix(&self, path: &str) -> &UnveilNode {
        let mut best = &self.root;
        let mut node = &self.root;
        for part in components(path) {
            match node.children.get(part) {
                Some(child) => {
                    node = child;
                    if child.explicitly_unveiled {
                        best = child;
                    }
                }
                None => break,
            }
        }
        best
    }

    /// Declares `permissions` for the canonical absolute `path`.
    pub fn unveil(&mut self, path: &str, permissions: &str) -> VfsResult<()> {
        if self.state == VeilState::Locked {
            return Err(VfsError::NotPermitted);
        }
        let access = UnveilAccess::parse(permissions)?;
        if !path.starts_with('/') {
            return Err(VfsError::InvalidArgument);
        }

        let covering = self.longest_unveiled_prefix(path);
        if covering.explicitly_unveiled && !covering.permissions.contains(access) {
            return Err(VfsError::NotPermitted);
        }

        let mut node = &mut self.root;
        for part in components(path) {
            node = node.children.entry(part.to_string()).or_default();
        }
        node.permissions = access;
        node.explicitly_unveiled = true;
        self.state = VeilState::Dropped;
        Ok(())
    }

    /// Seals the veil. Sealing a veil with no declarations hides everything.
    pub fn lock(&mut self) {
        self.state = VeilState::Locked;
    }

    /// Permission set governing `path`, or `None` when unveiling never happened.
    pub fn permissions_for(&self, path: &str) -> Option<UnveilAccess> {
        match self.state {
            VeilState::None => None,
            _ => Some(self.longest_unveiled_prefix(path).permissions),
        }
    }

    /// Judges an access to the absolute `path` with the given open options.
    pub fn check(&self, path: &str, options: OpenOptions) -> VfsResult<()> {
        let Some(access) = self.permissions_for(path) else {
            return Ok(());
        };
        if access.is_empty() {
            return Err(VfsError::NotFound);
        }

        if options.contains(OpenOptions::CREATE) && !access.contains(UnveilAccess::CREATE_OR_REMOVE) {
            return Err(VfsError::AccessDenied);
        }
        if options.contains(OpenOptions::UNLINK_INTERNAL) {
            if !access.contains(UnveilAccess::CREATE_OR_REMOVE) {
                return Err(VfsError::AccessDenied);
            }
            return Ok(());
        }
        if options.contains(OpenOptions::READ) {
            let allowed = if options.contains(OpenOptions::DIRECTORY) {
                access.intersects(UnveilAccess::READ | UnveilAccess::BROWSE)
            } else {
                access.contains(UnveilAccess::READ)
            };
            if !allowed {
                return Err(VfsError::AccessDenied);
            }
        }
        if options.contains(OpenOptions::WRITE) && !access.contains(UnveilAccess::WRITE) {
            return Err(VfsError::AccessDenied);
        }
        if options.contains(OpenOptions::EXEC) && !access.contains(UnveilAccess::EXECUTE) {
            return Err(VfsError::AccessDenied);
        }
        Ok(())
    }

    /// Explicit declarations in path order.
    pub fn entries(&self) -> Vec<UnveilEntry> {
        fn walk(node: &UnveilNode, path: &str, out: &mut Vec<UnveilEntry>) {
            if node.explicitly_unveiled {
                out.push(UnveilEntry {
                    path: if path.is_empty() { "/".to_string() } else { path.to_string() },
                    permissions: node.permissions.letters(),
                });
            }
            for (name, child) in &node.children {
                walk(child, &format!("{}/{}", path, name), out);
            }
        }

        let mut out = Vec::new();
        walk(&self.root, "", &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_unset_veil_allows_everything() {
        let veil = Veil::new();
        assert_eq!(veil.state(), VeilState::None);
        assert!(veil.check("/etc/passwd", OpenOptions::READ | OpenOptions::WRITE).is_ok());
    }

    #[test]
    fn test_locked_empty_veil_hides_everything() {
        let mut veil = Veil::new();
        veil.lock();
        assert_eq!(veil.check("/", OpenOptions::READ), Err(VfsError::NotFound));
        assert_eq!(veil.unveil("/tmp", "r"), Err(VfsError::NotPermitted));
    }

    #[test]
    fn test_longest_prefix_wins() -> Result<()> {
        let mut veil = Veil::new();
        veil.unveil("/home", "r")?;
        veil.unveil("/home/user/tmp", "rwc")?;

        assert!(veil.check("/home/user/file", OpenOptions::READ).is_ok());
        assert_eq!(
            veil.check("/home/user/file", OpenOptions::WRITE),
            Err(VfsError::AccessDenied)
        );
        assert!(veil.check("/home/user/tmp/x", OpenOptions::WRITE | OpenOptions::CREATE).is_ok());
        assert_eq!(veil.check("/etc", OpenOptions::READ), Err(VfsError::NotFound));
        Ok(())
    }

    #[test]
    fn test_narrowing_only() -> Result<()> {
        let mut veil = Veil::new();
        veil.unveil("/data", "rw")?;
        assert_eq!(veil.unveil("/data/sub", "rwx"), Err(VfsError::NotPermitted));
        veil.unveil("/data/sub", "r")?;
        veil.unveil("/data", "r")?;
        assert_eq!(veil.unveil("/data", "rw"), Err(VfsError::NotPermitted));
        assert_eq!(veil.permissions_for("/data/other"), Some(UnveilAccess::READ));
        Ok(())
    }

    #[test]
    fn test_browse_allows_directory_listing_only() -> Result<()> {
        let mut veil = Veil::new();
        veil.unveil("/srv", "b")?;
        assert!(veil.check("/srv", OpenOptions::READ | OpenOptions::DIRECTORY).is_ok());
        assert_eq!(veil.check("/srv/file", OpenOptions::READ), Err(VfsError::AccessDenied));
        Ok(())
    }

    #[test]
    fn test_unlink_intent_needs_only_create_bit() -> Result<()> {
        let mut veil = Veil::new();
        veil.unveil("/tmp", "c")?;
        assert!(veil
            .check("/tmp/f", OpenOptions::UNLINK_INTERNAL | OpenOptions::WRITE)
            .is_ok());
        veil.unveil("/tmp/keep", "")?;
        assert_eq!(
            veil.check("/tmp/keep", OpenOptions::UNLINK_INTERNAL),
            Err(VfsError::NotFound)
        );
        Ok(())
    }

    #[test]
    fn test_invalid_letters_and_paths() {
        let mut veil = Veil::new();
        assert_eq!(veil.unveil("/tmp", "rz"), Err(VfsError::InvalidArgument));
        assert_eq!(veil.unveil("tmp", "r"), Err(VfsError::InvalidArgument));
        assert_eq!(veil.state(), VeilState::None);
    }

    #[test]
    fn test_entries_listing() -> Result<()> {
        let mut veil = Veil::new();
        veil.unveil("/", "r")?;
        veil.unveil("/var/log", "rc")?;
        let entries = veil.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/");
        assert_eq!(entries[1].path, "/var/log");
        assert_eq!(entries[1].permissions, "rc");
        Ok(())
    }
}
