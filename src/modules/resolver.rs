//! Path resolution.
//!
//! Walks a path component by component against a namespace context,
//! descending transparently into mounts and following symbolic links up to
//! [`SYMLINK_RECURSION_LIMIT`] levels deep. Resolution never consults the
//! veil; callers validate the resolved custody afterwards.

use super::constants::{MAX_NAME_LEN, MAX_PATH_LEN, SYMLINK_RECURSION_LIMIT};
use super::credentials::Credentials;
use super::custody::Custody;
use super::error::VfsError;
use super::inode::InodeMetadata;
use super::namespace::NamespaceContext;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Open and lookup options. They drive both DAC and veil checks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenOptions: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const CREATE = 1 << 3;
        const EXCLUSIVE = 1 << 4;
        const DIRECTORY = 1 << 5;
        const TRUNCATE = 1 << 6;
        /// Fail with `TooManyLevelsOfSymlinks` if the final component is a link.
        const NOFOLLOW = 1 << 7;
        /// Stop at a final symbolic link instead of following it.
        const NOFOLLOW_NOERROR = 1 << 8;
        /// Removal intent; judged by the create/remove veil bit.
        const UNLINK_INTERNAL = 1 << 9;
    }
}

/// The final component that was missing when resolution failed.
#[derive(Debug, Clone)]
pub struct MissingEntry {
    /// Directory that would contain the missing entry.
    pub parent: Arc<Custody>,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ResolveFailure {
    pub error: VfsError,
    /// Present only when the last component of the path was absent.
    pub missing: Option<MissingEntry>,
}

impl From<VfsError> for ResolveFailure {
    fn from(error: VfsError) -> Self {
        Self {
            error,
            missing: None,
        }
    }
}

impl From<ResolveFailure> for VfsError {
    fn from(failure: ResolveFailure) -> Self {
        failure.error
    }
}

impl fmt::Display for ResolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.missing {
            Some(missing) => write!(
                f,
                "{} ({} in {})",
                self.error,
                missing.name,
                missing.parent.absolute_path()
            ),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for ResolveFailure {}

/// A successfully resolved path.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub custody: Arc<Custody>,
    /// Custody of the directory holding the final component, if any.
    pub parent: Option<Arc<Custody>>,
}

pub type ResolveResult = Result<Resolved, ResolveFailure>;

// Components with the byte offset just past each one.
fn components(path: &str) -> Vec<(&str, usize)> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, byte) in path.bytes().enumerate() {
        if byte == b'/' {
            if i > start {
                parts.push((&path[start..i], i));
            }
            start = i + 1;
        }
    }
    if start < path.len() {
        parts.push((&path[start..], path.len()));
    }
    parts
}

/// Resolves paths within one namespace context on behalf of one identity.
pub struct PathResolver<'a> {
    context: &'a NamespaceContext,
    credentials: &'a Credentials,
}

impl<'a> PathResolver<'a> {
    pub fn new(context: &'a NamespaceContext, credentials: &'a Credentials) -> Self {
        Self {
            context,
            credentials,
        }
    }

    /// Resolves `path`, relative to `base` unless it is absolute.
    ///
    /// # Arguments
    ///
    /// * `path` - Slash-separated path; must not be empty
    /// * `base` - Starting point for relative paths
    /// * `options` - Only the `NOFOLLOW` bits affect resolution itself
    ///
    /// # Returns
    ///
    /// The resolved custody and its parent, or a failure that names the
    /// missing final component when only that one was absent.
    pub fn resolve(&self, path: &str, base: &Arc<Custody>, options: OpenOptions) -> ResolveResult {
        self.resolve_at_depth(path, base, options, 0)
    }

    // A link in a sticky world-writable directory is only followed when the
    // caller or the directory owner owns it.
    fn safe_to_follow(&self, link: &InodeMetadata, directory: &InodeMetadata) -> bool {
        if self.credentials.euid == link.uid {
            return true;
        }
        if !(directory.is_sticky() && directory.mode.0 & 0o002 != 0) {
            return true;
        }
        link.uid == directory.uid
    }

    fn resolve_at_depth(
        &self,
        path: &str,
        base: &Arc<Custody>,
        options: OpenOptions,
        depth: usize,
    ) -> ResolveResult {
        if path.is_empty() {
            return Err(VfsError::InvalidArgument.into());
        }
        if path.len() > MAX_PATH_LEN {
            return Err(VfsError::NameTooLong.into());
        }

        let mut custody = if path.starts_with('/') {
            self.context.root_custody()
        } else {
            Arc::clone(base)
        };
        let mut parent: Option<Arc<Custody>> = None;

        let parts = components(path);
        for (i, &(part, end)) in parts.iter().enumerate() {
            let have_more_parts = i + 1 < parts.len();

            let directory = custody.inode().metadata();
            if !directory.is_directory() {
                return Err(VfsError::NotADirectory.into());
            }
            if !directory.may_execute(self.credentials) {
                return Err(VfsError::AccessDenied.into());
            }
            parent = Some(Arc::clone(&custody));

            match part {
                "." => continue,
                ".." => {
                    if let Some(up) = custody.parent() {
                        custody = Arc::clone(up);
                    }
                    continue;
                }
                _ => {}
            }
            if part.len() > MAX_NAME_LEN {
                return Err(VfsError::NameTooLong.into());
            }

            let child = match custody.inode().lookup(part) {
                Ok(child) => child,
                Err(VfsError::NotFound) if !have_more_parts => {
                    return Err(ResolveFailure {
                        error: VfsError::NotFound,
                        missing: Some(MissingEntry {
                            parent: Arc::clone(&custody),
                            name: part.to_string(),
                        }),
                    });
                }
                Err(error) => return Err(error.into()),
            };

            let (child, mount_flags) = self.context.cross_mounts(child, custody.mount_flags());
            let directory_custody = Arc::clone(&custody);
            custody = Custody::new(Some(Arc::clone(&directory_custody)), part, child, mount_flags);

            let metadata = custody.inode().metadata();
            if !metadata.is_symlink() {
                continue;
            }
            if !have_more_parts {
                if options.contains(OpenOptions::NOFOLLOW_NOERROR) {
                    break;
                }
                if options.contains(OpenOptions::NOFOLLOW) {
                    return Err(VfsError::TooManyLevelsOfSymlinks.into());
                }
            }

            if !self.safe_to_follow(&metadata, &directory) {
                return Err(VfsError::AccessDenied.into());
            }
            if depth >= SYMLINK_RECURSION_LIMIT {
                return Err(VfsError::TooManyLevelsOfSymlinks.into());
            }

            let target = custody.inode().read_link()?;
            let follow_options = options - (OpenOptions::NOFOLLOW | OpenOptions::NOFOLLOW_NOERROR);
            let resolved = self.resolve_at_depth(&target, &directory_custody, follow_options, depth + 1);
            if !have_more_parts {
                return resolved;
            }

            // An absent link target is not the final component of this path.
            let target = resolved.map_err(|failure| ResolveFailure::from(failure.error))?;
            let remainder = format!(".{}", &path[end..]);
            return self.resolve_at_depth(&remainder, &target.custody, options, depth + 1);
        }

        Ok(Resolved { custody, parent })
    }
}
