use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::constants::DEFAULT_UMASK;
use super::credentials::Credentials;
use super::custody::Custody;
use super::error::{VfsError, VfsResult};
use super::namespace::NamespaceContext;
use super::resolver::{OpenOptions, PathResolver, ResolveFailure, ResolveResult, Resolved};
use super::veil::{UnveilAccess, UnveilEntry, Veil, VeilState};

/// Joins a directory path and an entry name.
pub(crate) fn join_path(directory: &str, name: &str) -> String {
    if directory == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", directory, name)
    }
}

/// Serialisable summary of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub credentials: Credentials,
    pub umask: u16,
    pub cwd: String,
    pub context: Uuid,
    pub veil: VeilState,
    pub unveiled: Vec<UnveilEntry>,
}

/// Per-process state used by every path operation: identity, umask, veil,
/// working directory and the namespace context the process is attached to.
pub struct Process {
    pid: u32,
    credentials: Credentials,
    umask: u16,
    veil: Veil,
    cwd: Arc<Custody>,
    context: Arc<NamespaceContext>,
}

impl Process {
    /// Creates a process attached to `context`, starting at its root.
    pub fn new(pid: u32, credentials: Credentials, context: Arc<NamespaceContext>) -> Self {
        context.attach();
        Self {
            pid,
            credentials,
            umask: DEFAULT_UMASK,
            veil: Veil::new(),
            cwd: context.root_custody(),
            context,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn umask(&self) -> u16 {
        self.umask
    }

    /// Sets the creation mask, returning the previous one.
    pub fn set_umask(&mut self, umask: u16) -> u16 {
        std::mem::replace(&mut self.umask, umask & 0o777)
    }

    pub fn veil(&self) -> &Veil {
        &self.veil
    }

    pub fn cwd(&self) -> &Arc<Custody> {
        &self.cwd
    }

    pub(crate) fn set_cwd(&mut self, cwd: Arc<Custody>) {
        self.cwd = cwd;
    }

    pub fn context(&self) -> &Arc<NamespaceContext> {
        &self.context
    }

    /// Moves the process into another namespace context. The working
    /// directory is reset to the new root.
    pub fn transition_to(&mut self, context: Arc<NamespaceContext>) {
        context.attach();
        self.context.detach();
        debug!(
            "Process {} moved from context {} to {}",
            self.pid,
            self.context.id(),
            context.id()
        );
        self.cwd = context.root_custody();
        self.context = context;
    }

    /// Resolves `path` from the working directory, ignoring the veil.
    pub fn resolve_without_veil(&self, path: &str, options: OpenOptions) -> ResolveResult {
        PathResolver::new(&self.context, &self.credentials).resolve(path, &self.cwd, options)
    }

    /// Resolves `path` and validates the result against the veil.
    pub fn resolve(&self, path: &str, options: OpenOptions) -> VfsResult<Resolved> {
        let resolved = self.resolve_without_veil(path, options)?;
        self.veil.check(&resolved.custody.absolute_path(), options)?;
        Ok(resolved)
    }

    pub(crate) fn validate_veil(&self, path: &str, options: OpenOptions) -> VfsResult<()> {
        self.veil.check(path, options)
    }

    /// Declares `permissions` for `path`.
    ///
    /// The path is canonicalised first: symbolic links are resolved, and a
    /// missing final component is appended to its resolved parent.
    ///
    /// # Arguments
    ///
    /// * `path` - Absolute path to unveil
    /// * `permissions` - Letters from `rwxcb`
    pub fn unveil(&mut self, path: &str, permissions: &str) -> VfsResult<()> {
        if self.veil.state() == VeilState::Locked {
            return Err(VfsError::NotPermitted);
        }
        UnveilAccess::parse(permissions)?;
        if !path.starts_with('/') {
            return Err(VfsError::InvalidArgument);
        }

        let root = self.context.root_custody();
        let resolver = PathResolver::new(&self.context, &self.credentials);
        let canonical = match resolver.resolve(path, &root, OpenOptions::empty()) {
            Ok(resolved) => resolved.custody.absolute_path(),
            Err(ResolveFailure {
                error: VfsError::NotFound,
                missing: Some(missing),
            }) => join_path(&missing.parent.absolute_path(), &missing.name),
            Err(failure) => return Err(failure.error),
        };

        self.veil.unveil(&canonical, permissions)?;
        debug!("Process {} unveiled {} ({})", self.pid, canonical, permissions);
        Ok(())
    }

    /// Seals the veil against further declarations.
    pub fn lock_veil(&mut self) {
        self.veil.lock();
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            credentials: self.credentials.clone(),
            umask: self.umask,
            cwd: self.cwd.absolute_path(),
            context: self.context.id(),
            veil: self.veil.state(),
            unveiled: self.veil.entries(),
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.context.detach();
    }
}
