//! Shared setup for unit tests: a manager with one context on an empty ramfs.

use anyhow::Result;
use std::sync::Arc;

use super::credentials::Credentials;
use super::custody::Custody;
use super::description::OpenFileDescription;
use super::mount::{FilesystemManager, MountRequest};
use super::namespace::{MountId, NamespaceContext};
use super::process::Process;
use super::resolver::{OpenOptions, ResolveResult};

pub struct Fixture {
    pub manager: FilesystemManager,
    pub context: Arc<NamespaceContext>,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let manager = FilesystemManager::new();
        let context = manager.create_context_with_empty_ramfs()?;
        Ok(Self { manager, context })
    }

    pub fn root_process(&self) -> Process {
        Process::new(1, Credentials::root(), Arc::clone(&self.context))
    }

    pub fn user_process(&self, uid: u32, gid: u32) -> Process {
        Process::new(uid, Credentials::user(uid, gid), Arc::clone(&self.context))
    }

    pub fn resolve(&self, path: &str, options: OpenOptions) -> ResolveResult {
        self.root_process().resolve_without_veil(path, options)
    }

    pub fn custody(&self, path: &str) -> Result<Arc<Custody>> {
        Ok(self.root_process().resolve(path, OpenOptions::empty())?.custody)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        Ok(self.root_process().mkdir(path, 0o755)?)
    }

    pub fn symlink(&self, target: &str, linkpath: &str) -> Result<()> {
        Ok(self.root_process().symlink(target, linkpath)?)
    }

    pub fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let file = self.root_process().open(
            path,
            OpenOptions::WRITE | OpenOptions::CREATE | OpenOptions::TRUNCATE,
            0o644,
        )?;
        file.write(contents)?;
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.root_process().open(path, OpenOptions::READ, 0)?;
        Ok(file.read_to_end()?)
    }

    pub fn mount_ramfs(&self, path: &str) -> Result<MountId> {
        self.mount(path, MountRequest::new("ramfs"))
    }

    pub fn mount_image(&self, path: &str, source: Arc<OpenFileDescription>) -> Result<MountId> {
        self.mount(path, MountRequest::new("imagefs").with_source(source))
    }

    fn mount(&self, path: &str, request: MountRequest) -> Result<MountId> {
        let target = self.custody(path)?;
        Ok(self
            .manager
            .mount(&self.context, &Credentials::root(), &target, &request)?)
    }
}
