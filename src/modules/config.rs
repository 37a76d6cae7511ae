//! JSON description of a namespace to build at startup.
//!
//! ```json
//! {
//!   "root": { "type": "ramfs", "options": { "mode": 493 } },
//!   "mounts": [
//!     { "kind": "fresh", "target": "/data",
//!       "filesystem": { "type": "imagefs", "source": "disk.json", "writable": true } },
//!     { "kind": "bind", "source": "/data", "target": "/view", "flags": "READ_ONLY" }
//!   ],
//!   "credentials": { "uid": 1000, "gid": 1000, "euid": 1000, "egid": 1000 },
//!   "unveil": [ { "path": "/data", "permissions": "rwc" } ],
//!   "lock_veil": true
//! }
//! ```

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::constants::{DEFAULT_DIRECTORY_PERMISSION, DEFAULT_UMASK};
use super::credentials::Credentials;
use super::description::OpenFileDescription;
use super::error::VfsError;
use super::fstype::MountOptions;
use super::mount::{FilesystemManager, MountRequest};
use super::namespace::MountFlags;
use super::process::Process;
use super::resolver::OpenOptions;
use super::veil::UnveilEntry;

fn default_umask() -> u16 {
    DEFAULT_UMASK
}

fn default_true() -> bool {
    true
}

fn default_pid() -> u32 {
    1
}

/// A filesystem to construct, optionally backed by a host file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemConfig {
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Host path of the backing file
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Open the backing file for writing
    #[serde(default = "default_true")]
    pub writable: bool,
    #[serde(default)]
    pub options: MountOptions,
    #[serde(default)]
    pub flags: MountFlags,
}

impl FilesystemConfig {
    /// Turns the entry into a mount request, opening the backing file if any.
    /// Relative backing paths are taken relative to `base_dir`.
    pub fn to_request(&self, base_dir: &Path) -> Result<MountRequest> {
        let mut request = MountRequest::new(&self.fs_type)
            .with_options(self.options.clone())
            .with_flags(self.flags);
        if let Some(source) = &self.source {
            let path = base_dir.join(source);
            let description = OpenFileDescription::open(&path, self.writable)
                .with_context(|| format!("Failed to open backing file {}", path.display()))?;
            request = request.with_source(Arc::new(description));
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MountEntry {
    /// Construct a filesystem and mount it at `target`.
    Fresh {
        target: String,
        filesystem: FilesystemConfig,
    },
    /// Show the namespace path `source` at `target`.
    Bind {
        source: String,
        target: String,
        #[serde(default)]
        flags: MountFlags,
    },
    /// Mount the filesystem rooted at `source` again at `target`.
    Copy {
        source: String,
        target: String,
        #[serde(default)]
        flags: MountFlags,
    },
}

impl MountEntry {
    pub fn target(&self) -> &str {
        match self {
            Self::Fresh { target, .. } | Self::Bind { target, .. } | Self::Copy { target, .. } => {
                target
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub root: FilesystemConfig,
    /// Applied in order; missing mount targets are created as directories.
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
    #[serde(default = "default_pid")]
    pub pid: u32,
    /// Identity of the configured process. Mounts are always performed as
    /// the superuser.
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "default_umask")]
    pub umask: u16,
    #[serde(default)]
    pub unveil: Vec<UnveilEntry>,
    #[serde(default)]
    pub lock_veil: bool,
    /// Directory relative backing paths are resolved against. Set by `load`.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl NamespaceConfig {
    /// Reads a configuration document from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Builds the namespace in `manager` and returns the configured process.
    pub fn build(&self, manager: &FilesystemManager) -> Result<Process> {
        let root_request = self.root.to_request(&self.base_dir)?;
        let context = manager
            .create_context(&root_request)
            .context("Failed to create root filesystem")?;
        let superuser = Credentials::root();
        let admin = Process::new(0, superuser.clone(), Arc::clone(&context));

        for entry in &self.mounts {
            create_directories(&admin, entry.target())?;
            let target = admin.resolve(entry.target(), OpenOptions::empty())?.custody;
            let mounted = match entry {
                MountEntry::Fresh { filesystem, .. } => {
                    let request = filesystem.to_request(&self.base_dir)?;
                    manager.mount(&context, &superuser, &target, &request)
                }
                MountEntry::Bind { source, flags, .. } => {
                    let source = admin.resolve(source, OpenOptions::empty())?.custody;
                    manager.bind_mount(&context, &superuser, &source, &target, *flags)
                }
                MountEntry::Copy { source, flags, .. } => {
                    let source = admin.resolve(source, OpenOptions::empty())?.custody;
                    manager.copy_mount(&context, &superuser, &source, &target, *flags)
                }
            };
            mounted.with_context(|| format!("Failed to mount at {}", entry.target()))?;
            debug!("Configured mount at {}", entry.target());
        }
        drop(admin);

        let mut process = Process::new(self.pid, self.credentials.clone(), context);
        process.set_umask(self.umask);
        for entry in &self.unveil {
            process
                .unveil(&entry.path, &entry.permissions)
                .with_context(|| format!("Failed to unveil {}", entry.path))?;
        }
        if self.lock_veil {
            process.lock_veil();
        }
        Ok(process)
    }
}

// Creates every missing directory along `path`.
fn create_directories(process: &Process, path: &str) -> Result<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|part| !part.is_empty()) {
        current.push('/');
        current.push_str(part);
        match process.mkdir(&current, DEFAULT_DIRECTORY_PERMISSION) {
            Ok(()) | Err(VfsError::Exists) => {}
            Err(error) => {
                return Err(error).with_context(|| format!("Failed to create {}", current))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG: &str = r#"{
        "root": { "type": "ramfs" },
        "mounts": [
            { "kind": "fresh", "target": "/data/disk",
              "filesystem": { "type": "imagefs", "source": "disk.json" } },
            { "kind": "bind", "source": "/data/disk", "target": "/view", "flags": "READ_ONLY" }
        ],
        "credentials": { "uid": 1000, "gid": 1000, "euid": 1000, "egid": 1000 },
        "umask": 63,
        "unveil": [ { "path": "/view", "permissions": "r" } ],
        "lock_veil": true
    }"#;

    #[test]
    fn test_load_and_build() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("disk.json"), "")?;
        let config_path = dir.path().join("namespace.json");
        fs::write(&config_path, CONFIG)?;

        let config = NamespaceConfig::load(&config_path)?;
        assert_eq!(config.mounts.len(), 2);
        assert_eq!(config.base_dir, dir.path());

        let manager = FilesystemManager::new();
        let mut process = config.build(&manager)?;
        assert_eq!(process.credentials().uid, 1000);
        assert_eq!(process.umask(), 0o077);
        assert_eq!(process.context().mount_count(), 3);
        assert!(process.resolve("/view", OpenOptions::READ).is_ok());
        assert_eq!(
            process.resolve("/data", OpenOptions::READ).err(),
            Some(VfsError::NotFound)
        );
        assert_eq!(process.unveil("/view", "r").err(), Some(VfsError::NotPermitted));
        Ok(())
    }

    #[test]
    fn test_mount_entry_forms() -> Result<()> {
        let entry: MountEntry = serde_json::from_str(
            r#"{ "kind": "copy", "source": "/a", "target": "/b", "flags": "READ_ONLY | NO_EXEC" }"#,
        )?;
        assert_eq!(
            entry,
            MountEntry::Copy {
                source: "/a".to_string(),
                target: "/b".to_string(),
                flags: MountFlags::READ_ONLY | MountFlags::NO_EXEC,
            }
        );
        assert_eq!(entry.target(), "/b");
        Ok(())
    }

    #[test]
    fn test_missing_backing_file() -> Result<()> {
        let dir = TempDir::new()?;
        let config = NamespaceConfig {
            root: FilesystemConfig {
                fs_type: "imagefs".to_string(),
                source: Some(PathBuf::from("absent.json")),
                writable: true,
                options: MountOptions::new(),
                flags: MountFlags::empty(),
            },
            mounts: Vec::new(),
            pid: 1,
            credentials: Credentials::root(),
            umask: DEFAULT_UMASK,
            unveil: Vec::new(),
            lock_veil: false,
            base_dir: dir.path().to_path_buf(),
        };
        assert!(config.build(&FilesystemManager::new()).is_err());
        Ok(())
    }
}
