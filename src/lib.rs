#![doc(html_root_url = "https://docs.rs/namei/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! namei: the namespace and path-resolution layer of a virtual filesystem
//!
//! Turns slash-separated paths into custody chains inside per-process mount
//! namespaces, and restricts what a process can see with an unveil-style
//! veil.
//!
//! ## Features
//!
//! - Path resolution with mount crossing and bounded symlink following
//! - Mount, bind, copy, remount, unmount and root pivoting per namespace
//! - Shared filesystem instances for file-backed mounts of the same device
//! - Per-process veils that can only narrow over time
//! - POSIX-style operations: open, mkdir, rename, link, chmod and friends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use namei::{Credentials, FilesystemManager, OpenOptions, Process};
//!
//! # fn main() -> anyhow::Result<()> {
//! let manager = FilesystemManager::new();
//! let context = manager.create_context_with_empty_ramfs()?;
//! let mut process = Process::new(1, Credentials::root(), context);
//!
//! process.mkdir("/srv", 0o755)?;
//! process.unveil("/srv", "rwc")?;
//! let motd = process.open("/srv/motd", OpenOptions::WRITE | OpenOptions::CREATE, 0o644)?;
//! motd.write(b"hello")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Veil letters
//!
//! - `r`: read files
//! - `w`: write files
//! - `x`: execute files
//! - `c`: create and remove entries
//! - `b`: browse directories

pub mod modules;

pub use modules::config::NamespaceConfig;
pub use modules::credentials::Credentials;
pub use modules::error::{VfsError, VfsResult};
pub use modules::mount::{FilesystemManager, MountRequest};
pub use modules::process::Process;

// Re-export commonly used types
pub use modules::namespace::MountFlags;
pub use modules::resolver::OpenOptions;
pub use modules::veil::UnveilAccess;
