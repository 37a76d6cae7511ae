//! Core namespace modules.
//!
//! This module provides the layers of the path-resolution subsystem:
//!
//! - `constants`: Resolution limits and default values
//! - `registry`, `fstype`: Filesystem construction and reuse
//! - `namespace`, `mount`: Mount tables, contexts and mount operations
//! - `resolver`, `veil`: Path resolution and per-process visibility
//! - `process`, `ops`: Per-process state and path-based operations
//! - `ramfs`, `imagefs`: Bundled filesystem drivers

pub mod config;
pub mod constants;
pub mod credentials;
pub mod custody;
pub mod description;
pub mod error;
pub mod file;
pub mod fstype;
pub mod imagefs;
pub mod inode;
pub mod mount;
/// Mount tables and namespace contexts.
pub mod namespace;
mod ops;
pub mod process;
pub mod ramfs;
pub mod registry;
pub mod resolver;
pub mod sync;
pub mod veil;

#[cfg(test)]
pub(crate) mod testing;
