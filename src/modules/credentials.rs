use super::constants::{SUPERUSER_GID, SUPERUSER_UID};
use serde::{Deserialize, Serialize};

/// Identity a path operation is performed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    #[serde(default)]
    pub extra_gids: Vec<u32>,
}

impl Credentials {
    /// Superuser credentials.
    pub fn root() -> Self {
        Self::user(SUPERUSER_UID, SUPERUSER_GID)
    }

    /// Credentials with matching real and effective ids.
    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            euid: uid,
            egid: gid,
            extra_gids: Vec::new(),
        }
    }

    pub fn with_extra_gids(mut self, gids: impl IntoIterator<Item = u32>) -> Self {
        self.extra_gids.extend(gids);
        self
    }

    pub fn is_superuser(&self) -> bool {
        self.euid == SUPERUSER_UID
    }

    /// Whether `gid` is the effective group or one of the supplementary groups.
    pub fn in_group(&self, gid: u32) -> bool {
        self.egid == gid || self.extra_gids.contains(&gid)
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::root()
    }
}
