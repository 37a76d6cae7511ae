// Resolution limits
pub const SYMLINK_RECURSION_LIMIT: usize = 8;
pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_NAME_LEN: usize = 255;

// Largest file an in-memory driver will hold
pub const MAX_FILE_SIZE: u64 = 1 << 32;

// Inode indices
pub const ROOT_INODE_INDEX: u64 = 1;
pub const INITIAL_INODE_INDEX: u64 = 2;

// Default permissions
pub const DEFAULT_DIRECTORY_PERMISSION: u16 = 0o755;
pub const DEFAULT_SYMLINK_PERMISSION: u16 = 0o777;
pub const DEFAULT_UMASK: u16 = 0o022;

// User and group IDs
pub const SUPERUSER_UID: u32 = 0;
pub const SUPERUSER_GID: u32 = 0;

// On-disk image format written by imagefs
pub const IMAGE_FORMAT_VERSION: u32 = 1;
