//! Mount configuration for the FUSE filesystem.

use std::time::Duration;

/// Default kernel cache TTL for attributes and entries.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Default upper bound on blocking threads serving reads and writes.
pub const DEFAULT_IO_THREADS: usize = 64;

/// Configuration options for a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    /// Time-to-live the kernel may cache attributes and entries for.
    ///
    /// Backing files can change underneath the mount, so keep this short.
    /// Default: 1 second.
    pub attr_ttl: Duration,

    /// Mount read-only. Default: false.
    pub read_only: bool,

    /// Let users other than the mounting user access the mount.
    ///
    /// Requires `user_allow_other` in `/etc/fuse.conf` for non-root users.
    /// Default: false.
    pub allow_other: bool,

    /// Filesystem name shown in the mount table. Default: `wrenchfs`.
    pub fs_name: String,

    /// Maximum blocking threads used for reads and writes. Default: 64.
    pub io_threads: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_ATTR_TTL,
            read_only: false,
            allow_other: false,
            fs_name: "wrenchfs".to_string(),
            io_threads: DEFAULT_IO_THREADS,
        }
    }
}

impl MountConfig {
    /// Sets the kernel cache TTL.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn allow_other(mut self, allow_other: bool) -> Self {
        self.allow_other = allow_other;
        self
    }

    #[must_use]
    pub fn fs_name(mut self, name: impl Into<String>) -> Self {
        self.fs_name = name.into();
        self
    }

    /// Sets the blocking thread limit (at least 1).
    #[must_use]
    pub fn io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads.max(1);
        self
    }
}
