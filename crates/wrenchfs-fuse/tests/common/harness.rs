//! Test mount harness for FUSE integration tests.
//!
//! Provides `TestMount`, which builds a pair of backing roots in a temporary
//! directory, mounts the one selected by a credential, and unmounts on drop.

// Not all tests use all TestMount methods
#![allow(dead_code)]

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use wrenchfs_core::credential::{BENIGN_CREDENTIAL, BENIGN_DIR, SECRET_DIR};
use wrenchfs_core::{PassthroughSession, RootTable};
use wrenchfs_fuse::{MountConfig, WrenchMountHandle};

/// Content of `greeting` in the benign root.
pub const GREETING: &[u8] = b"Hello, World!\n";

/// A mounted backing root for testing.
///
/// Fields drop in order: the mount goes away before its directories.
pub struct TestMount {
    handle: WrenchMountHandle,
    /// Path where the filesystem is mounted.
    pub mount_path: PathBuf,
    /// Directory holding `benign/`, `secret/` and the mount point.
    base: TempDir,
}

impl TestMount {
    /// Mount the benign root read-write.
    pub fn benign() -> Result<Self, String> {
        Self::with_credential(BENIGN_CREDENTIAL, MountConfig::default())
    }

    /// Mount the root selected by `credential`.
    pub fn with_credential(credential: &str, config: MountConfig) -> Result<Self, String> {
        let base = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        populate_roots(base.path()).map_err(|e| format!("Failed to populate roots: {e}"))?;

        let mount_path = base.path().join("mnt");
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;

        let root = RootTable::new(base.path())
            .resolve(credential)
            .map_err(|e| format!("Failed to resolve credential: {e}"))?;
        let config = config.fs_name("wrenchfs-test");
        let handle = wrenchfs_fuse::mount(PassthroughSession::new(root), &mount_path, config)
            .map_err(|e| format!("Failed to mount: {e}"))?;

        Ok(Self {
            handle,
            mount_path,
            base,
        })
    }

    /// Path of a file inside the benign backing root, bypassing the mount.
    pub fn benign_backing(&self, relative: &str) -> PathBuf {
        self.base.path().join(BENIGN_DIR).join(relative)
    }

    /// Path of a file inside the secret backing root, bypassing the mount.
    pub fn secret_backing(&self, relative: &str) -> PathBuf {
        self.base.path().join(SECRET_DIR).join(relative)
    }

    /// Path next to both roots, outside either.
    pub fn outside(&self, relative: &str) -> PathBuf {
        self.base.path().join(relative)
    }

    /// Build a full path from a relative path.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.mount_path.join(relative.trim_start_matches('/'))
    }

    /// Read a file's contents.
    pub fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        let mut content = Vec::new();
        File::open(self.path(path))?.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Write content to a file (creates or overwrites).
    pub fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = File::create(self.path(path))?;
        file.write_all(content)?;
        file.sync_all()?;
        Ok(())
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.path(path))
    }

    /// Remove a file.
    pub fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.path(path))
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> io::Result<()> {
        fs::remove_dir(self.path(path))
    }

    /// Rename/move a file or directory.
    pub fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.path(from), self.path(to))
    }

    /// Check if a path exists.
    pub fn exists(&self, path: &str) -> bool {
        self.path(path).exists()
    }

    /// Get symlink metadata (doesn't follow symlinks).
    pub fn symlink_metadata(&self, path: &str) -> io::Result<Metadata> {
        fs::symlink_metadata(self.path(path))
    }

    /// Sorted directory entry names.
    pub fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(self.path(path))?
            .filter_map(std::result::Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Unmount explicitly, waiting for the session to finish.
    ///
    /// Returns the backing directories so they outlive the mount.
    pub fn unmount(self) -> TempDir {
        self.handle.unmount();
        self.base
    }
}

fn populate_roots(base: &Path) -> io::Result<()> {
    let benign = base.join(BENIGN_DIR);
    fs::create_dir_all(benign.join("photos"))?;
    fs::write(benign.join("greeting"), GREETING)?;
    fs::write(benign.join("shopping.txt"), b"milk\neggs\n")?;

    let secret = base.join(SECRET_DIR);
    fs::create_dir_all(&secret)?;
    fs::write(secret.join("launch_codes.txt"), b"00000000\n")?;

    fs::write(base.join("shadow"), b"outside both roots")
}

/// Check if FUSE is available on this system.
pub fn fuse_available() -> bool {
    wrenchfs_fuse::is_available()
}

/// Skip test if FUSE is not available.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::harness::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}
