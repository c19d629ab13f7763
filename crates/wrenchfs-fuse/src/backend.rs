//! Mounting and unmounting.
//!
//! [`mount`] validates the mount point, spawns the FUSE session in the
//! background and waits until the kernel reports the mount as active.
//! The returned [`WrenchMountHandle`] unmounts on [`WrenchMountHandle::unmount`]
//! or when dropped.

use crate::config::MountConfig;
use crate::error::MountError;
use crate::filesystem::WrenchFS;
use fuser::{BackgroundSession, MountOption};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use wrenchfs_core::PassthroughSession;

/// How long to wait for the kernel to report the mount as active.
const MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling interval while waiting for the mount.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timeout for graceful session.join() before forcing unmount.
/// The join thread may leak on timeout.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a mounted filesystem. Dropping it unmounts.
pub struct WrenchMountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl WrenchMountHandle {
    /// Where the filesystem is mounted.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts and waits for the FUSE session to finish.
    ///
    /// Blocks while the kernel still has requests in flight.
    pub fn unmount(mut self) {
        tracing::info!(mountpoint = %self.mountpoint.display(), "Unmounting FUSE filesystem");
        if let Some(session) = self.session.take() {
            session.join();
        }
        tracing::info!(mountpoint = %self.mountpoint.display(), "FUSE unmount successful");
    }

    /// Force unmount using system tools when the normal unmount is blocked.
    fn force_unmount(&self) {
        #[cfg(target_os = "macos")]
        {
            let result = std::process::Command::new("diskutil")
                .args(["unmount", "force"])
                .arg(&self.mountpoint)
                .output();

            match result {
                Ok(output) if output.status.success() => {
                    tracing::debug!("Force unmount via diskutil succeeded");
                    return;
                }
                _ => {
                    tracing::debug!("diskutil unmount failed, trying umount");
                }
            }

            let _ = std::process::Command::new("umount")
                .arg("-f")
                .arg(&self.mountpoint)
                .output();
        }

        #[cfg(target_os = "linux")]
        {
            let _ = std::process::Command::new("fusermount")
                .args(["-uz"])
                .arg(&self.mountpoint)
                .output();
        }
    }
}

impl Drop for WrenchMountHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::debug!(mountpoint = %self.mountpoint.display(), "Unmounting on drop");

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            session.join();
            let _ = tx.send(());
        });

        if rx.recv_timeout(JOIN_TIMEOUT).is_err() {
            tracing::warn!(
                mountpoint = %self.mountpoint.display(),
                "session.join() timed out after {JOIN_TIMEOUT:?}, forcing unmount"
            );
            self.force_unmount();
        }
    }
}

/// Whether FUSE is usable on this machine.
pub fn is_available() -> bool {
    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
    }
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        false
    }
}

fn unavailable_reason() -> String {
    #[cfg(target_os = "macos")]
    {
        "macFUSE is not installed. Download it from https://osxfuse.github.io/".to_string()
    }
    #[cfg(target_os = "linux")]
    {
        "FUSE is not available. Ensure the fuse kernel module is loaded.".to_string()
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        "FUSE is not supported on this platform.".to_string()
    }
}

/// Builds the fuser mount options for `config`.
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype("wrenchfs".to_string()),
        MountOption::AutoUnmount,
        // Let the kernel check permission bits against the backing attributes
        MountOption::DefaultPermissions,
    ];
    options.push(if config.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }

    #[cfg(target_os = "macos")]
    options.push(MountOption::CUSTOM("noappledouble".to_string()));

    options
}

/// Checks that `mountpoint` is an existing directory outside `root`.
///
/// Mounting inside the backing root would let the mount see itself.
pub fn validate_mountpoint(mountpoint: &Path, root: &Path) -> Result<PathBuf, MountError> {
    let invalid = |reason: String| MountError::MountPoint {
        path: mountpoint.to_path_buf(),
        reason,
    };

    let resolved = mountpoint
        .canonicalize()
        .map_err(|e| invalid(e.to_string()))?;
    if !resolved.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    if resolved.starts_with(root) {
        return Err(invalid(format!("inside backing root {}", root.display())));
    }
    Ok(resolved)
}

/// Mounts `session` at `mountpoint` in the background.
pub fn mount(
    session: PassthroughSession,
    mountpoint: &Path,
    config: MountConfig,
) -> Result<WrenchMountHandle, MountError> {
    if !is_available() {
        return Err(MountError::Unavailable(unavailable_reason()));
    }

    let mountpoint = validate_mountpoint(mountpoint, session.root().path())?;
    tracing::info!(
        root = %session.root().path().display(),
        mountpoint = %mountpoint.display(),
        read_only = config.read_only,
        "Starting FUSE mount"
    );

    let options = mount_options(&config);
    let fs = WrenchFS::new(session, config).map_err(|e| std::io::Error::other(e.to_string()))?;
    let session = fuser::spawn_mount2(fs, &mountpoint, &options)?;

    let handle = WrenchMountHandle {
        session: Some(session),
        mountpoint,
    };
    wait_for_mount(&handle.mountpoint)?;

    tracing::info!(mountpoint = %handle.mountpoint.display(), "FUSE mount ready");
    Ok(handle)
}

/// Polls until the mount point's device differs from its parent's.
fn wait_for_mount(mountpoint: &Path) -> Result<(), MountError> {
    use std::os::unix::fs::MetadataExt;

    let parent = mountpoint.parent().unwrap_or(Path::new("/"));
    let deadline = Instant::now() + MOUNT_TIMEOUT;

    while Instant::now() < deadline {
        if let (Ok(mount_meta), Ok(parent_meta)) =
            (std::fs::metadata(mountpoint), std::fs::metadata(parent))
            && mount_meta.dev() != parent_meta.dev()
        {
            tracing::debug!(
                mountpoint = %mountpoint.display(),
                dev = mount_meta.dev(),
                "FUSE mount confirmed active"
            );
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    Err(MountError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("FUSE mount did not become ready within {MOUNT_TIMEOUT:?}"),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mount_options_default() {
        let options = mount_options(&MountConfig::default());
        assert!(options.contains(&MountOption::FSName("wrenchfs".to_string())));
        assert!(options.contains(&MountOption::RW));
        assert!(!options.contains(&MountOption::RO));
        assert!(!options.contains(&MountOption::AllowOther));
    }

    #[test]
    fn test_mount_options_read_only_allow_other() {
        let config = MountConfig::default().read_only(true).allow_other(true);
        let options = mount_options(&config);
        assert!(options.contains(&MountOption::RO));
        assert!(!options.contains(&MountOption::RW));
        assert!(options.contains(&MountOption::AllowOther));
    }

    #[test]
    fn test_validate_mountpoint() {
        let base = TempDir::new().unwrap();
        let root = base.path().join("root");
        let mnt = base.path().join("mnt");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::create_dir(&mnt).unwrap();
        std::fs::write(base.path().join("file"), b"x").unwrap();
        let root = root.canonicalize().unwrap();

        assert_eq!(
            validate_mountpoint(&mnt, &root).unwrap(),
            mnt.canonicalize().unwrap()
        );
        assert!(matches!(
            validate_mountpoint(&base.path().join("missing"), &root),
            Err(MountError::MountPoint { .. })
        ));
        assert!(matches!(
            validate_mountpoint(&base.path().join("file"), &root),
            Err(MountError::MountPoint { .. })
        ));
        assert!(matches!(
            validate_mountpoint(&root.join("nested"), &root),
            Err(MountError::MountPoint { .. })
        ));
    }
}
