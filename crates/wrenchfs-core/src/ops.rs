//! Path-only operations.
//!
//! Operations with no bespoke handling are enumerated in [`PathOp`] and run
//! through a single translate-then-delegate step: the virtual path is
//! translated and the directly equivalent real primitive is called with the
//! same arguments. Errors come back verbatim.

use crate::attr::FsStats;
use crate::error::{PassthroughError, PassthroughResult};
use crate::path::SymlinkPolicy;
use crate::session::PassthroughSession;
use filetime::FileTime;
use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;
use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::trace;

/// A path-only filesystem operation and its arguments.
///
/// Paths carried inside a variant (`to`) are virtual and translated like the
/// primary path. Symlink targets are stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOp {
    Mkdir { mode: u32 },
    Mknod { mode: u32, rdev: u64 },
    Rmdir,
    Unlink,
    Rename { to: PathBuf },
    /// Creates a new hard link at `to` pointing at the primary path.
    Link { to: PathBuf },
    /// Creates a symlink at the primary path.
    Symlink { target: PathBuf },
    Readlink,
    Chmod { mode: u32 },
    Chown { uid: Option<u32>, gid: Option<u32> },
    Truncate { size: u64 },
    SetTimes {
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    },
    Access { mask: i32 },
    Statfs,
    GetXattr { name: OsString },
    ListXattr,
    SetXattr {
        name: OsString,
        value: Vec<u8>,
        flags: i32,
    },
    RemoveXattr { name: OsString },
}

impl PathOp {
    /// Operation name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            PathOp::Mkdir { .. } => "mkdir",
            PathOp::Mknod { .. } => "mknod",
            PathOp::Rmdir => "rmdir",
            PathOp::Unlink => "unlink",
            PathOp::Rename { .. } => "rename",
            PathOp::Link { .. } => "link",
            PathOp::Symlink { .. } => "symlink",
            PathOp::Readlink => "readlink",
            PathOp::Chmod { .. } => "chmod",
            PathOp::Chown { .. } => "chown",
            PathOp::Truncate { .. } => "truncate",
            PathOp::SetTimes { .. } => "utimens",
            PathOp::Access { .. } => "access",
            PathOp::Statfs => "statfs",
            PathOp::GetXattr { .. } => "getxattr",
            PathOp::ListXattr => "listxattr",
            PathOp::SetXattr { .. } => "setxattr",
            PathOp::RemoveXattr { .. } => "removexattr",
        }
    }

    /// Whether the operation changes the backing tree.
    pub fn is_mutating(&self) -> bool {
        match self {
            PathOp::Readlink | PathOp::Statfs | PathOp::GetXattr { .. } | PathOp::ListXattr => {
                false
            }
            PathOp::Access { mask } => mask & libc::W_OK != 0,
            _ => true,
        }
    }

    fn is_xattr(&self) -> bool {
        matches!(
            self,
            PathOp::GetXattr { .. }
                | PathOp::ListXattr
                | PathOp::SetXattr { .. }
                | PathOp::RemoveXattr { .. }
        )
    }

    /// Whether the real primitive dereferences a final symlink.
    fn symlink_policy(&self) -> SymlinkPolicy {
        match self {
            PathOp::Chmod { .. }
            | PathOp::Chown { .. }
            | PathOp::Truncate { .. }
            | PathOp::SetTimes { .. }
            | PathOp::Access { .. }
            | PathOp::Statfs => SymlinkPolicy::Follow,
            _ => SymlinkPolicy::NoFollow,
        }
    }
}

/// Result of a [`PathOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathReply {
    Done,
    /// Verbatim symlink target.
    Target(PathBuf),
    Statfs(FsStats),
    /// Attribute value.
    Xattr(Vec<u8>),
    /// NUL-separated attribute names, as returned by `listxattr(2)`.
    XattrNames(Vec<u8>),
}

impl PassthroughSession {
    /// Translates `virtual_path` and performs `op` on the real path.
    pub fn apply(&self, virtual_path: impl AsRef<Path>, op: PathOp) -> PassthroughResult<PathReply> {
        let virtual_path = virtual_path.as_ref();
        trace!(op = op.name(), path = %virtual_path.display(), "apply");

        if op.is_mutating() {
            self.ensure_writable()?;
        }
        if op.is_xattr() && !xattr::SUPPORTED_PLATFORM {
            return Err(PassthroughError::NotSupported);
        }
        let translator = self.translator();
        let real = translator.translate_with(virtual_path, op.symlink_policy())?;

        match op {
            PathOp::Mkdir { mode } => {
                DirBuilder::new().mode(mode & 0o7777).create(&real)?;
            }
            PathOp::Mknod { mode, rdev } => {
                #[allow(clippy::unnecessary_cast)]
                let (kind, perm, dev) = (
                    SFlag::from_bits_truncate((mode & libc::S_IFMT as u32) as libc::mode_t),
                    Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t),
                    rdev as libc::dev_t,
                );
                nix::sys::stat::mknod(&real, kind, perm, dev).map_err(io::Error::from)?;
            }
            PathOp::Rmdir => fs::remove_dir(&real)?,
            PathOp::Unlink => fs::remove_file(&real)?,
            PathOp::Rename { to } => {
                let to = translator.translate(&to)?;
                fs::rename(&real, &to)?;
            }
            PathOp::Link { to } => {
                let to = translator.translate(&to)?;
                fs::hard_link(&real, &to)?;
            }
            PathOp::Symlink { target } => std::os::unix::fs::symlink(&target, &real)?,
            PathOp::Readlink => return Ok(PathReply::Target(fs::read_link(&real)?)),
            PathOp::Chmod { mode } => {
                fs::set_permissions(&real, fs::Permissions::from_mode(mode & 0o7777))?;
            }
            PathOp::Chown { uid, gid } => std::os::unix::fs::chown(&real, uid, gid)?,
            PathOp::Truncate { size } => {
                OpenOptions::new().write(true).open(&real)?.set_len(size)?;
            }
            PathOp::SetTimes { atime, mtime } => set_times(&real, atime, mtime)?,
            PathOp::Access { mask } => {
                nix::unistd::access(&real, AccessFlags::from_bits_truncate(mask))
                    .map_err(io::Error::from)?;
            }
            PathOp::Statfs => return Ok(PathReply::Statfs(statfs(&real)?)),
            PathOp::GetXattr { name } => return Ok(PathReply::Xattr(get_xattr(&real, &name)?)),
            PathOp::ListXattr => return Ok(PathReply::XattrNames(list_xattr(&real)?)),
            PathOp::SetXattr { name, value, flags } => set_xattr(&real, &name, &value, flags)?,
            PathOp::RemoveXattr { name } => xattr::remove(&real, &name)?,
        }
        Ok(PathReply::Done)
    }
}

fn set_times(
    real: &Path,
    atime: Option<SystemTime>,
    mtime: Option<SystemTime>,
) -> io::Result<()> {
    match (atime, mtime) {
        (Some(a), Some(m)) => filetime::set_file_times(
            real,
            FileTime::from_system_time(a),
            FileTime::from_system_time(m),
        ),
        (Some(a), None) => filetime::set_file_atime(real, FileTime::from_system_time(a)),
        (None, Some(m)) => filetime::set_file_mtime(real, FileTime::from_system_time(m)),
        (None, None) => Ok(()),
    }
}

#[allow(clippy::unnecessary_cast, clippy::useless_conversion)]
fn statfs(real: &Path) -> io::Result<FsStats> {
    let st = nix::sys::statvfs::statvfs(real).map_err(io::Error::from)?;
    Ok(FsStats {
        blocks: st.blocks() as u64,
        blocks_free: st.blocks_free() as u64,
        blocks_available: st.blocks_available() as u64,
        files: st.files() as u64,
        files_free: st.files_free() as u64,
        block_size: u32::try_from(st.block_size()).unwrap_or(u32::MAX),
        name_max: u32::try_from(st.name_max()).unwrap_or(u32::MAX),
        fragment_size: u32::try_from(st.fragment_size()).unwrap_or(u32::MAX),
    })
}

/// Errno for a missing extended attribute.
#[cfg(target_os = "macos")]
const NO_XATTR: i32 = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const NO_XATTR: i32 = libc::ENODATA;

// The xattr crate operates on the link itself, never its target.

fn get_xattr(real: &Path, name: &OsStr) -> io::Result<Vec<u8>> {
    xattr::get(real, name)?.ok_or_else(|| io::Error::from_raw_os_error(NO_XATTR))
}

/// Attribute names joined NUL-terminated, as `listxattr(2)` returns them.
fn list_xattr(real: &Path) -> io::Result<Vec<u8>> {
    let mut names = Vec::new();
    for name in xattr::list(real)? {
        names.extend_from_slice(name.as_bytes());
        names.push(0);
    }
    Ok(names)
}

/// Sets an attribute, honoring `XATTR_CREATE` and `XATTR_REPLACE`.
///
/// The existence check and the write are two calls, so the flags are not
/// atomic against a concurrent writer on the backing file.
fn set_xattr(real: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
    if flags & (libc::XATTR_CREATE | libc::XATTR_REPLACE) != 0 {
        let exists = xattr::get(real, name)?.is_some();
        if exists && flags & libc::XATTR_CREATE != 0 {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        if !exists && flags & libc::XATTR_REPLACE != 0 {
            return Err(io::Error::from_raw_os_error(NO_XATTR));
        }
    }
    xattr::set(real, name, value)
}
