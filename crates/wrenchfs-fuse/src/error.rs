//! Error handling for the FUSE adapter.
//!
//! Operation errors map to errno values through [`ToErrno`]; mount-time
//! failures are collected in [`MountError`] and never reach the kernel.

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use wrenchfs_core::{PassthroughError, ResolveError};

pub use wrenchfs_core::error::{ToErrno, io_error_to_errno};

/// Errors raised while serving a FUSE request.
#[derive(Debug, Error)]
pub enum FuseError {
    /// Error from the passthrough session.
    #[error(transparent)]
    Passthrough(#[from] PassthroughError),

    /// Inode unknown to the inode table (already forgotten).
    #[error("Invalid inode: {0}")]
    InvalidInode(u64),

    /// Request arguments the adapter rejects before reaching the session.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl FuseError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Passthrough(e) => e.to_errno(),
            FuseError::InvalidInode(_) => libc::ENOENT,
            FuseError::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

impl ToErrno for FuseError {
    fn to_errno(&self) -> i32 {
        FuseError::to_errno(self)
    }
}

impl From<io::Error> for FuseError {
    fn from(e: io::Error) -> Self {
        FuseError::Passthrough(PassthroughError::Io(e))
    }
}

/// Result type for FUSE request handling.
pub type FuseResult<T> = Result<T, FuseError>;

/// Errors that prevent a mount from starting.
#[derive(Debug, Error)]
pub enum MountError {
    /// Credential did not select a usable backing root.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Mount point missing or not a directory.
    #[error("Invalid mount point {}: {reason}", path.display())]
    MountPoint { path: PathBuf, reason: String },

    /// FUSE is not installed or not loaded.
    #[error("FUSE unavailable: {0}")]
    Unavailable(String),

    /// The transport refused the mount.
    #[error("Mount failed: {0}")]
    Io(#[from] io::Error),
}
