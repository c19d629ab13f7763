//! Error types for passthrough operations and their POSIX errno mapping.
//!
//! Real-filesystem errors are carried verbatim in [`PassthroughError::Io`] and
//! surface to the caller with the same errno the backing filesystem produced.
//! The remaining variants are raised by this layer itself.

use std::io;
use thiserror::Error;

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum PassthroughError {
    /// Error from the underlying filesystem, passed through unchanged.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Virtual path would resolve outside the backing root.
    #[error("Path escapes backing root: {0}")]
    Escape(String),

    /// Handle is unknown, already released, or was never issued.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Arguments the real filesystem would never see (bad flags, offsets).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Mutating operation on a read-only session.
    #[error("Read-only filesystem")]
    ReadOnly,

    /// Operation not available on this platform.
    #[error("Operation not supported")]
    NotSupported,
}

impl PassthroughError {
    /// Converts this error to a libc error code for the transport.
    pub fn to_errno(&self) -> i32 {
        match self {
            PassthroughError::Io(e) => io_error_to_errno(e),
            PassthroughError::Escape(_) => libc::ENOENT,
            PassthroughError::InvalidHandle(_) => libc::EBADF,
            PassthroughError::InvalidArgument(_) => libc::EINVAL,
            PassthroughError::ReadOnly => libc::EROFS,
            PassthroughError::NotSupported => libc::ENOTSUP,
        }
    }
}

/// Result type for passthrough operations.
pub type PassthroughResult<T> = Result<T, PassthroughError>;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for PassthroughError {
    fn to_errno(&self) -> i32 {
        PassthroughError::to_errno(self)
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

/// Maps an IO error to an errno, preferring the raw OS code.
///
/// Errors synthesized by std (no OS code) are classified by kind, falling
/// back to `EIO`.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }
    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let e = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(io_error_to_errno(&e), libc::ENOENT);

        let e = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(io_error_to_errno(&e), libc::EACCES);
    }

    #[test]
    fn test_io_error_mapping_without_os_error() {
        let e = io::Error::other("custom error");
        assert_eq!(io_error_to_errno(&e), libc::EIO);

        let e = io::Error::new(io::ErrorKind::InvalidInput, "bad flags");
        assert_eq!(io_error_to_errno(&e), libc::EINVAL);
    }

    #[test]
    fn test_passthrough_error_all_variants() {
        assert_eq!(
            PassthroughError::Escape("/../etc".to_string()).to_errno(),
            libc::ENOENT,
            "Escape should look like a missing path"
        );
        assert_eq!(PassthroughError::InvalidHandle(7).to_errno(), libc::EBADF);
        assert_eq!(
            PassthroughError::InvalidArgument("offset".to_string()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(PassthroughError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(PassthroughError::NotSupported.to_errno(), libc::ENOTSUP);
    }

    #[test]
    fn test_real_errors_pass_through_verbatim() {
        let error_codes = [
            libc::ENOENT,
            libc::EACCES,
            libc::EEXIST,
            libc::ENOTDIR,
            libc::EISDIR,
            libc::ENOSPC,
            libc::EROFS,
            libc::ENOTEMPTY,
            libc::EXDEV,
        ];

        for code in error_codes {
            let e = PassthroughError::from(io::Error::from_raw_os_error(code));
            assert_eq!(e.to_errno(), code, "errno {code} should pass through unchanged");
        }
    }

    #[test]
    fn test_display_mentions_handle() {
        let e = PassthroughError::InvalidHandle(42);
        assert!(e.to_string().contains("42"));
    }

    #[test]
    fn test_to_errno_trait_io_error() {
        let e = io::Error::from_raw_os_error(libc::ENOTDIR);
        assert_eq!(ToErrno::to_errno(&e), libc::ENOTDIR);
    }
}
