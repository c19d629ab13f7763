//! Credential-to-root resolution.
//!
//! A mount selects exactly one backing directory by exact match of the
//! supplied credential against a fixed table. Unknown credentials fail
//! closed: there is no default root.
//!
//! The comparison is a plain string equality check. This is root
//! *selection*, not access control.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Credential granting the low-sensitivity root.
pub const BENIGN_CREDENTIAL: &str = "password1";

/// Credential granting the high-sensitivity root.
pub const SECRET_CREDENTIAL: &str = "supersecret";

/// Directory name of the low-sensitivity root, relative to the table base.
pub const BENIGN_DIR: &str = "benign";

/// Directory name of the high-sensitivity root, relative to the table base.
pub const SECRET_DIR: &str = "secret";

/// Errors that prevent a mount from starting.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The credential matched no table entry.
    #[error("Unrecognized credential")]
    UnknownCredential,

    /// The credential matched but its directory cannot serve as a root.
    #[error("Backing root unavailable: {}", path.display())]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A canonical, absolute directory that a session serves content from.
///
/// Fixed for the lifetime of a mount; everything else borrows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingRoot(PathBuf);

impl BackingRoot {
    /// Canonicalizes `path` and checks that it is a directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ResolveError> {
        let path = path.as_ref();
        let unavailable = |source| ResolveError::RootUnavailable {
            path: path.to_path_buf(),
            source,
        };

        let canonical = path.canonicalize().map_err(unavailable)?;
        let metadata = std::fs::metadata(&canonical).map_err(unavailable)?;
        if !metadata.is_dir() {
            return Err(unavailable(io::Error::from_raw_os_error(libc::ENOTDIR)));
        }
        Ok(Self(canonical))
    }

    /// The canonical root path.
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// The fixed credential table.
#[derive(Debug, Clone)]
pub struct RootTable {
    base: PathBuf,
    entries: [(&'static str, &'static str); 2],
}

impl RootTable {
    /// Creates the table with both roots located under `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            entries: [
                (BENIGN_CREDENTIAL, BENIGN_DIR),
                (SECRET_CREDENTIAL, SECRET_DIR),
            ],
        }
    }

    /// Directory that holds the candidate roots.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Maps a credential to its backing root.
    ///
    /// Both failure modes are fatal to mount startup. They are logged
    /// differently here but callers should report them the same way.
    pub fn resolve(&self, credential: &str) -> Result<BackingRoot, ResolveError> {
        let Some((_, dir)) = self.entries.iter().find(|(c, _)| *c == credential) else {
            warn!("Rejected unrecognized credential");
            return Err(ResolveError::UnknownCredential);
        };

        let candidate = self.base.join(dir);
        debug!(candidate = %candidate.display(), "Credential matched, opening root");

        match BackingRoot::open(&candidate) {
            Ok(root) => {
                info!(root = %root.path().display(), "Backing root selected");
                Ok(root)
            }
            Err(e) => {
                warn!(error = %e, "Credential matched but backing root is unusable");
                Err(e)
            }
        }
    }
}
