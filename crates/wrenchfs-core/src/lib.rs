//! Credential-gated passthrough filesystem core.
//!
//! This crate selects one backing directory per mount from a credential and
//! forwards filesystem operations to it, rewriting virtual paths so the
//! virtual root maps onto the chosen directory. It has no dependency on any
//! particular transport; `wrenchfs-fuse` adapts it to FUSE.
//!
//! # Features
//!
//! - Fixed credential table, fail-closed on unknown credentials
//! - Root containment for every translated path, symlinks included
//! - Opaque file handles with a per-descriptor cursor lock
//! - Verbatim pass-through of real filesystem errors as errno values
//! - Optional read-only sessions
//!
//! # Usage
//!
//! ```no_run
//! use wrenchfs_core::{PassthroughSession, RootTable};
//!
//! let root = RootTable::new(".").resolve("password1")?;
//! let session = PassthroughSession::new(root);
//!
//! let fh = session.open("/greeting", libc::O_RDONLY)?;
//! let bytes = session.read(fh, 0, 14)?;
//! session.release(fh)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod attr;
pub mod credential;
pub mod error;
pub mod handles;
pub mod ops;
pub mod path;
pub mod session;

pub use attr::{FileKind, FileStat, FsStats};
pub use credential::{BackingRoot, ResolveError, RootTable};
pub use error::{PassthroughError, PassthroughResult, ToErrno};
pub use handles::{OpenFile, OpenFileTable};
pub use ops::{PathOp, PathReply};
pub use path::{PathTranslator, SymlinkPolicy};
pub use session::{DirEntries, DirEntry, PassthroughSession, checked_offset};
