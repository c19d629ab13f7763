//! FUSE adapter for the credential-gated passthrough filesystem.
//!
//! Maps kernel inode numbers to virtual paths and forwards each request to a
//! [`wrenchfs_core::PassthroughSession`]. One mount serves exactly one
//! backing root, chosen before mounting.
//!
//! # Usage
//!
//! ```no_run
//! use wrenchfs_core::{PassthroughSession, RootTable};
//! use wrenchfs_fuse::{MountConfig, mount};
//!
//! let root = RootTable::new("/srv/roots").resolve("password1")?;
//! let handle = mount(
//!     PassthroughSession::new(root),
//!     std::path::Path::new("/mnt/wrench"),
//!     MountConfig::default(),
//! )?;
//! // ... serve until done ...
//! handle.unmount();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod inode;

pub use backend::{WrenchMountHandle, is_available, mount, mount_options};
pub use config::MountConfig;
pub use error::{FuseError, FuseResult, MountError, ToErrno};
pub use filesystem::WrenchFS;
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};
