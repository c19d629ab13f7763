//! Mount session: the operation dispatcher for one backing root.
//!
//! A [`PassthroughSession`] owns the backing root and the open-file table
//! for one mount. Every operation takes a virtual path (or a handle issued
//! by this session), translates it, and performs the equivalent real
//! operation. Real-filesystem errors come back unchanged.
//!
//! The operations with bespoke handling live here: attribute query,
//! directory listing, open/create, read/write/release and the other
//! handle-scoped calls. Everything else goes through
//! [`PassthroughSession::apply`] in [`crate::ops`].
//!
//! # Thread Safety
//!
//! The session is `Send + Sync` and every method takes `&self`. Reads and
//! writes on one handle are serialized by that handle's cursor lock; all
//! other operations run without locking.

use crate::attr::{FileKind, FileStat};
use crate::credential::BackingRoot;
use crate::error::{PassthroughError, PassthroughResult};
use crate::handles::{OpenFile, OpenFileTable};
use crate::path::PathTranslator;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Flags `create` hands to `OpenOptions` rather than passing through.
const MANAGED_FLAGS: i32 = libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC;

/// Flags `open` hands to `OpenOptions`. `O_TRUNC` goes to the kernel as-is.
const OPEN_MANAGED_FLAGS: i32 = libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL;

/// One directory entry as returned by [`PassthroughSession::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

/// Lazy listing of one directory, `.` and `..` first.
///
/// Finite and single-pass; listing again requires a fresh
/// [`PassthroughSession::readdir`] call.
#[derive(Debug)]
pub struct DirEntries {
    dots_emitted: u8,
    inner: fs::ReadDir,
}

impl Iterator for DirEntries {
    type Item = PassthroughResult<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dots_emitted < 2 {
            let name = if self.dots_emitted == 0 { "." } else { ".." };
            self.dots_emitted += 1;
            return Some(Ok(DirEntry {
                name: OsString::from(name),
                kind: FileKind::Directory,
            }));
        }

        let entry = match self.inner.next()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e.into())),
        };
        Some(
            entry
                .file_type()
                .map(|ft| DirEntry {
                    name: entry.file_name(),
                    kind: FileKind::from(ft),
                })
                .map_err(PassthroughError::from),
        )
    }
}

/// Access mode requested by open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AccessMode {
    read: bool,
    write: bool,
}

impl AccessMode {
    fn from_flags(flags: i32) -> PassthroughResult<Self> {
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => Ok(Self { read: true, write: false }),
            libc::O_WRONLY => Ok(Self { read: false, write: true }),
            libc::O_RDWR => Ok(Self { read: true, write: true }),
            other => Err(PassthroughError::InvalidArgument(format!(
                "access mode {other:#o}"
            ))),
        }
    }
}

/// Converts a transport offset, rejecting negative values.
pub fn checked_offset(offset: i64) -> PassthroughResult<u64> {
    u64::try_from(offset)
        .map_err(|_| PassthroughError::InvalidArgument(format!("negative offset {offset}")))
}

/// State for one mount: the backing root and its open files.
#[derive(Debug)]
pub struct PassthroughSession {
    root: BackingRoot,
    files: OpenFileTable,
    read_only: bool,
}

impl PassthroughSession {
    pub fn new(root: BackingRoot) -> Self {
        info!(root = %root.path().display(), "Session started");
        Self {
            root,
            files: OpenFileTable::new(),
            read_only: false,
        }
    }

    /// Rejects every mutating operation with `EROFS` when set.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn root(&self) -> &BackingRoot {
        &self.root
    }

    pub fn translator(&self) -> PathTranslator<'_> {
        PathTranslator::new(&self.root)
    }

    /// The session's open-file table.
    pub fn files(&self) -> &OpenFileTable {
        &self.files
    }

    pub(crate) fn ensure_writable(&self) -> PassthroughResult<()> {
        if self.read_only {
            Err(PassthroughError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Raw `lstat` of the entry at `virtual_path`.
    pub fn getattr(&self, virtual_path: impl AsRef<Path>) -> PassthroughResult<FileStat> {
        let real = self.translator().translate(virtual_path)?;
        let metadata = fs::symlink_metadata(&real)?;
        Ok(FileStat::from(&metadata))
    }

    /// `fstat` of an open handle.
    pub fn getattr_handle(&self, fh: u64) -> PassthroughResult<FileStat> {
        let open = self.files.get(fh)?;
        let metadata = open.file().metadata()?;
        Ok(FileStat::from(&metadata))
    }

    /// Lists the directory at `virtual_path`.
    ///
    /// Fails up front with the real error (`ENOENT`, `ENOTDIR`); errors on
    /// individual entries surface as items.
    pub fn readdir(&self, virtual_path: impl AsRef<Path>) -> PassthroughResult<DirEntries> {
        let real = self.translator().translate_following(virtual_path)?;
        let inner = fs::read_dir(&real)?;
        Ok(DirEntries {
            dots_emitted: 0,
            inner,
        })
    }

    /// Opens an existing file and returns a fresh handle.
    ///
    /// `O_CREAT` and `O_EXCL` are ignored here; use [`Self::create`].
    pub fn open(&self, virtual_path: impl AsRef<Path>, flags: i32) -> PassthroughResult<u64> {
        let access = AccessMode::from_flags(flags)?;
        let truncate = flags & libc::O_TRUNC != 0;
        if access.write || truncate {
            self.ensure_writable()?;
        }

        let real = self.translator().translate_following(virtual_path)?;
        let file = OpenOptions::new()
            .read(access.read)
            .write(access.write)
            .custom_flags(flags & !OPEN_MANAGED_FLAGS)
            .open(&real)?;

        Ok(self.files.insert(OpenFile::new(file, flags, real)))
    }

    /// Creates (or truncates) a file with `mode` and returns a fresh handle.
    ///
    /// The file is always opened writable: a read-only access mode is
    /// widened to read-write. An existing file is truncated unless
    /// `O_EXCL` is set, in which case it is an `EEXIST` error.
    pub fn create(
        &self,
        virtual_path: impl AsRef<Path>,
        flags: i32,
        mode: u32,
    ) -> PassthroughResult<u64> {
        self.ensure_writable()?;
        let access = AccessMode::from_flags(flags)?;
        let exclusive = flags & libc::O_EXCL != 0;

        let real = self.translator().translate_following(virtual_path)?;
        let file = OpenOptions::new()
            .read(access.read)
            .write(true)
            .create(true)
            .create_new(exclusive)
            .truncate(!exclusive)
            .mode(mode & 0o7777)
            .custom_flags(flags & !MANAGED_FLAGS)
            .open(&real)?;

        let flags = (flags & !libc::O_ACCMODE)
            | if access.read { libc::O_RDWR } else { libc::O_WRONLY };
        Ok(self.files.insert(OpenFile::new(file, flags, real)))
    }

    /// Reads up to `size` bytes at `offset`.
    ///
    /// Returns fewer bytes only at end of file; an offset at or past EOF
    /// yields an empty buffer.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> PassthroughResult<Vec<u8>> {
        let open = self.files.get(fh)?;
        Ok(open.read_at(offset, size)?)
    }

    /// Writes all of `data` at `offset` and returns the byte count.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> PassthroughResult<usize> {
        self.ensure_writable()?;
        let open = self.files.get(fh)?;
        Ok(open.write_at(offset, data)?)
    }

    /// Closes a handle.
    ///
    /// Fails only for an unknown handle; a failing close is logged.
    pub fn release(&self, fh: u64) -> PassthroughResult<()> {
        self.files.release(fh)
    }

    /// Flushes file data and metadata of an open handle.
    pub fn flush(&self, fh: u64) -> PassthroughResult<()> {
        let open = self.files.get(fh)?;
        open.file().sync_all()?;
        Ok(())
    }

    /// `fdatasync` when `datasync` is set, `fsync` otherwise.
    pub fn fsync(&self, fh: u64, datasync: bool) -> PassthroughResult<()> {
        let open = self.files.get(fh)?;
        if datasync {
            open.file().sync_data()?;
        } else {
            open.file().sync_all()?;
        }
        Ok(())
    }

    /// `ftruncate` on an open handle.
    pub fn truncate_handle(&self, fh: u64, size: u64) -> PassthroughResult<()> {
        self.ensure_writable()?;
        let open = self.files.get(fh)?;
        open.file().set_len(size)?;
        Ok(())
    }

    /// Closes every open handle. Returns how many were still open.
    pub fn close_all(&self) -> usize {
        let count = self.files.close_all();
        if count > 0 {
            warn!(count, "Closed handles still open at session end");
        } else {
            debug!("No open handles at session end");
        }
        count
    }
}

impl Drop for PassthroughSession {
    fn drop(&mut self) {
        self.close_all();
    }
}
