//! FUSE filesystem implementation for a passthrough session.
//!
//! This module implements the fuser `Filesystem` trait on top of
//! [`PassthroughSession`]. The kernel speaks in inode numbers; every request
//! is turned back into a virtual path through the [`InodeTable`] and handed
//! to the session, whose result (or errno) goes straight back to the kernel.
//!
//! Reads and writes are moved onto a blocking thread pool so several
//! transfers can be in flight at once. Everything else runs inline on the
//! FUSE session thread.

use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult, ToErrno};
use crate::inode::{InodeTable, ROOT_INODE};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Runtime;
use tracing::{debug, info, trace, warn};
use wrenchfs_core::{
    FileKind, FileStat, PassthroughSession, PathOp, PathReply, checked_offset,
};

/// Converts a backing file kind to the FUSE file type.
pub fn fuse_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Symlink => FileType::Symlink,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Socket => FileType::Socket,
    }
}

/// Builds a FUSE attribute from raw backing metadata under our inode number.
#[allow(clippy::cast_possible_truncation)]
pub fn file_attr(ino: u64, stat: &FileStat) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.ctime,
        kind: fuse_file_type(stat.kind),
        perm: stat.permissions() as u16,
        nlink: u32::try_from(stat.nlink).unwrap_or(u32::MAX),
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev as u32,
        blksize: u32::try_from(stat.blksize).unwrap_or(u32::MAX),
        flags: 0,
    }
}

fn resolve_time(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|t| match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    })
}

/// Replies to an xattr query following the size-query protocol (size 0 asks for the length).
fn reply_xattr(reply: ReplyXattr, size: u32, value: &[u8]) {
    let Ok(len) = u32::try_from(value.len()) else {
        reply.error(libc::E2BIG);
        return;
    };
    if size == 0 {
        reply.size(len);
    } else if len > size {
        reply.error(libc::ERANGE);
    } else {
        reply.data(value);
    }
}

/// FUSE filesystem forwarding every request to one backing root.
pub struct WrenchFS {
    /// Shared with in-flight read/write workers.
    session: Arc<PassthroughSession>,
    inodes: InodeTable,
    /// Blocking pool for reads and writes.
    runtime: Runtime,
    config: MountConfig,
}

impl WrenchFS {
    /// Creates the filesystem for `session`.
    ///
    /// A read-only config makes the session read-only as well.
    pub fn new(session: PassthroughSession, config: MountConfig) -> FuseResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.io_threads)
            .thread_name("wrenchfs-io")
            .build()
            .map_err(|e| {
                FuseError::from(std::io::Error::other(format!(
                    "Failed to create tokio runtime: {e}"
                )))
            })?;

        let read_only = config.read_only || session.is_read_only();
        let session = session.read_only(read_only);

        info!(
            root = %session.root().path().display(),
            read_only,
            io_threads = config.io_threads,
            "WrenchFS initialized"
        );

        Ok(Self {
            session: Arc::new(session),
            inodes: InodeTable::new(),
            runtime,
            config,
        })
    }

    /// The session serving this filesystem.
    pub fn session(&self) -> &Arc<PassthroughSession> {
        &self.session
    }

    fn path_of(&self, ino: u64) -> FuseResult<PathBuf> {
        self.inodes.path(ino).ok_or(FuseError::InvalidInode(ino))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> FuseResult<PathBuf> {
        self.inodes
            .child_path(parent, name)
            .ok_or(FuseError::InvalidInode(parent))
    }

    /// Stats `path`, registers it as looked up, and returns its attribute.
    fn lookup_path(&self, path: &Path) -> FuseResult<FileAttr> {
        let stat = self.session.getattr(path)?;
        let ino = self.inodes.get_or_insert(path);
        Ok(file_attr(ino, &stat))
    }

    fn attr_of(&self, ino: u64, fh: Option<u64>) -> FuseResult<FileAttr> {
        let stat = match fh {
            Some(fh) => self.session.getattr_handle(fh)?,
            None => self.session.getattr(self.path_of(ino)?)?,
        };
        Ok(file_attr(ino, &stat))
    }

    /// Runs a path operation on `parent/name` and replies with the new entry.
    fn create_entry(&self, parent: u64, name: &OsStr, op: PathOp) -> FuseResult<FileAttr> {
        let path = self.child_of(parent, name)?;
        self.session.apply(&path, op)?;
        self.lookup_path(&path)
    }

    /// Releases a handle that was never handed to the kernel.
    fn discard_handle(&self, fh: u64) {
        if let Err(e) = self.session.release(fh) {
            warn!(fh, error = %e, "Failed to release unreported handle");
        }
    }

    fn apply_on_inode(&self, ino: u64, op: PathOp) -> FuseResult<PathReply> {
        let path = self.path_of(ino)?;
        Ok(self.session.apply(&path, op)?)
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr_inner(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> FuseResult<FileAttr> {
        let path = self.path_of(ino)?;

        if let Some(mode) = mode {
            self.session.apply(&path, PathOp::Chmod { mode })?;
        }
        if uid.is_some() || gid.is_some() {
            self.session.apply(&path, PathOp::Chown { uid, gid })?;
        }
        if let Some(size) = size {
            match fh {
                Some(fh) => self.session.truncate_handle(fh, size)?,
                None => {
                    self.session.apply(&path, PathOp::Truncate { size })?;
                }
            }
        }
        if atime.is_some() || mtime.is_some() {
            self.session.apply(
                &path,
                PathOp::SetTimes {
                    atime: resolve_time(atime),
                    mtime: resolve_time(mtime),
                },
            )?;
        }

        self.attr_of(ino, fh)
    }

    fn readdir_inner(&self, ino: u64, offset: i64, reply: &mut ReplyDirectory) -> FuseResult<()> {
        let path = self.path_of(ino)?;
        let skip = usize::try_from(offset)
            .map_err(|_| FuseError::InvalidArgument(format!("readdir offset {offset}")))?;
        let parent_ino = path
            .parent()
            .and_then(|parent| self.inodes.get_inode(parent))
            .unwrap_or(ROOT_INODE);

        for (i, entry) in self.session.readdir(&path)?.enumerate().skip(skip) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let entry_ino = match entry.name.as_bytes() {
                b"." => ino,
                b".." => parent_ino,
                _ => self
                    .inodes
                    .get_or_insert_no_lookup_inc(&path.join(&entry.name)),
            };
            let next_offset = i64::try_from(i + 1).unwrap_or(i64::MAX);
            // add() returns true when the reply buffer is full
            if reply.add(entry_ino, next_offset, fuse_file_type(entry.kind), &entry.name) {
                break;
            }
        }
        Ok(())
    }
}

impl Filesystem for WrenchFS {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        info!("FUSE filesystem initialized");
        // Enable async reads so concurrent readers reach the blocking pool together
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        Ok(())
    }

    fn destroy(&mut self) {
        let open = self.session.close_all();
        info!(open_handles = open, "FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, name = ?name, "lookup");
        match self
            .child_of(parent, name)
            .and_then(|path| self.lookup_path(&path))
        {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, ?fh, "getattr");
        match self.attr_of(ino, fh) {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, ?mode, ?uid, ?gid, ?size, ?fh, "setattr");
        match self.setattr_inner(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&self.config.attr_ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        match self.apply_on_inode(ino, PathOp::Readlink) {
            Ok(PathReply::Target(target)) => reply.data(target.as_os_str().as_bytes()),
            Ok(_) => reply.error(libc::EIO),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?name, mode, "mknod");
        let op = PathOp::Mknod {
            mode: mode & !umask,
            rdev: u64::from(rdev),
        };
        match self.create_entry(parent, name, op) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?name, mode, "mkdir");
        match self.create_entry(parent, name, PathOp::Mkdir { mode: mode & !umask }) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "unlink");
        let result = self.child_of(parent, name).and_then(|path| {
            self.session.apply(&path, PathOp::Unlink)?;
            self.inodes.invalidate_path(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "rmdir");
        let result = self.child_of(parent, name).and_then(|path| {
            self.session.apply(&path, PathOp::Rmdir)?;
            self.inodes.invalidate_path(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?link_name, target = %target.display(), "symlink");
        let op = PathOp::Symlink {
            target: target.to_path_buf(),
        };
        match self.create_entry(parent, link_name, op) {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent, name = ?name, newparent, newname = ?newname, flags, "rename");
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE have no portable primitive
            reply.error(libc::EINVAL);
            return;
        }

        let result = self.child_of(parent, name).and_then(|from| {
            let to = self.child_of(newparent, newname)?;
            self.session.apply(&from, PathOp::Rename { to: to.clone() })?;
            self.inodes.rename_subtree(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        trace!(inode = ino, newparent, newname = ?newname, "link");
        let result = self.path_of(ino).and_then(|existing| {
            let to = self.child_of(newparent, newname)?;
            self.session.apply(&existing, PathOp::Link { to: to.clone() })?;
            self.lookup_path(&to)
        });
        match result {
            Ok(attr) => reply.entry(&self.config.attr_ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        let result = self
            .path_of(ino)
            .and_then(|path| Ok(self.session.open(&path, flags)?));
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        let offset = match checked_offset(offset) {
            Ok(offset) => offset,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let session = Arc::clone(&self.session);
        self.runtime.spawn_blocking(move || {
            match session.read(fh, offset, size) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh, offset, len = data.len(), "write");
        let offset = match checked_offset(offset) {
            Ok(offset) => offset,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let session = Arc::clone(&self.session);
        let data = data.to_vec();
        self.runtime.spawn_blocking(move || {
            match session.write(fh, offset, &data) {
                Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        match self.session.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, "release");
        if let Err(e) = self.session.release(fh) {
            warn!(fh, error = %e, "Release of unknown handle");
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh, datasync, "fsync");
        match self.session.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        // Listing happens per readdir call; this only surfaces ENOENT/ENOTDIR early
        let result = self
            .path_of(ino)
            .and_then(|path| Ok(self.session.readdir(&path).map(drop)?));
        match result {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, offset, "readdir");
        match self.readdir_inner(ino, offset, &mut reply) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        trace!(inode = ino, "statfs");
        match self.apply_on_inode(ino, PathOp::Statfs) {
            Ok(PathReply::Statfs(st)) => reply.statfs(
                st.blocks,
                st.blocks_free,
                st.blocks_available,
                st.files,
                st.files_free,
                st.block_size,
                st.name_max,
                st.fragment_size,
            ),
            Ok(_) => reply.error(libc::EIO),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, name = ?name, len = value.len(), "setxattr");
        let op = PathOp::SetXattr {
            name: name.to_os_string(),
            value: value.to_vec(),
            flags,
        };
        match self.apply_on_inode(ino, op) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        trace!(inode = ino, name = ?name, size, "getxattr");
        let op = PathOp::GetXattr {
            name: name.to_os_string(),
        };
        match self.apply_on_inode(ino, op) {
            Ok(PathReply::Xattr(value)) => reply_xattr(reply, size, &value),
            Ok(_) => reply.error(libc::EIO),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        trace!(inode = ino, size, "listxattr");
        match self.apply_on_inode(ino, PathOp::ListXattr) {
            Ok(PathReply::XattrNames(names)) => reply_xattr(reply, size, &names),
            Ok(_) => reply.error(libc::EIO),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(inode = ino, name = ?name, "removexattr");
        let op = PathOp::RemoveXattr {
            name: name.to_os_string(),
        };
        match self.apply_on_inode(ino, op) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!(inode = ino, mask, "access");
        match self.apply_on_inode(ino, PathOp::Access { mask }) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        trace!(parent, name = ?name, mode, flags, "create");
        let result = self.child_of(parent, name).and_then(|path| {
            let fh = self.session.create(&path, flags, mode & !umask)?;
            match self.lookup_path(&path) {
                Ok(attr) => Ok((attr, fh)),
                Err(e) => {
                    // The kernel never learns about this handle
                    self.discard_handle(fh);
                    Err(e)
                }
            }
        });
        match result {
            Ok((attr, fh)) => reply.created(&self.config.attr_ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
