//! Open-file table.
//!
//! Maps opaque `u64` handles to open descriptors on backing files. The
//! table itself is a sharded concurrent map; each descriptor additionally
//! carries its own cursor lock that serializes the seek-then-transfer pair
//! for reads and writes. The two are independent: looking up or releasing a
//! handle never waits on a transfer in progress on another handle.
//!
//! # Handle Lifecycle
//!
//! 1. **Insert**: `open`/`create` registers a descriptor and returns a fresh id
//! 2. **Get**: read/write/flush clone the descriptor out of the table
//! 3. **Remove**: `release` unregisters the id; the descriptor closes when
//!    its last reference drops, and a failed close is logged either way

use crate::error::{PassthroughError, PassthroughResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Thread-safe map from auto-generated `u64` ids to values.
///
/// Ids start at 1 (0 is reserved for "no handle") and wrap back to 1 on
/// overflow. An id still in use is never reissued.
#[derive(Debug)]
pub struct HandleTable<V> {
    handles: DashMap<u64, V>,
    next_id: AtomicU64,
}

impl<V> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a value under a freshly generated id.
    pub fn insert_auto(&self, value: V) -> u64 {
        loop {
            let id = match self
                .next_id
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(current.checked_add(1).unwrap_or(1))
                }) {
                Ok(id) | Err(id) => id,
            };
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.handles.entry(id) {
                entry.insert(value);
                return id;
            }
        }
    }

    /// Removes an id and returns its value.
    pub fn remove(&self, id: u64) -> Option<V> {
        self.handles.remove(&id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<(u64, V)> {
        let ids: Vec<u64> = self.handles.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.handles.remove(&id))
            .collect()
    }
}

impl<V: Clone> HandleTable<V> {
    /// Returns a clone of the value so the map shard is not held by the caller.
    pub fn get_cloned(&self, id: u64) -> Option<V> {
        self.handles.get(&id).map(|v| v.value().clone())
    }
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// A descriptor on a backing file plus the lock guarding its cursor.
#[derive(Debug)]
pub struct OpenFile {
    /// Present until `Drop` takes it to close.
    file: Option<File>,
    cursor: Mutex<()>,
    flags: i32,
    real_path: PathBuf,
}

impl OpenFile {
    pub fn new(file: File, flags: i32, real_path: PathBuf) -> Self {
        Self {
            file: Some(file),
            cursor: Mutex::new(()),
            flags,
            real_path,
        }
    }

    /// Flags the descriptor was opened with.
    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Real path at open time. Not updated if the file is later renamed.
    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    pub fn file(&self) -> &File {
        match &self.file {
            Some(file) => file,
            None => unreachable!("descriptor is only taken in drop"),
        }
    }

    /// Seeks to `offset` and reads up to `size` bytes as one critical section.
    ///
    /// Keeps reading until `size` bytes are collected or EOF is hit, so a
    /// short result always means end of file.
    pub fn read_at(&self, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let _cursor = self.cursor.lock();
        let mut file = self.file();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(size as usize);
        file.take(u64::from(size)).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Seeks to `offset` and writes all of `data` as one critical section.
    ///
    /// Descriptors opened with `O_APPEND` ignore the offset; the kernel
    /// positions every write at end of file.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let _cursor = self.cursor.lock();
        let mut file = self.file();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }
}

impl Drop for OpenFile {
    /// Closes the descriptor through `close(2)` so its result can be logged.
    fn drop(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        match nix::unistd::close(file) {
            Ok(()) => debug!(path = %self.real_path.display(), "Closed open file"),
            Err(e) => warn!(path = %self.real_path.display(), error = %e, "Close failed"),
        }
    }
}

/// Table of descriptors opened by one session.
#[derive(Debug, Default)]
pub struct OpenFileTable {
    table: HandleTable<Arc<OpenFile>>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor and returns its handle.
    pub fn insert(&self, file: OpenFile) -> u64 {
        let path = file.real_path.clone();
        let fh = self.table.insert_auto(Arc::new(file));
        debug!(fh, path = %path.display(), "Registered open file");
        fh
    }

    /// Looks up a live handle.
    pub fn get(&self, fh: u64) -> PassthroughResult<Arc<OpenFile>> {
        self.table
            .get_cloned(fh)
            .ok_or(PassthroughError::InvalidHandle(fh))
    }

    /// Unregisters a handle and closes its descriptor.
    ///
    /// The handle is invalid as soon as this returns, even if the close
    /// itself failed; close failures are logged, not returned. If another
    /// thread is mid-transfer on the descriptor, the close happens (and is
    /// logged) when that transfer drops its reference.
    pub fn release(&self, fh: u64) -> PassthroughResult<()> {
        let open = self
            .table
            .remove(fh)
            .ok_or(PassthroughError::InvalidHandle(fh))?;
        close_open_file(fh, open);
        Ok(())
    }

    /// Releases every handle. Returns how many were still open.
    pub fn close_all(&self) -> usize {
        let drained = self.table.drain();
        let count = drained.len();
        for (fh, open) in drained {
            close_open_file(fh, open);
        }
        count
    }

    pub fn contains(&self, fh: u64) -> bool {
        self.table.contains(fh)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

fn close_open_file(fh: u64, open: Arc<OpenFile>) {
    if Arc::strong_count(&open) > 1 {
        debug!(
            fh,
            path = %open.real_path.display(),
            "Handle released during transfer, close deferred"
        );
    }
    drop(open);
}
