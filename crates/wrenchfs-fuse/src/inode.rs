//! Inode management for the FUSE filesystem.
//!
//! FUSE addresses entries by inode number while the session works on
//! virtual paths. This table keeps the bidirectional mapping, with the
//! kernel's `nlookup` reference count on each entry deciding when an inode
//! can be dropped.

use dashmap::DashMap;
use dashmap::mapref::one::Ref;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Virtual path, always absolute (`/` for the root).
    pub path: PathBuf,
    /// Lookup count for proper `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: PathBuf, nlookup: u64) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrements the lookup count and returns the new value, or `None` on underflow.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::AcqRel);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::Relaxed);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

/// Thread-safe map between inode numbers and virtual paths.
#[derive(Debug)]
pub struct InodeTable {
    path_to_ino: DashMap<PathBuf, u64>,
    entries: DashMap<u64, InodeEntry>,
    next_ino: AtomicU64,
}

impl InodeTable {
    /// Creates a table with the root pre-allocated.
    pub fn new() -> Self {
        let table = Self {
            path_to_ino: DashMap::new(),
            entries: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INODE + 1),
        };
        let root = PathBuf::from("/");
        table.path_to_ino.insert(root.clone(), ROOT_INODE);
        table.entries.insert(ROOT_INODE, InodeEntry::new(root, 1));
        table
    }

    /// Virtual path of `name` inside the directory `parent`.
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.entries.get(&parent).map(|e| e.path.join(name))
    }

    /// Virtual path of an inode.
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.entries.get(&ino).map(|e| e.path.clone())
    }

    pub fn get(&self, ino: u64) -> Option<Ref<'_, u64, InodeEntry>> {
        self.entries.get(&ino)
    }

    pub fn get_inode(&self, path: &Path) -> Option<u64> {
        self.path_to_ino.get(path).map(|r| *r)
    }

    /// Returns the inode for `path`, allocating one if needed, and counts a lookup.
    pub fn get_or_insert(&self, path: &Path) -> u64 {
        self.insert_with_nlookup(path, 1)
    }

    /// Like [`Self::get_or_insert`] but without counting a lookup.
    ///
    /// Used for `readdir` entries, which must not affect `nlookup`.
    pub fn get_or_insert_no_lookup_inc(&self, path: &Path) -> u64 {
        self.insert_with_nlookup(path, 0)
    }

    fn insert_with_nlookup(&self, path: &Path, nlookup: u64) -> u64 {
        if let Some(ino) = self.get_inode(path) {
            if nlookup > 0
                && let Some(entry) = self.entries.get(&ino)
            {
                entry.inc_nlookup();
            }
            return ino;
        }

        let mut created = false;
        let ino = *self
            .path_to_ino
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
                self.entries
                    .insert(ino, InodeEntry::new(path.to_path_buf(), nlookup));
                created = true;
                ino
            });
        if !created
            && nlookup > 0
            && let Some(entry) = self.entries.get(&ino)
        {
            entry.inc_nlookup();
        }
        ino
    }

    /// Decrements the lookup count, evicting the inode at zero.
    ///
    /// Returns `true` if the inode was evicted. The root is never evicted.
    pub fn forget(&self, ino: u64, nlookup: u64) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        if let Some(entry) = self.entries.get(&ino)
            && let Some(remaining) = entry.dec_nlookup(nlookup)
            && remaining == 0
        {
            drop(entry);
            return self.evict(ino);
        }
        false
    }

    fn evict(&self, ino: u64) -> bool {
        let Some((_, entry)) = self.entries.remove(&ino) else {
            return false;
        };
        self.path_to_ino
            .remove_if(&entry.path, |_, mapped| *mapped == ino);
        true
    }

    /// Drops the path mapping after the entry was removed.
    ///
    /// An inode the kernel holds no lookups on is evicted right away;
    /// otherwise it stays until the kernel forgets it.
    pub fn invalidate_path(&self, path: &Path) {
        if path == Path::new("/") {
            return;
        }
        if let Some((_, ino)) = self.path_to_ino.remove(path) {
            self.entries.remove_if(&ino, |_, entry| entry.nlookup() == 0);
        }
    }

    /// Moves `from` and every known descendant under `to`.
    ///
    /// Any inode previously mapped at `to` (an overwritten target) loses its
    /// path mapping.
    pub fn rename_subtree(&self, from: &Path, to: &Path) {
        self.invalidate_path(to);

        let moved: Vec<(u64, PathBuf, PathBuf)> = self
            .entries
            .iter()
            .filter_map(|e| {
                let rest = e.path.strip_prefix(from).ok()?;
                let new_path = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
                Some((*e.key(), e.path.clone(), new_path))
            })
            .collect();

        // Never hold an `entries` guard while touching `path_to_ino`
        for (ino, old_path, new_path) in moved {
            self.path_to_ino
                .remove_if(&old_path, |_, mapped| *mapped == ino);
            if let Some(mut entry) = self.entries.get_mut(&ino) {
                entry.path.clone_from(&new_path);
            }
            self.path_to_ino.insert(new_path, ino);
        }
    }

    /// Number of inodes in the table, root included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when only the root is left.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
