//! Virtual-to-real path translation with root containment.
//!
//! Virtual paths arrive unsanitized. Translation normalizes them lexically,
//! rejecting any `..` that would climb above the virtual root, and then
//! canonicalizes the deepest existing ancestor of the result to make sure no
//! symlink on the way leads outside the backing root.
//!
//! Containment is checked at translation time. A symlink swapped in between
//! translation and the real operation is not caught here.

use crate::credential::BackingRoot;
use crate::error::{PassthroughError, PassthroughResult};
use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Whether the final path component is resolved if it is a symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkPolicy {
    /// Operate on the final component itself (lstat, unlink, rename, readlink).
    NoFollow,
    /// The real operation dereferences the final component (open, chmod, readdir).
    Follow,
}

/// Normalizes a virtual path into a root-relative path.
///
/// `.` segments and repeated separators are dropped. A `..` that would pop
/// past the virtual root is an [`PassthroughError::Escape`], never clamped.
pub fn normalize_virtual(virtual_path: &Path) -> PassthroughResult<PathBuf> {
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in virtual_path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => parts.push(name),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(escape(virtual_path));
                }
            }
            Component::Prefix(_) => return Err(escape(virtual_path)),
        }
    }
    Ok(parts.into_iter().collect())
}

fn escape(virtual_path: &Path) -> PassthroughError {
    PassthroughError::Escape(virtual_path.display().to_string())
}

/// Rewrites virtual paths into real paths under one backing root.
///
/// Stateless apart from the borrowed root; safe to use from any thread.
#[derive(Debug, Clone, Copy)]
pub struct PathTranslator<'a> {
    root: &'a BackingRoot,
}

impl<'a> PathTranslator<'a> {
    pub fn new(root: &'a BackingRoot) -> Self {
        Self { root }
    }

    /// Translates a path whose final component is operated on directly.
    pub fn translate(&self, virtual_path: impl AsRef<Path>) -> PassthroughResult<PathBuf> {
        self.translate_with(virtual_path.as_ref(), SymlinkPolicy::NoFollow)
    }

    /// Translates a path whose final component the real operation follows.
    pub fn translate_following(&self, virtual_path: impl AsRef<Path>) -> PassthroughResult<PathBuf> {
        self.translate_with(virtual_path.as_ref(), SymlinkPolicy::Follow)
    }

    /// Translates `virtual_path` under the given symlink policy.
    pub fn translate_with(
        &self,
        virtual_path: &Path,
        policy: SymlinkPolicy,
    ) -> PassthroughResult<PathBuf> {
        let relative = normalize_virtual(virtual_path)?;
        let root = self.root.path();
        if relative.as_os_str().is_empty() {
            return Ok(root.to_path_buf());
        }

        let real = root.join(&relative);
        match policy {
            SymlinkPolicy::NoFollow => {
                if let Some(parent) = real.parent() {
                    self.check_ancestors(parent, virtual_path)?;
                }
            }
            SymlinkPolicy::Follow => self.check_final(&real, virtual_path)?,
        }
        Ok(real)
    }

    /// Checks a path the real operation will dereference.
    ///
    /// A dangling symlink is refused outright: its target cannot be
    /// canonicalized, and following it with `O_CREAT` could create a file
    /// anywhere.
    fn check_final(&self, real: &Path, virtual_path: &Path) -> PassthroughResult<()> {
        match real.canonicalize() {
            Ok(canonical) => self.ensure_inside(&canonical, virtual_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let is_symlink = std::fs::symlink_metadata(real)
                    .is_ok_and(|m| m.file_type().is_symlink());
                if is_symlink {
                    return Err(escape(virtual_path));
                }
                match real.parent() {
                    Some(parent) => self.check_ancestors(parent, virtual_path),
                    None => Ok(()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Canonicalizes the deepest existing ancestor and checks containment.
    fn check_ancestors(&self, start: &Path, virtual_path: &Path) -> PassthroughResult<()> {
        let mut current = Some(start);
        while let Some(dir) = current {
            match dir.canonicalize() {
                Ok(canonical) => return self.ensure_inside(&canonical, virtual_path),
                // Missing ancestors make the real call fail with ENOENT anyway
                Err(e) if e.kind() == io::ErrorKind::NotFound => current = dir.parent(),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn ensure_inside(&self, canonical: &Path, virtual_path: &Path) -> PassthroughResult<()> {
        if canonical.starts_with(self.root.path()) {
            Ok(())
        } else {
            tracing::debug!(
                virtual_path = %virtual_path.display(),
                "Rejected path resolving outside backing root"
            );
            Err(escape(virtual_path))
        }
    }
}
