//! Sync-root relative paths
//!
//! Everything exchanged with the server is relative to the sync root. The
//! prefix is stripped here, once, on structured `Path` values.

use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// The absolute directory that scopes synchronization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRoot {
    root: PathBuf,
}

impl SyncRoot {
    /// Canonicalize `path` and use it as the sync root
    ///
    /// # Errors
    /// Returns an error if the path does not exist or is not a directory
    pub fn open(path: &Path) -> Result<Self, PathError> {
        let root = std::fs::canonicalize(path).map_err(|source| PathError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        if !root.is_dir() {
            return Err(PathError::NotADirectory(root));
        }
        Ok(Self { root })
    }

    /// Use an already-absolute path as the root without touching the filesystem
    ///
    /// # Errors
    /// Returns an error if `root` is not absolute
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PathError> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(PathError::NotAbsolute(root));
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Strip the root prefix from an absolute path
    ///
    /// The root itself relativizes to the empty path.
    ///
    /// # Errors
    /// Returns an error if `path` lies outside the root
    pub fn relativize(&self, path: &Path) -> Result<PathBuf, PathError> {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .map_err(|_| PathError::OutsideRoot {
                path: path.to_path_buf(),
                root: self.root.clone(),
            })
    }

    /// Join a relative path back onto the root
    ///
    /// # Errors
    /// Returns an error if `relative` is absolute or climbs out with `..`
    pub fn absolute(&self, relative: &Path) -> Result<PathBuf, PathError> {
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(PathError::NotRelative(relative.to_path_buf()));
        }
        Ok(self.root.join(relative))
    }
}

/// Raw bytes of a relative path as sent on the wire
#[must_use]
pub fn wire_bytes(relative: &Path) -> &[u8] {
    relative.as_os_str().as_encoded_bytes()
}

/// Number of components, used as directory depth
#[must_use]
pub fn depth(relative: &Path) -> usize {
    relative
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}
