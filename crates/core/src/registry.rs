//! Watch id to directory bookkeeping

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::NotWatched;

/// Identifier handed out by the event source for one watched directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub i32);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps live watches to the relative directory each one observes
///
/// Both directions are exact-key maps and are always updated together.
#[derive(Debug, Default)]
pub struct PathRegistry {
    by_id: HashMap<WatchId, PathBuf>,
    by_path: HashMap<PathBuf, WatchId>,
}

impl PathRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the mapping for `id`
    pub fn register(&mut self, id: WatchId, relative: impl Into<PathBuf>) {
        let relative = relative.into();
        if let Some(old) = self.by_id.insert(id, relative.clone()) {
            if self.by_path.get(&old) == Some(&id) {
                self.by_path.remove(&old);
            }
        }
        if let Some(previous) = self.by_path.insert(relative, id) {
            // The same directory was watched under another id; only one may stay live
            if previous != id {
                self.by_id.remove(&previous);
            }
        }
    }

    /// Look up the directory observed by `id`
    ///
    /// # Errors
    /// Returns `NotWatched` if the id is not registered
    pub fn resolve(&self, id: WatchId) -> Result<&Path, NotWatched> {
        self.by_id
            .get(&id)
            .map(PathBuf::as_path)
            .ok_or(NotWatched(id))
    }

    /// Remove `id`; absent ids are a no-op
    pub fn unregister(&mut self, id: WatchId) -> Option<PathBuf> {
        let path = self.by_id.remove(&id)?;
        if self.by_path.get(&path) == Some(&id) {
            self.by_path.remove(&path);
        }
        Some(path)
    }

    /// The watch registered for exactly this directory
    #[must_use]
    pub fn watch_for(&self, relative: &Path) -> Option<WatchId> {
        self.by_path.get(relative).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WatchId, &Path)> {
        self.by_id.iter().map(|(id, path)| (*id, path.as_path()))
    }
}
