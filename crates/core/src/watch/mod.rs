//! Filesystem change notifications
//!
//! `EventSource` is the seam between the engine and whatever produces change
//! events. On Linux it is backed by inotify; tests script it.

pub mod decode;
#[cfg(target_os = "linux")]
pub mod inotify;

use std::io;
use std::path::{Path, PathBuf};

use crate::error::WatchError;
use crate::registry::WatchId;

#[cfg(target_os = "linux")]
pub use inotify::InotifySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Delete,
    Attrib,
    Modify,
}

/// One decoded change inside a watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub watch_id: WatchId,
    pub kind: ChangeKind,
    /// Entry name inside the watched directory; empty for the directory itself
    pub name: PathBuf,
    pub is_dir: bool,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(watch_id: WatchId, kind: ChangeKind, name: impl Into<PathBuf>, is_dir: bool) -> Self {
        Self {
            watch_id,
            kind,
            name: name.into(),
            is_dir,
        }
    }
}

/// Producer of change notifications for individually watched directories
pub trait EventSource {
    /// Start watching one directory (not its descendants)
    ///
    /// # Errors
    /// Returns an error if the watch cannot be installed
    fn add_watch(&mut self, path: &Path) -> io::Result<WatchId>;

    /// Stop watching
    ///
    /// # Errors
    /// Returns an error if the id is unknown to the source
    fn remove_watch(&mut self, id: WatchId) -> io::Result<()>;

    /// Block for the next batch of events
    ///
    /// An empty batch means the wait timed out, so callers can check for
    /// shutdown and call again.
    ///
    /// # Errors
    /// Returns an error if reading fails or the batch is malformed
    fn read_events(&mut self) -> Result<Vec<ChangeEvent>, WatchError>;
}

impl<S: EventSource + ?Sized> EventSource for &mut S {
    fn add_watch(&mut self, path: &Path) -> io::Result<WatchId> {
        (**self).add_watch(path)
    }

    fn remove_watch(&mut self, id: WatchId) -> io::Result<()> {
        (**self).remove_watch(id)
    }

    fn read_events(&mut self) -> Result<Vec<ChangeEvent>, WatchError> {
        (**self).read_events()
    }
}

impl<S: EventSource + ?Sized> EventSource for Box<S> {
    fn add_watch(&mut self, path: &Path) -> io::Result<WatchId> {
        (**self).add_watch(path)
    }

    fn remove_watch(&mut self, id: WatchId) -> io::Result<()> {
        (**self).remove_watch(id)
    }

    fn read_events(&mut self) -> Result<Vec<ChangeEvent>, WatchError> {
        (**self).read_events()
    }
}
