//! Shared sync context used by both the initial walk and the event loop

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{NotWatched, SyncError, WatchError};
use crate::paths::{SyncRoot, wire_bytes};
use crate::protocol::{Op, ProtocolClient, Status};
use crate::record::FileRecord;
use crate::registry::{PathRegistry, WatchId};
use crate::transport::Transport;
use crate::watch::{ChangeEvent, EventSource};

/// Owns the session, the event source and the watch registry for one root
#[derive(Debug)]
pub struct Engine<T, S> {
    root: SyncRoot,
    client: ProtocolClient<T>,
    source: S,
    registry: PathRegistry,
}

impl<T: Transport, S: EventSource> Engine<T, S> {
    pub fn new(root: SyncRoot, client: ProtocolClient<T>, source: S) -> Self {
        Self {
            root,
            client,
            source,
            registry: PathRegistry::new(),
        }
    }

    pub fn root(&self) -> &SyncRoot {
        &self.root
    }

    pub fn client(&self) -> &ProtocolClient<T> {
        &self.client
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn registry(&self) -> &PathRegistry {
        &self.registry
    }

    /// Release the session and the event source
    pub fn into_parts(self) -> (ProtocolClient<T>, S) {
        (self.client, self.source)
    }

    /// Send one entry's metadata and, if the server asks for it, its content
    ///
    /// # Errors
    /// `Stat` if the entry vanished, `Rejected` on a FAIL reply, or a
    /// protocol error
    pub fn sync_entry(&mut self, relative: &Path) -> Result<FileRecord, SyncError> {
        let absolute = self.root.absolute(relative)?;
        let record = FileRecord::capture(&absolute, relative)?;

        match self.client.sync_meta(&record)? {
            Status::Ok => {}
            Status::Fail => {
                return Err(SyncError::Rejected {
                    op: Op::SyncMeta,
                    path: record.path,
                });
            }
            Status::More => self.send_content(&absolute, &record)?,
        }
        Ok(record)
    }

    /// Send metadata only; a request for content is not honored
    ///
    /// # Errors
    /// Same as [`Engine::sync_entry`]
    pub fn sync_attributes(&mut self, relative: &Path) -> Result<FileRecord, SyncError> {
        let absolute = self.root.absolute(relative)?;
        let record = FileRecord::capture(&absolute, relative)?;

        match self.client.sync_meta(&record)? {
            Status::Ok => {}
            Status::Fail => {
                return Err(SyncError::Rejected {
                    op: Op::SyncMeta,
                    path: record.path,
                });
            }
            Status::More => debug!(
                "server wants content for {} after attribute change, not sending",
                relative.display()
            ),
        }
        Ok(record)
    }

    /// Ask the server to drop an entry, unwatching it first if it was a directory
    ///
    /// # Errors
    /// `Rejected` on a FAIL reply, or a protocol error
    pub fn remove_entry(&mut self, relative: &Path, is_dir: bool) -> Result<(), SyncError> {
        if is_dir {
            self.unwatch_dir(relative);
        }

        match self.client.remove(relative)? {
            Status::Fail => Err(SyncError::Rejected {
                op: Op::Remove,
                path: relative.to_path_buf(),
            }),
            Status::Ok | Status::More => Ok(()),
        }
    }

    /// Start watching one directory and record it in the registry
    ///
    /// # Errors
    /// `Watch` if the event source refuses the directory
    pub fn watch_dir(&mut self, relative: &Path) -> Result<WatchId, SyncError> {
        let absolute = self.root.absolute(relative)?;
        let id = self
            .source
            .add_watch(&absolute)
            .map_err(|source| SyncError::Watch {
                path: relative.to_path_buf(),
                source,
            })?;
        self.registry.register(id, relative);
        debug!("watch {id} on /{}", relative.display());
        Ok(id)
    }

    /// Drop the watch registered for exactly this directory, if any
    pub fn unwatch_dir(&mut self, relative: &Path) -> Option<WatchId> {
        let id = self.registry.watch_for(relative)?;
        // The kernel drops watches on deleted directories by itself
        if let Err(e) = self.source.remove_watch(id) {
            debug!("watch {id} already gone: {e}");
        }
        self.registry.unregister(id);
        debug!("unwatched {id} on /{}", relative.display());
        Some(id)
    }

    /// Path of the entry an event refers to, relative to the root
    ///
    /// # Errors
    /// `NotWatched` if the event's watch id is not registered
    pub fn resolve_event(&self, event: &ChangeEvent) -> Result<PathBuf, NotWatched> {
        let dir = self.registry.resolve(event.watch_id)?;
        if event.name.as_os_str().is_empty() {
            Ok(dir.to_path_buf())
        } else {
            Ok(dir.join(&event.name))
        }
    }

    /// Block for the next batch of change notifications
    ///
    /// # Errors
    /// Returns the event source's error
    pub fn next_batch(&mut self) -> Result<Vec<ChangeEvent>, WatchError> {
        self.source.read_events()
    }

    fn send_content(&mut self, absolute: &Path, record: &FileRecord) -> Result<(), SyncError> {
        let status = if let Some(target) = &record.link_target {
            let target = wire_bytes(target);
            self.client.sync_data(target, target.len() as u64)?
        } else if !record.is_regular() || record.hash.is_zero() {
            self.client.sync_data(io::empty(), 0)?
        } else {
            match File::open(absolute) {
                Ok(file) => self.client.sync_data(file, record.stat.size)?,
                Err(e) => {
                    warn!("cannot open {}: {e}", record.path.display());
                    self.client.sync_data(io::empty(), 0)?
                }
            }
        };

        if status != Status::Ok {
            warn!("content for {} answered {status:?}", record.path.display());
        }
        Ok(())
    }
}
