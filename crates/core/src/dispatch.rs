//! Event loop that keeps the server in step after the initial walk

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, trace, warn};

use crate::engine::Engine;
use crate::error::{SyncError, WatchError};
use crate::transport::Transport;
use crate::watch::{ChangeEvent, ChangeKind, EventSource};

/// Cloneable stop flag shared between the event loop and whoever ends it
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Non-empty batches read
    pub batches: u64,
    pub events: u64,
    /// Events for unknown watches, plus malformed batches
    pub dropped: u64,
    pub failed: u64,
}

/// Applies change events to the server one at a time
pub struct EventDispatcher<'a, T, S> {
    engine: &'a mut Engine<T, S>,
    stats: DispatchStats,
}

impl<'a, T: Transport, S: EventSource> EventDispatcher<'a, T, S> {
    pub fn new(engine: &'a mut Engine<T, S>) -> Self {
        Self {
            engine,
            stats: DispatchStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Read and dispatch batches until `shutdown` is triggered
    ///
    /// # Errors
    /// Returns a fatal protocol error or an event source I/O error
    pub fn run(&mut self, shutdown: &ShutdownSignal) -> Result<DispatchStats, SyncError> {
        info!("watching for changes");

        while !shutdown.is_triggered() {
            let events = match self.engine.next_batch() {
                Ok(events) => events,
                Err(WatchError::Malformed(e)) => {
                    warn!("dropping malformed notification batch: {e}");
                    self.stats.dropped += 1;
                    continue;
                }
                Err(e) => {
                    error!("event source failed: {e}");
                    return Err(e.into());
                }
            };
            if events.is_empty() {
                continue;
            }
            self.stats.batches += 1;

            for event in &events {
                self.stats.events += 1;
                match self.dispatch(event) {
                    Ok(()) => {}
                    Err(SyncError::NotWatched(e)) => {
                        warn!("dropping {:?} on {}: {e}", event.kind, event.name.display());
                        self.stats.dropped += 1;
                    }
                    Err(e) if e.is_fatal() => {
                        error!("stopping event loop: {e}");
                        return Err(e);
                    }
                    Err(e) => {
                        warn!("{e}");
                        self.stats.failed += 1;
                    }
                }
            }
        }

        for (id, path) in self.engine.registry().iter() {
            trace!("watch {id} still on /{}", path.display());
        }
        let stats = self.stats;
        info!(
            "event loop stopped: {} events in {} batches, {} dropped, {} failed",
            stats.events, stats.batches, stats.dropped, stats.failed
        );
        Ok(stats)
    }

    /// Apply one event
    ///
    /// # Errors
    /// `NotWatched` for an unknown watch id, otherwise whatever the sync step returns
    pub fn dispatch(&mut self, event: &ChangeEvent) -> Result<(), SyncError> {
        let relative = self.engine.resolve_event(event)?;
        if relative.as_os_str().is_empty() {
            trace!("ignoring {:?} on the sync root", event.kind);
            return Ok(());
        }
        debug!("{:?} /{}", event.kind, relative.display());

        match event.kind {
            ChangeKind::Create => {
                let synced = self.engine.sync_entry(&relative).map(drop);
                // Watch even if the server rejected it, so later changes inside are seen
                if event.is_dir && !synced.as_ref().is_err_and(SyncError::is_fatal) {
                    self.engine.watch_dir(&relative)?;
                }
                synced
            }
            ChangeKind::Attrib => self.engine.sync_attributes(&relative).map(drop),
            ChangeKind::Delete => self.engine.remove_entry(&relative, event.is_dir),
            ChangeKind::Modify => self.engine.sync_entry(&relative).map(drop),
        }
    }
}
