//! Initial depth-first walk of the sync root

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::dispatch::ShutdownSignal;
use crate::engine::Engine;
use crate::error::SyncError;
use crate::paths::{depth, wire_bytes};
use crate::transport::Transport;
use crate::watch::EventSource;

/// Diagnostic file naming the deepest directory found by the walk
pub const DEEPEST_FILE: &str = "longestPath.txt";

/// Tally of one walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkReport {
    pub synced: usize,
    pub failed: usize,
    pub watched: usize,
    /// Deepest directory by component count; the first one reached wins ties
    pub deepest: Option<(usize, PathBuf)>,
    /// Set when shutdown stopped the walk before every entry was visited
    pub interrupted: bool,
}

impl WalkReport {
    fn observe_dir(&mut self, relative: &Path) {
        let d = depth(relative);
        if self.deepest.as_ref().is_none_or(|(best, _)| d > *best) {
            self.deepest = Some((d, relative.to_path_buf()));
        }
    }

    fn stop_requested(&mut self, shutdown: &ShutdownSignal) -> bool {
        if shutdown.is_triggered() {
            self.interrupted = true;
        }
        self.interrupted
    }

    /// Write the deepest directory as one line to `dir/longestPath.txt`
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn write_deepest(&self, dir: &Path) -> io::Result<PathBuf> {
        let path = dir.join(DEEPEST_FILE);
        let mut line = self
            .deepest
            .as_ref()
            .map(|(_, p)| wire_bytes(p).to_vec())
            .unwrap_or_default();
        line.push(b'\n');
        fs::write(&path, line)?;
        Ok(path)
    }
}

/// Watch every directory under the root and sync every entry once
///
/// Directories are synced before they are descended into. Per-entry failures
/// are counted and skipped; only a fatal error stops the walk. `shutdown` is
/// checked before every entry, and a triggered signal returns the partial
/// report with `interrupted` set.
///
/// # Errors
/// Returns the first fatal error
pub fn walk<T: Transport, S: EventSource>(
    engine: &mut Engine<T, S>,
    shutdown: &ShutdownSignal,
) -> Result<WalkReport, SyncError> {
    let start = Instant::now();
    let mut report = WalkReport::default();

    info!("initial sync of {}", engine.root().path().display());
    walk_dir(engine, Path::new(""), shutdown, &mut report)?;

    if report.interrupted {
        info!(
            "initial sync interrupted after {} synced, {} failed",
            report.synced, report.failed
        );
        return Ok(report);
    }
    info!(
        "initial sync done: {} synced, {} failed, {} dirs watched in {:.2?}",
        report.synced,
        report.failed,
        report.watched,
        start.elapsed()
    );
    Ok(report)
}

fn walk_dir<T: Transport, S: EventSource>(
    engine: &mut Engine<T, S>,
    relative: &Path,
    shutdown: &ShutdownSignal,
    report: &mut WalkReport,
) -> Result<(), SyncError> {
    match engine.watch_dir(relative) {
        Ok(_) => report.watched += 1,
        Err(e) => warn!("{e}"),
    }
    report.observe_dir(relative);

    let absolute = engine.root().absolute(relative)?;
    let entries = match list_dir(&absolute) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot list /{}: {e}", relative.display());
            return Ok(());
        }
    };

    for (name, is_dir) in entries {
        if report.stop_requested(shutdown) {
            return Ok(());
        }
        let child = relative.join(&name);
        match engine.sync_entry(&child) {
            Ok(_) => report.synced += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("skipping /{}: {e}", child.display());
                report.failed += 1;
            }
        }
        if is_dir && !report.stop_requested(shutdown) {
            walk_dir(engine, &child, shutdown, report)?;
        }
    }
    Ok(())
}

/// Entry names sorted, each with whether it is a real directory (not a link to one)
fn list_dir(dir: &Path) -> io::Result<Vec<(OsString, bool)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry in {}: {e}", dir.display());
                continue;
            }
        };
        let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
        entries.push((entry.file_name(), is_dir));
    }
    entries.sort();
    Ok(entries)
}
