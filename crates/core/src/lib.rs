//! treesync-core: Core sync engine
//!
//! Mirrors a directory tree to a remote store: an initial walk that watches
//! every directory and syncs every entry, then an event loop that forwards
//! filesystem changes over the wire protocol.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod hash;
pub mod paths;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod transport;
pub mod walk;
pub mod watch;

#[cfg(test)]
mod testing;

pub use config::ClientConfig;
pub use dispatch::{DispatchStats, EventDispatcher, ShutdownSignal};
pub use engine::Engine;
pub use error::{ConfigError, PathError, ProtocolError, SyncError, WatchError};
pub use hash::ContentHash;
pub use paths::SyncRoot;
pub use protocol::{Op, ProtocolClient, Status};
pub use record::{EntryStat, FileRecord};
pub use registry::{PathRegistry, WatchId};
pub use transport::{StreamTransport, Transport};
pub use walk::{WalkReport, walk};
pub use watch::{ChangeEvent, ChangeKind, EventSource};
