//! treesync-transport: connections to the remote store
//!
//! `TcpTransport` talks to a real server; `LocalStore` emulates one in
//! process for tests.

pub mod local;
pub mod tcp;

pub use local::{LocalStore, StoreRequest, StoredEntry};
pub use tcp::TcpTransport;
