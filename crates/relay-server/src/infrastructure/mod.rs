//! Infrastructure layer for relay-server.
//!
//! All I/O lives here: the TCP listener, the WebSocket upgrade and the
//! per-connection reader and writer tasks.  The bundled in-memory store is
//! here too, as the default implementation of the storage boundary.
//!
//! # What does NOT belong here?
//!
//! - Routing or any per-message behaviour (application layer)
//! - Configuration types and parsing (domain layer)

pub mod storage;
pub mod ws_server;

pub use storage::MemoryStore;
pub use ws_server::{bind_listener, run_server, serve};
