//! Application layer for relay-server.
//!
//! Everything the multiplexer does with a connection once the socket exists:
//! admission, routing, the interaction patterns, liveness, and the events the
//! hosting application consumes.  None of it touches a socket directly;
//! outbound frames go through each connection's [`Transport`] queue.
//!
//! # Responsibilities
//!
//! - The [`Hub`]: connection registry, topic broker and stream registry
//!   behind one lock, plus the request coordinator and RPC table
//! - Routing decoded frames through the auth and feature gates
//! - Server-initiated requests with deadlines, and client requests answered
//!   through a [`Responder`]
//! - Heartbeat monitoring and the auth-failure grace close
//! - Ingestion validation and the storage boundary traits
//!
//! # What does NOT belong here?
//!
//! - Accepting TCP connections or WebSocket framing (infrastructure)
//! - Wire message types and the codec (`relay-core`)

pub mod auth;
pub mod coordinator;
pub mod events;
pub mod heartbeat;
pub mod hub;
pub mod ingestion;
pub mod pubsub;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod streams;
pub mod transport;

pub use coordinator::{RequestError, Responder};
pub use events::{ServerEvent, StreamEndCause};
pub use hub::{Hub, ServerStats, SERVER_VERSION};
pub use ingestion::{DataStore, FieldEncryptor, InsertReceipt, StorageBinding, StorageError};
pub use router::{route_binary, route_text};
pub use rpc::{RpcError, RpcHandler, RpcRegistry};
pub use transport::{Outbound, Transport, TransportReceiver, OUTBOUND_QUEUE_CAPACITY};
