//! # relay-core
//!
//! Shared library for the relay connection multiplexer containing the JSON
//! wire protocol, the frame codec and the session types that the server hands
//! to application code.
//!
//! It has zero dependencies on sockets, async runtimes or timers.
//!
//! # Architecture overview
//!
//! A relay server keeps one persistent WebSocket per client and multiplexes
//! four interaction patterns over it:
//!
//! - fire-and-forget data ingestion (`data` / `sensor_data`),
//! - correlated request/response in both directions (`request` / `response`),
//! - topic publish/subscribe (`subscribe` / `unsubscribe` / `publish`),
//! - named streams (`stream_start` / `stream_data` / `stream_end`),
//!
//! plus `rpc_call` for server-side procedures and the lifecycle kinds
//! (`handshake`, `auth`, `heartbeat`, `ping`).
//!
//! This crate defines:
//!
//! - **`protocol`** – the typed inbound/outbound message enums, close reasons,
//!   error codes and the codec that turns raw text frames into messages and
//!   back.
//! - **`domain`** – connection identity and the [`SessionInfo`] snapshot.

pub mod domain;
pub mod protocol;

pub use domain::session::{ConnectionId, SessionInfo, UNKNOWN_CLIENT_TYPE};
pub use protocol::close::CloseReason;
pub use protocol::codec::{decode_frame, encode_frame, unix_millis, ProtocolError};
pub use protocol::messages::{ErrorCode, InboundMessage, MessageKind, OutboundMessage, RequestId};
