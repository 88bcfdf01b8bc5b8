//! relay-server library crate.
//!
//! A real-time connection multiplexer: many clients hold one WebSocket each
//! to this server and use it for data ingestion, request/response in both
//! directions, topic pub/sub, server-side RPC and client data streams.
//!
//! # Architecture
//!
//! ```text
//! Clients (JSON text frames over WebSocket)
//!         ↕
//! [relay-server]
//!   ├── domain/           ServerConfig and its TOML loader
//!   ├── application/
//!   │     ├── hub         registry + broker + streams, requests, RPC
//!   │     ├── router      decode → auth gate → feature gate → dispatch
//!   │     └── ...         heartbeat, ingestion, transport, events
//!   └── infrastructure/
//!         ├── ws_server   accept loop, reader/writer tasks (tokio-tungstenite)
//!         └── storage     in-memory DataStore
//! ```
//!
//! Wire types and the codec live in `relay-core`.
//!
//! # Layer rules
//!
//! - `domain` does no I/O.
//! - `application` never touches a socket; it pushes frames into each
//!   connection's `Transport` queue.
//! - `infrastructure` owns the sockets and drives the application layer.

/// Domain layer: configuration.
pub mod domain;

/// Application layer: hub, routing and the interaction patterns.
pub mod application;

/// Infrastructure layer: WebSocket server and the in-memory store.
pub mod infrastructure;
