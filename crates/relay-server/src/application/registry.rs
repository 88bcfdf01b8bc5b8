//! Connection registry: the single owner of per-connection session state.
//!
//! The registry is a plain data structure; the hub holds it behind its state
//! mutex together with the topic broker and stream registry so that teardown
//! purges all three in one critical section.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use relay_core::{unix_millis, ConnectionId, SessionInfo};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::application::heartbeat::HeartbeatGuard;
use crate::application::transport::Transport;

/// Why a connection was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("connection limit of {max} reached")]
    AtCapacity { max: usize },

    #[error("server is shutting down")]
    ShuttingDown,
}

/// Summary returned when a connection is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub duration: Duration,
    pub messages_received: u64,
}

/// One live connection.
#[derive(Debug)]
pub struct Connection {
    pub session: SessionInfo,
    pub transport: Transport,
    pub connected_at: Instant,
    pub last_heartbeat: Instant,
    pub last_activity: Instant,
    heartbeat: Option<HeartbeatGuard>,
}

impl Connection {
    /// Attaches the heartbeat monitor; dropping the connection aborts it.
    pub fn set_heartbeat(&mut self, guard: HeartbeatGuard) {
        self.heartbeat = Some(guard);
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat.is_some()
    }

    /// Bumps the received counter and the activity clock.
    pub fn record_inbound(&mut self) {
        self.session.messages_received += 1;
        self.last_activity = Instant::now();
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }
}

/// Map of live connections with a hard capacity.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    max_connections: usize,
    total_admitted: u64,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
            total_admitted: 0,
        }
    }

    /// Registers a new connection and returns its id.
    ///
    /// Connections start authenticated only when `authenticated` is passed
    /// as `true` (auth not required).
    ///
    /// # Errors
    ///
    /// [`AdmissionError::AtCapacity`] when the live count is already at the
    /// limit.  The registry is left unchanged.
    pub fn admit(
        &mut self,
        transport: Transport,
        remote_addr: Option<SocketAddr>,
        user_agent: Option<String>,
        authenticated: bool,
    ) -> Result<ConnectionId, AdmissionError> {
        if self.connections.len() >= self.max_connections {
            return Err(AdmissionError::AtCapacity {
                max: self.max_connections,
            });
        }

        let id = Uuid::new_v4();
        let now = Instant::now();
        let session = SessionInfo::new(id, remote_addr, user_agent, authenticated, unix_millis());
        self.connections.insert(
            id,
            Connection {
                session,
                transport,
                connected_at: now,
                last_heartbeat: now,
                last_activity: now,
                heartbeat: None,
            },
        );
        self.total_admitted += 1;
        Ok(id)
    }

    /// Removes a connection.  Returns `None` if it was already gone.
    ///
    /// The returned [`Connection`] still owns its heartbeat guard; dropping
    /// it cancels the timer.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<(Connection, SessionStats)> {
        let conn = self.connections.remove(id)?;
        let stats = SessionStats {
            duration: conn.connected_at.elapsed(),
            messages_received: conn.session.messages_received,
        };
        Some((conn, stats))
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn authenticated_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.session.authenticated)
            .count()
    }

    /// Connections ever admitted, including ones since removed.
    pub fn total_admitted(&self) -> u64 {
        self.total_admitted
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
