//! Connection identity and session snapshots.

use std::net::SocketAddr;

use serde::Serialize;
use uuid::Uuid;

/// Server-generated identifier of one WebSocket connection (UUID v4).
pub type ConnectionId = Uuid;

/// Client category recorded until a handshake names an accepted one.
pub const UNKNOWN_CLIENT_TYPE: &str = "unknown";

/// Immutable snapshot of a connection's session state.
///
/// Taken under the registry lock and handed out by value, so RPC handlers and
/// event consumers never observe a half-updated session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub connection_id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    pub user_agent: Option<String>,
    pub client_type: String,
    pub version: Option<String>,
    pub authenticated: bool,
    pub capabilities: Vec<String>,
    /// Unix milliseconds at admission.
    pub connected_at_ms: u64,
    pub messages_received: u64,
}

impl SessionInfo {
    /// A fresh session for a just-admitted connection.
    pub fn new(
        connection_id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        user_agent: Option<String>,
        authenticated: bool,
        connected_at_ms: u64,
    ) -> Self {
        Self {
            connection_id,
            remote_addr,
            user_agent,
            client_type: UNKNOWN_CLIENT_TYPE.to_string(),
            version: None,
            authenticated,
            capabilities: Vec::new(),
            connected_at_ms,
            messages_received: 0,
        }
    }

    /// `true` once a handshake has recorded an accepted client category.
    pub fn is_identified(&self) -> bool {
        self.client_type != UNKNOWN_CLIENT_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_starts_unidentified() {
        let session = SessionInfo::new(Uuid::new_v4(), None, None, false, 10);
        assert_eq!(session.client_type, UNKNOWN_CLIENT_TYPE);
        assert!(!session.is_identified());
        assert_eq!(session.messages_received, 0);
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let session = SessionInfo::new(Uuid::nil(), Some(addr), Some("probe/1".into()), true, 5);
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["remoteAddr"], "127.0.0.1:9000");
        assert_eq!(value["userAgent"], "probe/1");
        assert_eq!(value["connectedAtMs"], 5);
        assert_eq!(value["authenticated"], true);
    }
}
