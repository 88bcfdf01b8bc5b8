//! WebSocket close codes used by the relay server.

/// Why the server is closing a connection.
///
/// Codes below 4000 are the standard RFC 6455 codes; the 4xxx range is
/// application-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close requested by application code.
    Normal,
    /// The server is shutting down.
    ServerShutdown,
    /// A frame exceeded the socket-level size ceiling.
    MessageTooBig,
    /// `max_connections` was reached when this socket arrived.
    Overloaded,
    /// An `auth` message carried the wrong token.
    AuthenticationFailed,
    /// No heartbeat within twice the heartbeat interval.
    HeartbeatTimeout,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::ServerShutdown => 1001,
            CloseReason::MessageTooBig => 1009,
            CloseReason::Overloaded => 1013,
            CloseReason::AuthenticationFailed => 4001,
            CloseReason::HeartbeatTimeout => 4002,
        }
    }

    /// Human-readable reason sent in the close frame.
    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::Normal => "closed",
            CloseReason::ServerShutdown => "server shutting down",
            CloseReason::MessageTooBig => "message too big",
            CloseReason::Overloaded => "server at connection limit",
            CloseReason::AuthenticationFailed => "authentication failed",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_codes_are_in_private_range() {
        assert!(CloseReason::AuthenticationFailed.code() >= 4000);
        assert!(CloseReason::HeartbeatTimeout.code() >= 4000);
    }

    #[test]
    fn test_overloaded_uses_try_again_later_code() {
        assert_eq!(CloseReason::Overloaded.code(), 1013);
    }

    #[test]
    fn test_message_too_big_uses_rfc_code() {
        assert_eq!(CloseReason::MessageTooBig.code(), 1009);
    }

    #[test]
    fn test_display_includes_code() {
        assert_eq!(
            CloseReason::HeartbeatTimeout.to_string(),
            "heartbeat timeout (4002)"
        );
    }
}
