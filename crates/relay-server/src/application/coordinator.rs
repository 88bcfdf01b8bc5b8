//! Correlated request/response in both directions.
//!
//! **Server → client.**  [`RequestCoordinator`] tracks requests the server has
//! sent and is waiting on.  Each pending entry is resolved exactly once: by a
//! matching `response`, by its deadline, or by [`RequestCoordinator::shutdown`].
//! Resolution removes the entry, so a late or duplicate response finds nothing
//! and is ignored.  The deadline timer lives in the caller's future; if that
//! future is dropped, its [`PendingGuard`] removes the entry.
//!
//! **Client → server.**  Inbound `request` frames reach the application as a
//! [`Responder`], a one-shot handle that sends exactly one `response`.  A
//! responder dropped unanswered sends a failure so the client is never left
//! waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{ConnectionId, OutboundMessage, RequestId};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::hub::Hub;

/// Error text sent when a [`Responder`] is dropped without answering.
pub const UNHANDLED_REQUEST_ERROR: &str = "request was not handled";

/// Failure of a server-initiated request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The client answered with `success: false`.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("request coordinator shut down")]
    Shutdown,

    /// The target connection is unknown, closed, or refused the frame.
    #[error("connection closed")]
    ConnectionClosed,
}

type Completion = oneshot::Sender<Result<Value, RequestError>>;

#[derive(Debug)]
struct PendingRequest {
    connection_id: ConnectionId,
    endpoint: String,
    /// `None` when the timeout is too large to represent.
    deadline: Option<Instant>,
    completion: Completion,
}

/// Table of server-initiated requests awaiting a response.
#[derive(Debug, Default)]
pub struct RequestCoordinator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    shut_down: AtomicBool,
}

impl RequestCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a request id and registers its pending entry.
    ///
    /// # Errors
    ///
    /// [`RequestError::Shutdown`] once the coordinator has been shut down.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<(PendingGuard<'_>, oneshot::Receiver<Result<Value, RequestError>>), RequestError>
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RequestError::Shutdown);
        }
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                connection_id,
                endpoint: endpoint.to_string(),
                deadline: Instant::now().checked_add(timeout),
                completion: tx,
            },
        );
        Ok((
            PendingGuard {
                coordinator: self,
                request_id,
            },
            rx,
        ))
    }

    /// Applies a `response` frame from `connection_id`.
    ///
    /// Returns `false` (and does nothing) for unknown or already-resolved
    /// ids, and for responses from a connection other than the one asked.
    pub fn resolve(
        &self,
        connection_id: ConnectionId,
        request_id: &str,
        result: Result<Value, RequestError>,
    ) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(request_id) {
                Some(p) if p.connection_id == connection_id => pending.remove(request_id),
                Some(_) => {
                    warn!("response {request_id} from {connection_id} does not match the requested connection");
                    None
                }
                None => None,
            }
        };

        let Some(entry) = entry else {
            debug!("ignoring response for unknown request {request_id}");
            return false;
        };

        let outcome = if entry.deadline.is_some_and(|d| Instant::now() > d) {
            debug!("response {request_id} arrived after its deadline");
            Err(RequestError::Timeout(Duration::ZERO))
        } else {
            result
        };
        debug!("request {request_id} ({}) resolved", entry.endpoint);
        // The receiver may already be gone if the caller was dropped.
        let _ = entry.completion.send(outcome);
        true
    }

    /// Removes a pending entry without resolving it.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.pending.lock().remove(request_id).is_some()
    }

    /// Waits for the response to a registered request.
    ///
    /// The entry is removed on every exit path, including cancellation of
    /// this future.
    pub async fn wait(
        &self,
        guard: PendingGuard<'_>,
        mut rx: oneshot::Receiver<Result<Value, RequestError>>,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Shutdown),
            Err(_) => {
                if self.cancel(guard.request_id()) {
                    Err(RequestError::Timeout(timeout))
                } else {
                    // Resolved between the deadline firing and the removal.
                    rx.try_recv()
                        .unwrap_or(Err(RequestError::Timeout(timeout)))
                }
            }
        }
    }

    /// Fails every outstanding request with [`RequestError::Shutdown`] and
    /// refuses new ones.  Returns how many were failed.
    pub fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::Release);
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.completion.send(Err(RequestError::Shutdown));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.lock().contains_key(request_id)
    }
}

/// Removes its pending entry when dropped.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    coordinator: &'a RequestCoordinator,
    request_id: String,
}

impl PendingGuard<'_> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.cancel(&self.request_id);
    }
}

// ── Client-initiated requests ─────────────────────────────────────────────────

/// One-shot reply handle for a client `request`.
///
/// Holds the hub weakly and addresses the client by id, so a responder kept
/// past teardown pins nothing of the connection.
#[derive(Debug)]
pub struct Responder {
    connection_id: ConnectionId,
    request_id: RequestId,
    hub: Weak<Hub>,
    answered: bool,
}

impl Responder {
    pub fn new(connection_id: ConnectionId, request_id: RequestId, hub: Weak<Hub>) -> Self {
        Self {
            connection_id,
            request_id,
            hub,
            answered: false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Sends the `response`.  Returns `false` if the frame could not be
    /// queued (hub or connection gone).
    pub fn respond(mut self, result: Result<Value, String>) -> bool {
        self.answered = true;
        self.send(result)
    }

    pub fn ok(self, data: Value) -> bool {
        self.respond(Ok(data))
    }

    pub fn fail(self, error: impl Into<String>) -> bool {
        self.respond(Err(error.into()))
    }

    fn send(&self, result: Result<Value, String>) -> bool {
        let msg = match result {
            Ok(data) => OutboundMessage::Response {
                request_id: self.request_id.clone(),
                success: true,
                data: Some(data),
                error: None,
            },
            Err(error) => OutboundMessage::Response {
                request_id: self.request_id.clone(),
                success: false,
                data: None,
                error: Some(error),
            },
        };
        self.hub
            .upgrade()
            .is_some_and(|hub| hub.send_to(self.connection_id, &msg))
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.answered {
            debug!("request {} dropped unanswered", self.request_id);
            self.send(Err(UNHANDLED_REQUEST_ERROR.to_string()));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
