//! Server-side remote procedure calls.
//!
//! The hosting application registers named handlers; clients invoke them with
//! `rpc_call`.  Handlers receive the call's params and a snapshot of the
//! caller's session.  Registration is last-wins, so built-in methods can be
//! overridden.
//!
//! A handler that panics does not take the connection down: the panic is
//! caught and its message returned as the call's error.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use relay_core::SessionInfo;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The handler returned an error.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked; holds the panic message.
    #[error("{0}")]
    Panicked(String),
}

/// A callable RPC method.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(&self, params: Value, session: SessionInfo) -> Result<Value, RpcError>;
}

/// Adapter for synchronous closures.
struct SyncFn<F>(F);

#[async_trait]
impl<F> RpcHandler for SyncFn<F>
where
    F: Fn(Value, &SessionInfo) -> Result<Value, String> + Send + Sync,
{
    async fn call(&self, params: Value, session: SessionInfo) -> Result<Value, RpcError> {
        (self.0)(params, &session).map_err(RpcError::Failed)
    }
}

/// Adapter for closures returning a future.
struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> RpcHandler for AsyncFn<F>
where
    F: Fn(Value, SessionInfo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    async fn call(&self, params: Value, session: SessionInfo) -> Result<Value, RpcError> {
        (self.0)(params, session).await.map_err(RpcError::Failed)
    }
}

/// Name → handler table.
#[derive(Default)]
pub struct RpcRegistry {
    methods: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
}

impl std::fmt::Debug for RpcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRegistry")
            .field("methods", &self.method_names())
            .finish()
    }
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one under `name`.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        let name = name.into();
        if self.methods.write().insert(name.clone(), handler).is_some() {
            debug!("rpc method {name} replaced");
        }
    }

    /// Registers a synchronous closure.
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Value, &SessionInfo) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(SyncFn(f)));
    }

    /// Registers an async closure.
    pub fn register_async<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Value, SessionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.register(name, Arc::new(AsyncFn(f)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.methods.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Looks up and runs `name`.  The read lock is released before the
    /// handler is awaited.
    pub async fn invoke(
        &self,
        name: &str,
        params: Value,
        session: SessionInfo,
    ) -> Result<Value, RpcError> {
        let handler = self.methods.read().get(name).cloned();
        let Some(handler) = handler else {
            return Err(RpcError::MethodNotFound(name.to_string()));
        };

        match AssertUnwindSafe(handler.call(params, session))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&*payload);
                warn!("rpc method {name} panicked: {message}");
                Err(RpcError::Panicked(message))
            }
        }
    }
}

/// Extracts the text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn session() -> SessionInfo {
        SessionInfo::new(Uuid::new_v4(), None, None, true, 0)
    }

    #[tokio::test]
    async fn test_unknown_method_names_the_method() {
        let registry = RpcRegistry::new();

        let err = registry.invoke("nope", Value::Null, session()).await.unwrap_err();

        assert_eq!(err, RpcError::MethodNotFound("nope".into()));
        assert_eq!(err.to_string(), "method not found: nope");
    }

    #[tokio::test]
    async fn test_sync_handler_receives_params_and_session() {
        // Arrange
        let registry = RpcRegistry::new();
        registry.register_fn("whoami", |params, session| {
            Ok(json!({"id": session.connection_id.to_string(), "params": params}))
        });
        let caller = session();

        // Act
        let result = registry
            .invoke("whoami", json!([1, 2]), caller.clone())
            .await
            .unwrap();

        // Assert
        assert_eq!(result["id"], caller.connection_id.to_string());
        assert_eq!(result["params"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_async_handler_error_is_failed() {
        let registry = RpcRegistry::new();
        registry.register_async("fail", |_params, _session| async {
            Err::<Value, _>("backend unavailable".to_string())
        });

        let err = registry.invoke("fail", Value::Null, session()).await.unwrap_err();

        assert_eq!(err, RpcError::Failed("backend unavailable".into()));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = RpcRegistry::new();
        registry.register_fn("v", |_, _| Ok(json!(1)));
        registry.register_fn("v", |_, _| Ok(json!(2)));

        assert_eq!(registry.invoke("v", Value::Null, session()).await, Ok(json!(2)));
        assert_eq!(registry.method_names(), vec!["v".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_removes_method() {
        let registry = RpcRegistry::new();
        registry.register_fn("gone", |_, _| Ok(Value::Null));

        assert!(registry.unregister("gone"));
        assert!(!registry.unregister("gone"));
        assert!(!registry.contains("gone"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_caught() {
        // Arrange
        let registry = RpcRegistry::new();
        registry.register_fn("boom", |_, _| panic!("kaboom"));

        // Act
        let err = registry.invoke("boom", Value::Null, session()).await.unwrap_err();

        // Assert
        assert_eq!(err, RpcError::Panicked("kaboom".into()));
    }

    #[tokio::test]
    async fn test_panic_with_formatted_message_is_caught() {
        let registry = RpcRegistry::new();
        registry.register_async("boom", |params, _| async move {
            if params.is_number() {
                panic!("bad params: {params}");
            }
            Ok(params)
        });

        let err = registry.invoke("boom", json!(7), session()).await.unwrap_err();

        assert_eq!(err, RpcError::Panicked("bad params: 7".into()));
    }
}
