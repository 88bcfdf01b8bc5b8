//! Data ingestion: validation of `data` frames and the storage boundary.
//!
//! Validation is synchronous and driven entirely by `[ingestion]` config.
//! Storage is optional and sits behind two traits so the hosting application
//! can plug in its own database and encryption:
//!
//! - [`DataStore::post_data`] writes one record to a table named after the
//!   frame's `dataType`;
//! - [`FieldEncryptor::encrypt`] transforms configured fields first.
//!
//! The bundled `infrastructure::storage::MemoryStore` implements `DataStore`.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::ConnectionId;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::config::IngestionConfig;

/// `dataType` used when a frame does not declare one.
pub const DEFAULT_DATA_TYPE: &str = "generic";

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("data payload is required")]
    MissingPayload,

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("field {0} must be numeric")]
    NotNumeric(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage backend failed: {0}")]
    Backend(String),

    #[error("failed to encrypt field {field}: {reason}")]
    Encryption { field: String, reason: String },
}

/// Acknowledgement of a stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertReceipt {
    pub insert_id: Value,
}

/// Persistent storage for ingested records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn post_data(&self, table: &str, record: Value) -> Result<InsertReceipt, StorageError>;
}

/// Field-level encryption applied before storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FieldEncryptor: Send + Sync {
    async fn encrypt(&self, value: Value) -> Result<Value, StorageError>;
}

/// Checks a payload against the global and per-kind rules.
///
/// A scalar or array payload passes only when no required field applies to
/// its `dataType`.
///
/// # Errors
///
/// The first rule the payload breaks.
pub fn validate<'a>(
    config: &IngestionConfig,
    data_type: &str,
    payload: Option<&'a Value>,
) -> Result<&'a Value, ValidationError> {
    let payload = match payload {
        None | Some(Value::Null) => return Err(ValidationError::MissingPayload),
        Some(p) => p,
    };

    let kind_rules = config.kinds.get(data_type);
    let Value::Object(fields) = payload else {
        let first_required = config
            .required_fields
            .iter()
            .chain(kind_rules.into_iter().flat_map(|rules| &rules.required))
            .next();
        return match first_required {
            Some(field) => Err(ValidationError::MissingField(field.clone())),
            None => Ok(payload),
        };
    };

    for field in &config.required_fields {
        if !has_field(fields, field) {
            return Err(ValidationError::MissingField(field.clone()));
        }
    }

    if let Some(rules) = kind_rules {
        for field in &rules.required {
            if !has_field(fields, field) {
                return Err(ValidationError::MissingField(field.clone()));
            }
        }
        for field in &rules.numeric {
            if let Some(value) = fields.get(field) {
                if !value.is_number() {
                    return Err(ValidationError::NotNumeric(field.clone()));
                }
            }
        }
    }

    Ok(payload)
}

fn has_field(fields: &Map<String, Value>, name: &str) -> bool {
    fields.get(name).is_some_and(|v| !v.is_null())
}

/// Builds the stored record: the payload's fields (or `value` for non-object
/// payloads) plus `connectionId`, `dataType` and `receivedAt`.
pub fn build_record(
    payload: &Value,
    connection_id: ConnectionId,
    data_type: &str,
    received_at_ms: u64,
) -> Value {
    let mut record = match payload {
        Value::Object(fields) => fields.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    record.insert(
        "connectionId".to_string(),
        Value::String(connection_id.to_string()),
    );
    record.insert("dataType".to_string(), Value::String(data_type.to_string()));
    record.insert("receivedAt".to_string(), Value::from(received_at_ms));
    Value::Object(record)
}

/// Storage collaborators wired into the hub.
#[derive(Clone)]
pub struct StorageBinding {
    store: Arc<dyn DataStore>,
    encryptor: Option<Arc<dyn FieldEncryptor>>,
    encrypted_fields: Vec<String>,
}

impl std::fmt::Debug for StorageBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBinding")
            .field("encryptor", &self.encryptor.is_some())
            .field("encrypted_fields", &self.encrypted_fields)
            .finish()
    }
}

impl StorageBinding {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            encryptor: None,
            encrypted_fields: Vec::new(),
        }
    }

    /// Encrypts `fields` with `encryptor` before every write.
    pub fn with_encryption(
        mut self,
        encryptor: Arc<dyn FieldEncryptor>,
        fields: Vec<String>,
    ) -> Self {
        self.encryptor = Some(encryptor);
        self.encrypted_fields = fields;
        self
    }

    /// Encrypts the configured fields present in `record`, then posts it.
    ///
    /// # Errors
    ///
    /// The first encryption failure, or the backend's error.
    pub async fn persist(&self, table: &str, mut record: Value) -> Result<InsertReceipt, StorageError> {
        if let (Some(encryptor), Value::Object(fields)) = (&self.encryptor, &mut record) {
            for name in &self.encrypted_fields {
                if let Some(value) = fields.remove(name) {
                    let encrypted = encryptor.encrypt(value).await.map_err(|e| match e {
                        StorageError::Encryption { .. } => e,
                        StorageError::Backend(reason) => StorageError::Encryption {
                            field: name.clone(),
                            reason,
                        },
                    })?;
                    fields.insert(name.clone(), encrypted);
                }
            }
        }
        self.store.post_data(table, record).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
