//! Object store trait, error types and backend configuration

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::LockInfo;

/// Errors that can occur when interacting with the state store
#[derive(Debug, Error)]
pub enum BackendError {
    /// Nothing live is stored at the address
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested version does not exist (or was already purged)
    #[error("Version {version_id} not found at {address}")]
    VersionNotFound { address: String, version_id: String },

    /// A conditional write's precondition did not hold
    #[error("Precondition failed writing {0}")]
    PreconditionFailed(String),

    /// The address is locked by another holder
    #[error(
        "State is locked by {holder} (lock ID: {lock_id}, operation: {operation}, since: {acquired_at})"
    )]
    Locked {
        lock_id: String,
        holder: String,
        operation: String,
        acquired_at: DateTime<Utc>,
    },

    /// The ticket presented on release no longer owns the lock
    #[error("Lock {lock_id} is not held (current holder: {current})")]
    LockNotHeld { lock_id: String, current: String },

    /// The written serial is not exactly one past the stored serial
    #[error("Stale serial for {address}: expected {expected}, got {actual}")]
    StaleSerial {
        address: String,
        expected: u64,
        actual: u64,
    },

    /// State lineage mismatch (prevents overwriting an unrelated history)
    #[error("State lineage mismatch for {address}: expected {expected}, got {actual}")]
    LineageMismatch {
        address: String,
        expected: String,
        actual: String,
    },

    /// Migration target already holds a document
    #[error("Destination is not empty: {0}")]
    DestinationNotEmpty(String),

    /// Migration was declined by the confirmation callback
    #[error("Migration from {source_address} to {dest} cancelled")]
    MigrationCancelled {
        source_address: String,
        dest: String,
    },

    /// Stored bytes failed to decode or verify
    #[error("Corrupt state payload: {0}")]
    CorruptPayload(String),

    /// The address string is not usable
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The bucket/container does not exist
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// Failed to create bucket
    #[error("Failed to create bucket: {0}")]
    BucketCreationFailed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network or storage-layer failure
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

/// Coarse classification of a [`BackendError`], used by callers to decide
/// between retrying, reloading, or escalating to an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Address or version absent; informational
    NotFound,
    /// Lock or optimistic-concurrency conflict; reload/retry is the caller's call
    Conflict,
    /// Needs operator action
    Fatal,
    /// Safe to retry with backoff
    Transient,
}

impl BackendError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            holder: lock.holder.clone(),
            operation: lock.operation.clone(),
            acquired_at: lock.acquired_at,
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a Locked error for a lock whose record could not be read back
    pub fn locked_by_unknown() -> Self {
        Self::Locked {
            lock_id: "unknown".to_string(),
            holder: "unknown".to_string(),
            operation: "unknown".to_string(),
            acquired_at: Utc::now(),
        }
    }

    /// Create a not-found error for an address
    pub fn not_found(address: &Address) -> Self {
        Self::NotFound(address.to_string())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) | Self::VersionNotFound { .. } => ErrorClass::NotFound,
            Self::PreconditionFailed(_)
            | Self::Locked { .. }
            | Self::LockNotHeld { .. }
            | Self::StaleSerial { .. }
            | Self::LineageMismatch { .. } => ErrorClass::Conflict,
            Self::BackendUnavailable(_) | Self::Io(_) => ErrorClass::Transient,
            Self::DestinationNotEmpty(_)
            | Self::MigrationCancelled { .. }
            | Self::CorruptPayload(_)
            | Self::InvalidAddress(_)
            | Self::UnsupportedBackend(_)
            | Self::Configuration(_)
            | Self::BucketNotFound(_)
            | Self::BucketCreationFailed(_)
            | Self::Serialization(_) => ErrorClass::Fatal,
        }
    }

    /// Whether retrying the same call with backoff can succeed
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Identifies one logical document in the store.
///
/// Opaque to this crate beyond equality and lock-address derivation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Suffix appended to an address to derive its lock address
    pub const LOCK_SUFFIX: &'static str = ".lock";

    pub fn new(address: impl Into<String>) -> BackendResult<Self> {
        let address = address.into();
        if address.is_empty() {
            return Err(BackendError::InvalidAddress(
                "address must not be empty".to_string(),
            ));
        }
        Ok(Self(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address of the lock record guarding this address
    pub fn lock_address(&self) -> Address {
        Address(format!("{}{}", self.0, Self::LOCK_SUFFIX))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = BackendError;

    fn try_from(value: String) -> BackendResult<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Address {
    type Error = BackendError;

    fn try_from(value: &str) -> BackendResult<Self> {
        Self::new(value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Precondition for a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// No live version exists (never written, or newest version is a tombstone)
    Absent,
    /// The newest version has exactly this id
    VersionId(String),
}

/// Bytes read from the store together with the version they came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub version_id: String,
}

/// One entry of an address's version history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub version_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_tombstone: bool,
}

/// Trait for versioned object stores
///
/// Every call reflects live backing state; implementations must not cache
/// across calls. `conditional_put` is the only primitive exclusivity is
/// built on, so it must check and write atomically.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read the current live version
    ///
    /// Returns `NotFound` if nothing was ever written or the newest version is a tombstone
    async fn get(&self, address: &Address) -> BackendResult<StoredObject>;

    /// Unconditionally write a new version, returning its id
    async fn put(&self, address: &Address, bytes: Vec<u8>) -> BackendResult<String>;

    /// Write a new version only if `expect` holds at the moment of writing
    ///
    /// Returns `PreconditionFailed` otherwise; nothing is written in that case.
    ///
    /// S3 cannot condition a write on a version id, so it checks the current
    /// version id and then writes with `If-Match` on that version's ETag.
    /// Versions with identical content share an ETag, so a content-identical
    /// write landing between those two calls is not detected there.
    async fn conditional_put(
        &self,
        address: &Address,
        bytes: Vec<u8>,
        expect: Precondition,
    ) -> BackendResult<String>;

    /// Hide the current version behind a tombstone, returning the tombstone's version id
    async fn soft_delete(&self, address: &Address) -> BackendResult<String>;

    /// Tombstone the current version only if its id is `version_id`
    ///
    /// Returns `PreconditionFailed` if the current version is anything else
    /// (including a tombstone); nothing is written in that case.
    async fn soft_delete_if(&self, address: &Address, version_id: &str) -> BackendResult<String>;

    /// List all versions (live and tombstones), newest first
    async fn list_versions(&self, address: &Address) -> BackendResult<Vec<VersionInfo>>;

    /// Permanently remove one version
    ///
    /// This is a privileged, irreversible operation; nothing else in this
    /// crate calls it.
    async fn purge(&self, address: &Address, version_id: &str) -> BackendResult<()>;

    /// Initialize the backing storage (create the bucket or root directory)
    ///
    /// Called by the operator's `init` step only; the other operations never
    /// create storage as a side effect.
    async fn init(&self) -> BackendResult<()>;
}

/// Configuration for a state backend
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend type (e.g., "s3", "local", "memory")
    #[serde(rename = "backend")]
    pub backend_type: String,
    /// Backend-specific attributes
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute value
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Parse a configuration from JSON text
    pub fn from_json(text: &str) -> BackendResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| BackendError::configuration(format!("Invalid backend config: {}", e)))
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Get a boolean attribute value
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(|v| v.as_bool())
    }

    /// Get a boolean attribute with a default value
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Get a required string attribute
    pub fn require_string(&self, key: &str) -> BackendResult<&str> {
        self.get_string(key).ok_or_else(|| {
            BackendError::configuration(format!("Missing required attribute: {}", key))
        })
    }
}
