//! Keel State Storage
//!
//! This crate persists opaque state documents in a versioned object store
//! (S3, the local filesystem, or memory), with locking for safe concurrent
//! access and loss-safe migration between addresses.
//!
//! # Overview
//!
//! The state storage system consists of:
//!
//! - **ObjectStore**: A trait for versioned blob stores with conditional writes
//! - **LockManager**: Lock records taken with create-if-absent writes
//! - **StateRepository**: Locked read-validate-write of a [`StateDocument`]
//! - **Migrator**: Copies a document to a fresh address, never touching the source
//!
//! # Example
//!
//! ```ignore
//! use keel_state::{create_backend, Address, BackendConfig, StateDocument, StateRepository};
//!
//! let config = BackendConfig::new("s3")
//!     .with_attribute("bucket", "my-state-bucket".into())
//!     .with_attribute("region", "ap-northeast-1".into());
//! let store = create_backend(&config).await?;
//! let repository = StateRepository::new(store);
//!
//! let address = Address::new("infra/prod.state")?;
//! let written = repository
//!     .transact(&address, "alice@laptop", |current| match current {
//!         Some(doc) => doc.successor(new_payload),
//!         None => StateDocument::initial(new_payload),
//!     })
//!     .await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod migrate;
pub mod repository;
pub mod state;

// Re-export main types for convenience
pub use backend::{
    Address, BackendConfig, BackendError, BackendResult, ErrorClass, ObjectStore, Precondition,
    StoredObject, VersionInfo,
};
pub use backends::{LocalStore, MemoryStore, S3Store, create_backend, init_backend};
pub use lock::{LockGuard, LockInfo, LockManager, LockTicket, default_holder};
pub use migrate::{MigrationResult, Migrator};
pub use repository::{StateRepository, VersionedDocument};
pub use state::{DocSummary, StateDocument};
