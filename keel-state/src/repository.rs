//! Locked read-modify-write access to state documents

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::backend::{Address, BackendError, BackendResult, ObjectStore};
use crate::lock::{LockGuard, LockManager};
use crate::state::StateDocument;

/// A decoded document together with the exact bytes and version it was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedDocument {
    pub document: StateDocument,
    pub version_id: String,
    pub bytes: Vec<u8>,
}

/// Reads state documents and writes them under the address's lock
#[derive(Clone)]
pub struct StateRepository {
    store: Arc<dyn ObjectStore>,
    locks: LockManager,
}

impl StateRepository {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            locks: LockManager::new(store.clone()),
            store,
        }
    }

    /// The lock manager guarding this repository's addresses
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Read the current document; does not take the lock
    pub async fn load(&self, address: &Address) -> BackendResult<Option<StateDocument>> {
        Ok(self
            .load_versioned(address)
            .await?
            .map(|versioned| versioned.document))
    }

    /// Read the current document along with its raw bytes and version id
    pub async fn load_versioned(
        &self,
        address: &Address,
    ) -> BackendResult<Option<VersionedDocument>> {
        match self.store.get(address).await {
            Ok(object) => {
                let document = StateDocument::decode(&object.bytes)?;
                Ok(Some(VersionedDocument {
                    document,
                    version_id: object.version_id,
                    bytes: object.bytes,
                }))
            }
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the document at `address` with the one `f` derives from the current one
    ///
    /// Takes the address's lock for the whole read-validate-write sequence
    /// and releases it on every exit path. A panic inside `f` is re-raised
    /// after the lock is released. `f` must return either the successor of
    /// the current document (same lineage, serial + 1) or, when there is no
    /// current document, a document with a fresh lineage and serial 1.
    pub async fn transact<F>(
        &self,
        address: &Address,
        holder: &str,
        f: F,
    ) -> BackendResult<StateDocument>
    where
        F: FnOnce(Option<&StateDocument>) -> StateDocument + Send,
    {
        let ticket = self.locks.acquire(address, holder, "transact").await?;
        let guard = LockGuard::new(self.locks.clone(), ticket);

        let outcome = self.write_locked(address, f).await;
        let released = guard.release().await;

        match outcome {
            Ok(Ok(next)) => {
                // The write is durable; a failed release only leaves a lock for an operator to clear
                if let Err(e) = released {
                    error!(%address, holder, error = %e, "wrote state but failed to release lock");
                }
                Ok(next)
            }
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(e) => {
                if let Err(release_error) = released {
                    warn!(%address, error = %release_error, "failed to release lock after error");
                }
                Err(e)
            }
        }
    }

    /// Steps run while the lock is held; the inner `Err` carries a panic from `f`
    async fn write_locked<F>(
        &self,
        address: &Address,
        f: F,
    ) -> BackendResult<Result<StateDocument, Box<dyn Any + Send>>>
    where
        F: FnOnce(Option<&StateDocument>) -> StateDocument + Send,
    {
        let current = self.load_versioned(address).await?;
        let current_doc = current.as_ref().map(|c| &c.document);

        let next = match panic::catch_unwind(AssertUnwindSafe(|| f(current_doc))) {
            Ok(next) => next,
            Err(payload) => return Ok(Err(payload)),
        };

        validate(address, current_doc, &next)?;

        let version_id = self.store.put(address, next.encode()).await?;
        debug!(
            %address,
            serial = next.serial,
            lineage = %next.lineage,
            %version_id,
            "wrote state"
        );
        Ok(Ok(next))
    }
}

/// Check `next` against the stored document it is meant to replace
fn validate(
    address: &Address,
    current: Option<&StateDocument>,
    next: &StateDocument,
) -> BackendResult<()> {
    if next.format_version != StateDocument::CURRENT_VERSION {
        return Err(BackendError::Serialization(format!(
            "cannot write format version {}",
            next.format_version
        )));
    }

    match current {
        Some(current) => {
            if next.lineage != current.lineage {
                return Err(BackendError::LineageMismatch {
                    address: address.to_string(),
                    expected: current.lineage.to_string(),
                    actual: next.lineage.to_string(),
                });
            }
            let expected = current.serial.checked_add(1).ok_or_else(|| {
                BackendError::Serialization(format!("serial exhausted at {}", address))
            })?;
            if next.serial != expected {
                return Err(BackendError::StaleSerial {
                    address: address.to_string(),
                    expected,
                    actual: next.serial,
                });
            }
        }
        None => {
            if next.serial != 1 {
                return Err(BackendError::StaleSerial {
                    address: address.to_string(),
                    expected: 1,
                    actual: next.serial,
                });
            }
            if next.lineage.is_nil() {
                return Err(BackendError::LineageMismatch {
                    address: address.to_string(),
                    expected: "a fresh lineage".to_string(),
                    actual: next.lineage.to_string(),
                });
            }
        }
    }
    Ok(())
}
