//! Lock records and the lock manager
//!
//! A lock on an address is a JSON record stored at the address's lock
//! address. It is taken with a create-if-absent write, so the backing
//! store's conditional put is the only thing arbitrating between holders.
//! Locks never expire on their own; a crashed holder's lock stays until
//! [`LockManager::force_release`] is called.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{Address, BackendError, BackendResult, ObjectStore, Precondition};

/// Information about a state lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// Who acquired the lock (username@hostname by default)
    pub holder: String,
    /// The operation being performed (e.g., "transact", "migrate")
    pub operation: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock record for a holder and operation
    pub fn new(holder: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            holder: holder.into(),
            operation: operation.into(),
            acquired_at: Utc::now(),
        }
    }

    /// How long the lock has been held
    pub fn age(&self) -> Duration {
        Utc::now() - self.acquired_at
    }
}

/// Proof of lock ownership returned by [`LockManager::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTicket {
    pub address: Address,
    pub info: LockInfo,
    /// Store version of the lock record this ticket wrote
    pub version_id: String,
}

/// A lost create-if-absent race is retried once if the winner already released
const ACQUIRE_ATTEMPTS: usize = 2;

/// Acquires and releases lock records in an object store
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn ObjectStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Try to take the lock on `address`
    ///
    /// Returns immediately: either a ticket, or `Locked` carrying the
    /// current holder. Waiting and retrying are left to the caller.
    pub async fn acquire(
        &self,
        address: &Address,
        holder: &str,
        operation: &str,
    ) -> BackendResult<LockTicket> {
        let info = LockInfo::new(holder, operation);
        let body = serde_json::to_vec_pretty(&info)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;
        let lock_address = address.lock_address();

        for _ in 0..ACQUIRE_ATTEMPTS {
            match self
                .store
                .conditional_put(&lock_address, body.clone(), Precondition::Absent)
                .await
            {
                Ok(version_id) => {
                    debug!(%address, holder, lock_id = %info.id, "acquired lock");
                    return Ok(LockTicket {
                        address: address.clone(),
                        info,
                        version_id,
                    });
                }
                Err(BackendError::PreconditionFailed(_)) => {
                    if let Some(existing) = self.current(address).await? {
                        debug!(%address, holder = %existing.holder, "lock is held");
                        return Err(BackendError::locked(&existing));
                    }
                    // The holder released between our write and our read
                }
                Err(e) => return Err(e),
            }
        }

        debug!(%address, holder, "lock changed hands while acquiring");
        Err(BackendError::locked_by_unknown())
    }

    /// Release a lock previously acquired with `ticket`
    ///
    /// Tombstones the lock record only if it is still the exact version the
    /// ticket wrote. Fails with `LockNotHeld` otherwise (force-released, or
    /// re-acquired by someone else), leaving the current lock untouched.
    pub async fn release(&self, ticket: &LockTicket) -> BackendResult<()> {
        match self
            .store
            .soft_delete_if(&ticket.address.lock_address(), &ticket.version_id)
            .await
        {
            Ok(_) => {
                debug!(address = %ticket.address, lock_id = %ticket.info.id, "released lock");
                Ok(())
            }
            Err(BackendError::PreconditionFailed(_)) | Err(BackendError::NotFound(_)) => {
                let current = match self.current(&ticket.address).await {
                    Ok(Some(lock)) => lock.holder,
                    Ok(None) => "nobody".to_string(),
                    Err(_) => "unknown".to_string(),
                };
                Err(BackendError::LockNotHeld {
                    lock_id: ticket.info.id.clone(),
                    current,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the lock on `address` regardless of who holds it
    ///
    /// Operator escape hatch for a holder that died without releasing.
    /// Returns the evicted record, or `None` if the address was unlocked.
    pub async fn force_release(&self, address: &Address) -> BackendResult<Option<LockInfo>> {
        let lock_address = address.lock_address();
        let evicted = match self.store.get(&lock_address).await {
            Ok(object) => serde_json::from_slice::<LockInfo>(&object.bytes).ok(),
            Err(BackendError::NotFound(_)) => {
                info!(%address, "force release requested but address is not locked");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.store.soft_delete(&lock_address).await {
            Ok(_) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match &evicted {
            Some(lock) => warn!(
                %address,
                holder = %lock.holder,
                lock_id = %lock.id,
                operation = %lock.operation,
                "force released lock"
            ),
            None => warn!(%address, "force released unreadable lock record"),
        }
        Ok(evicted)
    }

    /// Read the live lock record on `address`, if any
    pub async fn current(&self, address: &Address) -> BackendResult<Option<LockInfo>> {
        match self.store.get(&address.lock_address()).await {
            Ok(object) => {
                let lock = serde_json::from_slice(&object.bytes).map_err(|e| {
                    BackendError::CorruptPayload(format!("Failed to parse lock record: {}", e))
                })?;
                Ok(Some(lock))
            }
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Holds a lock for a scope
///
/// Call [`LockGuard::release`] on every normal exit. A guard dropped
/// without being released (a cancelled future, for example) spawns a
/// best-effort release on the current tokio runtime.
pub struct LockGuard {
    manager: LockManager,
    ticket: LockTicket,
    released: bool,
}

impl LockGuard {
    pub fn new(manager: LockManager, ticket: LockTicket) -> Self {
        Self {
            manager,
            ticket,
            released: false,
        }
    }

    pub fn ticket(&self) -> &LockTicket {
        &self.ticket
    }

    /// Release the lock now
    pub async fn release(mut self) -> BackendResult<()> {
        self.released = true;
        self.manager.release(&self.ticket).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            address = %self.ticket.address,
            lock_id = %self.ticket.info.id,
            "lock guard dropped without release"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let ticket = self.ticket.clone();
            handle.spawn(async move {
                if let Err(e) = manager.release(&ticket).await {
                    warn!(address = %ticket.address, error = %e, "deferred lock release failed");
                }
            });
        }
    }
}

/// Get the default holder string (username@hostname)
pub fn default_holder() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}
