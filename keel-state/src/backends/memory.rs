//! In-memory versioned object store
//!
//! Keeps every version of every address in process memory. Suitable for
//! tests, embedding, and dry runs; nothing survives the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::backend::{
    Address, BackendError, BackendResult, ObjectStore, Precondition, StoredObject, VersionInfo,
};

struct Version {
    id: String,
    timestamp: DateTime<Utc>,
    /// `None` marks a tombstone
    body: Option<Vec<u8>>,
}

/// Versioned object store held in memory
pub struct MemoryStore {
    /// Versions per address, oldest first
    objects: RwLock<HashMap<Address, Vec<Version>>>,
    next_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
        }
    }

    fn new_version(&self, body: Option<Vec<u8>>) -> Version {
        let n = self.next_version.fetch_add(1, Ordering::Relaxed);
        Version {
            id: format!("m{}", n),
            timestamp: Utc::now(),
            body,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live_version(versions: Option<&Vec<Version>>) -> Option<&Version> {
    versions
        .and_then(|v| v.last())
        .filter(|latest| latest.body.is_some())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, address: &Address) -> BackendResult<StoredObject> {
        let objects = self.objects.read();
        match live_version(objects.get(address)) {
            Some(Version {
                id,
                body: Some(bytes),
                ..
            }) => Ok(StoredObject {
                bytes: bytes.clone(),
                version_id: id.clone(),
            }),
            _ => Err(BackendError::not_found(address)),
        }
    }

    async fn put(&self, address: &Address, bytes: Vec<u8>) -> BackendResult<String> {
        let version = self.new_version(Some(bytes));
        let id = version.id.clone();
        self.objects
            .write()
            .entry(address.clone())
            .or_default()
            .push(version);
        Ok(id)
    }

    async fn conditional_put(
        &self,
        address: &Address,
        bytes: Vec<u8>,
        expect: Precondition,
    ) -> BackendResult<String> {
        let mut objects = self.objects.write();
        let current = live_version(objects.get(address)).map(|v| v.id.as_str());
        let holds = match &expect {
            Precondition::Absent => current.is_none(),
            Precondition::VersionId(expected) => current == Some(expected.as_str()),
        };
        if !holds {
            return Err(BackendError::PreconditionFailed(address.to_string()));
        }

        let version = self.new_version(Some(bytes));
        let id = version.id.clone();
        objects.entry(address.clone()).or_default().push(version);
        Ok(id)
    }

    async fn soft_delete(&self, address: &Address) -> BackendResult<String> {
        let mut objects = self.objects.write();
        if live_version(objects.get(address)).is_none() {
            return Err(BackendError::not_found(address));
        }

        let tombstone = self.new_version(None);
        let id = tombstone.id.clone();
        objects.entry(address.clone()).or_default().push(tombstone);
        info!(%address, tombstone = %id, "soft deleted");
        Ok(id)
    }

    async fn soft_delete_if(&self, address: &Address, version_id: &str) -> BackendResult<String> {
        let mut objects = self.objects.write();
        if live_version(objects.get(address)).map(|v| v.id.as_str()) != Some(version_id) {
            return Err(BackendError::PreconditionFailed(address.to_string()));
        }

        let tombstone = self.new_version(None);
        let id = tombstone.id.clone();
        objects.entry(address.clone()).or_default().push(tombstone);
        info!(%address, version_id, tombstone = %id, "soft deleted");
        Ok(id)
    }

    async fn list_versions(&self, address: &Address) -> BackendResult<Vec<VersionInfo>> {
        let objects = self.objects.read();
        Ok(objects
            .get(address)
            .map(|versions| {
                versions
                    .iter()
                    .rev()
                    .map(|v| VersionInfo {
                        version_id: v.id.clone(),
                        timestamp: v.timestamp,
                        is_tombstone: v.body.is_none(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge(&self, address: &Address, version_id: &str) -> BackendResult<()> {
        let mut objects = self.objects.write();
        let versions = objects
            .get_mut(address)
            .ok_or_else(|| BackendError::VersionNotFound {
                address: address.to_string(),
                version_id: version_id.to_string(),
            })?;

        let pos = versions
            .iter()
            .position(|v| v.id == version_id)
            .ok_or_else(|| BackendError::VersionNotFound {
                address: address.to_string(),
                version_id: version_id.to_string(),
            })?;
        versions.remove(pos);

        if versions.is_empty() {
            objects.remove(address);
        }
        warn!(%address, version_id, "purged version");
        Ok(())
    }

    async fn init(&self) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get(&addr("cfg/x")).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_creates_new_versions() {
        let store = MemoryStore::new();
        let x = addr("cfg/x");
        let v1 = store.put(&x, b"one".to_vec()).await.unwrap();
        let v2 = store.put(&x, b"two".to_vec()).await.unwrap();
        assert_ne!(v1, v2);

        let current = store.get(&x).await.unwrap();
        assert_eq!(current.bytes, b"two");
        assert_eq!(current.version_id, v2);

        let versions = store.list_versions(&x).await.unwrap();
        let ids: Vec<_> = versions.iter().map(|v| v.version_id.clone()).collect();
        assert_eq!(ids, vec![v2, v1]);
    }

    #[tokio::test]
    async fn test_conditional_put_absent() {
        let store = MemoryStore::new();
        let x = addr("cfg/x");
        store
            .conditional_put(&x, b"a".to_vec(), Precondition::Absent)
            .await
            .unwrap();
        assert!(matches!(
            store
                .conditional_put(&x, b"b".to_vec(), Precondition::Absent)
                .await,
            Err(BackendError::PreconditionFailed(_))
        ));
        assert_eq!(store.get(&x).await.unwrap().bytes, b"a");
    }

    #[tokio::test]
    async fn test_conditional_put_absent_after_tombstone() {
        let store = MemoryStore::new();
        let x = addr("cfg/x");
        store.put(&x, b"a".to_vec()).await.unwrap();
        store.soft_delete(&x).await.unwrap();
        store
            .conditional_put(&x, b"b".to_vec(), Precondition::Absent)
            .await
            .unwrap();
        assert_eq!(store.get(&x).await.unwrap().bytes, b"b");
    }

    #[tokio::test]
    async fn test_conditional_put_version_id() {
        let store = MemoryStore::new();
        let x = addr("cfg/x");
        let v1 = store.put(&x, b"a".to_vec()).await.unwrap();
        let v2 = store
            .conditional_put(&x, b"b".to_vec(), Precondition::VersionId(v1.clone()))
            .await
            .unwrap();

        // v1 is no longer current
        assert!(matches!(
            store
                .conditional_put(&x, b"c".to_vec(), Precondition::VersionId(v1))
                .await,
            Err(BackendError::PreconditionFailed(_))
        ));
        assert_eq!(store.get(&x).await.unwrap().version_id, v2);
    }

    #[tokio::test]
    async fn test_soft_delete_then_purge() {
        let store = MemoryStore::new();
        let x = addr("cfg/x");
        let live = store.put(&x, b"a".to_vec()).await.unwrap();
        let tombstone = store.soft_delete(&x).await.unwrap();

        assert!(matches!(store.get(&x).await, Err(BackendError::NotFound(_))));
        let versions = store.list_versions(&x).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version_id, tombstone);
        assert!(versions[0].is_tombstone);
        assert_eq!(versions[1].version_id, live);

        store.purge(&x, &live).await.unwrap();
        let versions = store.list_versions(&x).await.unwrap();
        assert!(versions.iter().all(|v| v.version_id != live));
    }

    #[tokio::test]
    async fn test_purging_tombstone_restores_previous_version() {
        let store = MemoryStore::new();
        let x = addr("cfg/x");
        store.put(&x, b"a".to_vec()).await.unwrap();
        let tombstone = store.soft_delete(&x).await.unwrap();
        store.purge(&x, &tombstone).await.unwrap();
        assert_eq!(store.get(&x).await.unwrap().bytes, b"a");
    }

    #[tokio::test]
    async fn test_soft_delete_missing() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.soft_delete(&addr("cfg/x")).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_if_matches_current_version_only() {
        let store = MemoryStore::new();
        let x = addr("cfg/x");
        let v1 = store.put(&x, b"a".to_vec()).await.unwrap();
        let v2 = store.put(&x, b"b".to_vec()).await.unwrap();

        assert!(matches!(
            store.soft_delete_if(&x, &v1).await,
            Err(BackendError::PreconditionFailed(_))
        ));
        assert_eq!(store.get(&x).await.unwrap().version_id, v2);

        store.soft_delete_if(&x, &v2).await.unwrap();
        assert!(matches!(store.get(&x).await, Err(BackendError::NotFound(_))));

        // The tombstone is current now, so the same id no longer matches
        assert!(matches!(
            store.soft_delete_if(&x, &v2).await,
            Err(BackendError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_unknown_version() {
        let store = MemoryStore::new();
        let x = addr("cfg/x");
        store.put(&x, b"a".to_vec()).await.unwrap();
        assert!(matches!(
            store.purge(&x, "m999").await,
            Err(BackendError::VersionNotFound { .. })
        ));
    }
}
