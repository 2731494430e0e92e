//! Copying state documents between addresses
//!
//! Migration only ever writes to the destination, and only when the
//! destination is empty. The source is read and never touched; reclaiming
//! it is a separate, explicit soft delete or purge.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::backend::{Address, BackendError, BackendResult, ObjectStore, Precondition};
use crate::repository::StateRepository;
use crate::state::{DocSummary, StateDocument};

/// Outcome of a successful migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationResult {
    pub source: Address,
    pub dest: Address,
    /// Bytes copied from the source (zero when the source was empty)
    pub bytes_copied: u64,
    /// Whether the source held no document, so an initial one was written instead
    pub was_empty: bool,
}

/// Moves state documents to fresh addresses
pub struct Migrator {
    store: Arc<dyn ObjectStore>,
    repository: StateRepository,
}

impl Migrator {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            repository: StateRepository::new(store.clone()),
            store,
        }
    }

    /// Copy the document at `source` to the empty address `dest`
    ///
    /// `confirm` is asked only when the source holds a document; declining
    /// aborts with `MigrationCancelled`. An empty source gets an initial
    /// document written at `dest` without asking. Running this again after
    /// a successful copy fails with `DestinationNotEmpty`.
    pub async fn migrate<F>(
        &self,
        source: &Address,
        dest: &Address,
        confirm: F,
    ) -> BackendResult<MigrationResult>
    where
        F: FnOnce(&DocSummary) -> bool + Send,
    {
        if source == dest {
            return Err(BackendError::InvalidAddress(format!(
                "cannot migrate {} onto itself",
                source
            )));
        }

        match self.store.get(dest).await {
            Ok(_) => return Err(BackendError::DestinationNotEmpty(dest.to_string())),
            Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let Some(current) = self.repository.load_versioned(source).await? else {
            let initial = StateDocument::initial(Vec::new());
            self.write_fresh(dest, initial.encode()).await?;
            info!(%source, %dest, lineage = %initial.lineage, "source empty, initialized destination");
            return Ok(MigrationResult {
                source: source.clone(),
                dest: dest.clone(),
                bytes_copied: 0,
                was_empty: true,
            });
        };

        let summary = current.document.summarize(source, &current.version_id);
        if !confirm(&summary) {
            info!(%source, %dest, "migration declined");
            return Err(BackendError::MigrationCancelled {
                source_address: source.to_string(),
                dest: dest.to_string(),
            });
        }

        let bytes_copied = current.bytes.len() as u64;
        self.write_fresh(dest, current.bytes).await?;
        info!(
            %source,
            %dest,
            serial = summary.serial,
            bytes = bytes_copied,
            "migrated state"
        );

        Ok(MigrationResult {
            source: source.clone(),
            dest: dest.clone(),
            bytes_copied,
            was_empty: false,
        })
    }

    /// Write to `dest` only if it is still empty; a concurrent migration that got there first wins
    async fn write_fresh(&self, dest: &Address, bytes: Vec<u8>) -> BackendResult<()> {
        match self
            .store
            .conditional_put(dest, bytes, Precondition::Absent)
            .await
        {
            Ok(_) => Ok(()),
            Err(BackendError::PreconditionFailed(_)) => {
                Err(BackendError::DestinationNotEmpty(dest.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{StoredObject, VersionInfo};
    use crate::backends::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, StateRepository, Migrator) {
        let store = Arc::new(MemoryStore::new());
        let repo = StateRepository::new(store.clone());
        let migrator = Migrator::new(store.clone());
        (store, repo, migrator)
    }

    async fn seed(repo: &StateRepository, address: &Address, payload: &[u8]) -> StateDocument {
        let payload = payload.to_vec();
        repo.transact(address, "seed", |_| StateDocument::initial(payload))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrate_copies_exact_bytes() {
        let (store, repo, migrator) = setup();
        let (x, y) = (addr("cfg/x"), addr("cfg/y"));
        let doc = seed(&repo, &x, b"resources").await;
        let before = store.get(&x).await.unwrap();

        let result = migrator
            .migrate(&x, &y, |summary| {
                assert_eq!(summary.serial, 1);
                assert_eq!(summary.lineage, doc.lineage);
                assert_eq!(summary.payload_len, 9);
                true
            })
            .await
            .unwrap();

        assert!(!result.was_empty);
        assert_eq!(result.bytes_copied, before.bytes.len() as u64);
        assert_eq!(store.get(&y).await.unwrap().bytes, before.bytes);
        // Lineage travels with the document
        assert_eq!(repo.load(&y).await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn test_migrate_leaves_source_untouched() {
        let (store, repo, migrator) = setup();
        let (x, y) = (addr("cfg/x"), addr("cfg/y"));
        seed(&repo, &x, b"resources").await;
        let bytes_before = store.get(&x).await.unwrap();
        let versions_before = store.list_versions(&x).await.unwrap();

        migrator.migrate(&x, &y, |_| true).await.unwrap();

        assert_eq!(store.get(&x).await.unwrap(), bytes_before);
        assert_eq!(store.list_versions(&x).await.unwrap(), versions_before);
    }

    #[tokio::test]
    async fn test_empty_source_skips_confirmation() {
        let (_, repo, migrator) = setup();
        let (x, y) = (addr("cfg/x"), addr("cfg/y"));
        let asked = AtomicBool::new(false);

        let result = migrator
            .migrate(&x, &y, |_| {
                asked.store(true, Ordering::SeqCst);
                false
            })
            .await
            .unwrap();

        assert!(!asked.load(Ordering::SeqCst));
        assert!(result.was_empty);
        assert_eq!(result.bytes_copied, 0);
        assert!(repo.load(&x).await.unwrap().is_none());

        let initial = repo.load(&y).await.unwrap().unwrap();
        assert_eq!(initial.serial, 1);
        assert!(initial.payload.is_empty());
    }

    #[tokio::test]
    async fn test_declined_migration_scenario() {
        let (store, repo, migrator) = setup();
        let (x, y) = (addr("cfg/x"), addr("cfg/y"));
        seed(&repo, &x, b"resources").await;
        let before = store.get(&x).await.unwrap();

        let err = migrator.migrate(&x, &y, |_| false).await.unwrap_err();
        assert!(matches!(err, BackendError::MigrationCancelled { .. }));
        assert!(repo.load(&y).await.unwrap().is_none());
        assert_eq!(store.get(&x).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_destination_not_empty() {
        let (_, repo, migrator) = setup();
        let (x, y) = (addr("cfg/x"), addr("cfg/y"));
        seed(&repo, &x, b"source").await;
        let existing = seed(&repo, &y, b"already here").await;

        let err = migrator
            .migrate(&x, &y, |_| panic!("must not ask"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::DestinationNotEmpty(_)));
        assert_eq!(repo.load(&y).await.unwrap(), Some(existing));
    }

    #[tokio::test]
    async fn test_rerun_is_detected() {
        let (_, repo, migrator) = setup();
        let (x, y) = (addr("cfg/x"), addr("cfg/y"));
        seed(&repo, &x, b"resources").await;

        migrator.migrate(&x, &y, |_| true).await.unwrap();
        let err = migrator.migrate(&x, &y, |_| true).await.unwrap_err();
        assert!(matches!(err, BackendError::DestinationNotEmpty(_)));
    }

    #[tokio::test]
    async fn test_destination_accepts_successor_after_migration() {
        let (_, repo, migrator) = setup();
        let (x, y) = (addr("cfg/x"), addr("cfg/y"));
        seed(&repo, &x, b"resources").await;
        migrator.migrate(&x, &y, |_| true).await.unwrap();

        let next = repo
            .transact(&y, "h1", |current| current.unwrap().successor(b"moved".to_vec()))
            .await
            .unwrap();
        assert_eq!(next.serial, 2);
        assert_eq!(repo.load(&x).await.unwrap().unwrap().serial, 1);
    }

    #[tokio::test]
    async fn test_corrupt_source_is_fatal() {
        let (store, _, migrator) = setup();
        let (x, y) = (addr("cfg/x"), addr("cfg/y"));
        store.put(&x, b"not a state document".to_vec()).await.unwrap();

        let err = migrator
            .migrate(&x, &y, |_| panic!("must not ask"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::CorruptPayload(_)));
        assert!(matches!(store.get(&y).await, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_migrate_onto_itself() {
        let (_, _, migrator) = setup();
        let x = addr("cfg/x");
        assert!(matches!(
            migrator.migrate(&x, &x, |_| true).await,
            Err(BackendError::InvalidAddress(_))
        ));
    }

    /// Memory store where a competing migration fills `dest` right after it is checked
    struct CompetingMigration {
        inner: MemoryStore,
        dest: Address,
        armed: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for CompetingMigration {
        async fn get(&self, address: &Address) -> BackendResult<StoredObject> {
            let result = self.inner.get(address).await;
            if *address == self.dest && self.armed.swap(false, Ordering::SeqCst) {
                let theirs = StateDocument::initial(b"theirs".to_vec()).encode();
                self.inner.put(address, theirs).await?;
            }
            result
        }

        async fn put(&self, address: &Address, bytes: Vec<u8>) -> BackendResult<String> {
            self.inner.put(address, bytes).await
        }

        async fn conditional_put(
            &self,
            address: &Address,
            bytes: Vec<u8>,
            expect: Precondition,
        ) -> BackendResult<String> {
            self.inner.conditional_put(address, bytes, expect).await
        }

        async fn soft_delete(&self, address: &Address) -> BackendResult<String> {
            self.inner.soft_delete(address).await
        }

        async fn soft_delete_if(
            &self,
            address: &Address,
            version_id: &str,
        ) -> BackendResult<String> {
            self.inner.soft_delete_if(address, version_id).await
        }

        async fn list_versions(&self, address: &Address) -> BackendResult<Vec<VersionInfo>> {
            self.inner.list_versions(address).await
        }

        async fn purge(&self, address: &Address, version_id: &str) -> BackendResult<()> {
            self.inner.purge(address, version_id).await
        }

        async fn init(&self) -> BackendResult<()> {
            self.inner.init().await
        }
    }

    #[tokio::test]
    async fn test_concurrent_migration_into_same_destination_loses() {
        let (x, y) = (addr("cfg/x"), addr("cfg/y"));
        let store = Arc::new(CompetingMigration {
            inner: MemoryStore::new(),
            dest: y.clone(),
            armed: AtomicBool::new(false),
        });
        let repo = StateRepository::new(store.clone());
        let migrator = Migrator::new(store.clone());
        seed(&repo, &x, b"ours").await;
        store.armed.store(true, Ordering::SeqCst);

        let err = migrator.migrate(&x, &y, |_| true).await.unwrap_err();
        assert!(matches!(err, BackendError::DestinationNotEmpty(_)));

        // The competing write is kept as is
        let kept = repo.load(&y).await.unwrap().unwrap();
        assert_eq!(kept.payload, b"theirs");
        assert_eq!(repo.load(&x).await.unwrap().unwrap().payload, b"ours");
    }
}
