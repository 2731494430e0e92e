//! Local filesystem backend for state storage
//!
//! Each address gets its own directory under the root; each version is an
//! immutable file named by a per-address sequence number. New versions are
//! written to a temporary file and then linked into place without
//! clobbering, so two writers racing for the same sequence number cannot
//! both win, even across processes. That no-clobber publish is what
//! conditional puts are built on.
//!
//! Version file layout: `[1 byte kind][8 bytes created, ms since epoch LE][body]`.
//! Purged versions keep their file (with the body dropped) so sequence
//! numbers are never reused.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::backend::{
    Address, BackendConfig, BackendError, BackendResult, ObjectStore, Precondition, StoredObject,
    VersionInfo,
};

const KIND_LIVE: u8 = 0;
const KIND_TOMBSTONE: u8 = 1;
const KIND_PURGED: u8 = 2;
const RECORD_HEADER: usize = 9;

/// Unconditional writers retry when they lose a sequence number race
const MAX_PUBLISH_ATTEMPTS: usize = 64;

/// Header of one version file
#[derive(Debug)]
struct Record {
    seq: u64,
    kind: u8,
    created: DateTime<Utc>,
}

/// Filesystem-backed versioned store
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Default root directory
    pub const DEFAULT_ROOT: &'static str = ".keel/state";

    /// Create a LocalStore rooted at a specific directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a LocalStore from configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let root = config
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_ROOT));

        Ok(Self::with_root(root))
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn address_dir(&self, address: &Address) -> PathBuf {
        self.root.join(encode_address(address))
    }

    /// Sequence numbers of an address's version files, oldest first
    fn seqs(&self, dir: &Path) -> BackendResult<Vec<u64>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("read state directory", e)),
        };

        let mut seqs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error("read state directory", e))?;
            // Temporary files and anything else without a numeric name are skipped
            if let Some(seq) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// Newest non-purged record plus the next free sequence number
    ///
    /// Only headers are read, newest first, stopping at the first record
    /// that is not purged. Older versions are never opened.
    fn head(&self, dir: &Path) -> BackendResult<(Option<Record>, u64)> {
        let seqs = self.seqs(dir)?;
        let next_seq = seqs.last().map(|seq| seq + 1).unwrap_or(1);
        for &seq in seqs.iter().rev() {
            let record = read_header(&dir.join(seq_name(seq)), seq)?;
            if record.kind != KIND_PURGED {
                return Ok((Some(record), next_seq));
            }
        }
        Ok((None, next_seq))
    }

    /// Publish a version at `seq`; `Ok(false)` if another writer took it first
    fn publish(&self, dir: &Path, seq: u64, kind: u8, body: &[u8]) -> BackendResult<bool> {
        fs::create_dir_all(dir).map_err(|e| io_error("create state directory", e))?;

        let tmp = write_temp(dir, kind, Utc::now(), body)?;
        match tmp.persist_noclobber(dir.join(seq_name(seq))) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_error("publish version", e.error)),
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::with_root(Self::DEFAULT_ROOT)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, address: &Address) -> BackendResult<StoredObject> {
        let dir = self.address_dir(address);
        // A purge can land between reading the header and the body; look again
        for _ in 0..MAX_PUBLISH_ATTEMPTS {
            let record = match self.head(&dir)? {
                (Some(record), _) if record.kind == KIND_LIVE => record,
                _ => return Err(BackendError::not_found(address)),
            };
            let (kind, body) = read_body(&dir.join(seq_name(record.seq)))?;
            if kind == KIND_LIVE {
                return Ok(StoredObject {
                    bytes: body,
                    version_id: record.seq.to_string(),
                });
            }
        }
        Err(BackendError::BackendUnavailable(format!(
            "gave up reading {} after {} contended attempts",
            address, MAX_PUBLISH_ATTEMPTS
        )))
    }

    async fn put(&self, address: &Address, bytes: Vec<u8>) -> BackendResult<String> {
        let dir = self.address_dir(address);
        for _ in 0..MAX_PUBLISH_ATTEMPTS {
            let (_, seq) = self.head(&dir)?;
            if self.publish(&dir, seq, KIND_LIVE, &bytes)? {
                return Ok(seq.to_string());
            }
        }
        Err(BackendError::BackendUnavailable(format!(
            "gave up writing {} after {} contended attempts",
            address, MAX_PUBLISH_ATTEMPTS
        )))
    }

    async fn conditional_put(
        &self,
        address: &Address,
        bytes: Vec<u8>,
        expect: Precondition,
    ) -> BackendResult<String> {
        let dir = self.address_dir(address);
        let (current, seq) = self.head(&dir)?;
        let live = current.filter(|r| r.kind == KIND_LIVE);

        let holds = match &expect {
            Precondition::Absent => live.is_none(),
            Precondition::VersionId(v) => live.is_some_and(|r| r.seq.to_string() == *v),
        };
        // Losing the publish race means someone wrote after we checked
        if holds && self.publish(&dir, seq, KIND_LIVE, &bytes)? {
            return Ok(seq.to_string());
        }
        Err(BackendError::PreconditionFailed(address.to_string()))
    }

    async fn soft_delete(&self, address: &Address) -> BackendResult<String> {
        let dir = self.address_dir(address);
        for _ in 0..MAX_PUBLISH_ATTEMPTS {
            let (current, seq) = self.head(&dir)?;
            if !current.is_some_and(|r| r.kind == KIND_LIVE) {
                return Err(BackendError::not_found(address));
            }
            if self.publish(&dir, seq, KIND_TOMBSTONE, &[])? {
                info!(%address, tombstone = seq, "soft deleted");
                return Ok(seq.to_string());
            }
        }
        Err(BackendError::BackendUnavailable(format!(
            "gave up deleting {} after {} contended attempts",
            address, MAX_PUBLISH_ATTEMPTS
        )))
    }

    async fn soft_delete_if(&self, address: &Address, version_id: &str) -> BackendResult<String> {
        let dir = self.address_dir(address);
        let (current, seq) = self.head(&dir)?;
        let holds = current.is_some_and(|r| r.kind == KIND_LIVE && r.seq.to_string() == version_id);

        // The tombstone takes the very next sequence number, so a write after our check makes the publish fail
        if holds && self.publish(&dir, seq, KIND_TOMBSTONE, &[])? {
            info!(%address, version_id, tombstone = seq, "soft deleted");
            return Ok(seq.to_string());
        }
        Err(BackendError::PreconditionFailed(address.to_string()))
    }

    async fn list_versions(&self, address: &Address) -> BackendResult<Vec<VersionInfo>> {
        let dir = self.address_dir(address);
        let mut versions = Vec::new();
        for seq in self.seqs(&dir)?.into_iter().rev() {
            let record = read_header(&dir.join(seq_name(seq)), seq)?;
            if record.kind == KIND_PURGED {
                continue;
            }
            versions.push(VersionInfo {
                version_id: seq.to_string(),
                timestamp: record.created,
                is_tombstone: record.kind == KIND_TOMBSTONE,
            });
        }
        Ok(versions)
    }

    async fn purge(&self, address: &Address, version_id: &str) -> BackendResult<()> {
        let not_found = || BackendError::VersionNotFound {
            address: address.to_string(),
            version_id: version_id.to_string(),
        };
        let seq: u64 = version_id.parse().map_err(|_| not_found())?;

        let dir = self.address_dir(address);
        let path = dir.join(seq_name(seq));
        let record = match read_header(&path, seq) {
            Ok(record) => record,
            Err(BackendError::NotFound(_)) => return Err(not_found()),
            Err(e) => return Err(e),
        };
        if record.kind == KIND_PURGED {
            return Err(not_found());
        }

        let tmp = write_temp(&dir, KIND_PURGED, record.created, &[])?;
        tmp.persist(&path)
            .map_err(|e| io_error("purge version", e.error))?;
        warn!(%address, version_id, "purged version");
        Ok(())
    }

    async fn init(&self) -> BackendResult<()> {
        fs::create_dir_all(&self.root).map_err(|e| io_error("create state root", e))?;
        info!(root = %self.root.display(), "initialized local state store");
        Ok(())
    }
}

fn seq_name(seq: u64) -> String {
    format!("{:020}", seq)
}

/// Map an address to a single safe directory name
fn encode_address(address: &Address) -> String {
    let mut out = String::with_capacity(address.as_str().len());
    for b in address.as_str().bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn write_temp(
    dir: &Path,
    kind: u8,
    created: DateTime<Utc>,
    body: &[u8],
) -> BackendResult<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_error("create temp file", e))?;
    tmp.write_all(&[kind])
        .and_then(|_| tmp.write_all(&created.timestamp_millis().to_le_bytes()))
        .and_then(|_| tmp.write_all(body))
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| io_error("write version", e))?;
    Ok(tmp)
}

fn truncated(path: &Path) -> BackendError {
    BackendError::Io(format!("Version file {} is truncated", path.display()))
}

/// Read a version file's header without touching its body
fn read_header(path: &Path, seq: u64) -> BackendResult<Record> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(BackendError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(io_error("read version", e)),
    };

    let mut header = [0u8; RECORD_HEADER];
    file.read_exact(&mut header).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => truncated(path),
        _ => io_error("read version", e),
    })?;

    let mut millis = [0u8; 8];
    millis.copy_from_slice(&header[1..]);
    let created = DateTime::from_timestamp_millis(i64::from_le_bytes(millis)).ok_or_else(|| {
        BackendError::Io(format!("Version file {} has a bad timestamp", path.display()))
    })?;

    Ok(Record {
        seq,
        kind: header[0],
        created,
    })
}

/// Read a version file's kind and body
fn read_body(path: &Path) -> BackendResult<(u8, Vec<u8>)> {
    let mut bytes = fs::read(path).map_err(|e| io_error("read version", e))?;
    if bytes.len() < RECORD_HEADER {
        return Err(truncated(path));
    }
    let kind = bytes[0];
    Ok((kind, bytes.split_off(RECORD_HEADER)))
}

fn io_error(action: &str, e: std::io::Error) -> BackendError {
    BackendError::Io(format!("Failed to {}: {}", action, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_local_store_read_write() {
        let dir = tempdir().unwrap();
        let store = LocalStore::with_root(dir.path());
        let x = addr("cfg/x");

        assert!(matches!(store.get(&x).await, Err(BackendError::NotFound(_))));

        let v1 = store.put(&x, b"one".to_vec()).await.unwrap();
        let v2 = store.put(&x, b"two".to_vec()).await.unwrap();
        assert_eq!(v1, "1");
        assert_eq!(v2, "2");

        let current = store.get(&x).await.unwrap();
        assert_eq!(current.bytes, b"two");
        assert_eq!(current.version_id, "2");
    }

    #[tokio::test]
    async fn test_local_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let x = addr("cfg/x");
        LocalStore::with_root(dir.path())
            .put(&x, b"persisted".to_vec())
            .await
            .unwrap();

        let reopened = LocalStore::with_root(dir.path());
        assert_eq!(reopened.get(&x).await.unwrap().bytes, b"persisted");
    }

    #[tokio::test]
    async fn test_local_store_conditional_put() {
        let dir = tempdir().unwrap();
        let store = LocalStore::with_root(dir.path());
        let x = addr("cfg/x");

        let v1 = store
            .conditional_put(&x, b"a".to_vec(), Precondition::Absent)
            .await
            .unwrap();
        assert!(matches!(
            store
                .conditional_put(&x, b"b".to_vec(), Precondition::Absent)
                .await,
            Err(BackendError::PreconditionFailed(_))
        ));

        store
            .conditional_put(&x, b"b".to_vec(), Precondition::VersionId(v1.clone()))
            .await
            .unwrap();
        assert!(matches!(
            store
                .conditional_put(&x, b"c".to_vec(), Precondition::VersionId(v1))
                .await,
            Err(BackendError::PreconditionFailed(_))
        ));
        assert_eq!(store.get(&x).await.unwrap().bytes, b"b");
    }

    #[tokio::test]
    async fn test_local_store_concurrent_create_if_absent() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::with_root(dir.path()));
        let x = addr("cfg/x.lock");

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            let x = x.clone();
            handles.push(tokio::spawn(async move {
                store
                    .conditional_put(&x, vec![i], Precondition::Absent)
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.list_versions(&x).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_store_tombstone_and_purge() {
        let dir = tempdir().unwrap();
        let store = LocalStore::with_root(dir.path());
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
        assert_eq!(versions.len(), 1);
        assert!(versions.iter().all(|v| v.version_id != live));

        assert!(matches!(
            store.purge(&x, &live).await,
            Err(BackendError::VersionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_store_version_ids_not_reused_after_purge() {
        let dir = tempdir().unwrap();
        let store = LocalStore::with_root(dir.path());
        let x = addr("cfg/x");

        let v1 = store.put(&x, b"a".to_vec()).await.unwrap();
        store.purge(&x, &v1).await.unwrap();
        assert!(matches!(store.get(&x).await, Err(BackendError::NotFound(_))));

        let v2 = store.put(&x, b"b".to_vec()).await.unwrap();
        assert_ne!(v1, v2);
    }

    #[tokio::test]
    async fn test_local_store_purge_bad_version_id() {
        let dir = tempdir().unwrap();
        let store = LocalStore::with_root(dir.path());
        assert!(matches!(
            store.purge(&addr("cfg/x"), "not-a-number").await,
            Err(BackendError::VersionNotFound { .. })
        ));
        assert!(matches!(
            store.purge(&addr("cfg/x"), "7").await,
            Err(BackendError::VersionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_store_reads_only_the_newest_version() {
        let dir = tempdir().unwrap();
        let store = LocalStore::with_root(dir.path());
        let x = addr("cfg/x");
        for i in 1..=51u32 {
            store.put(&x, i.to_string().into_bytes()).await.unwrap();
        }

        // Damage the oldest version; the current one must stay readable
        let oldest = dir.path().join(encode_address(&x)).join(seq_name(1));
        fs::write(&oldest, [0u8, 0u8]).unwrap();

        let current = store.get(&x).await.unwrap();
        assert_eq!(current.version_id, "51");
        assert_eq!(current.bytes, b"51");

        let v52 = store.put(&x, b"52".to_vec()).await.unwrap();
        assert_eq!(v52, "52");
        store.soft_delete_if(&x, &v52).await.unwrap();
        assert!(matches!(store.get(&x).await, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_local_store_truncated_current_version() {
        let dir = tempdir().unwrap();
        let store = LocalStore::with_root(dir.path());
        let x = addr("cfg/x");
        store.put(&x, b"a".to_vec()).await.unwrap();

        let current = dir.path().join(encode_address(&x)).join(seq_name(1));
        fs::write(&current, [0u8]).unwrap();
        assert!(matches!(store.get(&x).await, Err(BackendError::Io(_))));
    }

    #[tokio::test]
    async fn test_local_store_soft_delete_if() {
        let dir = tempdir().unwrap();
        let store = LocalStore::with_root(dir.path());
        let x = addr("cfg/x");
        let v1 = store.put(&x, b"a".to_vec()).await.unwrap();
        let v2 = store.put(&x, b"b".to_vec()).await.unwrap();

        assert!(matches!(
            store.soft_delete_if(&x, &v1).await,
            Err(BackendError::PreconditionFailed(_))
        ));
        assert_eq!(store.get(&x).await.unwrap().bytes, b"b");

        let tombstone = store.soft_delete_if(&x, &v2).await.unwrap();
        let versions = store.list_versions(&x).await.unwrap();
        assert_eq!(versions[0].version_id, tombstone);
        assert!(versions[0].is_tombstone);
        assert!(matches!(
            store.soft_delete_if(&x, &v2).await,
            Err(BackendError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_local_store_init_creates_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("nested/state");
        let store = LocalStore::with_root(&root);
        store.init().await.unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_encode_address() {
        assert_eq!(encode_address(&addr("cfg/x")), "cfg%2Fx");
        assert_eq!(encode_address(&addr("cfg/x.lock")), "cfg%2Fx%2Elock");
        assert_eq!(encode_address(&addr("..")), "%2E%2E");
    }

    #[test]
    fn test_local_store_from_config() {
        let config = BackendConfig {
            backend_type: "local".to_string(),
            attributes: HashMap::new(),
        };
        let store = LocalStore::from_config(&config).unwrap();
        assert_eq!(store.root(), Path::new(".keel/state"));

        let config = BackendConfig::new("local").with_attribute("path", "custom/dir".into());
        let store = LocalStore::from_config(&config).unwrap();
        assert_eq!(store.root(), Path::new("custom/dir"));
    }
}
