//! Object store implementations

mod local;
mod memory;
mod s3;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

use std::sync::Arc;

use crate::backend::{BackendConfig, BackendError, BackendResult, ObjectStore};

/// Create an object store from configuration
///
/// This function dispatches to the appropriate store implementation
/// based on the backend_type in the configuration. It never creates
/// storage; an S3 bucket must already exist with versioning enabled.
pub async fn create_backend(config: &BackendConfig) -> BackendResult<Arc<dyn ObjectStore>> {
    match config.backend_type.as_str() {
        "s3" => {
            let store = S3Store::from_config(config).await?;
            store.check_versioning().await?;
            Ok(Arc::new(store))
        }
        "local" => Ok(Arc::new(LocalStore::from_config(config)?)),
        "memory" => Ok(Arc::new(MemoryStore::new())),
        other => Err(BackendError::unsupported_backend(other)),
    }
}

/// Create an object store and initialize its backing storage
///
/// Creates the S3 bucket (when `auto_create` allows) or the local root
/// directory.
pub async fn init_backend(config: &BackendConfig) -> BackendResult<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.backend_type.as_str() {
        "s3" => Arc::new(S3Store::from_config(config).await?),
        "local" => Arc::new(LocalStore::from_config(config)?),
        "memory" => Arc::new(MemoryStore::new()),
        other => return Err(BackendError::unsupported_backend(other)),
    };
    store.init().await?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Address;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_unsupported_backend() {
        let config = BackendConfig {
            backend_type: "unsupported".to_string(),
            attributes: HashMap::new(),
        };

        let result = create_backend(&config).await;

        if let Err(BackendError::UnsupportedBackend(name)) = result {
            assert_eq!(name, "unsupported");
        } else {
            panic!("Expected UnsupportedBackend error");
        }
    }

    #[tokio::test]
    async fn test_s3_backend_requires_bucket() {
        let config = BackendConfig::new("s3").with_attribute("region", "us-east-1".into());
        assert!(matches!(
            create_backend(&config).await,
            Err(BackendError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_create_local_backend_does_not_create_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("state");
        let config = BackendConfig::new("local").with_attribute(
            "path",
            serde_json::Value::String(root.display().to_string()),
        );

        create_backend(&config).await.unwrap();
        assert!(!root.exists());

        init_backend(&config).await.unwrap();
        assert!(root.is_dir());
    }

    #[tokio::test]
    async fn test_init_unsupported_backend() {
        assert!(matches!(
            init_backend(&BackendConfig::new("azure")).await,
            Err(BackendError::UnsupportedBackend(_))
        ));
    }

    #[tokio::test]
    async fn test_create_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::new("local").with_attribute(
            "path",
            serde_json::Value::String(dir.path().display().to_string()),
        );
        let store = create_backend(&config).await.unwrap();

        let x = Address::new("cfg/x").unwrap();
        store.put(&x, b"a".to_vec()).await.unwrap();
        assert_eq!(store.get(&x).await.unwrap().bytes, b"a");
    }
}
