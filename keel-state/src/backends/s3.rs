//! S3 backend for state storage
//!
//! Requires a bucket with versioning enabled, checked whenever the store is
//! opened: soft deletes are delete markers, purges are versioned deletes.
//! Create-if-absent writes use `If-None-Match: *`; version-matched writes
//! and deletes check the current version id and then send `If-Match` on its
//! ETag.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketVersioningStatus, PublicAccessBlockConfiguration, ServerSideEncryption,
    VersioningConfiguration,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::{
    Address, BackendConfig, BackendError, BackendResult, ObjectStore, Precondition, StoredObject,
    VersionInfo,
};

/// Version id S3 reports for objects in an unversioned bucket
const NULL_VERSION: &str = "null";

/// S3-based versioned object store
pub struct S3Store {
    /// S3 client
    client: Client,
    /// Bucket name
    bucket: String,
    /// Key prefix prepended to every address
    prefix: String,
    /// AWS region
    region: String,
    /// Whether to encrypt objects (default: true)
    encrypt: bool,
    /// Whether to auto-create the bucket if it doesn't exist (default: true)
    auto_create: bool,
}

impl S3Store {
    /// Create a new S3Store from configuration
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let bucket = config.require_string("bucket")?.to_string();
        let region_value = config.require_string("region")?;

        // Convert region from DSL format (aws.Region.ap_northeast_1) to AWS format (ap-northeast-1)
        let region = convert_region_value(region_value);
        let prefix = config.get_string("prefix").unwrap_or_default().to_string();

        let encrypt = config.get_bool_or("encrypt", true);
        let auto_create = config.get_bool_or("auto_create", true);

        // Credentials come from the ambient AWS provider chain
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.clone()))
            .load()
            .await;

        let client = Client::new(&aws_config);

        Ok(Self {
            client,
            bucket,
            prefix,
            region,
            encrypt,
            auto_create,
        })
    }

    /// Get the bucket name
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    /// Get whether auto_create is enabled
    pub fn auto_create_enabled(&self) -> bool {
        self.auto_create
    }

    fn key(&self, address: &Address) -> String {
        object_key(&self.prefix, address)
    }

    /// Make sure the bucket exists, creating it if allowed
    pub async fn ensure_bucket(&self) -> BackendResult<()> {
        if self.bucket_exists().await? {
            return Ok(());
        }
        if !self.auto_create {
            return Err(BackendError::BucketNotFound(self.bucket.clone()));
        }
        self.create_bucket().await
    }

    /// Fail unless the bucket has versioning enabled
    ///
    /// Without versioning a soft delete erases the object outright and no
    /// history is listed.
    pub async fn check_versioning(&self) -> BackendResult<()> {
        let output = self
            .client
            .get_bucket_versioning()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| match status_of(&err) {
                Some(404) => BackendError::BucketNotFound(self.bucket.clone()),
                _ => unavailable(err),
            })?;
        versioning_enabled(&self.bucket, output.status())
    }

    /// Check if the bucket exists
    pub async fn bucket_exists(&self) -> BackendResult<bool> {
        let result = self.client.head_bucket().bucket(&self.bucket).send().await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                // HeadBucket returns 404 for non-existent buckets
                if err.as_service_error().is_some() || status_of(&err) == Some(404) {
                    Ok(false)
                } else {
                    Err(unavailable(err))
                }
            }
        }
    }

    /// Create the bucket with versioning enabled and public access blocked
    pub async fn create_bucket(&self) -> BackendResult<()> {
        // Create bucket with location constraint if not us-east-1
        let mut create_request = self.client.create_bucket().bucket(&self.bucket);

        if self.region != "us-east-1" {
            use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};

            let constraint = BucketLocationConstraint::from(self.region.as_str());
            let config = CreateBucketConfiguration::builder()
                .location_constraint(constraint)
                .build();
            create_request = create_request.create_bucket_configuration(config);
        }

        create_request.send().await.map_err(|e| {
            BackendError::BucketCreationFailed(DisplayErrorContext(&e).to_string())
        })?;

        // Versioning is what soft delete and purge rely on
        let versioning_config = VersioningConfiguration::builder()
            .status(BucketVersioningStatus::Enabled)
            .build();

        self.client
            .put_bucket_versioning()
            .bucket(&self.bucket)
            .versioning_configuration(versioning_config)
            .send()
            .await
            .map_err(|e| {
                BackendError::BackendUnavailable(format!(
                    "Failed to enable versioning: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        let public_access_block = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .block_public_policy(true)
            .ignore_public_acls(true)
            .restrict_public_buckets(true)
            .build();

        self.client
            .put_public_access_block()
            .bucket(&self.bucket)
            .public_access_block_configuration(public_access_block)
            .send()
            .await
            .map_err(|e| {
                BackendError::BackendUnavailable(format!(
                    "Failed to block public access: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        info!(bucket = %self.bucket, region = %self.region, "created state bucket");
        Ok(())
    }

    /// Current version id and ETag, or `None` if nothing live is stored
    async fn head(&self, key: &str) -> BackendResult<Option<(String, String)>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some((
                output.version_id().unwrap_or(NULL_VERSION).to_string(),
                output.e_tag().unwrap_or_default().to_string(),
            ))),
            Err(err) if status_of(&err) == Some(404) => Ok(None),
            Err(err) => Err(unavailable(err)),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, address: &Address) -> BackendResult<StoredObject> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(address))
            .send()
            .await;

        match result {
            Ok(output) => {
                let version_id = output.version_id().unwrap_or(NULL_VERSION).to_string();
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| BackendError::BackendUnavailable(e.to_string()))?;
                Ok(StoredObject {
                    bytes: body.into_bytes().to_vec(),
                    version_id,
                })
            }
            // A delete marker as the newest version also reads as 404
            Err(err) if status_of(&err) == Some(404) => Err(BackendError::not_found(address)),
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn put(&self, address: &Address, bytes: Vec<u8>) -> BackendResult<String> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(address))
            .body(ByteStream::from(bytes))
            .content_type("application/octet-stream");

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        let output = request.send().await.map_err(unavailable)?;
        Ok(output.version_id().unwrap_or(NULL_VERSION).to_string())
    }

    async fn conditional_put(
        &self,
        address: &Address,
        bytes: Vec<u8>,
        expect: Precondition,
    ) -> BackendResult<String> {
        let key = self.key(address);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type("application/octet-stream");

        request = match expect {
            Precondition::Absent => request.if_none_match("*"),
            Precondition::VersionId(expected) => match self.head(&key).await? {
                Some((version_id, etag)) if version_id == expected => request.if_match(etag),
                _ => return Err(BackendError::PreconditionFailed(address.to_string())),
            },
        };

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        match request.send().await {
            Ok(output) => Ok(output.version_id().unwrap_or(NULL_VERSION).to_string()),
            // 412 Precondition Failed, or 409 when a concurrent conditional write won
            Err(err) if matches!(status_of(&err), Some(409) | Some(412)) => {
                debug!(%address, "conditional put lost");
                Err(BackendError::PreconditionFailed(address.to_string()))
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn soft_delete(&self, address: &Address) -> BackendResult<String> {
        let key = self.key(address);
        if self.head(&key).await?.is_none() {
            return Err(BackendError::not_found(address));
        }

        let output = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(unavailable)?;
        let tombstone = output.version_id().unwrap_or(NULL_VERSION).to_string();
        info!(%address, %tombstone, "soft deleted");
        Ok(tombstone)
    }

    async fn soft_delete_if(&self, address: &Address, version_id: &str) -> BackendResult<String> {
        let key = self.key(address);
        let etag = match self.head(&key).await? {
            Some((current, etag)) if current == version_id => etag,
            _ => return Err(BackendError::PreconditionFailed(address.to_string())),
        };

        // Without a version id this adds a delete marker; If-Match makes it conditional
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .if_match(etag)
            .send()
            .await
        {
            Ok(output) => {
                let tombstone = output.version_id().unwrap_or(NULL_VERSION).to_string();
                info!(%address, version_id, %tombstone, "soft deleted");
                Ok(tombstone)
            }
            Err(err) if matches!(status_of(&err), Some(404) | Some(409) | Some(412)) => {
                debug!(%address, "conditional delete lost");
                Err(BackendError::PreconditionFailed(address.to_string()))
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    /// List versions and delete markers, newest first
    ///
    /// Ordered by `LastModified`, which S3 reports with one-second precision.
    /// The current version is always first, but older entries written within
    /// the same second have no reliable order between them.
    async fn list_versions(&self, address: &Address) -> BackendResult<Vec<VersionInfo>> {
        let key = self.key(address);
        // (is_latest, info) so ties on timestamp still put the current version first
        let mut versions: Vec<(bool, VersionInfo)> = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;

        loop {
            let output = self
                .client
                .list_object_versions()
                .bucket(&self.bucket)
                .prefix(&key)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take())
                .send()
                .await
                .map_err(unavailable)?;

            // The prefix also matches longer keys (e.g. the lock key)
            for v in output.versions() {
                if v.key() == Some(key.as_str()) {
                    versions.push((
                        v.is_latest().unwrap_or(false),
                        VersionInfo {
                            version_id: v.version_id().unwrap_or(NULL_VERSION).to_string(),
                            timestamp: to_utc(v.last_modified()),
                            is_tombstone: false,
                        },
                    ));
                }
            }
            for m in output.delete_markers() {
                if m.key() == Some(key.as_str()) {
                    versions.push((
                        m.is_latest().unwrap_or(false),
                        VersionInfo {
                            version_id: m.version_id().unwrap_or(NULL_VERSION).to_string(),
                            timestamp: to_utc(m.last_modified()),
                            is_tombstone: true,
                        },
                    ));
                }
            }

            if !output.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = output.next_key_marker().map(str::to_string);
            version_marker = output.next_version_id_marker().map(str::to_string);
            if key_marker.is_none() && version_marker.is_none() {
                break;
            }
        }

        versions.sort_by(|(a_latest, a), (b_latest, b)| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b_latest.cmp(a_latest))
        });
        Ok(versions.into_iter().map(|(_, info)| info).collect())
    }

    async fn purge(&self, address: &Address, version_id: &str) -> BackendResult<()> {
        let known = self
            .list_versions(address)
            .await?
            .iter()
            .any(|v| v.version_id == version_id);
        if !known {
            return Err(BackendError::VersionNotFound {
                address: address.to_string(),
                version_id: version_id.to_string(),
            });
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(address))
            .version_id(version_id)
            .send()
            .await
            .map_err(unavailable)?;
        warn!(%address, version_id, "purged version");
        Ok(())
    }

    async fn init(&self) -> BackendResult<()> {
        self.ensure_bucket().await?;
        self.check_versioning().await
    }
}

fn versioning_enabled(bucket: &str, status: Option<&BucketVersioningStatus>) -> BackendResult<()> {
    match status {
        Some(BucketVersioningStatus::Enabled) => Ok(()),
        other => Err(BackendError::configuration(format!(
            "Bucket {} must have versioning enabled (status: {})",
            bucket,
            other.map(|s| s.as_str()).unwrap_or("never enabled")
        ))),
    }
}

/// Convert region value from DSL format to AWS format
/// e.g., "aws.Region.ap_northeast_1" -> "ap-northeast-1"
fn convert_region_value(value: &str) -> String {
    if value.starts_with("aws.Region.") {
        value
            .strip_prefix("aws.Region.")
            .unwrap_or(value)
            .replace('_', "-")
    } else {
        value.to_string()
    }
}

fn object_key(prefix: &str, address: &Address) -> String {
    if prefix.is_empty() {
        address.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), address)
    }
}

fn to_utc(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    dt.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
        .unwrap_or_default()
}

/// HTTP status of a failed S3 call, when a response was received
fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

fn unavailable<E>(err: SdkError<E>) -> BackendError
where
    E: std::error::Error + 'static,
{
    BackendError::BackendUnavailable(DisplayErrorContext(&err).to_string())
}
