//! Blob stager: short-lived storage for uploaded files
//!
//! Uploads live in the blob store until their job reaches a terminal stage
//! or, if never consumed, until the expiry sweep removes them. Nothing here
//! is permanent storage.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::StagingConfig;
use crate::error::{Error, Result};
use crate::providers::blob_store::BlobStoreProvider;
use crate::storage::IngestDb;
use crate::types::UploadRecord;

/// Manages staged upload blobs and their records
pub struct BlobStager {
    db: Arc<IngestDb>,
    store: Arc<dyn BlobStoreProvider>,
    config: StagingConfig,
}

impl BlobStager {
    pub fn new(db: Arc<IngestDb>, store: Arc<dyn BlobStoreProvider>, config: StagingConfig) -> Self {
        Self { db, store, config }
    }

    /// Stage an uploaded file: validate, write the blob, persist the record.
    pub async fn stage(
        &self,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<UploadRecord> {
        let size = data.len() as u64;
        if size > self.config.max_upload_size {
            return Err(Error::SizeExceeded {
                size_bytes: size,
                max_bytes: self.config.max_upload_size,
            });
        }

        if !self
            .config
            .allowed_content_types
            .iter()
            .any(|t| t == content_type)
        {
            return Err(Error::UnsupportedType(content_type.to_string()));
        }

        let upload = UploadRecord::new(
            filename.to_string(),
            content_type.to_string(),
            size,
            self.config.upload_ttl(),
        );

        self.store.put(&upload.blob_key, data).await?;
        self.db.insert_upload(&upload)?;

        tracing::info!(
            upload_id = %upload.id,
            filename = %upload.filename,
            size_bytes = size,
            "Upload staged"
        );

        Ok(upload)
    }

    /// Fetch a staged blob for processing.
    ///
    /// Consumed uploads stay fetchable past their TTL so retries of a
    /// long-running job keep working; unconsumed uploads expire.
    pub async fn fetch_for_processing(&self, upload_id: uuid::Uuid) -> Result<Vec<u8>> {
        let upload = self
            .db
            .get_upload(upload_id)?
            .ok_or_else(|| Error::NotFound(format!("Upload {} does not exist", upload_id)))?;

        if !upload.consumed && upload.is_expired(Utc::now()) {
            return Err(Error::NotFound(format!("Upload {} has expired", upload_id)));
        }

        self.store.get(&upload.blob_key).await
    }

    /// Delete a staged blob and its record. Idempotent.
    pub async fn delete(&self, upload_id: uuid::Uuid) -> Result<()> {
        let Some(upload) = self.db.get_upload(upload_id)? else {
            return Ok(());
        };

        self.store.delete(&upload.blob_key).await?;
        self.db.delete_upload(upload_id)?;

        tracing::debug!(upload_id = %upload_id, "Staged blob deleted");
        Ok(())
    }

    /// Remove expired, never-consumed uploads. Returns how many were swept.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.db.list_expired_uploads(now)?;
        let mut swept = 0usize;

        for upload in expired {
            match self.store.delete(&upload.blob_key).await {
                Ok(()) => {
                    self.db.delete_upload(upload.id)?;
                    swept += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        upload_id = %upload.id,
                        "Failed to sweep expired blob, will retry next cycle: {}",
                        e
                    );
                }
            }
        }

        if swept > 0 {
            tracing::info!(swept, "Expired uploads swept");
        }

        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::local::LocalBlobStore;

    async fn stager() -> (BlobStager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(IngestDb::in_memory().unwrap());
        let store = Arc::new(LocalBlobStore::new(dir.path()).unwrap());
        (
            BlobStager::new(
                db,
                store,
                StagingConfig {
                    max_upload_size: 1024,
                    upload_ttl_secs: 3600,
                    ..StagingConfig::default()
                },
            ),
            dir,
        )
    }

    #[tokio::test]
    async fn test_stage_and_fetch_round_trip() {
        let (stager, _dir) = stager().await;
        let upload = stager
            .stage("report.pdf", "application/pdf", b"pdf bytes")
            .await
            .unwrap();

        let data = stager.fetch_for_processing(upload.id).await.unwrap();
        assert_eq!(data, b"pdf bytes");
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected() {
        let (stager, _dir) = stager().await;
        let big = vec![0u8; 2048];
        let err = stager
            .stage("big.pdf", "application/pdf", &big)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SizeExceeded { .. }));
    }

    #[tokio::test]
    async fn test_unknown_content_type_is_rejected() {
        let (stager, _dir) = stager().await;
        let err = stager
            .stage("archive.zip", "application/zip", b"zip")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (stager, _dir) = stager().await;
        let upload = stager
            .stage("report.pdf", "application/pdf", b"data")
            .await
            .unwrap();

        stager.delete(upload.id).await.unwrap();
        stager.delete(upload.id).await.unwrap();

        let err = stager.fetch_for_processing(upload.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_unconsumed_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(IngestDb::in_memory().unwrap());
        let store = Arc::new(LocalBlobStore::new(dir.path()).unwrap());
        let stager = BlobStager::new(
            db.clone(),
            store.clone(),
            StagingConfig {
                upload_ttl_secs: 0,
                ..StagingConfig::default()
            },
        );

        let upload = stager
            .stage("stale.pdf", "application/pdf", b"data")
            .await
            .unwrap();

        let swept = stager
            .sweep_expired(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        assert!(!store.exists(&upload.blob_key).await.unwrap());
        assert!(db.get_upload(upload.id).unwrap().is_none());
    }
}
