//! Staged upload records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A staged, not-yet-processed file.
///
/// Owned by the blob stager. The document id is assigned up front so the
/// upload and the eventual document share an identity; the blob is removed
/// when the job reaches a terminal stage, or by the expiry sweep if the
/// upload is never consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Unique upload ID
    pub id: Uuid,
    /// Document this upload will become once submitted
    pub document_id: Uuid,
    /// Key of the blob in the staging store
    pub blob_key: String,
    /// Original filename as provided by the caller
    pub filename: String,
    /// Declared content type
    pub content_type: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Whether a processing job has been submitted for this upload
    pub consumed: bool,
    /// After this instant the upload is no longer fetchable and the sweep
    /// may remove the blob
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Create a new staged upload with the given TTL
    pub fn new(
        filename: String,
        content_type: String,
        size_bytes: u64,
        ttl: chrono::Duration,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            document_id: Uuid::new_v4(),
            blob_key: format!("staging/{}", id),
            filename,
            content_type,
            size_bytes,
            consumed: false,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
