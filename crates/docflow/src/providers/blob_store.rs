//! Blob store provider trait for staged upload payloads

use async_trait::async_trait;

use crate::error::Result;

/// Trait for short-lived blob storage backing the upload stager
#[async_trait]
pub trait BlobStoreProvider: Send + Sync {
    /// Write a blob under the given key
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read a blob; `NotFound` if missing
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Delete a blob. Idempotent: deleting an already-deleted key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether a blob exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Check if the provider is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Provider name for logging
    fn name(&self) -> &str;
}
