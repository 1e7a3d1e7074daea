//! Vector store provider trait

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Chunk;

/// Trait for persisting chunk embeddings.
///
/// Writes are keyed by `(document_id, chunk_index)` so a retried stage
/// overwrites instead of inserting duplicates.
#[async_trait]
pub trait VectorStoreProvider: Send + Sync {
    /// Upsert a chunk's vector; returns an opaque reference to the stored
    /// entry
    async fn upsert(&self, chunk: &Chunk, vector: &[f32]) -> Result<String>;

    /// Delete all vectors for a document; returns how many were removed.
    /// Used to clear partial prior output before a clean re-chunk.
    async fn delete_by_document(&self, document_id: &Uuid) -> Result<usize>;

    /// Total number of vectors stored
    async fn len(&self) -> Result<usize>;

    /// Check if store is empty
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Check if the provider is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Provider name for logging
    fn name(&self) -> &str;
}
