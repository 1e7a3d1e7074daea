//! Local provider implementations: filesystem blobs and an in-memory
//! vector store for single-process deployments and tests

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::Chunk;

use super::blob_store::BlobStoreProvider;
use super::vector_store::VectorStoreProvider;

/// Blob store writing staged uploads to the local filesystem
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// Keys contain a path-like prefix; flatten them to a single file name
    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(key.replace('/', "_"))
    }
}

#[async_trait]
impl BlobStoreProvider for LocalBlobStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.blob_path(key), data)
            .await
            .map_err(|e| Error::BlobStorage(format!("Failed to write blob {}: {}", key, e)))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Blob {} does not exist", key)))
            }
            Err(e) => Err(Error::BlobStorage(format!(
                "Failed to read blob {}: {}",
                key, e
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::BlobStorage(format!(
                "Failed to delete blob {}: {}",
                key, e
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blob_path(key).exists())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.root.exists())
    }

    fn name(&self) -> &str {
        "local-fs"
    }
}

/// Entry stored per embedded chunk
#[derive(Debug, Clone)]
struct StoredVector {
    #[allow(dead_code)]
    vector: Vec<f32>,
    #[allow(dead_code)]
    content: String,
}

/// In-memory vector store keyed by `(document_id, chunk_index)`
#[derive(Default)]
pub struct MemoryVectorStore {
    vectors: DashMap<(Uuid, u32), StoredVector>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStoreProvider for MemoryVectorStore {
    async fn upsert(&self, chunk: &Chunk, vector: &[f32]) -> Result<String> {
        self.vectors.insert(
            (chunk.document_id, chunk.chunk_index),
            StoredVector {
                vector: vector.to_vec(),
                content: chunk.content.clone(),
            },
        );
        Ok(format!("{}:{}", chunk.document_id, chunk.chunk_index))
    }

    async fn delete_by_document(&self, document_id: &Uuid) -> Result<usize> {
        let keys: Vec<(Uuid, u32)> = self
            .vectors
            .iter()
            .map(|entry| *entry.key())
            .filter(|(doc, _)| doc == document_id)
            .collect();

        let count = keys.len();
        for key in keys {
            self.vectors.remove(&key);
        }
        Ok(count)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.vectors.len())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
