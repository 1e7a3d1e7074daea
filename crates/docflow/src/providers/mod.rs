//! Provider abstractions for the pipeline's external collaborators
//!
//! The extractor, embedder, vector store, and blob store are consumed
//! through traits so deployments can swap implementations without touching
//! the pipeline.

pub mod blob_store;
pub mod embedding;
pub mod extractor;
pub mod local;
pub mod ollama;
pub mod vector_store;

pub use blob_store::BlobStoreProvider;
pub use embedding::EmbeddingProvider;
pub use extractor::ContentExtractor;
pub use vector_store::VectorStoreProvider;
