//! docflow: asynchronous document-ingestion pipeline
//!
//! Uploaded documents are staged in short-lived blob storage, then driven by
//! a pool of workers through a durable five-stage state machine: extract
//! text, check for duplicates by content fingerprint, split into
//! retrieval-ready chunks, generate embeddings, and persist everything for
//! semantic search. Submission never blocks on processing; callers poll the
//! status service. Staged blobs are removed on every terminal transition,
//! with a periodic sweep catching anything left behind.

pub mod config;
pub mod error;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod staging;
pub mod status;
pub mod storage;
pub mod types;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use processing::{CleanupSweeper, IngestWorker, JobQueue};
pub use staging::BlobStager;
pub use status::{StatusService, StatusSnapshot};
pub use storage::IngestDb;
pub use types::{
    document::{Chunk, DocumentRecord, DocumentStatus},
    job::{IngestionJob, JobStage},
    upload::UploadRecord,
};
