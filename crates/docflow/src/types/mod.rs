//! Core types for documents, chunks, jobs, and staged uploads

pub mod document;
pub mod job;
pub mod upload;

pub use document::{Chunk, DocumentRecord, DocumentStatus};
pub use job::{IngestionJob, JobStage};
pub use upload::UploadRecord;
