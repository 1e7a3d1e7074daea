//! Read-only status projection for pollers
//!
//! Snapshots come straight from the persisted records, so they always
//! reflect the last checkpoint a worker wrote; a crashed worker shows the
//! last stage it reached and is flagged as stalled once its lease lapses.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::IngestDb;
use crate::types::{DocumentStatus, IngestionJob, JobStage};

/// Point-in-time view of a job and its document
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub job_id: Uuid,
    pub document_id: Uuid,
    pub stage: JobStage,
    pub document_status: DocumentStatus,
    /// 0-100, never decreases over a job's lifetime
    pub progress: u8,
    pub chunks_embedded: u32,
    pub total_chunks: u32,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<Uuid>,
    pub blob_deleted: bool,
    /// Non-terminal job whose worker lease lapsed without a checkpoint;
    /// the queue will redeliver it
    pub stalled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_seconds: Option<i64>,
}

/// Read-only status queries plus cooperative cancellation
pub struct StatusService {
    db: Arc<IngestDb>,
}

impl StatusService {
    pub fn new(db: Arc<IngestDb>) -> Self {
        Self { db }
    }

    /// Status of the most recent job for a document
    pub fn status_for_document(&self, document_id: Uuid) -> Result<StatusSnapshot> {
        let job = self
            .db
            .find_latest_job_for_document(document_id)?
            .ok_or_else(|| Error::NotFound(format!("No job for document {}", document_id)))?;
        self.snapshot(job)
    }

    /// Status of a specific job
    pub fn status_for_job(&self, job_id: Uuid) -> Result<StatusSnapshot> {
        let job = self
            .db
            .get_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("Job {} does not exist", job_id)))?;
        self.snapshot(job)
    }

    /// Request cooperative cancellation; honored by the worker at the next
    /// stage or batch boundary. Returns false for terminal or unknown jobs.
    pub fn cancel(&self, job_id: Uuid) -> Result<bool> {
        self.db.request_cancel(job_id)
    }

    fn snapshot(&self, job: IngestionJob) -> Result<StatusSnapshot> {
        let document = self
            .db
            .get_document(job.document_id)?
            .ok_or_else(|| Error::NotFound(format!("Document {} does not exist", job.document_id)))?;

        let stalled = !job.is_terminal()
            && matches!(job.lease_expires_at, Some(lease) if lease < Utc::now());

        Ok(StatusSnapshot {
            job_id: job.id,
            document_id: job.document_id,
            stage: job.stage,
            document_status: document.status,
            progress: job.progress,
            chunks_embedded: job.chunks_embedded,
            total_chunks: job.total_chunks,
            attempt_count: job.attempt_count,
            last_error: job.last_error.clone(),
            duplicate_of: document.duplicate_of,
            blob_deleted: job.blob_deleted,
            stalled,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            processing_time_seconds: job.processing_time_seconds(),
        })
    }
}
