//! Durable job queue over the persisted job records
//!
//! Workers coordinate exclusively through the store: submission is guarded
//! by the single-flight index, delivery is an atomic claim with a lease, and
//! retries are scheduled rows rather than in-memory state.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};
use crate::storage::IngestDb;
use crate::types::{DocumentRecord, IngestionJob};

/// Durable queue of ingestion jobs
pub struct JobQueue {
    db: Arc<IngestDb>,
    config: ProcessingConfig,
}

impl JobQueue {
    pub fn new(db: Arc<IngestDb>, config: ProcessingConfig) -> Self {
        Self { db, config }
    }

    pub fn db(&self) -> &Arc<IngestDb> {
        &self.db
    }

    /// Submit a staged upload for processing.
    ///
    /// Creates the document record and the job. A second submission for a
    /// document that is already mid-pipeline is coalesced: the live job's id
    /// is returned and no new job is created.
    pub fn submit(
        &self,
        upload_id: Uuid,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Uuid> {
        let upload = self
            .db
            .get_upload(upload_id)?
            .ok_or_else(|| Error::NotFound(format!("Upload {} does not exist", upload_id)))?;

        if !upload.consumed && upload.is_expired(Utc::now()) {
            return Err(Error::NotFound(format!("Upload {} has expired", upload_id)));
        }

        let document = DocumentRecord::new(
            upload.document_id,
            upload.filename.clone(),
            upload.filename.clone(),
        );
        self.db.insert_document(&document)?;

        let job = IngestionJob::new(
            upload.document_id,
            upload_id,
            self.config.max_attempts,
            metadata,
        );

        if !self.db.try_insert_job(&job)? {
            // Single-flight: coalesce into the job already in flight
            let existing = self
                .db
                .find_active_job_for_document(upload.document_id)?
                .ok_or_else(|| {
                    Error::internal(format!(
                        "Live job for document {} vanished during submit",
                        upload.document_id
                    ))
                })?;
            tracing::info!(
                document_id = %upload.document_id,
                job_id = %existing.id,
                "Submission coalesced into existing job"
            );
            return Ok(existing.id);
        }

        self.db.mark_upload_consumed(upload_id)?;

        tracing::info!(
            job_id = %job.id,
            document_id = %upload.document_id,
            upload_id = %upload_id,
            "Job submitted"
        );

        Ok(job.id)
    }

    /// Claim the next runnable job for a worker, starting a new attempt
    pub fn claim(&self, worker_id: &str) -> Result<Option<IngestionJob>> {
        self.db.claim_next_job(
            worker_id,
            Utc::now(),
            chrono::Duration::seconds(self.config.lease_secs as i64),
        )
    }

    /// Persist job state and renew the claim lease.
    ///
    /// Called after every stage transition and every embedding batch; the
    /// lease renewal is what keeps a healthy long-running job from being
    /// redelivered.
    pub fn checkpoint(&self, job: &mut IngestionJob) -> Result<()> {
        let now = Utc::now();
        job.updated_at = now;
        if job.claimed_by.is_some() && !job.is_terminal() {
            job.lease_expires_at =
                Some(now + chrono::Duration::seconds(self.config.lease_secs as i64));
        }
        self.db.update_job(job)
    }

    /// Schedule a retry of the current stage after a transient failure
    pub fn retry_later(&self, job: &mut IngestionJob, message: &str) -> Result<()> {
        let backoff = self.config.backoff_for_attempt(job.attempt_count);
        let next_attempt_at = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();
        job.schedule_retry(message, next_attempt_at);
        self.db.update_job(job)?;

        tracing::warn!(
            job_id = %job.id,
            stage = job.stage.as_str(),
            attempt = job.attempt_count,
            backoff_secs = backoff.as_secs(),
            "Transient failure, retry scheduled: {}",
            message
        );
        Ok(())
    }

    /// Request cooperative cancellation of a job
    pub fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let accepted = self.db.request_cancel(job_id)?;
        if accepted {
            tracing::info!(job_id = %job_id, "Cancellation requested");
        }
        Ok(accepted)
    }
}
