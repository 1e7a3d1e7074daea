//! Worker that drives ingestion jobs through the stage state machine
//!
//! A worker claims one job at a time and executes it to completion within
//! itself; concurrency comes from running many workers, never from sharing
//! job state in memory. Every stage handler is safe to re-run: a job
//! redelivered after a crash or a transient failure resumes from the start
//! of the stage it was in.

use std::sync::Arc;
use tokio::time::timeout;

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};
use crate::ingestion::{Deduplicator, TextChunker};
use crate::processing::JobQueue;
use crate::providers::{ContentExtractor, EmbeddingProvider, VectorStoreProvider};
use crate::providers::extractor::ExtractedDocument;
use crate::staging::BlobStager;
use crate::storage::IngestDb;
use crate::types::{IngestionJob, JobStage};

/// Background worker executing ingestion jobs
pub struct IngestWorker {
    worker_id: String,
    db: Arc<IngestDb>,
    queue: Arc<JobQueue>,
    stager: Arc<BlobStager>,
    extractor: Arc<dyn ContentExtractor>,
    embedder: Arc<dyn EmbeddingProvider>,
    vector_store: Arc<dyn VectorStoreProvider>,
    dedup: Deduplicator,
    chunker: TextChunker,
    config: ProcessingConfig,
}

impl IngestWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        queue: Arc<JobQueue>,
        stager: Arc<BlobStager>,
        extractor: Arc<dyn ContentExtractor>,
        embedder: Arc<dyn EmbeddingProvider>,
        vector_store: Arc<dyn VectorStoreProvider>,
        chunker: TextChunker,
        config: ProcessingConfig,
    ) -> Self {
        let db = queue.db().clone();
        Self {
            worker_id,
            dedup: Deduplicator::new(db.clone()),
            db,
            queue,
            stager,
            extractor,
            embedder,
            vector_store,
            chunker,
            config,
        }
    }

    /// Run forever: claim jobs as they become available, sleep when idle
    pub async fn run(self) {
        tracing::info!(worker = %self.worker_id, "Worker started");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.config.poll_interval()).await,
                Err(e) => {
                    tracing::error!(worker = %self.worker_id, "Worker tick failed: {}", e);
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }
    }

    /// Claim and process at most one job. Returns whether a job was
    /// processed.
    pub async fn tick(&self) -> Result<bool> {
        let Some(job) = self.queue.claim(&self.worker_id)? else {
            return Ok(false);
        };
        self.process(job).await;
        Ok(true)
    }

    /// Execute a claimed job, translating errors into retry scheduling or a
    /// terminal failure at this single boundary.
    async fn process(&self, mut job: IngestionJob) {
        let job_id = job.id;
        tracing::info!(
            worker = %self.worker_id,
            job_id = %job_id,
            stage = job.stage.as_str(),
            attempt = job.attempt_count,
            "Processing job"
        );

        match self.drive(&mut job).await {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                tracing::info!(job_id = %job_id, "Job cancelled");
                self.finish_failure(&mut job, "cancelled").await;
            }
            Err(e) if e.is_transient() && job.attempts_remaining() => {
                if let Err(persist_err) = self.queue.retry_later(&mut job, &e.to_string()) {
                    tracing::error!(job_id = %job_id, "Failed to schedule retry: {}", persist_err);
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job_id,
                    stage = job.stage.as_str(),
                    attempts = job.attempt_count,
                    "Job failed: {}",
                    e
                );
                self.finish_failure(&mut job, &e.to_string()).await;
            }
        }
    }

    /// Advance the job stage by stage until terminal. Cancellation is
    /// honored between stages.
    async fn drive(&self, job: &mut IngestionJob) -> Result<()> {
        loop {
            if !job.stage.is_terminal() && self.db.is_cancel_requested(job.id)? {
                return Err(Error::Cancelled);
            }

            match job.stage {
                JobStage::Uploaded => {
                    job.advance_stage();
                    self.queue.checkpoint(job)?;
                }
                JobStage::Extracting => self.run_extract(job).await?,
                JobStage::CheckingDuplicates => {
                    if self.run_dedup_check(job).await? {
                        // Duplicate short-circuit: job is already terminal
                        return Ok(());
                    }
                }
                JobStage::Chunking => self.run_chunking(job).await?,
                JobStage::Embedding => self.run_embedding(job).await?,
                JobStage::Completed => {
                    self.finish_success(job).await?;
                    return Ok(());
                }
                JobStage::Failed => return Ok(()),
            }
        }
    }

    /// EXTRACTING: fetch the staged blob and turn it into text
    async fn run_extract(&self, job: &mut IngestionJob) -> Result<()> {
        let upload = self
            .db
            .get_upload(job.upload_id)?
            .ok_or_else(|| Error::NotFound(format!("Upload {} does not exist", job.upload_id)))?;

        let data = self.stager.fetch_for_processing(job.upload_id).await?;

        let extracted = timeout(
            self.config.stage_timeout(),
            self.extractor.extract(&data, &upload.content_type),
        )
        .await
        .map_err(|_| {
            Error::extractor(format!(
                "Extraction timed out after {}s",
                self.config.stage_timeout().as_secs()
            ))
        })??;

        if extracted.text.trim().chars().count() < self.config.min_extracted_chars {
            return Err(Error::corrupt(
                "Document contains no extractable text".to_string(),
            ));
        }

        tracing::info!(
            job_id = %job.id,
            chars = extracted.text.len(),
            pages = extracted.pages.len(),
            "Text extracted"
        );

        // Checkpoint the extraction output so later stages can resume
        // without re-running this one
        self.db.set_extracted_text(job.id, Some(&extracted.text))?;

        job.advance_stage();
        self.queue.checkpoint(job)
    }

    /// CHECKING_DUPLICATES: fingerprint and look for an existing original.
    /// Returns true when the job short-circuited as a duplicate.
    async fn run_dedup_check(&self, job: &mut IngestionJob) -> Result<bool> {
        let text = self.checkpointed_text(job)?;
        let hash = Deduplicator::fingerprint(&text);

        let mut document = self
            .db
            .get_document(job.document_id)?
            .ok_or_else(|| Error::internal(format!("Document {} missing", job.document_id)))?;
        document.content_hash = Some(hash.clone());

        if let Some(original) = self.dedup.find_existing(&hash, job.document_id)? {
            tracing::info!(
                job_id = %job.id,
                document_id = %job.document_id,
                original_id = %original.id,
                "Duplicate content detected"
            );

            document.mark_duplicate(original.id);
            self.db.update_document(&document)?;

            job.complete_as_duplicate();
            self.cleanup_blob(job).await;
            self.db.set_extracted_text(job.id, None)?;
            self.queue.checkpoint(job)?;
            return Ok(true);
        }

        self.db.update_document(&document)?;
        job.advance_stage();
        self.queue.checkpoint(job)?;
        Ok(false)
    }

    /// CHUNKING: split the text and persist the full chunk set atomically
    async fn run_chunking(&self, job: &mut IngestionJob) -> Result<()> {
        let text = self.checkpointed_text(job)?;
        let extracted = ExtractedDocument::from_paginated_text(text);

        let chunks = self.chunker.chunk_document(job.document_id, &extracted);
        if chunks.is_empty() {
            return Err(Error::corrupt(
                "Chunking produced no usable chunks".to_string(),
            ));
        }

        self.db.replace_chunks(job.document_id, &chunks)?;

        // Clear vectors left behind by a previous attempt so the embedding
        // stage starts from a clean slate
        self.vector_store
            .delete_by_document(&job.document_id)
            .await?;

        tracing::info!(job_id = %job.id, chunks = chunks.len(), "Chunks created");

        job.update_chunk_progress(0, chunks.len() as u32);
        job.advance_stage();
        self.queue.checkpoint(job)
    }

    /// EMBEDDING: embed chunks in index order, upserting vectors keyed by
    /// (document, index). Progress and the lease advance per batch, and
    /// cancellation is checked per batch rather than mid-call.
    async fn run_embedding(&self, job: &mut IngestionJob) -> Result<()> {
        let chunks = self.db.get_chunks(job.document_id)?;
        let total = chunks.len() as u32;
        let mut processed = 0u32;

        for batch in chunks.chunks(self.config.embed_batch_size.max(1)) {
            if self.db.is_cancel_requested(job.id)? {
                return Err(Error::Cancelled);
            }

            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = timeout(
                self.config.stage_timeout(),
                self.embedder.embed_batch(&texts),
            )
            .await
            .map_err(|_| {
                Error::embedding(format!(
                    "Embedding batch timed out after {}s",
                    self.config.stage_timeout().as_secs()
                ))
            })??;

            if vectors.len() != batch.len() {
                return Err(Error::embedding(format!(
                    "Embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                )));
            }

            for (chunk, vector) in batch.iter().zip(vectors.iter()) {
                let embedding_ref = self.vector_store.upsert(chunk, vector).await?;
                self.db
                    .set_chunk_embedding_ref(job.document_id, chunk.chunk_index, &embedding_ref)?;
            }

            processed += batch.len() as u32;
            job.update_chunk_progress(processed, total);
            self.queue.checkpoint(job)?;
        }

        job.advance_stage();
        self.queue.checkpoint(job)
    }

    /// COMPLETED: finalize the document, then unconditional cleanup
    async fn finish_success(&self, job: &mut IngestionJob) -> Result<()> {
        let chunk_count = self.db.count_chunks(job.document_id)? as u32;

        let mut document = self
            .db
            .get_document(job.document_id)?
            .ok_or_else(|| Error::internal(format!("Document {} missing", job.document_id)))?;
        document.mark_completed(chunk_count);
        self.db.update_document(&document)?;

        self.cleanup_blob(job).await;
        self.db.set_extracted_text(job.id, None)?;
        self.queue.checkpoint(job)?;

        tracing::info!(
            job_id = %job.id,
            document_id = %job.document_id,
            chunks = chunk_count,
            attempts = job.attempt_count,
            elapsed_secs = job.processing_time_seconds().unwrap_or(0),
            "Job completed"
        );
        Ok(())
    }

    /// Terminal failure path; cleanup still runs
    async fn finish_failure(&self, job: &mut IngestionJob, message: &str) {
        job.fail_with_error(message);

        match self.db.get_document(job.document_id) {
            Ok(Some(mut document)) => {
                document.mark_failed();
                if let Err(e) = self.db.update_document(&document) {
                    tracing::error!(job_id = %job.id, "Failed to mark document failed: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(job_id = %job.id, "Failed to load document: {}", e);
            }
        }

        self.cleanup_blob(job).await;

        if let Err(e) = self.db.set_extracted_text(job.id, None) {
            tracing::error!(job_id = %job.id, "Failed to clear extraction checkpoint: {}", e);
        }
        if let Err(e) = self.db.update_job(job) {
            tracing::error!(job_id = %job.id, "Failed to persist failed job: {}", e);
        }
    }

    /// Delete the staged blob. A failure here never blocks the terminal
    /// transition; the sweeper reconciles leftovers.
    async fn cleanup_blob(&self, job: &mut IngestionJob) {
        match self.stager.delete(job.upload_id).await {
            Ok(()) => job.blob_deleted = true,
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    upload_id = %job.upload_id,
                    "Blob cleanup failed, leaving it to the sweeper: {}",
                    e
                );
            }
        }
    }

    fn checkpointed_text(&self, job: &IngestionJob) -> Result<String> {
        self.db.get_extracted_text(job.id)?.ok_or_else(|| {
            Error::internal(format!("Extraction checkpoint missing for job {}", job.id))
        })
    }
}
