//! End-to-end pipeline scenarios with scripted collaborators
//!
//! The extractor, embedder, and blob store are replaced by test doubles with
//! failure injection so every stage transition and retry path can be driven
//! deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use docflow::config::{ChunkingConfig, ProcessingConfig, StagingConfig};
use docflow::error::{Error, Result};
use docflow::ingestion::TextChunker;
use docflow::providers::extractor::ExtractedDocument;
use docflow::providers::local::{LocalBlobStore, MemoryVectorStore};
use docflow::providers::{
    BlobStoreProvider, ContentExtractor, EmbeddingProvider, VectorStoreProvider,
};
use docflow::{
    BlobStager, CleanupSweeper, DocumentStatus, IngestDb, IngestWorker, JobQueue, JobStage,
    StatusService,
};

// ==================== Test doubles ====================

/// Extractor returning fixed text, optionally failing the first N calls
struct ScriptedExtractor {
    text: String,
    fail_first: AtomicUsize,
}

impl ScriptedExtractor {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fail_first: AtomicUsize::new(0),
        }
    }

    fn failing_first(text: &str, failures: usize) -> Self {
        Self {
            text: text.to_string(),
            fail_first: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ContentExtractor for ScriptedExtractor {
    async fn extract(&self, _data: &[u8], _content_type: &str) -> Result<ExtractedDocument> {
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::extractor("connection reset by extractor"));
        }
        Ok(ExtractedDocument::from_paginated_text(self.text.clone()))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Embedder producing constant vectors, with one injectable failure at a
/// specific call number (1-based)
struct ScriptedEmbedder {
    calls: AtomicUsize,
    fail_at_call: usize,
    failed: AtomicBool,
    fail_always: bool,
    observed_progress: Mutex<Vec<u8>>,
    watch: Mutex<Option<(Arc<IngestDb>, Uuid)>>,
}

impl ScriptedEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_at_call: 0,
            failed: AtomicBool::new(false),
            fail_always: false,
            observed_progress: Mutex::new(Vec::new()),
            watch: Mutex::new(None),
        }
    }

    fn failing_once_at(call: usize) -> Self {
        Self {
            fail_at_call: call,
            ..Self::new()
        }
    }

    fn always_failing() -> Self {
        Self {
            fail_always: true,
            ..Self::new()
        }
    }

    /// Record the persisted job progress at every embed call
    fn watch_job(&self, db: Arc<IngestDb>, job_id: Uuid) {
        *self.watch.lock() = Some((db, job_id));
    }

    fn observed_progress(&self) -> Vec<u8> {
        self.observed_progress.lock().clone()
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((db, job_id)) = self.watch.lock().clone() {
            if let Ok(Some(job)) = db.get_job(job_id) {
                self.observed_progress.lock().push(job.progress);
            }
        }

        if self.fail_always {
            return Err(Error::embedding("embedding service unavailable"));
        }
        if call == self.fail_at_call && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(Error::embedding("embedding service hiccup"));
        }
        Ok(vec![0.25; 8])
    }

    fn dimensions(&self) -> usize {
        8
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Blob store wrapper that fails the first N delete calls
struct FlakyDeleteStore {
    inner: LocalBlobStore,
    fail_deletes: AtomicUsize,
}

#[async_trait]
impl BlobStoreProvider for FlakyDeleteStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self
            .fail_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::BlobStorage("staging store unavailable".into()));
        }
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

// ==================== Harness ====================

struct Harness {
    db: Arc<IngestDb>,
    queue: Arc<JobQueue>,
    stager: Arc<BlobStager>,
    vector_store: Arc<MemoryVectorStore>,
    worker: IngestWorker,
    status: StatusService,
    _dir: tempfile::TempDir,
}

fn processing_config() -> ProcessingConfig {
    ProcessingConfig {
        max_attempts: 3,
        // Immediate redelivery keeps the tests deterministic
        retry_backoff_secs: vec![0],
        embed_batch_size: 2,
        ..ProcessingConfig::default()
    }
}

fn build_harness(
    extractor: Arc<dyn ContentExtractor>,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalBlobStore::new(dir.path()).unwrap());
    build_harness_with_store(extractor, embedder, store, dir)
}

fn build_harness_with_store(
    extractor: Arc<dyn ContentExtractor>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn BlobStoreProvider>,
    dir: tempfile::TempDir,
) -> Harness {
    let db = Arc::new(IngestDb::in_memory().unwrap());
    let stager = Arc::new(BlobStager::new(
        db.clone(),
        store,
        StagingConfig::default(),
    ));
    let config = processing_config();
    let queue = Arc::new(JobQueue::new(db.clone(), config.clone()));
    let vector_store = Arc::new(MemoryVectorStore::new());

    let worker = IngestWorker::new(
        "worker-test".to_string(),
        queue.clone(),
        stager.clone(),
        extractor,
        embedder,
        vector_store.clone(),
        TextChunker::new(&ChunkingConfig {
            target_tokens: 20,
            overlap_tokens: 5,
            min_tokens: 1,
        }),
        config,
    );

    Harness {
        status: StatusService::new(db.clone()),
        db,
        queue,
        stager,
        vector_store,
        worker,
        _dir: dir,
    }
}

impl Harness {
    async fn stage_and_submit(&self, filename: &str, data: &[u8]) -> (Uuid, Uuid) {
        let upload = self
            .stager
            .stage(filename, "application/pdf", data)
            .await
            .unwrap();
        let job_id = self.queue.submit(upload.id, HashMap::new()).unwrap();
        (job_id, upload.document_id)
    }

    /// Drain the queue: process jobs until nothing is claimable
    async fn run_to_idle(&self) {
        while self.worker.tick().await.unwrap() {}
    }
}

fn policy_text() -> String {
    (0..60)
        .map(|i| format!("Clause {} of the retention policy covers archival rules.", i))
        .collect::<Vec<_>>()
        .join(" ")
}

// ==================== Scenarios ====================

#[tokio::test]
async fn full_pipeline_completes_document() {
    let harness = build_harness(
        Arc::new(ScriptedExtractor::new(&policy_text())),
        Arc::new(ScriptedEmbedder::new()),
    );

    let (job_id, document_id) = harness.stage_and_submit("policy.pdf", b"%PDF-1.4").await;
    harness.run_to_idle().await;

    let job = harness.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.attempt_count, 1);
    assert!(job.blob_deleted);

    let doc = harness.db.get_document(document_id).unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert!(doc.chunk_count > 1);
    assert!(doc.content_hash.is_some());

    // Chunk indexes are contiguous from 0 and every chunk is embedded
    let chunks = harness.db.get_chunks(document_id).unwrap();
    assert_eq!(chunks.len(), doc.chunk_count as usize);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index as usize, i);
        assert!(chunk.embedding_ref.is_some());
    }
    assert_eq!(
        harness.vector_store.len().await.unwrap(),
        doc.chunk_count as usize
    );

    // The staged blob is gone after the terminal transition
    assert!(matches!(
        harness.stager.fetch_for_processing(job.upload_id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn resubmitted_content_dedups_with_zero_new_chunks() {
    let harness = build_harness(
        Arc::new(ScriptedExtractor::new(&policy_text())),
        Arc::new(ScriptedEmbedder::new()),
    );

    let (_job1, doc1) = harness.stage_and_submit("policy.pdf", b"%PDF-1.4").await;
    harness.run_to_idle().await;
    let original = harness.db.get_document(doc1).unwrap().unwrap();
    assert_eq!(original.status, DocumentStatus::Completed);
    let vectors_before = harness.vector_store.len().await.unwrap();

    // Same content re-uploaded under another name and format
    let (job2, doc2) = harness.stage_and_submit("policy-copy.docx", b"PK docx bytes").await;
    harness.run_to_idle().await;

    let dup = harness.db.get_document(doc2).unwrap().unwrap();
    assert_eq!(dup.status, DocumentStatus::Duplicate);
    assert_eq!(dup.duplicate_of, Some(doc1));
    assert_eq!(dup.chunk_count, 0);
    assert!(harness.db.get_chunks(doc2).unwrap().is_empty());

    // No new vectors, and the duplicate's blob is cleaned up too
    assert_eq!(harness.vector_store.len().await.unwrap(), vectors_before);
    let job = harness.db.get_job(job2).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Completed);
    assert!(job.blob_deleted);

    let snap = harness.status.status_for_document(doc2).unwrap();
    assert_eq!(snap.document_status, DocumentStatus::Duplicate);
    assert_eq!(snap.duplicate_of, Some(doc1));
    assert_eq!(snap.progress, 100);
}

#[tokio::test]
async fn transient_embedding_failure_retries_to_success() {
    let embedder = Arc::new(ScriptedEmbedder::failing_once_at(3));
    let harness = build_harness(
        Arc::new(ScriptedExtractor::new(&policy_text())),
        embedder.clone(),
    );

    let (job_id, document_id) = harness.stage_and_submit("policy.pdf", b"%PDF-1.4").await;
    embedder.watch_job(harness.db.clone(), job_id);
    harness.run_to_idle().await;

    // Attempt 1 failed partway through embedding, attempt 2 finished
    let job = harness.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Completed);
    assert_eq!(job.attempt_count, 2);

    let doc = harness.db.get_document(document_id).unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);

    // Exactly total_chunks persisted, no duplicates from the re-run
    assert_eq!(
        harness.db.count_chunks(document_id).unwrap(),
        doc.chunk_count as usize
    );
    assert_eq!(
        harness.vector_store.len().await.unwrap(),
        doc.chunk_count as usize
    );

    // Progress observed across both attempts never decreased
    let observed = embedder.observed_progress();
    assert!(!observed.is_empty());
    assert!(
        observed.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {:?}",
        observed
    );
}

#[tokio::test]
async fn empty_document_fails_permanently_without_retry() {
    let harness = build_harness(
        Arc::new(ScriptedExtractor::new("   ")),
        Arc::new(ScriptedEmbedder::new()),
    );

    let (job_id, document_id) = harness.stage_and_submit("empty.pdf", b"").await;
    harness.run_to_idle().await;

    let job = harness.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Failed);
    // Permanent failure: no retries burned
    assert_eq!(job.attempt_count, 1);
    assert!(job.last_error.as_deref().unwrap_or("").contains("extractable"));
    assert!(job.blob_deleted);

    let doc = harness.db.get_document(document_id).unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert!(matches!(
        harness.stager.fetch_for_processing(job.upload_id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn exhausted_attempts_fail_terminally_with_cleanup() {
    let harness = build_harness(
        Arc::new(ScriptedExtractor::new(&policy_text())),
        Arc::new(ScriptedEmbedder::always_failing()),
    );

    let (job_id, _document_id) = harness.stage_and_submit("policy.pdf", b"%PDF-1.4").await;
    harness.run_to_idle().await;

    let job = harness.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Failed);
    assert_eq!(job.attempt_count, 3);
    assert!(job
        .last_error
        .as_deref()
        .unwrap_or("")
        .contains("embedding service unavailable"));
    assert!(job.blob_deleted);

    let snap = harness.status.status_for_job(job_id).unwrap();
    assert_eq!(snap.attempt_count, 3);
    assert!(snap.last_error.is_some());
}

#[tokio::test]
async fn transient_extractor_failure_resumes_at_extracting() {
    let harness = build_harness(
        Arc::new(ScriptedExtractor::failing_first(&policy_text(), 1)),
        Arc::new(ScriptedEmbedder::new()),
    );

    let (job_id, document_id) = harness.stage_and_submit("policy.pdf", b"%PDF-1.4").await;

    // First tick: claim, fail at EXTRACTING, schedule retry
    assert!(harness.worker.tick().await.unwrap());
    let job = harness.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Extracting);
    assert_eq!(job.attempt_count, 1);
    assert!(job.last_error.is_some());

    // Retry resumes from the failed stage and completes
    harness.run_to_idle().await;
    let job = harness.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Completed);
    assert_eq!(job.attempt_count, 2);
    let doc = harness.db.get_document(document_id).unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
}

#[tokio::test]
async fn concurrent_submissions_share_one_job() {
    let harness = build_harness(
        Arc::new(ScriptedExtractor::new(&policy_text())),
        Arc::new(ScriptedEmbedder::new()),
    );

    let upload = harness
        .stager
        .stage("policy.pdf", "application/pdf", b"%PDF-1.4")
        .await
        .unwrap();

    let queue_a = harness.queue.clone();
    let queue_b = harness.queue.clone();
    let id_a = upload.id;
    let id_b = upload.id;

    let (a, b) = tokio::join!(
        tokio::task::spawn_blocking(move || queue_a.submit(id_a, HashMap::new()).unwrap()),
        tokio::task::spawn_blocking(move || queue_b.submit(id_b, HashMap::new()).unwrap()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // Exactly one job proceeds; the other submission coalesced into it
    assert_eq!(a, b);
    let active = harness
        .db
        .find_active_job_for_document(upload.document_id)
        .unwrap()
        .unwrap();
    assert_eq!(active.id, a);

    harness.run_to_idle().await;
    let job = harness.db.get_job(a).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Completed);
}

#[tokio::test]
async fn cancelled_job_fails_with_cleanup() {
    let harness = build_harness(
        Arc::new(ScriptedExtractor::new(&policy_text())),
        Arc::new(ScriptedEmbedder::new()),
    );

    let (job_id, document_id) = harness.stage_and_submit("policy.pdf", b"%PDF-1.4").await;

    assert!(harness.status.cancel(job_id).unwrap());
    harness.run_to_idle().await;

    let job = harness.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Failed);
    assert_eq!(job.last_error.as_deref(), Some("cancelled"));
    assert!(job.blob_deleted);

    let doc = harness.db.get_document(document_id).unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);

    // Cancelling a terminal job is refused
    assert!(!harness.status.cancel(job_id).unwrap());
}

#[tokio::test]
async fn sweeper_reconciles_failed_blob_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyDeleteStore {
        inner: LocalBlobStore::new(dir.path()).unwrap(),
        fail_deletes: AtomicUsize::new(1),
    });
    let harness = build_harness_with_store(
        Arc::new(ScriptedExtractor::new(&policy_text())),
        Arc::new(ScriptedEmbedder::new()),
        store,
        dir,
    );

    let (job_id, _document_id) = harness.stage_and_submit("policy.pdf", b"%PDF-1.4").await;
    harness.run_to_idle().await;

    // Terminal, but the cleanup delete failed and was deferred
    let job = harness.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.stage, JobStage::Completed);
    assert!(!job.blob_deleted);

    let sweeper = CleanupSweeper::new(
        harness.db.clone(),
        harness.stager.clone(),
        std::time::Duration::from_secs(300),
    );
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.blobs_reconciled, 1);

    let job = harness.db.get_job(job_id).unwrap().unwrap();
    assert!(job.blob_deleted);
}

#[tokio::test]
async fn expired_upload_is_swept_without_processing() {
    let harness = build_harness(
        Arc::new(ScriptedExtractor::new(&policy_text())),
        Arc::new(ScriptedEmbedder::new()),
    );

    let upload = harness
        .stager
        .stage("forgotten.pdf", "application/pdf", b"%PDF-1.4")
        .await
        .unwrap();

    // Never submitted; sweep it once the TTL has lapsed
    let swept = harness
        .stager
        .sweep_expired(upload.expires_at + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(swept, 1);
    assert!(matches!(
        harness.stager.fetch_for_processing(upload.id).await,
        Err(Error::NotFound(_))
    ));
}
