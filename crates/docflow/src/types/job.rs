//! Ingestion job entity and the stage state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Pipeline stage, in strict forward order.
///
/// `Failed` is reachable from any non-terminal stage; a duplicate
/// short-circuits `CheckingDuplicates -> Completed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Uploaded,
    Extracting,
    CheckingDuplicates,
    Chunking,
    Embedding,
    Completed,
    Failed,
}

impl JobStage {
    /// Terminal stages never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Completed | JobStage::Failed)
    }

    /// The next forward stage, if any
    pub fn next(&self) -> Option<JobStage> {
        match self {
            JobStage::Uploaded => Some(JobStage::Extracting),
            JobStage::Extracting => Some(JobStage::CheckingDuplicates),
            JobStage::CheckingDuplicates => Some(JobStage::Chunking),
            JobStage::Chunking => Some(JobStage::Embedding),
            JobStage::Embedding => Some(JobStage::Completed),
            JobStage::Completed | JobStage::Failed => None,
        }
    }

    /// Baseline progress when a job reaches this stage
    pub fn progress_floor(&self) -> u8 {
        match self {
            JobStage::Uploaded => 5,
            JobStage::Extracting => 25,
            JobStage::CheckingDuplicates => 35,
            JobStage::Chunking => 55,
            JobStage::Embedding => 55,
            JobStage::Completed => 100,
            JobStage::Failed => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Uploaded => "uploaded",
            JobStage::Extracting => "extracting",
            JobStage::CheckingDuplicates => "checking_duplicates",
            JobStage::Chunking => "chunking",
            JobStage::Embedding => "embedding",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "uploaded" => JobStage::Uploaded,
            "extracting" => JobStage::Extracting,
            "checking_duplicates" => JobStage::CheckingDuplicates,
            "chunking" => JobStage::Chunking,
            "embedding" => JobStage::Embedding,
            "completed" => JobStage::Completed,
            _ => JobStage::Failed,
        }
    }
}

/// The unit of work driving one document through the pipeline.
///
/// Mutated exclusively by the worker that holds the claim; all coordination
/// happens through the persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: Uuid,
    pub document_id: Uuid,
    pub upload_id: Uuid,
    pub stage: JobStage,
    /// 0-100, monotonically non-decreasing for the lifetime of the job
    pub progress: u8,
    pub chunks_embedded: u32,
    pub total_chunks: u32,
    /// Delivery attempts so far; incremented when an attempt starts
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    /// Whether the staged blob has been successfully removed
    pub blob_deleted: bool,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be (re)delivered
    pub next_attempt_at: DateTime<Utc>,
    /// Free-form key/value metadata (priority, originating tenant)
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IngestionJob {
    /// Create a new job for a staged upload
    pub fn new(
        document_id: Uuid,
        upload_id: Uuid,
        max_attempts: u32,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            document_id,
            upload_id,
            stage: JobStage::Uploaded,
            progress: JobStage::Uploaded.progress_floor(),
            chunks_embedded: 0,
            total_chunks: 0,
            attempt_count: 0,
            max_attempts,
            last_error: None,
            cancel_requested: false,
            blob_deleted: false,
            claimed_by: None,
            lease_expires_at: None,
            next_attempt_at: now,
            metadata,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Raise progress, never lowering it
    fn raise_progress(&mut self, value: u8) {
        self.progress = self.progress.max(value.min(100));
    }

    /// Advance to the next stage of the state machine
    pub fn advance_stage(&mut self) {
        if let Some(next) = self.stage.next() {
            self.stage = next;
            self.raise_progress(next.progress_floor());
            self.updated_at = Utc::now();
            if next == JobStage::Completed && self.completed_at.is_none() {
                self.completed_at = Some(self.updated_at);
            }
        }
    }

    /// Record the start of a delivery attempt
    pub fn begin_attempt(&mut self, worker_id: &str, lease_expires_at: DateTime<Utc>) {
        self.attempt_count += 1;
        self.claimed_by = Some(worker_id.to_string());
        self.lease_expires_at = Some(lease_expires_at);
        self.updated_at = Utc::now();
        if self.started_at.is_none() {
            self.started_at = Some(self.updated_at);
        }
    }

    /// Update per-chunk progress inside the embedding stage.
    ///
    /// Embedding owns the 55-85 band; each embedded chunk moves progress
    /// proportionally within it.
    pub fn update_chunk_progress(&mut self, chunks_embedded: u32, total_chunks: u32) {
        self.chunks_embedded = chunks_embedded;
        self.total_chunks = total_chunks;
        if self.stage == JobStage::Embedding && total_chunks > 0 {
            let band = 30.0 * (chunks_embedded as f32 / total_chunks as f32);
            self.raise_progress(55 + band as u8);
        }
        self.updated_at = Utc::now();
    }

    /// Short-circuit to completion for a duplicate document
    pub fn complete_as_duplicate(&mut self) {
        self.stage = JobStage::Completed;
        self.raise_progress(100);
        self.updated_at = Utc::now();
        self.completed_at = Some(self.updated_at);
    }

    /// Terminal failure. Progress keeps its last value so pollers never see
    /// it move backwards.
    pub fn fail_with_error(&mut self, message: &str) {
        self.stage = JobStage::Failed;
        self.last_error = Some(message.to_string());
        self.updated_at = Utc::now();
        self.completed_at = Some(self.updated_at);
    }

    /// Schedule a retry of the current stage after a transient failure
    pub fn schedule_retry(&mut self, message: &str, next_attempt_at: DateTime<Utc>) {
        self.last_error = Some(message.to_string());
        self.claimed_by = None;
        self.lease_expires_at = None;
        self.next_attempt_at = next_attempt_at;
        self.updated_at = Utc::now();
    }

    /// Whether another delivery attempt is allowed
    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Total processing time, once started
    pub fn processing_time_seconds(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> IngestionJob {
        IngestionJob::new(Uuid::new_v4(), Uuid::new_v4(), 3, HashMap::new())
    }

    #[test]
    fn test_forward_only_stages() {
        let mut j = job();
        let mut seen = vec![j.stage];
        while let Some(next) = j.stage.next() {
            j.advance_stage();
            assert_eq!(j.stage, next);
            seen.push(j.stage);
        }
        assert_eq!(
            seen,
            vec![
                JobStage::Uploaded,
                JobStage::Extracting,
                JobStage::CheckingDuplicates,
                JobStage::Chunking,
                JobStage::Embedding,
                JobStage::Completed,
            ]
        );
        assert!(j.is_terminal());
        assert_eq!(j.progress, 100);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut j = job();
        let mut last = j.progress;
        j.advance_stage(); // extracting
        j.advance_stage(); // checking_duplicates
        j.advance_stage(); // chunking
        j.advance_stage(); // embedding
        for done in 0..=10u32 {
            j.update_chunk_progress(done, 10);
            assert!(j.progress >= last);
            last = j.progress;
        }
        assert_eq!(j.progress, 85);
        j.advance_stage();
        assert_eq!(j.progress, 100);
    }

    #[test]
    fn test_failure_keeps_progress() {
        let mut j = job();
        j.advance_stage();
        j.advance_stage();
        let before = j.progress;
        j.fail_with_error("extractor exploded");
        assert_eq!(j.stage, JobStage::Failed);
        assert_eq!(j.progress, before);
        assert_eq!(j.last_error.as_deref(), Some("extractor exploded"));
        assert!(j.completed_at.is_some());
    }

    #[test]
    fn test_attempt_accounting() {
        let mut j = job();
        assert!(j.attempts_remaining());
        j.begin_attempt("w-0", Utc::now());
        j.begin_attempt("w-1", Utc::now());
        j.begin_attempt("w-0", Utc::now());
        assert_eq!(j.attempt_count, 3);
        assert!(!j.attempts_remaining());
    }

    #[test]
    fn test_duplicate_short_circuit() {
        let mut j = job();
        j.advance_stage(); // extracting
        j.advance_stage(); // checking_duplicates
        j.complete_as_duplicate();
        assert_eq!(j.stage, JobStage::Completed);
        assert_eq!(j.progress, 100);
    }

    #[test]
    fn test_stage_round_trip() {
        for stage in [
            JobStage::Uploaded,
            JobStage::Extracting,
            JobStage::CheckingDuplicates,
            JobStage::Chunking,
            JobStage::Embedding,
            JobStage::Completed,
            JobStage::Failed,
        ] {
            assert_eq!(JobStage::parse(stage.as_str()), stage);
        }
    }
}
