//! Configuration for the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Storage paths (database, staging blobs)
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upload staging configuration
    #[serde(default)]
    pub staging: StagingConfig,
    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// Worker pool and retry configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Background cleanup configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Content extractor service configuration
    #[serde(default)]
    pub extractor: ExtractorConfig,
    /// Embedding service configuration
    #[serde(default)]
    pub embeddings: EmbeddingConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database holding jobs, documents, and chunks
    pub database_path: PathBuf,
    /// Directory for staged upload blobs
    pub staging_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/docflow.db"),
            staging_dir: PathBuf::from("data/staging"),
        }
    }
}

/// Upload staging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Maximum upload size in bytes (default: 100MB)
    pub max_upload_size: u64,
    /// How long a staged upload stays fetchable before the sweep removes it
    pub upload_ttl_secs: u64,
    /// Accepted content types
    #[serde(default = "default_allowed_types")]
    pub allowed_content_types: Vec<String>,
}

fn default_allowed_types() -> Vec<String> {
    vec![
        "application/pdf".to_string(),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string(),
        "application/msword".to_string(),
        "text/html".to_string(),
        "text/plain".to_string(),
    ]
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 100 * 1024 * 1024, // 100MB
            upload_ttl_secs: 3600,              // 1 hour
            allowed_content_types: default_allowed_types(),
        }
    }
}

impl StagingConfig {
    pub fn upload_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.upload_ttl_secs as i64)
    }
}

/// Text chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens
    pub target_tokens: usize,
    /// Overlap between consecutive chunks in tokens
    pub overlap_tokens: usize,
    /// Minimum tokens for a chunk to be kept
    pub min_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 400,
            overlap_tokens: 50,
            min_tokens: 10,
        }
    }
}

/// Worker pool and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of workers (default: CPU count, max 4)
    pub worker_count: Option<usize>,
    /// Maximum delivery attempts per job
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff schedule between attempts, in seconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: Vec<u64>,
    /// Timeout for a single stage attempt in seconds
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    /// Claim lease duration; a job with no checkpoint inside this window is
    /// treated as abandoned and redelivered
    #[serde(default = "default_lease")]
    pub lease_secs: u64,
    /// Idle poll interval for workers in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Chunks embedded per batch
    #[serde(default = "default_embed_batch")]
    pub embed_batch_size: usize,
    /// Minimum extractable characters for a document to be processable
    #[serde(default = "default_min_text")]
    pub min_extracted_chars: usize,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> Vec<u64> {
    vec![10, 30, 60]
}
fn default_stage_timeout() -> u64 {
    300
}
fn default_lease() -> u64 {
    120
}
fn default_poll_interval() -> u64 {
    500
}
fn default_embed_batch() -> usize {
    20
}
fn default_min_text() -> usize {
    10
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_count: None, // Auto-detect from CPU count
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff(),
            stage_timeout_secs: default_stage_timeout(),
            lease_secs: default_lease(),
            poll_interval_ms: default_poll_interval(),
            embed_batch_size: default_embed_batch(),
            min_extracted_chars: default_min_text(),
        }
    }
}

impl ProcessingConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff delay before the next attempt, given how many attempts have run
    pub fn backoff_for_attempt(&self, attempt_count: u32) -> Duration {
        let idx = (attempt_count.max(1) as usize - 1).min(
            self.retry_backoff_secs.len().saturating_sub(1),
        );
        Duration::from_secs(*self.retry_backoff_secs.get(idx).unwrap_or(&60))
    }

    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(|| num_cpus::get().min(4))
    }
}

/// Background cleanup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Interval between sweep runs in seconds
    pub sweep_interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300, // 5 minutes
        }
    }
}

impl CleanupConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Content extractor service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Base URL of the Tika-compatible extraction service
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9998".to_string(),
            timeout_secs: 120,
        }
    }
}

/// Embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Ollama base URL
    pub base_url: String,
    /// Embedding model name
    pub model: String,
    /// Embedding dimensions (768 for nomic-embed-text)
    pub dimensions: usize,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimensions: 768,
            timeout_secs: 60,
        }
    }
}
