//! Document and chunk types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a document in the system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Document is mid-pipeline
    Processing,
    /// Chunks and embeddings are persisted and searchable
    Completed,
    /// Processing failed terminally
    Failed,
    /// Content matched an already-completed document; no chunks were created
    Duplicate,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Duplicate => "duplicate",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => DocumentStatus::Processing,
            "completed" => DocumentStatus::Completed,
            "duplicate" => DocumentStatus::Duplicate,
            _ => DocumentStatus::Failed,
        }
    }
}

/// The durable entity chunks and embeddings attach to.
///
/// Outlives the job that produced it; retained for status and search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Unique document ID
    pub id: Uuid,
    /// Display title (defaults to the uploaded filename)
    pub title: String,
    /// Where the document came from (filename or URL)
    pub source: String,
    /// Fingerprint of the normalized extracted text, set during dedup check
    pub content_hash: Option<String>,
    /// Processing status
    pub status: DocumentStatus,
    /// Original document when this one is a duplicate
    pub duplicate_of: Option<Uuid>,
    /// Number of chunks created
    pub chunk_count: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Create a new document entering the pipeline
    pub fn new(id: Uuid, title: String, source: String) -> Self {
        Self {
            id,
            title,
            source,
            content_hash: None,
            status: DocumentStatus::Processing,
            duplicate_of: None,
            chunk_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Mark as a duplicate of an existing completed document
    pub fn mark_duplicate(&mut self, original: Uuid) {
        self.status = DocumentStatus::Duplicate;
        self.duplicate_of = Some(original);
        self.chunk_count = 0;
    }

    /// Mark as successfully completed
    pub fn mark_completed(&mut self, chunk_count: u32) {
        self.status = DocumentStatus::Completed;
        self.chunk_count = chunk_count;
    }

    /// Mark as terminally failed
    pub fn mark_failed(&mut self) {
        self.status = DocumentStatus::Failed;
    }
}

/// One retrieval-granular unit of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique chunk ID
    pub id: Uuid,
    /// Parent document ID
    pub document_id: Uuid,
    /// 0-based position within the document; defines ordering
    pub chunk_index: u32,
    /// Text content
    pub content: String,
    /// Estimated token count
    pub token_count: u32,
    /// Page number (1-indexed) when the extractor exposed page structure
    pub page_number: Option<u32>,
    /// Section or heading title, if known
    pub section_title: Option<String>,
    /// Opaque reference into the vector store, set once embedded
    pub embedding_ref: Option<String>,
}

impl Chunk {
    /// Create a new chunk
    pub fn new(
        document_id: Uuid,
        chunk_index: u32,
        content: String,
        token_count: u32,
        page_number: Option<u32>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            chunk_index,
            content,
            token_count,
            page_number,
            section_title: None,
            embedding_ref: None,
        }
    }
}
