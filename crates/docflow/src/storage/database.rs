//! SQLite persistence for the ingestion pipeline
//!
//! All coordination between workers goes through this store: job claims are
//! conditional writes, and the single-flight-per-document invariant is a
//! partial unique index rather than an application-level lock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Chunk, DocumentRecord, DocumentStatus, IngestionJob, JobStage, UploadRecord};

const JOB_COLUMNS: &str = "id, document_id, upload_id, stage, progress, chunks_embedded, \
     total_chunks, attempt_count, max_attempts, last_error, cancel_requested, blob_deleted, \
     claimed_by, lease_expires_at, next_attempt_at, metadata, created_at, updated_at, \
     started_at, completed_at";

/// SQLite-backed store for the pipeline's durable state
pub struct IngestDb {
    conn: Arc<Mutex<Connection>>,
}

impl IngestDb {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        // WAL mode for concurrent readers while a worker writes
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
        "#,
        )
        .map_err(|e| Error::Database(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            -- Staged uploads awaiting processing
            CREATE TABLE IF NOT EXISTS uploads (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                blob_key TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_uploads_expires_at ON uploads(expires_at);

            -- Durable documents; outlive the jobs that produced them
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                source TEXT NOT NULL,
                content_hash TEXT,
                status TEXT NOT NULL,
                duplicate_of TEXT,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_content_hash ON documents(content_hash);
            CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

            -- Ingestion jobs; terminal rows are retained for audit and status
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                upload_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                chunks_embedded INTEGER NOT NULL DEFAULT 0,
                total_chunks INTEGER NOT NULL DEFAULT 0,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                blob_deleted INTEGER NOT NULL DEFAULT 0,
                claimed_by TEXT,
                lease_expires_at TEXT,
                next_attempt_at TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                extracted_text TEXT
            );

            -- Single-flight: at most one live job per document
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_document
                ON jobs(document_id) WHERE stage NOT IN ('completed', 'failed');
            CREATE INDEX IF NOT EXISTS idx_jobs_stage ON jobs(stage);
            CREATE INDEX IF NOT EXISTS idx_jobs_next_attempt_at ON jobs(next_attempt_at);

            -- Chunks keyed by (document, index) so stage re-runs overwrite
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                page_number INTEGER,
                section_title TEXT,
                embedding_ref TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(document_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id);
        "#,
        )
        .map_err(|e| Error::Database(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!("Database migrations complete");
        Ok(())
    }

    // ==================== Upload Operations ====================

    /// Insert a staged upload record
    pub fn insert_upload(&self, upload: &UploadRecord) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO uploads (
                id, document_id, blob_key, filename, content_type,
                size_bytes, consumed, expires_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                upload.id.to_string(),
                upload.document_id.to_string(),
                upload.blob_key,
                upload.filename,
                upload.content_type,
                upload.size_bytes as i64,
                upload.consumed as i64,
                upload.expires_at.to_rfc3339(),
                upload.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(format!("Failed to insert upload: {}", e)))?;

        Ok(())
    }

    /// Get an upload by ID
    pub fn get_upload(&self, upload_id: Uuid) -> Result<Option<UploadRecord>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT * FROM uploads WHERE id = ?1")
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let record = stmt
            .query_row(params![upload_id.to_string()], row_to_upload)
            .optional()
            .map_err(|e| Error::Database(format!("Failed to get upload: {}", e)))?;

        Ok(record)
    }

    /// Mark an upload as consumed by a processing job
    pub fn mark_upload_consumed(&self, upload_id: Uuid) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "UPDATE uploads SET consumed = 1 WHERE id = ?1",
            params![upload_id.to_string()],
        )?;

        Ok(())
    }

    /// Remove an upload record; returns false if it was already gone
    pub fn delete_upload(&self, upload_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn.execute(
            "DELETE FROM uploads WHERE id = ?1",
            params![upload_id.to_string()],
        )?;

        Ok(count > 0)
    }

    /// Expired uploads that were never consumed (sweep targets)
    pub fn list_expired_uploads(&self, now: DateTime<Utc>) -> Result<Vec<UploadRecord>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT * FROM uploads WHERE consumed = 0 AND expires_at < ?1")
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let records = stmt
            .query_map(params![now.to_rfc3339()], row_to_upload)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(records)
    }

    // ==================== Document Operations ====================

    /// Insert a document record. A no-op when the document already exists,
    /// so resubmissions for the same document fall through to the job-level
    /// single-flight check.
    pub fn insert_document(&self, doc: &DocumentRecord) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT OR IGNORE INTO documents (
                id, title, source, content_hash, status, duplicate_of, chunk_count, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                doc.id.to_string(),
                doc.title,
                doc.source,
                doc.content_hash,
                doc.status.as_str(),
                doc.duplicate_of.map(|id| id.to_string()),
                doc.chunk_count as i64,
                doc.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(format!("Failed to insert document: {}", e)))?;

        Ok(())
    }

    /// Persist a document's mutable fields
    pub fn update_document(&self, doc: &DocumentRecord) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            UPDATE documents SET
                content_hash = ?2,
                status = ?3,
                duplicate_of = ?4,
                chunk_count = ?5
            WHERE id = ?1
            "#,
            params![
                doc.id.to_string(),
                doc.content_hash,
                doc.status.as_str(),
                doc.duplicate_of.map(|id| id.to_string()),
                doc.chunk_count as i64,
            ],
        )
        .map_err(|e| Error::Database(format!("Failed to update document: {}", e)))?;

        Ok(())
    }

    /// Get a document by ID
    pub fn get_document(&self, document_id: Uuid) -> Result<Option<DocumentRecord>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT * FROM documents WHERE id = ?1")
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let record = stmt
            .query_row(params![document_id.to_string()], row_to_document)
            .optional()
            .map_err(|e| Error::Database(format!("Failed to get document: {}", e)))?;

        Ok(record)
    }

    /// Find a completed, non-duplicate document with the given content hash.
    ///
    /// Only completed originals participate in deduplication; failed and
    /// duplicate documents never shadow a fresh ingest.
    pub fn find_completed_by_hash(&self, content_hash: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(
                "SELECT * FROM documents \
                 WHERE content_hash = ?1 AND status = 'completed' AND duplicate_of IS NULL \
                 LIMIT 1",
            )
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let record = stmt
            .query_row(params![content_hash], row_to_document)
            .optional()
            .map_err(|e| Error::Database(format!("Failed to query by hash: {}", e)))?;

        Ok(record)
    }

    // ==================== Job Operations ====================

    /// Insert a job. Returns false when the single-flight index rejected it
    /// because a live job already exists for the document.
    pub fn try_insert_job(&self, job: &IngestionJob) -> Result<bool> {
        let conn = self.conn.lock();

        let metadata_json = serde_json::to_string(&job.metadata)?;

        let result = conn.execute(
            r#"
            INSERT INTO jobs (
                id, document_id, upload_id, stage, progress, chunks_embedded,
                total_chunks, attempt_count, max_attempts, last_error, cancel_requested,
                blob_deleted, claimed_by, lease_expires_at, next_attempt_at, metadata,
                created_at, updated_at, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
            params![
                job.id.to_string(),
                job.document_id.to_string(),
                job.upload_id.to_string(),
                job.stage.as_str(),
                job.progress as i64,
                job.chunks_embedded as i64,
                job.total_chunks as i64,
                job.attempt_count as i64,
                job.max_attempts as i64,
                job.last_error,
                job.cancel_requested as i64,
                job.blob_deleted as i64,
                job.claimed_by,
                job.lease_expires_at.map(|t| t.to_rfc3339()),
                job.next_attempt_at.to_rfc3339(),
                metadata_json,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(Error::Database(format!("Failed to insert job: {}", e))),
        }
    }

    /// Persist a job's mutable fields
    pub fn update_job(&self, job: &IngestionJob) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            UPDATE jobs SET
                stage = ?2,
                progress = ?3,
                chunks_embedded = ?4,
                total_chunks = ?5,
                attempt_count = ?6,
                last_error = ?7,
                cancel_requested = ?8,
                blob_deleted = ?9,
                claimed_by = ?10,
                lease_expires_at = ?11,
                next_attempt_at = ?12,
                updated_at = ?13,
                started_at = ?14,
                completed_at = ?15
            WHERE id = ?1
            "#,
            params![
                job.id.to_string(),
                job.stage.as_str(),
                job.progress as i64,
                job.chunks_embedded as i64,
                job.total_chunks as i64,
                job.attempt_count as i64,
                job.last_error,
                job.cancel_requested as i64,
                job.blob_deleted as i64,
                job.claimed_by,
                job.lease_expires_at.map(|t| t.to_rfc3339()),
                job.next_attempt_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| Error::Database(format!("Failed to update job: {}", e)))?;

        Ok(())
    }

    /// Get a job by ID
    pub fn get_job(&self, job_id: Uuid) -> Result<Option<IngestionJob>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS))
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let record = stmt
            .query_row(params![job_id.to_string()], row_to_job)
            .optional()
            .map_err(|e| Error::Database(format!("Failed to get job: {}", e)))?;

        Ok(record)
    }

    /// The most recent job for a document (live or terminal)
    pub fn find_latest_job_for_document(&self, document_id: Uuid) -> Result<Option<IngestionJob>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE document_id = ?1 ORDER BY created_at DESC LIMIT 1",
                JOB_COLUMNS
            ))
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let record = stmt
            .query_row(params![document_id.to_string()], row_to_job)
            .optional()
            .map_err(|e| Error::Database(format!("Failed to query job: {}", e)))?;

        Ok(record)
    }

    /// The live (non-terminal) job for a document, if any
    pub fn find_active_job_for_document(&self, document_id: Uuid) -> Result<Option<IngestionJob>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs \
                 WHERE document_id = ?1 AND stage NOT IN ('completed', 'failed') LIMIT 1",
                JOB_COLUMNS
            ))
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let record = stmt
            .query_row(params![document_id.to_string()], row_to_job)
            .optional()
            .map_err(|e| Error::Database(format!("Failed to query job: {}", e)))?;

        Ok(record)
    }

    /// Atomically claim the next runnable job for a worker.
    ///
    /// Runnable means non-terminal, past `next_attempt_at`, and either
    /// unclaimed or holding an expired lease (abandoned by a dead worker).
    /// Claiming starts a new attempt.
    pub fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<IngestionJob>> {
        let conn = self.conn.lock();
        let now_s = now.to_rfc3339();

        let candidate = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM jobs \
                     WHERE stage NOT IN ('completed', 'failed') \
                       AND next_attempt_at <= ?1 \
                       AND (claimed_by IS NULL OR lease_expires_at < ?1) \
                     ORDER BY created_at ASC LIMIT 1",
                    JOB_COLUMNS
                ))
                .map_err(|e| Error::Database(format!("Failed to prepare claim query: {}", e)))?;

            stmt.query_row(params![now_s], row_to_job)
                .optional()
                .map_err(|e| Error::Database(format!("Failed to query claimable job: {}", e)))?
        };

        let Some(mut job) = candidate else {
            return Ok(None);
        };

        job.begin_attempt(worker_id, now + lease);

        let changed = conn.execute(
            r#"
            UPDATE jobs SET
                attempt_count = ?2,
                claimed_by = ?3,
                lease_expires_at = ?4,
                updated_at = ?5,
                started_at = ?6
            WHERE id = ?1 AND (claimed_by IS NULL OR lease_expires_at < ?5)
            "#,
            params![
                job.id.to_string(),
                job.attempt_count as i64,
                job.claimed_by,
                job.lease_expires_at.map(|t| t.to_rfc3339()),
                now_s,
                job.started_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        if changed == 1 {
            Ok(Some(job))
        } else {
            Ok(None)
        }
    }

    /// Request cooperative cancellation; returns false if the job is already
    /// terminal or unknown
    pub fn request_cancel(&self, job_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();

        let changed = conn.execute(
            "UPDATE jobs SET cancel_requested = 1, updated_at = ?2 \
             WHERE id = ?1 AND stage NOT IN ('completed', 'failed')",
            params![job_id.to_string(), Utc::now().to_rfc3339()],
        )?;

        Ok(changed > 0)
    }

    /// Re-read the persisted cancellation flag
    pub fn is_cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();

        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(flag.unwrap_or(0) != 0)
    }

    /// Store or clear the extraction checkpoint for a job
    pub fn set_extracted_text(&self, job_id: Uuid, text: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "UPDATE jobs SET extracted_text = ?2 WHERE id = ?1",
            params![job_id.to_string(), text],
        )?;

        Ok(())
    }

    /// Read the extraction checkpoint for a job
    pub fn get_extracted_text(&self, job_id: Uuid) -> Result<Option<String>> {
        let conn = self.conn.lock();

        let text: Option<Option<String>> = conn
            .query_row(
                "SELECT extracted_text FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(text.flatten())
    }

    /// Terminal jobs whose staged blob could not be removed yet
    /// (reconciled by the cleanup sweep)
    pub fn list_terminal_jobs_with_blobs(&self) -> Result<Vec<IngestionJob>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs \
                 WHERE stage IN ('completed', 'failed') AND blob_deleted = 0",
                JOB_COLUMNS
            ))
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let records = stmt
            .query_map([], row_to_job)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(records)
    }

    // ==================== Chunk Operations ====================

    /// Replace the whole chunk set for a document in one transaction.
    ///
    /// All-or-nothing: search never observes a partial chunk set, and a
    /// retried chunking stage overwrites rather than appends.
    pub fn replace_chunks(&self, document_id: Uuid, chunks: &[Chunk]) -> Result<()> {
        let mut conn = self.conn.lock();

        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        tx.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id.to_string()],
        )?;

        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT OR REPLACE INTO chunks (
                        id, document_id, chunk_index, content, token_count,
                        page_number, section_title, embedding_ref, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    "#,
                )
                .map_err(|e| Error::Database(format!("Failed to prepare statement: {}", e)))?;

            let now = Utc::now().to_rfc3339();
            for chunk in chunks {
                stmt.execute(params![
                    chunk.id.to_string(),
                    chunk.document_id.to_string(),
                    chunk.chunk_index as i64,
                    chunk.content,
                    chunk.token_count as i64,
                    chunk.page_number.map(|p| p as i64),
                    chunk.section_title,
                    chunk.embedding_ref,
                    &now,
                ])?;
            }
        }

        tx.commit()
            .map_err(|e| Error::Database(format!("Failed to commit chunks: {}", e)))?;

        Ok(())
    }

    /// All chunks for a document, in index order
    pub fn get_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT * FROM chunks WHERE document_id = ?1 ORDER BY chunk_index ASC")
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let records = stmt
            .query_map(params![document_id.to_string()], row_to_chunk)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(records)
    }

    /// Record the vector-store reference for an embedded chunk
    pub fn set_chunk_embedding_ref(
        &self,
        document_id: Uuid,
        chunk_index: u32,
        embedding_ref: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "UPDATE chunks SET embedding_ref = ?3 WHERE document_id = ?1 AND chunk_index = ?2",
            params![
                document_id.to_string(),
                chunk_index as i64,
                embedding_ref
            ],
        )?;

        Ok(())
    }

    /// Number of chunks stored for a document
    pub fn count_chunks(&self, document_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
            params![document_id.to_string()],
            |row| row.get(0),
        )?;

        Ok(count as usize)
    }
}

// Row mappers

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
    })
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn row_to_upload(row: &rusqlite::Row) -> rusqlite::Result<UploadRecord> {
    let id: String = row.get(0)?;
    let document_id: String = row.get(1)?;
    let blob_key: String = row.get(2)?;
    let filename: String = row.get(3)?;
    let content_type: String = row.get(4)?;
    let size_bytes: i64 = row.get(5)?;
    let consumed: i64 = row.get(6)?;
    let expires_at: String = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok(UploadRecord {
        id: parse_uuid(&id),
        document_id: parse_uuid(&document_id),
        blob_key,
        filename,
        content_type,
        size_bytes: size_bytes as u64,
        consumed: consumed != 0,
        expires_at: parse_ts(&expires_at),
        created_at: parse_ts(&created_at),
    })
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<DocumentRecord> {
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let source: String = row.get(2)?;
    let content_hash: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let duplicate_of: Option<String> = row.get(5)?;
    let chunk_count: i64 = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(DocumentRecord {
        id: parse_uuid(&id),
        title,
        source,
        content_hash,
        status: DocumentStatus::parse(&status),
        duplicate_of: duplicate_of.map(|s| parse_uuid(&s)),
        chunk_count: chunk_count as u32,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<IngestionJob> {
    let id: String = row.get(0)?;
    let document_id: String = row.get(1)?;
    let upload_id: String = row.get(2)?;
    let stage: String = row.get(3)?;
    let progress: i64 = row.get(4)?;
    let chunks_embedded: i64 = row.get(5)?;
    let total_chunks: i64 = row.get(6)?;
    let attempt_count: i64 = row.get(7)?;
    let max_attempts: i64 = row.get(8)?;
    let last_error: Option<String> = row.get(9)?;
    let cancel_requested: i64 = row.get(10)?;
    let blob_deleted: i64 = row.get(11)?;
    let claimed_by: Option<String> = row.get(12)?;
    let lease_expires_at: Option<String> = row.get(13)?;
    let next_attempt_at: String = row.get(14)?;
    let metadata_json: Option<String> = row.get(15)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;
    let started_at: Option<String> = row.get(18)?;
    let completed_at: Option<String> = row.get(19)?;

    Ok(IngestionJob {
        id: parse_uuid(&id),
        document_id: parse_uuid(&document_id),
        upload_id: parse_uuid(&upload_id),
        stage: JobStage::parse(&stage),
        progress: progress as u8,
        chunks_embedded: chunks_embedded as u32,
        total_chunks: total_chunks as u32,
        attempt_count: attempt_count as u32,
        max_attempts: max_attempts as u32,
        last_error,
        cancel_requested: cancel_requested != 0,
        blob_deleted: blob_deleted != 0,
        claimed_by,
        lease_expires_at: parse_opt_ts(lease_expires_at),
        next_attempt_at: parse_ts(&next_attempt_at),
        metadata: metadata_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_else(HashMap::new),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        started_at: parse_opt_ts(started_at),
        completed_at: parse_opt_ts(completed_at),
    })
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
    let id: String = row.get(0)?;
    let document_id: String = row.get(1)?;
    let chunk_index: i64 = row.get(2)?;
    let content: String = row.get(3)?;
    let token_count: i64 = row.get(4)?;
    let page_number: Option<i64> = row.get(5)?;
    let section_title: Option<String> = row.get(6)?;
    let embedding_ref: Option<String> = row.get(7)?;

    Ok(Chunk {
        id: parse_uuid(&id),
        document_id: parse_uuid(&document_id),
        chunk_index: chunk_index as u32,
        content,
        token_count: token_count as u32,
        page_number: page_number.map(|p| p as u32),
        section_title,
        embedding_ref,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn new_job(document_id: Uuid) -> IngestionJob {
        IngestionJob::new(document_id, Uuid::new_v4(), 3, HashMap::new())
    }

    #[test]
    fn test_single_flight_per_document() {
        let db = IngestDb::in_memory().unwrap();
        let document_id = Uuid::new_v4();

        assert!(db.try_insert_job(&new_job(document_id)).unwrap());
        // Second live job for the same document is rejected
        assert!(!db.try_insert_job(&new_job(document_id)).unwrap());

        // Finish the first job; a fresh one is allowed again
        let mut job = db.find_active_job_for_document(document_id).unwrap().unwrap();
        job.fail_with_error("boom");
        db.update_job(&job).unwrap();
        assert!(db.try_insert_job(&new_job(document_id)).unwrap());
    }

    #[test]
    fn test_claim_and_lease() {
        let db = IngestDb::in_memory().unwrap();
        let job = new_job(Uuid::new_v4());
        db.try_insert_job(&job).unwrap();

        let now = Utc::now();
        let lease = chrono::Duration::seconds(60);

        let claimed = db.claim_next_job("w-0", now, lease).unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.attempt_count, 1);

        // While the lease is live nobody else can claim it
        assert!(db.claim_next_job("w-1", now, lease).unwrap().is_none());

        // After the lease expires the job is redelivered as a new attempt
        let later = now + chrono::Duration::seconds(120);
        let reclaimed = db.claim_next_job("w-1", later, lease).unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempt_count, 2);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("w-1"));
    }

    #[test]
    fn test_claim_respects_next_attempt_at() {
        let db = IngestDb::in_memory().unwrap();
        let mut job = new_job(Uuid::new_v4());
        job.next_attempt_at = Utc::now() + chrono::Duration::seconds(30);
        db.try_insert_job(&job).unwrap();

        let now = Utc::now();
        assert!(db
            .claim_next_job("w-0", now, chrono::Duration::seconds(60))
            .unwrap()
            .is_none());
        assert!(db
            .claim_next_job("w-0", now + chrono::Duration::seconds(31), chrono::Duration::seconds(60))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_replace_chunks_is_idempotent() {
        let db = IngestDb::in_memory().unwrap();
        let document_id = Uuid::new_v4();

        let chunks: Vec<Chunk> = (0..3)
            .map(|i| Chunk::new(document_id, i, format!("chunk {}", i), 2, None))
            .collect();
        db.replace_chunks(document_id, &chunks).unwrap();
        assert_eq!(db.count_chunks(document_id).unwrap(), 3);

        // Re-running the stage with a different split overwrites, not appends
        let chunks: Vec<Chunk> = (0..2)
            .map(|i| Chunk::new(document_id, i, format!("redo {}", i), 2, None))
            .collect();
        db.replace_chunks(document_id, &chunks).unwrap();

        let stored = db.get_chunks(document_id).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].chunk_index, 0);
        assert_eq!(stored[1].chunk_index, 1);
        assert_eq!(stored[0].content, "redo 0");
    }

    #[test]
    fn test_dedup_lookup_only_sees_completed_originals() {
        let db = IngestDb::in_memory().unwrap();

        let mut failed = DocumentRecord::new(Uuid::new_v4(), "a".into(), "a.pdf".into());
        failed.content_hash = Some("h1".into());
        failed.mark_failed();
        db.insert_document(&failed).unwrap();
        assert!(db.find_completed_by_hash("h1").unwrap().is_none());

        let mut done = DocumentRecord::new(Uuid::new_v4(), "b".into(), "b.pdf".into());
        done.content_hash = Some("h1".into());
        done.mark_completed(4);
        db.insert_document(&done).unwrap();

        let hit = db.find_completed_by_hash("h1").unwrap().unwrap();
        assert_eq!(hit.id, done.id);
    }

    #[test]
    fn test_cancel_flag() {
        let db = IngestDb::in_memory().unwrap();
        let job = new_job(Uuid::new_v4());
        db.try_insert_job(&job).unwrap();

        assert!(!db.is_cancel_requested(job.id).unwrap());
        assert!(db.request_cancel(job.id).unwrap());
        assert!(db.is_cancel_requested(job.id).unwrap());

        // Terminal jobs cannot be cancelled
        let mut job = db.get_job(job.id).unwrap().unwrap();
        job.fail_with_error("cancelled");
        db.update_job(&job).unwrap();
        assert!(!db.request_cancel(job.id).unwrap());
    }

    #[test]
    fn test_extracted_text_checkpoint() {
        let db = IngestDb::in_memory().unwrap();
        let job = new_job(Uuid::new_v4());
        db.try_insert_job(&job).unwrap();

        assert!(db.get_extracted_text(job.id).unwrap().is_none());
        db.set_extracted_text(job.id, Some("the text")).unwrap();
        assert_eq!(db.get_extracted_text(job.id).unwrap().as_deref(), Some("the text"));
        db.set_extracted_text(job.id, None).unwrap();
        assert!(db.get_extracted_text(job.id).unwrap().is_none());
    }

    #[test]
    fn test_expired_upload_listing() {
        let db = IngestDb::in_memory().unwrap();

        let fresh = UploadRecord::new(
            "fresh.pdf".into(),
            "application/pdf".into(),
            10,
            chrono::Duration::hours(1),
        );
        let mut stale = UploadRecord::new(
            "stale.pdf".into(),
            "application/pdf".into(),
            10,
            chrono::Duration::hours(1),
        );
        stale.expires_at = Utc::now() - chrono::Duration::hours(2);

        db.insert_upload(&fresh).unwrap();
        db.insert_upload(&stale).unwrap();

        let expired = db.list_expired_uploads(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);

        // Consumed uploads are the job's responsibility, not the sweep's
        db.mark_upload_consumed(stale.id).unwrap();
        assert!(db.list_expired_uploads(Utc::now()).unwrap().is_empty());
    }
}
