//! Content-based document deduplication
//!
//! Fingerprints are computed over normalized *extracted* text, not raw
//! bytes, so the same logical document re-exported to a different file
//! format still collapses to one hash.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::IngestDb;
use crate::types::DocumentRecord;

/// Computes content fingerprints and looks up previously ingested documents
pub struct Deduplicator {
    db: Arc<IngestDb>,
}

impl Deduplicator {
    pub fn new(db: Arc<IngestDb>) -> Self {
        Self { db }
    }

    /// SHA-256 over normalized text, hex-encoded
    pub fn fingerprint(text: &str) -> String {
        let normalized = normalize(text);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// An already-completed original with the same fingerprint, excluding
    /// the document currently being processed
    pub fn find_existing(&self, hash: &str, current: Uuid) -> Result<Option<DocumentRecord>> {
        let existing = self.db.find_completed_by_hash(hash)?;
        Ok(existing.filter(|doc| doc.id != current))
    }
}

/// Normalize text for stable hashing: lowercase, drop everything that is not
/// alphanumeric or whitespace, collapse whitespace runs to single spaces.
fn normalize(text: &str) -> String {
    let filtered: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_collapses_formatting_variance() {
        assert_eq!(normalize("Hello,  World!"), normalize("hello world"));
        assert_eq!(
            normalize("Line one.\n\nLine  two."),
            normalize("line one line two")
        );
        assert_ne!(normalize("alpha beta"), normalize("alpha gamma"));
    }

    #[test]
    fn test_fingerprint_is_stable_across_reexports() {
        // Same content, different layout/punctuation
        let pdf_render = "Municipal Budget 2025\n\nSection 1: Overview.";
        let docx_render = "municipal budget 2025 section 1  overview";
        assert_eq!(
            Deduplicator::fingerprint(pdf_render),
            Deduplicator::fingerprint(docx_render)
        );
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let hash = Deduplicator::fingerprint("some text");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
