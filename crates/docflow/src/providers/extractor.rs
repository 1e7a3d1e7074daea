//! Content extraction provider
//!
//! Converts raw document bytes into plain text. The pipeline only depends on
//! the trait; the bundled implementation talks to a Tika-compatible HTTP
//! extraction service.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::config::ExtractorConfig;
use crate::error::{Error, Result};

/// Plain text extracted from a document, with page structure when the
/// source format exposes it
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    /// Full text content
    pub text: String,
    /// Per-page text, empty for formats without pages
    pub pages: Vec<PageText>,
}

/// Text of a single page
#[derive(Debug, Clone)]
pub struct PageText {
    /// 1-indexed page number
    pub page_number: u32,
    pub content: String,
}

impl ExtractedDocument {
    /// Build from flat text with no page structure
    pub fn from_text(text: String) -> Self {
        Self {
            text,
            pages: Vec::new(),
        }
    }

    /// Build from text containing form-feed page separators (as emitted by
    /// Tika for paginated formats)
    pub fn from_paginated_text(text: String) -> Self {
        let pages: Vec<PageText> = text
            .split('\u{0C}')
            .enumerate()
            .filter(|(_, content)| !content.trim().is_empty())
            .map(|(i, content)| PageText {
                page_number: i as u32 + 1,
                content: content.trim().to_string(),
            })
            .collect();

        if pages.len() > 1 {
            Self { text, pages }
        } else {
            Self::from_text(text)
        }
    }
}

/// Trait for converting raw file bytes into plain text.
///
/// Implementations must distinguish failure classes through the error type:
/// corrupt or unsupported content is permanent ([`Error::CorruptDocument`],
/// [`Error::UnsupportedType`]), I/O and service trouble is transient
/// ([`Error::Extractor`]).
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// Extract plain text from document bytes
    async fn extract(&self, data: &[u8], content_type: &str) -> Result<ExtractedDocument>;

    /// Check if the extractor is reachable
    async fn health_check(&self) -> Result<bool>;

    /// Provider name for logging
    fn name(&self) -> &str;
}

/// Extractor backed by an Apache Tika server
pub struct TikaExtractor {
    client: Client,
    base_url: String,
}

impl TikaExtractor {
    pub fn new(config: &ExtractorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build extractor client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ContentExtractor for TikaExtractor {
    async fn extract(&self, data: &[u8], content_type: &str) -> Result<ExtractedDocument> {
        let response = self
            .client
            .put(format!("{}/tika", self.base_url))
            .header("Content-Type", content_type)
            .header("Accept", "text/plain")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| Error::extractor(format!("Extraction request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| Error::extractor(format!("Failed to read extraction body: {}", e)))?;
            return Ok(ExtractedDocument::from_paginated_text(text));
        }

        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            415 => Err(Error::UnsupportedType(content_type.to_string())),
            // Tika signals unreadable input with 422
            422 => Err(Error::corrupt(format!(
                "Extractor rejected document: {}",
                body
            ))),
            code if (400..500).contains(&code) => Err(Error::corrupt(format!(
                "Extractor rejected document ({}): {}",
                code, body
            ))),
            code => Err(Error::extractor(format!(
                "Extractor service error ({}): {}",
                code, body
            ))),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/version", self.base_url))
            .send()
            .await;
        Ok(matches!(response, Ok(r) if r.status().is_success()))
    }

    fn name(&self) -> &str {
        "tika"
    }
}
