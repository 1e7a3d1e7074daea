//! Token-window text chunking with overlap
//!
//! Boundaries prefer paragraph breaks, then sentence boundaries; hard splits
//! only happen for single sentences larger than the whole window. Page
//! markers from the extractor are carried into chunk metadata.

use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::providers::extractor::ExtractedDocument;
use crate::types::Chunk;

/// Rough token count; whitespace-separated words are close enough to
/// subword tokens for sizing retrieval windows.
pub fn token_estimate(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Text chunker with a target token window and overlap
pub struct TextChunker {
    target_tokens: usize,
    overlap_tokens: usize,
    min_tokens: usize,
}

impl TextChunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            target_tokens: config.target_tokens.max(1),
            overlap_tokens: config.overlap_tokens,
            min_tokens: config.min_tokens,
        }
    }

    /// Chunk an extracted document, continuing indexes across pages
    pub fn chunk_document(&self, document_id: Uuid, extracted: &ExtractedDocument) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut next_index = 0u32;

        if extracted.pages.len() > 1 {
            for page in &extracted.pages {
                self.chunk_text(
                    &page.content,
                    document_id,
                    Some(page.page_number),
                    &mut next_index,
                    &mut chunks,
                );
            }
        } else {
            let page_number = extracted.pages.first().map(|p| p.page_number);
            self.chunk_text(
                &extracted.text,
                document_id,
                page_number,
                &mut next_index,
                &mut chunks,
            );
        }

        chunks
    }

    fn chunk_text(
        &self,
        text: &str,
        document_id: Uuid,
        page_number: Option<u32>,
        next_index: &mut u32,
        chunks: &mut Vec<Chunk>,
    ) {
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;

        for paragraph in text.split("\n\n") {
            if paragraph.trim().is_empty() {
                continue;
            }

            for sentence in paragraph.split_sentence_bounds() {
                let sentence = sentence.trim();
                if sentence.is_empty() {
                    continue;
                }
                let sentence_tokens = token_estimate(sentence);

                // A single sentence larger than the window gets hard-split;
                // no overlap is carried across the split
                if sentence_tokens > self.target_tokens {
                    self.flush(&mut current, &mut current_tokens, document_id, page_number, next_index, chunks);
                    current.clear();
                    current_tokens = 0;
                    for piece in hard_split(sentence, self.target_tokens) {
                        self.emit(piece, document_id, page_number, next_index, chunks);
                    }
                    continue;
                }

                if !current.is_empty() && current_tokens + sentence_tokens > self.target_tokens {
                    self.flush(&mut current, &mut current_tokens, document_id, page_number, next_index, chunks);
                }

                current.push(sentence.to_string());
                current_tokens += sentence_tokens;
            }
        }

        // Final chunk for this text block; overlap carry is dropped here
        if current_tokens >= self.min_tokens {
            let content = current.join(" ");
            self.emit(content, document_id, page_number, next_index, chunks);
        }
    }

    /// Emit the accumulated sentences as a chunk and seed the next window
    /// with the overlap tail.
    fn flush(
        &self,
        current: &mut Vec<String>,
        current_tokens: &mut usize,
        document_id: Uuid,
        page_number: Option<u32>,
        next_index: &mut u32,
        chunks: &mut Vec<Chunk>,
    ) {
        if current.is_empty() {
            return;
        }

        if *current_tokens >= self.min_tokens {
            let content = current.join(" ");
            self.emit(content, document_id, page_number, next_index, chunks);
        }

        let tail = overlap_tail(current, self.overlap_tokens);
        *current_tokens = tail.iter().map(|s| token_estimate(s)).sum();
        *current = tail;
    }

    fn emit(
        &self,
        content: String,
        document_id: Uuid,
        page_number: Option<u32>,
        next_index: &mut u32,
        chunks: &mut Vec<Chunk>,
    ) {
        let token_count = token_estimate(&content) as u32;
        chunks.push(Chunk::new(
            document_id,
            *next_index,
            content,
            token_count,
            page_number,
        ));
        *next_index += 1;
    }
}

/// Trailing sentences whose combined size stays within the overlap budget
fn overlap_tail(sentences: &[String], overlap_tokens: usize) -> Vec<String> {
    if overlap_tokens == 0 {
        return Vec::new();
    }

    let mut tail: Vec<String> = Vec::new();
    let mut tokens = 0usize;

    for sentence in sentences.iter().rev() {
        let sentence_tokens = token_estimate(sentence);
        if tokens + sentence_tokens > overlap_tokens {
            break;
        }
        tokens += sentence_tokens;
        tail.push(sentence.clone());
    }

    tail.reverse();
    tail
}

/// Split an oversized sentence into word-bounded pieces of at most
/// `max_tokens` each
fn hard_split(sentence: &str, max_tokens: usize) -> Vec<String> {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    words
        .chunks(max_tokens.max(1))
        .map(|piece| piece.join(" "))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::extractor::PageText;
    use proptest::prelude::*;

    fn chunker(target: usize, overlap: usize, min: usize) -> TextChunker {
        TextChunker::new(&ChunkingConfig {
            target_tokens: target,
            overlap_tokens: overlap,
            min_tokens: min,
        })
    }

    fn doc(text: &str) -> ExtractedDocument {
        ExtractedDocument {
            text: text.to_string(),
            pages: Vec::new(),
        }
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = chunker(100, 10, 1).chunk_document(Uuid::new_v4(), &doc("A short sentence."));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].content, "A short sentence.");
    }

    #[test]
    fn test_window_is_respected() {
        let text = (0..50)
            .map(|i| format!("Sentence number {} has a few tokens.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunker(20, 7, 1).chunk_document(Uuid::new_v4(), &doc(&text));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count as usize <= 20, "chunk over window: {}", chunk.token_count);
        }
    }

    #[test]
    fn test_overlap_carries_context() {
        let text = (0..12)
            .map(|i| format!("Topic {} continues the argument here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunker(12, 6, 1).chunk_document(Uuid::new_v4(), &doc(&text));
        assert!(chunks.len() > 1);
        // Each successor starts with the tail of its predecessor
        for pair in chunks.windows(2) {
            let prev_last = pair[0].content.split(". ").last().unwrap().trim_end_matches('.');
            assert!(
                pair[1].content.contains(prev_last),
                "no overlap between {:?} and {:?}",
                pair[0].content,
                pair[1].content
            );
        }
    }

    #[test]
    fn test_page_numbers_flow_into_metadata() {
        let extracted = ExtractedDocument {
            text: String::new(),
            pages: vec![
                PageText {
                    page_number: 1,
                    content: "First page talks about alpha and beta topics in detail.".into(),
                },
                PageText {
                    page_number: 2,
                    content: "Second page talks about gamma and delta topics in detail.".into(),
                },
            ],
        };
        let chunks = chunker(100, 10, 1).chunk_document(Uuid::new_v4(), &extracted);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page_number, Some(1));
        assert_eq!(chunks[1].page_number, Some(2));
        // Indexes stay contiguous across pages
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[1].chunk_index, 1);
    }

    #[test]
    fn test_oversized_sentence_is_hard_split() {
        let monster = (0..50).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let chunks = chunker(10, 3, 1).chunk_document(Uuid::new_v4(), &doc(&monster));
        assert_eq!(chunks.len(), 5);
        for chunk in &chunks {
            assert!(chunk.token_count <= 10);
        }
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunker(100, 10, 1).chunk_document(Uuid::new_v4(), &doc("")).is_empty());
        assert!(chunker(100, 10, 1).chunk_document(Uuid::new_v4(), &doc("\n\n  \n\n")).is_empty());
    }

    proptest! {
        #[test]
        fn prop_indexes_contiguous_and_bounded(
            words in proptest::collection::vec("[a-z]{1,8}", 0..600),
            target in 5usize..50,
        ) {
            let text = words.join(" ");
            let chunks = chunker(target, target / 4, 1)
                .chunk_document(Uuid::new_v4(), &doc(&text));

            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.chunk_index as usize, i);
                prop_assert!(!chunk.content.is_empty());
                prop_assert!(chunk.token_count as usize <= target);
            }
        }
    }
}
