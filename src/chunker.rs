//! Deterministic overlapping chunker.
//!
//! Splits a document's extracted text into passages of at most
//! `max_chars` characters with `overlap` characters shared between adjacent
//! passages. The output is a pure function of `(text, config)`: re-running
//! the chunk stage for the same generation reproduces byte-identical chunks,
//! which is what makes chunk-row upserts idempotent.

use crate::config::ChunkingConfig;
use crate::errors::IngestError;

/// Split `text` into overlapping passages.
///
/// Boundaries are computed on character offsets, never inside a multi-byte
/// code point. Empty input yields zero chunks, which is legal: the generation
/// then passes through the embed and index barriers trivially.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Result<Vec<String>, IngestError> {
    if config.max_chars == 0 {
        return Err(IngestError::ChunkingFailed {
            message: "max_chars must be positive".to_string(),
        });
    }
    if config.overlap >= config.max_chars {
        return Err(IngestError::ChunkingFailed {
            message: format!(
                "overlap ({}) must be smaller than max_chars ({})",
                config.overlap, config.max_chars
            ),
        });
    }
    if text.is_empty() {
        return Ok(Vec::new());
    }

    // Byte offset of every char boundary, plus the end of the text.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());
    let total_chars = boundaries.len() - 1;

    let step = config.max_chars - config.overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + config.max_chars).min(total_chars);
        chunks.push(text[boundaries[start]..boundaries[end]].to_string());
        if end == total_chars {
            break;
        }
        start += step;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_chars: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig::new(max_chars, overlap)
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("hello", &cfg(10, 2)).unwrap();
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", &cfg(10, 2)).unwrap().is_empty());
    }

    #[test]
    fn chunks_overlap_and_cover_the_text() {
        let text = "abcdefghijklmnop";
        let chunks = chunk_text(text, &cfg(6, 2)).unwrap();
        assert_eq!(chunks[0], "abcdef");
        assert_eq!(chunks[1], "efghij");
        assert_eq!(chunks[2], "ijklmn");
        assert_eq!(chunks[3], "mnop");
        // Adjacent chunks share exactly the configured overlap.
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(2).collect::<Vec<_>>().iter().rev().collect();
            assert!(pair[1].starts_with(&tail));
        }
    }

    #[test]
    fn deterministic_for_same_input() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let a = chunk_text(&text, &cfg(100, 20)).unwrap();
        let b = chunk_text(&text, &cfg(100, 20)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn multibyte_boundaries_are_respected() {
        let text = "héllø wörld ".repeat(30);
        let chunks = chunk_text(&text, &cfg(8, 3)).unwrap();
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 8);
        }
        // Reassembling first chunk + non-overlapping suffixes restores the text.
        let mut rebuilt = chunks[0].clone();
        for chunk in &chunks[1..] {
            let suffix: String = chunk.chars().skip(3).collect();
            rebuilt.push_str(&suffix);
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(matches!(
            chunk_text("abc", &cfg(0, 0)),
            Err(IngestError::ChunkingFailed { .. })
        ));
        assert!(matches!(
            chunk_text("abc", &cfg(4, 4)),
            Err(IngestError::ChunkingFailed { .. })
        ));
    }
}
