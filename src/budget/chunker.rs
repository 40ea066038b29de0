//! Chunk planning for texts that exceed a model's context window.
//!
//! A [`ChunkPlan`] is derived data: it is recomputed during the `prepare`
//! sub-phase and never persisted. Chunks cover the source text contiguously
//! and in order, with a bounded character overlap carried across each split
//! so the service keeps some context from the previous chunk.

use super::estimator::TokenEstimator;

/// One slice of a unit's source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of the slice start (always a char boundary).
    pub start: usize,
    /// Byte offset one past the slice end (always a char boundary).
    pub end: usize,
    /// Estimated token count of the slice.
    pub approx_tokens: u64,
    /// True when a single indivisible block exceeded the token ceiling and
    /// was emitted as-is. Callers must report these rather than drop them.
    pub oversized: bool,
}

/// Ordered chunking plan for one unit's source text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    /// Overlap window the plan was computed with, in characters.
    pub overlap_chars: usize,
}

impl ChunkPlan {
    /// Whether the text fits in a single chunk.
    pub fn is_single(&self) -> bool {
        self.chunks.len() <= 1
    }

    /// Whether any chunk had to be emitted over the token ceiling.
    pub fn has_oversized(&self) -> bool {
        self.chunks.iter().any(|c| c.oversized)
    }

    /// Borrow the slice of `text` covered by `chunk`.
    pub fn slice<'a>(&self, text: &'a str, chunk: &Chunk) -> &'a str {
        &text[chunk.start..chunk.end]
    }
}

/// Compute a chunking plan for `text` so that no chunk's estimated token
/// count exceeds `max_tokens_per_chunk`.
///
/// Text is accumulated greedily at paragraph granularity; a paragraph that
/// alone overflows the ceiling is retried at sentence granularity, and a
/// sentence that still overflows is emitted as its own chunk flagged
/// `oversized` instead of being dropped or causing an error. Each chunk
/// after the first starts `overlap_chars` characters before the previous
/// boundary (never before position 0).
pub fn calculate_splits(
    text: &str,
    estimator: &TokenEstimator,
    max_tokens_per_chunk: u64,
    overlap_chars: usize,
) -> ChunkPlan {
    let mut plan = ChunkPlan {
        chunks: Vec::new(),
        overlap_chars,
    };
    if text.is_empty() {
        return plan;
    }

    let whole = estimator.estimate(text);
    if whole <= max_tokens_per_chunk {
        plan.chunks.push(Chunk {
            start: 0,
            end: text.len(),
            approx_tokens: whole,
            oversized: false,
        });
        return plan;
    }

    let blocks = leaf_blocks(text, estimator, max_tokens_per_chunk);

    let mut chunk_start = 0usize;
    let mut cursor_end = 0usize;
    let mut blocks_in_chunk = 0usize;
    let mut i = 0usize;

    while i < blocks.len() {
        let (_, block_end) = blocks[i];
        let tentative = estimator.estimate(&text[chunk_start..block_end]);

        if tentative <= max_tokens_per_chunk {
            cursor_end = block_end;
            blocks_in_chunk += 1;
            i += 1;
            continue;
        }

        if blocks_in_chunk == 0 {
            // A single indivisible block (plus any carried overlap) exceeds
            // the ceiling: emit it oversized rather than losing it.
            plan.chunks.push(Chunk {
                start: chunk_start,
                end: block_end,
                approx_tokens: tentative,
                oversized: true,
            });
            chunk_start = overlap_start(text, block_end, overlap_chars);
            cursor_end = chunk_start;
            i += 1;
        } else {
            plan.chunks.push(Chunk {
                start: chunk_start,
                end: cursor_end,
                approx_tokens: estimator.estimate(&text[chunk_start..cursor_end]),
                oversized: false,
            });
            chunk_start = overlap_start(text, cursor_end, overlap_chars);
            cursor_end = chunk_start;
            blocks_in_chunk = 0;
            // Retry the same block against the fresh chunk.
        }
    }

    if cursor_end > chunk_start {
        plan.chunks.push(Chunk {
            start: chunk_start,
            end: cursor_end,
            approx_tokens: estimator.estimate(&text[chunk_start..cursor_end]),
            oversized: false,
        });
    }

    plan
}

/// Start offset for the chunk following a boundary at `end`: `overlap`
/// characters back, clamped to position 0. Counts characters, not bytes,
/// so multibyte text carries the full configured overlap.
fn overlap_start(text: &str, end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }
    text[..end]
        .char_indices()
        .rev()
        .take(overlap)
        .last()
        .map_or(end, |(start, _)| start)
}

/// Split `text` into blocks that chunk accumulation works over: paragraphs,
/// with any paragraph over the token ceiling broken into sentences. Spans
/// include trailing separators so concatenating them covers the whole text.
fn leaf_blocks(
    text: &str,
    estimator: &TokenEstimator,
    max_tokens: u64,
) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    for (start, end) in split_spans(text, 0, text.len(), "\n\n") {
        if estimator.estimate(&text[start..end]) <= max_tokens {
            blocks.push((start, end));
        } else {
            blocks.extend(sentence_spans(text, start, end));
        }
    }
    blocks
}

/// Spans of `text[from..to]` delimited by `sep`, separator runs attached to
/// the preceding span.
fn split_spans(text: &str, from: usize, to: usize, sep: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = from;
    let mut search = from;
    while let Some(pos) = text[search..to].find(sep) {
        let mut end = search + pos + sep.len();
        // Swallow consecutive separators into the same span.
        while text[end..to].starts_with(sep) {
            end += sep.len();
        }
        spans.push((start, end));
        start = end;
        search = end;
    }
    if start < to {
        spans.push((start, to));
    }
    spans
}

/// Sentence spans within `text[from..to]`, breaking after `.`, `!`, `?` or
/// a newline. The terminator stays with its sentence.
fn sentence_spans(text: &str, from: usize, to: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = from;
    let mut last_end = from;
    for (offset, ch) in text[from..to].char_indices() {
        let pos = from + offset + ch.len_utf8();
        if matches!(ch, '.' | '!' | '?' | '\n') {
            spans.push((start, pos));
            start = pos;
        }
        last_end = pos;
    }
    if start < last_end {
        spans.push((start, last_end));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraphs(count: usize) -> String {
        (0..count)
            .map(|i| format!("Paragraph {} has a handful of ordinary words in it.", i))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn test_empty_text_yields_empty_plan() {
        let plan = calculate_splits("", &TokenEstimator::default(), 100, 10);
        assert!(plan.chunks.is_empty());
    }

    #[test]
    fn test_small_text_is_single_chunk() {
        let text = "Just one short paragraph.";
        let plan = calculate_splits(text, &TokenEstimator::default(), 1_000, 50);
        assert!(plan.is_single());
        assert_eq!(plan.chunks[0].start, 0);
        assert_eq!(plan.chunks[0].end, text.len());
    }

    #[test]
    fn test_chunks_cover_text_contiguously_with_overlap() {
        let text = paragraphs(40);
        let estimator = TokenEstimator::default();
        let overlap = 30;
        let plan = calculate_splits(&text, &estimator, 60, overlap);
        assert!(plan.chunks.len() > 1);

        assert_eq!(plan.chunks[0].start, 0);
        assert_eq!(plan.chunks.last().map(|c| c.end), Some(text.len()));
        for pair in plan.chunks.windows(2) {
            // Next chunk starts inside the overlap window of the previous
            // boundary: no gaps, no re-reading beyond the window.
            assert!(pair[1].start <= pair[0].end);
            assert!(pair[0].end - pair[1].start <= overlap);
            assert!(pair[1].end > pair[0].end);
        }

        // Concatenating each chunk minus its carried overlap reconstructs
        // the original text.
        let mut rebuilt = String::new();
        let mut consumed = 0usize;
        for chunk in &plan.chunks {
            rebuilt.push_str(&text[consumed.max(chunk.start)..chunk.end]);
            consumed = chunk.end;
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_no_chunk_exceeds_ceiling() {
        let text = paragraphs(40);
        let estimator = TokenEstimator::default();
        let plan = calculate_splits(&text, &estimator, 60, 20);
        for chunk in &plan.chunks {
            if !chunk.oversized {
                assert!(chunk.approx_tokens <= 60);
                assert!(estimator.estimate(plan.slice(&text, chunk)) <= 60);
            }
        }
    }

    #[test]
    fn test_oversized_sentence_is_flagged_not_dropped() {
        // One giant unbreakable "sentence" with no terminators.
        let text = "word ".repeat(500);
        let plan = calculate_splits(text.trim_end(), &TokenEstimator::default(), 50, 10);
        assert!(plan.has_oversized());
        assert_eq!(plan.chunks.last().map(|c| c.end), Some(text.trim_end().len()));
    }

    #[test]
    fn test_oversized_paragraph_falls_back_to_sentences() {
        let sentences: String = (0..30)
            .map(|i| format!("Sentence number {} carries several plain words. ", i))
            .collect();
        let estimator = TokenEstimator::default();
        let plan = calculate_splits(&sentences, &estimator, 40, 0);
        assert!(plan.chunks.len() > 1);
        assert!(!plan.has_oversized());
    }

    #[test]
    fn test_overlap_never_before_position_zero() {
        let text = paragraphs(10);
        let plan = calculate_splits(&text, &TokenEstimator::default(), 30, 10_000);
        for chunk in &plan.chunks {
            assert!(chunk.start <= chunk.end);
        }
        assert_eq!(plan.chunks[0].start, 0);
    }

    #[test]
    fn test_multibyte_text_stays_on_char_boundaries() {
        let text = "καλημέρα κόσμε. ".repeat(80);
        let plan = calculate_splits(&text, &TokenEstimator::default(), 50, 7);
        for chunk in &plan.chunks {
            assert!(text.is_char_boundary(chunk.start));
            assert!(text.is_char_boundary(chunk.end));
        }
    }

    #[test]
    fn test_overlap_counts_characters_not_bytes() {
        // Greek letters are two bytes each; the carried overlap must still
        // span the configured number of characters.
        let text = "καλημέρα κόσμε. ".repeat(80);
        let overlap = 7;
        let plan = calculate_splits(&text, &TokenEstimator::default(), 50, overlap);
        assert!(plan.chunks.len() > 1);
        for pair in plan.chunks.windows(2) {
            assert_eq!(text[pair[1].start..pair[0].end].chars().count(), overlap);
        }
    }
}
