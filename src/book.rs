//! Input contract produced by the book parser collaborator.
//!
//! The engine never parses EPUB/PDF itself; it consumes an ordered chapter
//! list plus book metadata and treats both as read-only input to planning.

use serde::{Deserialize, Serialize};

use crate::budget::TokenEstimator;

/// Inclusive page range a chapter occupies in the source book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl PageRange {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    /// Number of pages covered by the range.
    pub fn len(&self) -> u32 {
        self.last.saturating_sub(self.first) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }
}

/// A single chapter as produced by the parser collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    /// 1-based chapter number; doubles as the unit key for chapter phases.
    pub number: u32,
    pub title: String,
    pub pages: PageRange,
    /// Full chapter text.
    pub content: String,
    /// Token count reported by the parser, when it computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
}

impl Chapter {
    /// Token count for budgeting: the parser-provided count when present,
    /// otherwise a conservative estimate of the chapter text.
    pub fn effective_tokens(&self, estimator: &TokenEstimator) -> u64 {
        self.token_count
            .unwrap_or_else(|| estimator.estimate(&self.content))
    }

    /// Unit key used for this chapter in the persisted state.
    pub fn unit_key(&self) -> String {
        format!("chapter-{}", self.number)
    }
}

/// Book-level metadata from the parser collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub total_pages: u32,
    /// Path or identifier of the source file, kept for provenance.
    pub source_file: String,
}

/// Complete parser output: metadata plus the ordered chapter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedBook {
    pub metadata: BookMetadata,
    pub chapters: Vec<Chapter>,
}

impl ParsedBook {
    pub fn new(metadata: BookMetadata, chapters: Vec<Chapter>) -> Self {
        Self { metadata, chapters }
    }

    /// Look up a chapter by number.
    pub fn chapter(&self, number: u32) -> Option<&Chapter> {
        self.chapters.iter().find(|c| c.number == number)
    }
}
