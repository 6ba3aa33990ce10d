use serde::{Deserialize, Serialize};

/// Positional class of a section within the source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChapterType {
    Prologue,
    Epilogue,
    #[default]
    Chapter,
}

/// A titled, contiguous span of the source document. Built once by the
/// parsing pipeline and treated as read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    /// Zero-padded id ("ch001"), assigned when the parsed book is saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub index: usize,
    pub title: String,
    /// Ordinal parsed from the title, when one could be found.
    #[serde(default)]
    pub number: Option<u64>,
    #[serde(rename = "type", default)]
    pub kind: ChapterType,
    /// Content length in Unicode scalar values, punctuation included.
    pub word_count: usize,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookInfo {
    pub title: String,
    pub total_chapters: usize,
    pub total_words: usize,
    pub source_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The persisted result of parsing one source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedBook {
    pub book_info: BookInfo,
    pub chapters: Vec<Chapter>,
}
