use crate::core::chapter::ChapterType;
use crate::services::parser::numerals::{chinese_to_int, contains_chinese_numeral};
use anyhow::{Context, Result};
use log::debug;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterMeta {
    pub number: Option<u64>,
    pub kind: ChapterType,
    pub word_count: usize,
}

/// Derives ordinal number, type classification and size from a chapter's
/// (title, content) pair.
#[derive(Debug)]
pub struct MetadataExtractor {
    number_patterns: Vec<Regex>,
    type_patterns: Vec<(ChapterType, Vec<Regex>)>,
}

impl MetadataExtractor {
    pub fn new() -> Result<Self> {
        let number_patterns = vec![
            Regex::new(r"第\s*([一二三四五六七八九十百千万\d]+)\s*[章节回]")
                .context("Invalid number pattern")?,
            Regex::new(r"^(\d+)[、.\s]").context("Invalid number pattern")?,
        ];

        // Classification priority is fixed: prologue, then epilogue, then
        // ordinary chapter. First matching class wins.
        let type_patterns = vec![
            (
                ChapterType::Prologue,
                compile(&[r"序\s*章", r"前\s*言", r"引\s*子"])?,
            ),
            (
                ChapterType::Epilogue,
                compile(&[r"尾\s*声", r"后\s*记", r"结\s*语"])?,
            ),
            (
                ChapterType::Chapter,
                compile(&[r"第\s*[一二三四五六七八九十百千万\d]+\s*[章节回]"])?,
            ),
        ];

        Ok(Self {
            number_patterns,
            type_patterns,
        })
    }

    pub fn extract(&self, title: &str, content: &str) -> ChapterMeta {
        let meta = ChapterMeta {
            number: self.extract_number(title),
            kind: self.identify_type(title),
            word_count: content.chars().count(),
        };
        debug!("Extracted metadata for '{}': {:?}", title.trim(), meta);
        meta
    }

    fn extract_number(&self, title: &str) -> Option<u64> {
        for pattern in &self.number_patterns {
            if let Some(caps) = pattern.captures(title) {
                let num_str = &caps[1];

                if contains_chinese_numeral(num_str) {
                    return Some(chinese_to_int(num_str));
                }
                // ASCII digits; a non-parsing capture falls through to the
                // next pattern.
                if let Ok(n) = num_str.parse::<u64>() {
                    return Some(n);
                }
            }
        }
        None
    }

    fn identify_type(&self, title: &str) -> ChapterType {
        for (kind, patterns) in &self.type_patterns {
            if patterns.iter().any(|p| p.is_match(title)) {
                return *kind;
            }
        }
        ChapterType::Chapter
    }
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("Invalid type pattern: {}", p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> MetadataExtractor {
        MetadataExtractor::new().unwrap()
    }

    #[test]
    fn extracts_arabic_chapter_number() {
        let meta = extractor().extract("第3章 标题", "正文内容");
        assert_eq!(meta.number, Some(3));
        assert_eq!(meta.kind, ChapterType::Chapter);
        assert_eq!(meta.word_count, 4);
    }

    #[test]
    fn extracts_chinese_chapter_number() {
        let meta = extractor().extract("第十二章 标题", "内容");
        assert_eq!(meta.number, Some(12));
        assert_eq!(meta.kind, ChapterType::Chapter);

        let meta = extractor().extract("第一百零二回 标题", "内容");
        assert_eq!(meta.number, Some(102));
    }

    #[test]
    fn extracts_bare_leading_number() {
        let meta = extractor().extract("12、标题", "内容");
        assert_eq!(meta.number, Some(12));
        assert_eq!(meta.kind, ChapterType::Chapter);
    }

    #[test]
    fn missing_number_is_none_not_error() {
        let meta = extractor().extract("尾声", "内容");
        assert_eq!(meta.number, None);
        assert_eq!(meta.kind, ChapterType::Epilogue);
    }

    #[test]
    fn classifies_prologue_before_chapter() {
        assert_eq!(extractor().extract("序章", "内容").kind, ChapterType::Prologue);
        assert_eq!(extractor().extract("引子", "内容").kind, ChapterType::Prologue);
        assert_eq!(extractor().extract("后记", "内容").kind, ChapterType::Epilogue);
    }

    #[test]
    fn word_count_is_code_points_including_punctuation() {
        let meta = extractor().extract("第一章", "你好，世界！");
        assert_eq!(meta.word_count, 6);
    }
}
