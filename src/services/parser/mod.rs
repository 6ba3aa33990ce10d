pub mod detector;
pub mod metadata;
pub mod normalize;
pub mod numerals;

use crate::core::chapter::{BookInfo, Chapter, ParsedBook};
use crate::core::config::{Config, ParserConfig};
use crate::services::{now_iso, safe_filename};
use anyhow::{bail, Context, Result};
use detector::ChapterDetector;
use log::info;
use metadata::MetadataExtractor;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

const PARSER_VERSION: &str = "0.1";

/// Parses one raw novel source into an ordered, typed chapter collection.
pub struct ChapterParser {
    config: ParserConfig,
    detector: ChapterDetector,
    metadata: MetadataExtractor,
    title_tail: Regex,
}

impl ChapterParser {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            config: config.parser.clone(),
            detector: ChapterDetector::from_config(&config.parser)?,
            metadata: MetadataExtractor::new()?,
            title_tail: Regex::new(r"第[一二三四五六七八九十百千万\d]+[章节回]\s*(.+)")
                .context("Invalid title pattern")?,
        })
    }

    /// Read, segment, and annotate a source file.
    pub fn parse_file(&self, path: &Path) -> Result<ParsedBook> {
        info!("Parsing file: {}", path.display());
        let text = read_source(path)?;
        Ok(self.parse_text(&text, path))
    }

    pub fn parse_text(&self, text: &str, source: &Path) -> ParsedBook {
        let raw_chapters = self.detector.detect(text);

        let mut chapters = Vec::with_capacity(raw_chapters.len());
        let mut total_words = 0usize;

        for (index, (title, content)) in raw_chapters.into_iter().enumerate() {
            let meta = self.metadata.extract(&title, &content);
            total_words += meta.word_count;

            chapters.push(Chapter {
                id: None,
                index,
                title: title.trim().to_string(),
                number: meta.number,
                kind: meta.kind,
                word_count: meta.word_count,
                content,
            });
        }

        let book_info = BookInfo {
            title: self.infer_book_title(source, &chapters),
            total_chapters: chapters.len(),
            total_words,
            source_file: source.display().to_string(),
            processed_date: None,
            version: None,
        };

        info!(
            "Parsed {} chapters, {} characters of text",
            book_info.total_chapters, book_info.total_words
        );

        ParsedBook { book_info, chapters }
    }

    /// Persist the parsed book as YAML, stamping processing metadata and
    /// assigning sequential chapter ids.
    pub fn save(&self, book: &mut ParsedBook, path: Option<&Path>) -> Result<PathBuf> {
        book.book_info.processed_date = Some(now_iso());
        book.book_info.version = Some(PARSER_VERSION.to_string());

        for (i, chapter) in book.chapters.iter_mut().enumerate() {
            chapter.id = Some(format!("ch{:03}", i + 1));
        }

        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Path::new(&self.config.output_dir)
                .join(format!("{}.yaml", safe_filename(&book.book_info.title))),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let content = serde_yaml_ng::to_string(book)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Saved parse result to {}", path.display());
        Ok(path)
    }

    /// Book title: the file stem when it looks like a title, otherwise the
    /// tail of the first chapter heading.
    fn infer_book_title(&self, source: &Path, chapters: &[Chapter]) -> String {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        if stem.chars().count() < 30 && !stem.is_empty() {
            return stem;
        }

        if let Some(first) = chapters.first() {
            if let Some(caps) = self.title_tail.captures(&first.title) {
                return caps[1].trim().to_string();
            }
        }

        stem
    }
}

/// Read a source document to text. Dispatch is by extension; unsupported
/// formats and undecodable bytes are construction failures that abort.
pub fn read_source(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" => {
            let bytes =
                fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            String::from_utf8(bytes)
                .with_context(|| format!("{} is not valid UTF-8 text", path.display()))
        }
        "epub" => read_epub(path),
        other => bail!("Unsupported file format: .{}", other),
    }
}

fn read_epub(path: &Path) -> Result<String> {
    let mut doc = epub::doc::EpubDoc::new(path)
        .map_err(|e| anyhow::anyhow!("Failed to open epub {}: {}", path.display(), e))?;

    let mut text = String::new();
    loop {
        if let Some((content, mimetype)) = doc.get_current_str() {
            match mimetype.as_str() {
                "application/xhtml+xml" | "text/html" => {
                    let plain = html2text::from_read(content.as_bytes(), 500)
                        .map_err(|e| anyhow::anyhow!("Failed to render epub chapter: {}", e))?;
                    text.push_str(&plain);
                    text.push('\n');
                }
                _ => {}
            }
        }
        if !doc.go_next() {
            break;
        }
    }
    Ok(text)
}
