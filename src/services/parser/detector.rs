use crate::core::config::ParserConfig;
use crate::services::parser::normalize::TextNormalizer;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use regex::Regex;

/// Parenthesized positional tag ("（一）", "(上)") marking a split
/// sub-section; such sections bypass the minimum-length filter.
const SUBPART_MARKER: &str = r"[（(][一二三四五六七八九十上中下]+[）)]";

/// Title given to text preceding the first detected boundary.
const LEADING_SECTION_TITLE: &str = "序章";

/// Locates chapter boundaries in raw novel text. Deliberately lossy: it
/// prefers dropping a dubious section over promoting promotional noise to a
/// chapter.
#[derive(Debug)]
pub struct ChapterDetector {
    patterns: Vec<Regex>,
    min_chapter_length: usize,
    announcement_keywords: Vec<String>,
    prologue_patterns: Vec<Regex>,
    epilogue_patterns: Vec<Regex>,
    subpart: Regex,
    normalizer: Option<TextNormalizer>,
}

impl ChapterDetector {
    pub fn from_config(config: &ParserConfig) -> Result<Self> {
        let patterns = compile_all(&config.patterns)?;
        debug!("Loaded {} chapter title patterns", patterns.len());

        Ok(Self {
            patterns,
            min_chapter_length: config.min_chapter_length,
            announcement_keywords: config.announcement_keywords.clone(),
            prologue_patterns: compile_all(&config.prologue_patterns)?,
            epilogue_patterns: compile_all(&config.epilogue_patterns)?,
            subpart: Regex::new(SUBPART_MARKER).context("Invalid sub-part marker pattern")?,
            normalizer: if config.clean_text {
                Some(TextNormalizer::new()?)
            } else {
                None
            },
        })
    }

    /// Split raw text into (title, content) pairs, in document order.
    pub fn detect(&self, text: &str) -> Vec<(String, String)> {
        info!("Detecting chapter boundaries");

        // Every pattern runs over the whole text; ties on the start offset
        // keep pattern-evaluation order (stable sort).
        let mut matches: Vec<(usize, &str)> = Vec::new();
        for pattern in &self.patterns {
            for m in pattern.find_iter(text) {
                matches.push((m.start(), m.as_str()));
            }
        }
        matches.sort_by_key(|(start, _)| *start);

        debug!("Found {} candidate chapter titles", matches.len());

        if matches.is_empty() {
            warn!("No chapter titles found");
            return Vec::new();
        }

        let mut chapters = Vec::new();

        // Text before the first boundary becomes an implicit leading section.
        if matches[0].0 > 0 {
            let leading = text[..matches[0].0].trim();
            if leading.chars().count() >= self.min_chapter_length {
                chapters.push((LEADING_SECTION_TITLE.to_string(), leading.to_string()));
            }
        }

        let total = matches.len();
        for (i, (start, title)) in matches.iter().enumerate() {
            let content_start = start + title.len();
            let content_end = matches.get(i + 1).map_or(text.len(), |(next, _)| *next);
            let content = text[content_start..content_end].trim();

            if self
                .announcement_keywords
                .iter()
                .any(|kw| title.contains(kw.as_str()))
            {
                warn!("Title '{}' looks like an author announcement, skipped", title.trim());
                continue;
            }

            let (title, content) = match &self.normalizer {
                Some(n) => (n.normalize(title), n.normalize(content)),
                None => (title.to_string(), content.to_string()),
            };

            // Prologue-class titles are only plausible near the head of the
            // document, epilogue-class near the tail.
            let is_prologue = self.prologue_patterns.iter().any(|p| p.is_match(&title));
            let is_epilogue = self.epilogue_patterns.iter().any(|p| p.is_match(&title));

            if is_prologue && i as f64 > total as f64 * 0.1 {
                warn!("Title '{}' is not near the start, probably not a prologue, skipped", title.trim());
                continue;
            }
            if is_epilogue && (i as f64) < total as f64 * 0.9 {
                warn!("Title '{}' is not near the end, probably not an epilogue, skipped", title.trim());
                continue;
            }

            let has_subpart_marker = self.subpart.is_match(&title);
            if content.chars().count() >= self.min_chapter_length || has_subpart_marker {
                chapters.push((title, content));
            } else {
                warn!("Chapter '{}' is too short, skipped", title.trim());
            }
        }

        info!("Detected {} valid chapters", chapters.len());
        chapters
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("Invalid chapter pattern: {}", p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ChapterDetector {
        ChapterDetector::from_config(&ParserConfig::default()).unwrap()
    }

    #[test]
    fn splits_three_well_formed_chapters() {
        let text = "第一章 开始\n这是第一章的内容，足够长了可以通过。\n\
                    第二章 发展\n这是第二章的内容，足够长了可以通过。\n\
                    第三章 结束\n这是第三章的内容，足够长了可以通过。\n";
        let chapters = detector().detect(text);

        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].0, "第一章 开始");
        assert_eq!(chapters[1].0, "第二章 发展");
        assert_eq!(chapters[2].0, "第三章 结束");
        assert!(chapters[0].1.contains("第一章的内容"));
        assert!(chapters[2].1.contains("第三章的内容"));
    }

    #[test]
    fn drops_sections_below_minimum_length() {
        let text = "第一章 开始\n内容太短\n\
                    第二章 发展\n这里是足够长的正文内容，可以通过长度检查。\n";
        let chapters = detector().detect(text);

        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].0, "第二章 发展");
    }

    #[test]
    fn subpart_marker_bypasses_length_filter() {
        let text = "第一章 别离（上）\n短\n\
                    第二章 发展\n这里是足够长的正文内容，可以通过长度检查。\n";
        let chapters = detector().detect(text);

        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].0, "第一章 别离（上）");
    }

    #[test]
    fn drops_misplaced_prologue() {
        // A 序章 title deep into the document (index 11 of 12 matches) is
        // past the 10% head window and must be dropped.
        let mut text = String::new();
        for i in ["一", "二", "三", "四", "五", "六", "七", "八", "九", "十", "十一"] {
            text.push_str(&format!("第{}章 标题\n这里是足够长的正文内容，可以通过长度检查。\n", i));
        }
        text.push_str("序章 迟来的序\n这里是足够长的正文内容，可以通过长度检查。\n");

        let chapters = detector().detect(&text);
        assert_eq!(chapters.len(), 11);
        assert!(chapters.iter().all(|(t, _)| !t.contains("序章")));
    }

    #[test]
    fn drops_misplaced_epilogue_but_keeps_final_one() {
        // 尾声 in the middle of the document (index 5 of 12) is dropped; the
        // one at the tail (index 11, past the 90% mark) is kept.
        let mut text = String::new();
        for i in ["一", "二", "三", "四", "五"] {
            text.push_str(&format!("第{}章 标题\n这里是足够长的正文内容，可以通过长度检查。\n", i));
        }
        text.push_str("尾声 过早的尾声\n这里是足够长的正文内容，可以通过长度检查。\n");
        for i in ["六", "七", "八", "九", "十"] {
            text.push_str(&format!("第{}章 标题\n这里是足够长的正文内容，可以通过长度检查。\n", i));
        }
        text.push_str("尾声 真正的尾声\n这里是足够长的正文内容，可以通过长度检查。\n");

        let chapters = detector().detect(&text);
        assert_eq!(chapters.len(), 11);
        assert_eq!(chapters.last().unwrap().0, "尾声 真正的尾声");
        assert!(!chapters.iter().any(|(t, _)| t.contains("过早")));
    }

    #[test]
    fn keeps_prologue_at_document_head() {
        let text = "序章 起源\n这里是足够长的正文内容，可以通过长度检查。\n\
                    第一章 开始\n这里是足够长的正文内容，可以通过长度检查。\n";
        let chapters = detector().detect(text);

        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].0, "序章 起源");
    }

    #[test]
    fn rejects_announcement_titles() {
        let text = "第一章 感谢书友支持\n这里是足够长的正文内容，可以通过长度检查。\n\
                    第二章 发展\n这里是足够长的正文内容，可以通过长度检查。\n";
        let chapters = detector().detect(text);

        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].0, "第二章 发展");
    }

    #[test]
    fn keeps_leading_text_as_implicit_section() {
        let text = "这本书开头有一段没有标题的引入文字，长度是足够的。\n\
                    第一章 开始\n这里是足够长的正文内容，可以通过长度检查。\n";
        let chapters = detector().detect(text);

        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].0, "序章");
        assert!(chapters[0].1.contains("引入文字"));
    }

    #[test]
    fn no_matches_yields_empty_result() {
        let chapters = detector().detect("没有任何章节标题的纯文本。");
        assert!(chapters.is_empty());
    }
}
