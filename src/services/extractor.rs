use crate::core::chapter::{BookInfo, Chapter};
use crate::core::character::{
    Appearance, BookMetadata, Character, CharacterBook, Importance, TextReference,
};
use crate::core::config::{Config, StandardizeMode};
use crate::services::llm::Llm;
use crate::services::standardizer::FeatureStandardizer;
use crate::services::safe_filename;
use anyhow::{Context, Result};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

const EXTRACTOR_VERSION: &str = "0.01";

/// Per-chapter window: longer contents contribute their head and tail only.
const WINDOW_FULL_LIMIT: usize = 3000;
const WINDOW_HEAD: usize = 2000;
const WINDOW_TAIL: usize = 1000;

/// Builds the character knowledge base from a parsed chapter collection:
/// batched basic extraction, cross-batch merge, detail enrichment for main
/// characters, optional standardization, then finalize and persist.
pub struct CharacterExtractor<'a> {
    config: &'a Config,
    llm: &'a Llm,
    standardizer: FeatureStandardizer<'a>,
}

#[derive(Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    characters: Vec<RawCharacter>,
}

#[derive(Deserialize)]
struct RawCharacter {
    name: String,
    #[serde(default)]
    aliases: Option<Vec<String>>,
    #[serde(default)]
    importance: Option<Importance>,
    #[serde(default)]
    first_appearance: Option<String>,
    #[serde(default)]
    attributes: Option<BTreeMap<String, Option<String>>>,
}

#[derive(Deserialize)]
struct FeaturePayload {
    appearance: Option<RawAppearance>,
}

#[derive(Deserialize)]
struct RawAppearance {
    #[serde(default)]
    face: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    clothing: Option<String>,
    #[serde(default)]
    text_references: Option<Vec<TextReference>>,
}

impl<'a> CharacterExtractor<'a> {
    pub fn new(config: &'a Config, llm: &'a Llm) -> Self {
        Self {
            config,
            llm,
            standardizer: FeatureStandardizer::new(llm),
        }
    }

    /// Run the full pipeline over an ordered chapter collection. Chapters and
    /// batches are processed strictly in input order; the merge outcome
    /// depends on it.
    pub async fn extract_from_chapters(
        &self,
        chapters: &[Chapter],
        book_info: Option<&BookInfo>,
    ) -> Result<CharacterBook> {
        info!("Extracting characters from {} chapters", chapters.len());

        let mut characters = self.extract_basic(chapters).await;
        info!("Merged into {} distinct characters", characters.len());

        self.enrich(&mut characters, chapters).await;

        if self.config.standardization.enabled {
            self.standardize_pass(&mut characters).await;
        }

        let book = CharacterBook {
            metadata: BookMetadata {
                total_characters: characters.len(),
                main_characters: characters
                    .iter()
                    .filter(|c| c.importance == Importance::Protagonist)
                    .count(),
                extraction_date: Some(Local::now().format("%Y-%m-%d").to_string()),
                version: Some(EXTRACTOR_VERSION.to_string()),
                book_title: book_info.map(|b| b.title.clone()),
                last_edited: None,
            },
            characters,
            edit_history: Vec::new(),
        };

        if self.config.extraction.save_results {
            self.save(&book)?;
        }

        Ok(book)
    }

    /// Stage 1: one generation request per fixed-size chapter batch. A batch
    /// whose request or parse fails is skipped; the pipeline continues.
    async fn extract_basic(&self, chapters: &[Chapter]) -> Vec<Character> {
        let batch_size = self.config.extraction.batch_size.max(1);
        let total_batches = (chapters.len() + batch_size - 1) / batch_size;
        info!("Basic extraction over {} batches", total_batches);

        let bar = progress_bar(total_batches as u64);
        let mut raw_characters = Vec::new();

        for (i, batch) in chapters.chunks(batch_size).enumerate() {
            let batch_num = i + 1;
            let window = prepare_chapters_text(batch.iter());
            let (system, user) = extraction_prompt(&window);

            let parsed = self
                .llm
                .query(&system, &user, true)
                .await
                .and_then(|response| {
                    serde_json::from_str::<ExtractionPayload>(&response)
                        .context("Malformed character extraction response")
                });

            match parsed {
                Ok(payload) => {
                    info!(
                        "Batch {}/{} extracted {} characters",
                        batch_num,
                        total_batches,
                        payload.characters.len()
                    );
                    raw_characters.extend(payload.characters);
                }
                Err(e) => {
                    error!("Batch {}/{} extraction failed: {:#}", batch_num, total_batches, e);
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        merge_characters(raw_characters)
    }

    /// Stage 2: appearance enrichment for protagonists and supporting
    /// characters. Minor characters are never enriched.
    async fn enrich(&self, characters: &mut [Character], chapters: &[Chapter]) {
        let targets: Vec<usize> = characters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.importance.is_main())
            .map(|(i, _)| i)
            .collect();

        info!("Extracting detailed features for {} characters", targets.len());
        let bar = progress_bar(targets.len() as u64);

        for idx in targets {
            let name = characters[idx].name.clone();
            let relevant = relevant_chapters(
                &characters[idx],
                chapters,
                self.config.extraction.max_relevant_chapters,
            );
            let window = prepare_chapters_text(relevant.into_iter());
            let (system, user) = feature_prompt(&name, &window);

            let parsed = self
                .llm
                .query(&system, &user, true)
                .await
                .and_then(|response| {
                    serde_json::from_str::<FeaturePayload>(&response)
                        .context("Malformed feature extraction response")
                });

            match parsed {
                Ok(payload) => {
                    if let Some(raw) = payload.appearance {
                        apply_appearance(&mut characters[idx].appearance, raw);
                    }
                    info!("Feature extraction for '{}' complete", name);
                }
                Err(e) => {
                    error!("Feature extraction for '{}' failed: {:#}", name, e);
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
    }

    /// Stage 3: policy-gated standardization pass.
    async fn standardize_pass(&self, characters: &mut [Character]) {
        let mode = self.config.standardization.mode;
        let targets: Vec<usize> = characters
            .iter()
            .enumerate()
            .filter(|(_, c)| match mode {
                StandardizeMode::All => true,
                StandardizeMode::Missing => {
                    c.appearance.is_empty()
                        || c.appearance.face.as_deref().map_or(true, |f| f.is_empty())
                }
                StandardizeMode::Main => c.importance == Importance::Protagonist,
            })
            .map(|(i, _)| i)
            .collect();

        info!("Standardizing features for {} characters", targets.len());
        let bar = progress_bar(targets.len() as u64);

        for idx in targets {
            let name = characters[idx].name.clone();
            if let Err(e) = self.standardizer.standardize(&mut characters[idx]).await {
                error!("Standardization for '{}' failed: {:#}", name, e);
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
    }

    fn save(&self, book: &CharacterBook) -> Result<PathBuf> {
        let filename = match book.metadata.book_title.as_deref() {
            Some(title) if !title.is_empty() => format!("{}_characters.json", title),
            _ => format!(
                "characters_{}.json",
                Local::now().format("%Y-%m-%d")
            ),
        };

        let dir = Path::new(&self.config.extraction.output_dir);
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let path = dir.join(safe_filename(&filename));
        fs::write(&path, serde_json::to_string_pretty(book)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Saved character book to {}", path.display());
        Ok(path)
    }
}

/// Deterministic cross-batch merge. Name is the dedup key; aliases union in
/// first-seen order; attributes fill forward (a later value lands only in an
/// empty slot); the first non-empty first_appearance wins. Ids are assigned
/// sequentially in merge order afterwards.
fn merge_characters(raw_characters: Vec<RawCharacter>) -> Vec<Character> {
    let mut merged: Vec<Character> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for raw in raw_characters {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            continue;
        }

        let idx = match by_name.get(&name) {
            Some(&idx) => idx,
            None => {
                let idx = merged.len();
                by_name.insert(name.clone(), idx);
                merged.push(Character {
                    name,
                    importance: raw.importance.unwrap_or_default(),
                    ..Character::default()
                });
                idx
            }
        };

        let character = &mut merged[idx];

        for alias in raw.aliases.unwrap_or_default() {
            if !alias.is_empty() && !character.aliases.contains(&alias) {
                character.aliases.push(alias);
            }
        }

        for (key, value) in raw.attributes.unwrap_or_default() {
            let incoming = value.filter(|v| !v.is_empty());
            if incoming.is_none() {
                continue;
            }
            let slot = character.attributes.entry(key).or_insert(None);
            if slot.as_deref().map_or(true, |v| v.is_empty()) {
                *slot = incoming;
            }
        }

        if character.first_appearance.is_none() {
            character.first_appearance = raw.first_appearance.filter(|v| !v.is_empty());
        }
    }

    for (i, character) in merged.iter_mut().enumerate() {
        character.id = format!("char{:03}", i + 1);
    }
    merged
}

/// Per-chapter headers and separators around a bounded content window.
fn prepare_chapters_text<'c, I>(chapters: I) -> String
where
    I: Iterator<Item = &'c Chapter>,
{
    let mut text = String::new();
    for chapter in chapters {
        text.push_str(&format!("章节: {}\n\n", chapter.title));

        let count = chapter.content.chars().count();
        if count > WINDOW_FULL_LIMIT {
            let head: String = chapter.content.chars().take(WINDOW_HEAD).collect();
            let tail: String = chapter.content.chars().skip(count - WINDOW_TAIL).collect();
            text.push_str(&format!("{}...\n...\n{}\n\n", head, tail));
        } else {
            text.push_str(&chapter.content);
            text.push_str("\n\n");
        }

        text.push_str("---\n\n");
    }
    text
}

/// Chapters mentioning the character by name or alias, in original order,
/// truncated to `max`. No relevance ranking.
fn relevant_chapters<'c>(
    character: &Character,
    chapters: &'c [Chapter],
    max: usize,
) -> Vec<&'c Chapter> {
    let mut names: Vec<&str> = vec![character.name.as_str()];
    names.extend(character.aliases.iter().map(|a| a.as_str()));

    chapters
        .iter()
        .filter(|ch| names.iter().any(|n| !n.is_empty() && ch.content.contains(n)))
        .take(max)
        .collect()
}

/// Explicit per-field update: a returned value overwrites, an absent one
/// leaves the field untouched.
fn apply_appearance(appearance: &mut Appearance, raw: RawAppearance) {
    if let Some(face) = raw.face {
        appearance.face = Some(face);
    }
    if let Some(body) = raw.body {
        appearance.body = Some(body);
    }
    if let Some(clothing) = raw.clothing {
        appearance.clothing = Some(clothing);
    }
    if let Some(refs) = raw.text_references {
        appearance.text_references = refs;
    }
}

fn extraction_prompt(chapters_text: &str) -> (String, String) {
    let system = "你是一个专业的文学分析助手，擅长从小说文本中提取角色信息。\
                  你的任务是从提供的小说章节中识别所有角色，并按重要性分类。\
                  请严格按照指定的JSON格式返回结果，不要添加任何额外的解释或评论。"
        .to_string();

    let user = format!(
        "请从以下小说章节中识别所有角色，并提供他们的基本信息。\n\n\
         小说章节:\n```\n{}\n```\n\n\
         请以JSON格式返回结果，必须包含以下字段:\n\n\
         ```json\n\
         {{\n\
           \"characters\": [\n\
             {{\n\
               \"name\": \"角色名称\",\n\
               \"aliases\": [\"可能的别名1\", \"可能的别名2\"],\n\
               \"importance\": \"主角/配角/次要角色\",\n\
               \"first_appearance\": \"首次出现的章节标题或位置\",\n\
               \"attributes\": {{\n\
                 \"gender\": \"性别\",\n\
                 \"age\": \"年龄描述\",\n\
                 \"occupation\": \"职业或身份\"\n\
               }}\n\
             }}\n\
           ]\n\
         }}\n\
         ```\n\n\
         重要说明:\n\
         1. 只识别有名字的角色，忽略匿名角色\n\
         2. 主角是故事的核心人物，配角是对故事有重要影响的人物，次要角色是短暂出现或影响有限的人物\n\
         3. 如果某些信息无法确定，使用null值\n\
         4. 确保JSON格式正确，可以被直接解析",
        chapters_text
    );

    (system, user)
}

fn feature_prompt(character_name: &str, chapters_text: &str) -> (String, String) {
    let system = "你是一个专业的文学分析助手，擅长从小说文本中提取角色的外观特征描述。\
                  你的任务是从提供的小说章节中提取指定角色的外观特征。\
                  请严格按照指定的JSON格式返回结果，不要添加任何额外的解释或评论。"
        .to_string();

    let user = format!(
        "请从以下小说章节中提取角色\"{}\"的外观特征描述。\n\n\
         小说章节:\n```\n{}\n```\n\n\
         请以JSON格式返回结果，必须包含以下字段:\n\n\
         ```json\n\
         {{\n\
           \"appearance\": {{\n\
             \"face\": \"面部特征描述，包括原文中提及的所有细节\",\n\
             \"body\": \"体型特征描述，包括身高、体格、姿态等\",\n\
             \"clothing\": \"服饰特征描述，包括常见着装、特殊装饰等\",\n\
             \"text_references\": [\n\
               {{\n\
                 \"description\": \"原文中的描述片段\",\n\
                 \"context\": \"描述出现的上下文\"\n\
               }}\n\
             ]\n\
           }}\n\
         }}\n\
         ```\n\n\
         重要说明:\n\
         1. 尽可能提取原文中的所有描述，保持原文表述\n\
         2. text_references字段应包含原文中的直接引用，以便验证\n\
         3. 如果某些信息在文本中未提及，使用null值\n\
         4. 确保JSON格式正确，可以被直接解析",
        character_name, chapters_text
    );

    (system, user)
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}") {
        bar.set_style(style);
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chapter::ChapterType;
    use crate::services::llm::LlmClient;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn raw(name: &str, aliases: &[&str], importance: Option<Importance>) -> RawCharacter {
        RawCharacter {
            name: name.to_string(),
            aliases: Some(aliases.iter().map(|s| s.to_string()).collect()),
            importance,
            first_appearance: None,
            attributes: None,
        }
    }

    fn chapter(index: usize, title: &str, content: &str) -> Chapter {
        Chapter {
            id: None,
            index,
            title: title.to_string(),
            number: Some(index as u64 + 1),
            kind: ChapterType::Chapter,
            word_count: content.chars().count(),
            content: content.to_string(),
        }
    }

    #[test]
    fn merge_unions_aliases_and_assigns_ids() {
        let merged = merge_characters(vec![
            raw("林远", &["小远"], Some(Importance::Protagonist)),
            raw("苏晴", &[], Some(Importance::Supporting)),
            raw("林远", &["远哥", "小远"], None),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "char001");
        assert_eq!(merged[0].name, "林远");
        assert_eq!(merged[0].aliases, vec!["小远", "远哥"]);
        assert_eq!(merged[0].importance, Importance::Protagonist);
        assert_eq!(merged[1].id, "char002");
    }

    #[test]
    fn merge_is_idempotent_on_identical_input() {
        let build = || {
            vec![
                raw("林远", &["小远"], Some(Importance::Protagonist)),
                raw("苏晴", &["晴儿"], Some(Importance::Supporting)),
            ]
        };

        let mut doubled = build();
        doubled.extend(build());

        let once = merge_characters(build());
        let twice = merge_characters(doubled);

        assert_eq!(once, twice);
    }

    #[test]
    fn merge_fills_attributes_forward_only() {
        let mut first = raw("林远", &[], None);
        first.attributes = Some(BTreeMap::from([
            ("gender".to_string(), Some("男".to_string())),
            ("age".to_string(), None),
        ]));
        let mut second = raw("林远", &[], None);
        second.attributes = Some(BTreeMap::from([
            ("gender".to_string(), Some("女".to_string())),
            ("age".to_string(), Some("二十岁".to_string())),
        ]));

        let merged = merge_characters(vec![first, second]);
        assert_eq!(merged[0].attribute("gender"), Some("男"));
        assert_eq!(merged[0].attribute("age"), Some("二十岁"));
    }

    #[test]
    fn merge_keeps_first_nonempty_first_appearance() {
        let mut first = raw("林远", &[], None);
        first.first_appearance = Some("".to_string());
        let mut second = raw("林远", &[], None);
        second.first_appearance = Some("第一章".to_string());
        let mut third = raw("林远", &[], None);
        third.first_appearance = Some("第三章".to_string());

        let merged = merge_characters(vec![first, second, third]);
        assert_eq!(merged[0].first_appearance.as_deref(), Some("第一章"));
    }

    #[test]
    fn window_truncates_long_chapters() {
        let long_content: String = "文".repeat(4000);
        let ch = chapter(0, "第一章", &long_content);
        let window = prepare_chapters_text(std::iter::once(&ch));

        assert!(window.starts_with("章节: 第一章\n\n"));
        assert!(window.contains("...\n...\n"));
        // 2000-char head + 1000-char tail, not the full 4000.
        let body_chars = window.chars().filter(|c| *c == '文').count();
        assert_eq!(body_chars, 3000);
        assert!(window.trim_end().ends_with("---"));
    }

    #[test]
    fn relevant_chapters_match_name_or_alias_in_order() {
        let chapters = vec![
            chapter(0, "第一章", "林远出场了。"),
            chapter(1, "第二章", "无关的内容。"),
            chapter(2, "第三章", "大家都叫他小远。"),
        ];
        let mut character = Character {
            name: "林远".to_string(),
            ..Character::default()
        };
        character.aliases.push("小远".to_string());

        let relevant = relevant_chapters(&character, &chapters, 10);
        assert_eq!(relevant.len(), 2);
        assert_eq!(relevant[0].index, 0);
        assert_eq!(relevant[1].index, 2);

        let capped = relevant_chapters(&character, &chapters, 1);
        assert_eq!(capped.len(), 1);
    }

    #[derive(Debug)]
    struct MockLlm {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn chat(&self, _system: &str, user: &str, _json_mode: bool) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if user.contains("识别所有角色") {
                if n == 0 {
                    // First extraction batch.
                    Ok(r#"{"characters": [
                        {"name": "林远", "aliases": ["小远"], "importance": "主角",
                         "first_appearance": "第一章",
                         "attributes": {"gender": "男", "age": null, "occupation": null}}
                    ]}"#
                        .to_string())
                } else {
                    // Second batch: unusable response; the batch is skipped.
                    Ok("完全不是JSON的回答".to_string())
                }
            } else if user.contains("外观特征描述") {
                Ok(r#"{"appearance": {"face": "剑眉星目", "body": "身材挺拔",
                       "clothing": null, "text_references": []}}"#
                    .to_string())
            } else {
                Err(anyhow!("unexpected prompt"))
            }
        }
    }

    fn test_config() -> Config {
        let yaml = "llm:\n  provider: deepseek\n\
                    extraction:\n  batch_size: 2\n  save_results: false\n\
                    standardization:\n  enabled: false\n";
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn pipeline_skips_failed_batches_and_enriches_main_characters() {
        let config = test_config();
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = Llm::with_client(
            Box::new(MockLlm { calls: calls.clone() }),
            1,
            Duration::from_millis(0),
        );
        let extractor = CharacterExtractor::new(&config, &llm);

        let chapters = vec![
            chapter(0, "第一章", "林远在长街上出场了，少年眉目清朗。"),
            chapter(1, "第二章", "小远继续他的旅程，风尘仆仆。"),
            chapter(2, "第三章", "别人的故事，与主角无关。"),
        ];

        let book = extractor.extract_from_chapters(&chapters, None).await.unwrap();

        // Batch 2 failed to parse and was skipped, not fatal.
        assert_eq!(book.characters.len(), 1);
        let hero = &book.characters[0];
        assert_eq!(hero.id, "char001");
        assert_eq!(hero.importance, Importance::Protagonist);
        assert_eq!(hero.first_appearance.as_deref(), Some("第一章"));

        // Enrichment landed on the protagonist.
        assert_eq!(hero.appearance.face.as_deref(), Some("剑眉星目"));
        assert_eq!(hero.appearance.body.as_deref(), Some("身材挺拔"));
        assert!(hero.appearance.clothing.is_none());

        assert_eq!(book.metadata.total_characters, 1);
        assert_eq!(book.metadata.main_characters, 1);
        assert!(book.metadata.extraction_date.is_some());

        // Two extraction batches + one enrichment request.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
