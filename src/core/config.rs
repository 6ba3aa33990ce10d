use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub llm: LlmConfig,

    #[serde(default)]
    pub parser: ParserConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub standardization: StandardizationConfig,

    #[serde(default)]
    pub tuning: TuningConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    /// "deepseek", "openai" or "ollama"
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    pub api_key: Option<String>,
    pub api_key_file: Option<String>,
    pub base_url: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ParserConfig {
    /// Ordered chapter-title matchers. Evaluation order breaks offset ties.
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,

    #[serde(default = "default_min_chapter_length")]
    pub min_chapter_length: usize,

    #[serde(default = "default_clean_text")]
    pub clean_text: bool,

    /// Titles containing any of these are author announcements, not chapters.
    #[serde(default = "default_announcement_keywords")]
    pub announcement_keywords: Vec<String>,

    #[serde(default = "default_prologue_patterns")]
    pub prologue_patterns: Vec<String>,

    #[serde(default = "default_epilogue_patterns")]
    pub epilogue_patterns: Vec<String>,

    #[serde(default = "default_parser_output_dir")]
    pub output_dir: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            patterns: default_patterns(),
            min_chapter_length: default_min_chapter_length(),
            clean_text: default_clean_text(),
            announcement_keywords: default_announcement_keywords(),
            prologue_patterns: default_prologue_patterns(),
            epilogue_patterns: default_epilogue_patterns(),
            output_dir: default_parser_output_dir(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_relevant_chapters")]
    pub max_relevant_chapters: usize,

    #[serde(default = "default_characters_output_dir")]
    pub output_dir: String,

    #[serde(default = "default_save_results")]
    pub save_results: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_relevant_chapters: default_max_relevant_chapters(),
            output_dir: default_characters_output_dir(),
            save_results: default_save_results(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StandardizeMode {
    /// Every extracted character.
    #[default]
    All,
    /// Only characters still lacking an appearance or face description.
    Missing,
    /// Protagonists only.
    Main,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StandardizationConfig {
    #[serde(default = "default_standardization_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub mode: StandardizeMode,
}

impl Default for StandardizationConfig {
    fn default() -> Self {
        Self {
            enabled: default_standardization_enabled(),
            mode: StandardizeMode::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TuningConfig {
    /// Edit-log capacity; the oldest entry is evicted past this.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    #[serde(default = "default_auto_validate")]
    pub auto_validate: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            auto_validate: default_auto_validate(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_characters_output_dir")]
    pub dir: String,

    /// Back up a pre-existing export target to "<path>.bak" before overwrite.
    #[serde(default = "default_backup")]
    pub backup: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_characters_output_dir(),
            backup: default_backup(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}
fn default_model() -> String {
    "deepseek-chat".to_string()
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    2
}
fn default_timeout() -> u64 {
    30
}

fn default_patterns() -> Vec<String> {
    vec![
        r"第\s*[一二三四五六七八九十百千万\d]+\s*[章节回].*?\n".to_string(),
        r"序\s*章.*?\n".to_string(),
        r"尾\s*声.*?\n".to_string(),
        r"后\s*记.*?\n".to_string(),
    ]
}
fn default_min_chapter_length() -> usize {
    10
}
fn default_clean_text() -> bool {
    true
}
fn default_announcement_keywords() -> Vec<String> {
    ["更新", "加精", "推荐", "感谢", "支持", "召开", "投票", "冲榜", "书友", "谢谢"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_prologue_patterns() -> Vec<String> {
    vec![
        r"序\s*章".to_string(),
        r"前\s*言".to_string(),
        r"引\s*子".to_string(),
    ]
}
fn default_epilogue_patterns() -> Vec<String> {
    vec![
        r"尾\s*声".to_string(),
        r"后\s*记".to_string(),
        r"结\s*语".to_string(),
    ]
}
fn default_parser_output_dir() -> String {
    "data/processed".to_string()
}

fn default_batch_size() -> usize {
    5
}
fn default_max_relevant_chapters() -> usize {
    10
}
fn default_characters_output_dir() -> String {
    "data/characters".to_string()
}
fn default_save_results() -> bool {
    true
}
fn default_standardization_enabled() -> bool {
    true
}
fn default_history_size() -> usize {
    10
}
fn default_auto_validate() -> bool {
    true
}
fn default_backup() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let yaml = "llm:\n  provider: deepseek\n";
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();

        assert_eq!(config.llm.model, "deepseek-chat");
        assert_eq!(config.llm.retry_count, 3);
        assert_eq!(config.parser.min_chapter_length, 10);
        assert_eq!(config.parser.patterns.len(), 4);
        assert_eq!(config.extraction.batch_size, 5);
        assert_eq!(config.extraction.max_relevant_chapters, 10);
        assert!(config.standardization.enabled);
        assert_eq!(config.standardization.mode, StandardizeMode::All);
        assert_eq!(config.tuning.history_size, 10);
        assert!(config.tuning.auto_validate);
        assert!(config.output.backup);
    }

    #[test]
    fn standardize_mode_parses_lowercase() {
        let yaml = "llm:\n  provider: deepseek\nstandardization:\n  mode: missing\n";
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.standardization.mode, StandardizeMode::Missing);
    }
}
