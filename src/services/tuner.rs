use crate::core::character::{
    Character, CharacterBook, EditLogEntry, FeatureEditRecord, TuneOp,
};
use crate::core::config::Config;
use crate::services::llm::Llm;
use crate::services::{now_iso, safe_filename};
use anyhow::{Context, Result};
use chrono::Local;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Features every portrait-ready character must carry.
pub const REQUIRED_FEATURES: [&str; 6] =
    ["face_shape", "eyes", "nose", "mouth", "eyebrows", "skin"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub missing_features: Vec<String>,
    pub inconsistencies: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Stateful editor over a loaded character collection. Applied edits live in
/// the collection's bounded edit-log; undone edits wait on an in-memory
/// redo-log that any new mutation clears. History is strictly linear.
pub struct CharacterTuner<'a> {
    config: &'a Config,
    llm: &'a Llm,
    book: Option<CharacterBook>,
    redo_log: Vec<EditLogEntry>,
}

#[derive(Deserialize)]
struct EditedPayload {
    edited_feature: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct RegeneratePayload {
    regenerated_appearance: Option<RegeneratedAppearance>,
}

#[derive(Deserialize)]
struct RegeneratedAppearance {
    #[serde(default)]
    face: Option<String>,
    #[serde(default)]
    structured_features: Option<BTreeMap<String, Option<String>>>,
}

#[derive(Deserialize)]
struct BatchEditPayload {
    batch_edits: Option<Vec<BatchEdit>>,
}

#[derive(Deserialize)]
struct BatchEdit {
    character_id: Option<String>,
    edited_feature: Option<String>,
}

impl<'a> CharacterTuner<'a> {
    pub fn new(config: &'a Config, llm: &'a Llm) -> Self {
        Self {
            config,
            llm,
            book: None,
            redo_log: Vec::new(),
        }
    }

    /// Load a persisted character collection; returns the character count.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let book: CharacterBook = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let count = book.characters.len();
        info!("Loaded {} characters from {}", count, path.display());

        self.book = Some(book);
        self.redo_log.clear();
        Ok(count)
    }

    pub fn book(&self) -> Option<&CharacterBook> {
        self.book.as_ref()
    }

    /// Exact-match filtering over flat ("importance") or dot-path nested
    /// ("attributes.gender") fields. No partial matching.
    pub fn list(&self, filter: &BTreeMap<String, String>) -> Vec<&Character> {
        let Some(book) = &self.book else {
            error!("No character data loaded");
            return Vec::new();
        };

        if filter.is_empty() {
            return book.characters.iter().collect();
        }
        book.characters
            .iter()
            .filter(|c| matches_filter(c, filter))
            .collect()
    }

    pub fn get(&self, character_id: &str) -> Option<&Character> {
        let Some(book) = &self.book else {
            error!("No character data loaded");
            return None;
        };
        let found = book.get(character_id);
        if found.is_none() {
            warn!("No character with id {}", character_id);
        }
        found
    }

    /// Directly set one structured feature, recording the change in the
    /// character-local trail and the global edit-log. Clears the redo-log.
    pub fn edit_feature(
        &mut self,
        character_id: &str,
        feature: &str,
        new_value: &str,
    ) -> Option<Character> {
        let Some(book) = self.book.as_mut() else {
            error!("No character data loaded");
            return None;
        };
        let Some(idx) = book.position(character_id) else {
            warn!("No character with id {}", character_id);
            return None;
        };

        let timestamp = now_iso();
        let character = &mut book.characters[idx];
        let old_value = character
            .appearance
            .structured_features
            .get(feature)
            .cloned();

        character
            .appearance
            .structured_features
            .insert(feature.to_string(), new_value.to_string());
        character.appearance.user_edited = true;
        character.appearance.edit_history.push(FeatureEditRecord {
            timestamp: timestamp.clone(),
            operation: "edit".to_string(),
            feature: Some(feature.to_string()),
            old_value: old_value.clone(),
            new_value: Some(new_value.to_string()),
            ..Default::default()
        });
        let name = character.name.clone();

        self.record(EditLogEntry {
            timestamp,
            character_id: character_id.to_string(),
            op: TuneOp::EditFeature {
                feature: feature.to_string(),
                old_value,
                new_value: new_value.to_string(),
            },
        });

        if self.config.tuning.auto_validate {
            let _ = self.validate(character_id);
        }

        info!("Edited feature '{}' of '{}'", feature, name);
        self.get(character_id).cloned()
    }

    /// Rewrite one feature through the generation service, keeping the
    /// character's other features in the prompt for consistency. The parsed
    /// value funnels through `edit_feature`.
    pub async fn edit_feature_with_prompt(
        &mut self,
        character_id: &str,
        feature: &str,
        instruction: &str,
    ) -> Option<Character> {
        let (system, user) = {
            let character = self.get(character_id)?;
            feature_edit_prompt(character, feature, instruction)
        };

        let response = match self.llm.query(&system, &user, true).await {
            Ok(r) => r,
            Err(e) => {
                error!("Feature edit failed: {:#}", e);
                return None;
            }
        };

        let payload: EditedPayload = match serde_json::from_str(&response) {
            Ok(p) => p,
            Err(e) => {
                error!("Feature edit failed: malformed response: {}", e);
                return None;
            }
        };

        match payload.edited_feature.and_then(|mut m| m.remove(feature)) {
            Some(value) => self.edit_feature(character_id, feature, &value),
            None => {
                error!("Feature edit failed: response missing '{}'", feature);
                None
            }
        }
    }

    /// Regenerate the whole appearance from a prompt. Explicitly kept
    /// features are restored by value over the regenerated result. The
    /// pre-edit appearance snapshot makes the operation invertible.
    pub async fn regenerate_features(
        &mut self,
        character_id: &str,
        prompt: &str,
        keep_features: &[String],
    ) -> Option<Character> {
        let (system, user) = {
            let character = self.get(character_id)?;
            regenerate_prompt(character, prompt, keep_features)
        };

        let response = match self.llm.query(&system, &user, true).await {
            Ok(r) => r,
            Err(e) => {
                error!("Feature regeneration failed: {:#}", e);
                return None;
            }
        };

        let payload: RegeneratePayload = match serde_json::from_str(&response) {
            Ok(p) => p,
            Err(e) => {
                error!("Feature regeneration failed: malformed response: {}", e);
                return None;
            }
        };
        let Some(regenerated) = payload.regenerated_appearance else {
            error!("Feature regeneration failed: unexpected response shape");
            return None;
        };

        let timestamp = now_iso();
        let book = self.book.as_mut()?;
        let idx = book.position(character_id)?;
        let character = &mut book.characters[idx];
        let old_appearance = character.appearance.clone();

        if let Some(face) = regenerated.face {
            character.appearance.face = Some(face);
        }
        if let Some(features) = regenerated.structured_features {
            let preserved: Vec<(String, String)> = keep_features
                .iter()
                .filter_map(|k| {
                    character
                        .appearance
                        .structured_features
                        .get(k)
                        .map(|v| (k.clone(), v.clone()))
                })
                .collect();

            character.appearance.structured_features = features
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect();

            for (k, v) in preserved {
                character.appearance.structured_features.insert(k, v);
            }
        }

        character.appearance.user_edited = true;
        character.appearance.edit_history.push(FeatureEditRecord {
            timestamp: timestamp.clone(),
            operation: "regenerate".to_string(),
            prompt: Some(prompt.to_string()),
            keep_features: keep_features.to_vec(),
            ..Default::default()
        });
        let name = character.name.clone();

        self.record(EditLogEntry {
            timestamp,
            character_id: character_id.to_string(),
            op: TuneOp::RegenerateFeatures {
                prompt: prompt.to_string(),
                keep_features: keep_features.to_vec(),
                old_appearance,
            },
        });

        if self.config.tuning.auto_validate {
            let _ = self.validate(character_id);
        }

        info!("Regenerated features of '{}'", name);
        self.get(character_id).cloned()
    }

    /// One generation request covering every matched character; each returned
    /// value funnels through `edit_feature`, so batch edits share the single
    /// edit's history and undo granularity.
    pub async fn batch_edit(
        &mut self,
        filter: &BTreeMap<String, String>,
        feature: &str,
        instruction: &str,
    ) -> Vec<Character> {
        let (total, system, user) = {
            let matched = self.list(filter);
            if matched.is_empty() {
                warn!("No characters match the filter");
                return Vec::new();
            }
            let (system, user) = batch_edit_prompt(&matched, feature, instruction);
            (matched.len(), system, user)
        };

        let response = match self.llm.query(&system, &user, true).await {
            Ok(r) => r,
            Err(e) => {
                error!("Batch edit failed: {:#}", e);
                return Vec::new();
            }
        };

        let payload: BatchEditPayload = match serde_json::from_str(&response) {
            Ok(p) => p,
            Err(e) => {
                error!("Batch edit failed: malformed response: {}", e);
                return Vec::new();
            }
        };
        let Some(edits) = payload.batch_edits else {
            error!("Batch edit failed: unexpected response shape");
            return Vec::new();
        };

        let mut updated = Vec::new();
        for edit in edits {
            if let (Some(id), Some(value)) = (edit.character_id, edit.edited_feature) {
                if let Some(character) = self.edit_feature(&id, feature, &value) {
                    updated.push(character);
                }
            }
        }

        info!(
            "Batch edited feature '{}' on {}/{} characters",
            feature,
            updated.len(),
            total
        );
        updated
    }

    /// Serialize the collection (or one character) to JSON, refreshing the
    /// `last_edited` stamp. A pre-existing destination is backed up first
    /// when configured to.
    pub fn export(
        &self,
        output_path: Option<&Path>,
        character_id: Option<&str>,
    ) -> Result<PathBuf> {
        let Some(book) = &self.book else {
            anyhow::bail!("No character data loaded");
        };

        let mut export = match character_id {
            Some(id) => {
                let character = book
                    .get(id)
                    .with_context(|| format!("No character with id {}", id))?
                    .clone();
                let mut metadata = book.metadata.clone();
                metadata.total_characters = 1;
                CharacterBook {
                    characters: vec![character],
                    metadata,
                    edit_history: Vec::new(),
                }
            }
            None => book.clone(),
        };
        export.metadata.last_edited = Some(now_iso());

        let path = match output_path {
            Some(p) => p.to_path_buf(),
            None => {
                let stamp = Local::now().format("%Y%m%d_%H%M%S");
                let filename = match character_id {
                    Some(id) => format!("{}_{}.json", id, stamp),
                    None => format!(
                        "{}_tuned_{}.json",
                        export.metadata.book_title.as_deref().unwrap_or("characters"),
                        stamp
                    ),
                };
                Path::new(&self.config.output.dir).join(safe_filename(&filename))
            }
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        if self.config.output.backup && path.exists() {
            let backup_path = PathBuf::from(format!("{}.bak", path.display()));
            match fs::copy(&path, &backup_path) {
                Ok(_) => info!("Backed up existing file to {}", backup_path.display()),
                Err(e) => warn!("Failed to back up existing file: {}", e),
            }
        }

        fs::write(&path, serde_json::to_string_pretty(&export)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Exported characters to {}", path.display());
        Ok(path)
    }

    /// Invert the newest applied edit. On success the entry moves to the
    /// redo-log; on failure it is pushed back and state is untouched.
    pub fn undo(&mut self) -> bool {
        let Some(book) = self.book.as_mut() else {
            warn!("Nothing to undo");
            return false;
        };
        let Some(entry) = book.edit_history.pop() else {
            warn!("Nothing to undo");
            return false;
        };

        let Some(idx) = book.position(&entry.character_id) else {
            warn!("Cannot undo: no character with id {}", entry.character_id);
            book.edit_history.push(entry);
            return false;
        };

        let timestamp = now_iso();
        let character = &mut book.characters[idx];
        match &entry.op {
            TuneOp::EditFeature {
                feature,
                old_value,
                new_value,
            } => {
                match old_value {
                    Some(value) => {
                        character
                            .appearance
                            .structured_features
                            .insert(feature.clone(), value.clone());
                    }
                    // The edit created the feature; undoing removes it again.
                    None => {
                        character.appearance.structured_features.remove(feature);
                    }
                }
                character.appearance.edit_history.push(FeatureEditRecord {
                    timestamp,
                    operation: "undo".to_string(),
                    feature: Some(feature.clone()),
                    old_value: Some(new_value.clone()),
                    new_value: old_value.clone(),
                    ..Default::default()
                });
                info!("Undid edit of feature '{}' on '{}'", feature, character.name);
            }
            TuneOp::RegenerateFeatures { old_appearance, .. } => {
                character.appearance = old_appearance.clone();
                character.appearance.edit_history.push(FeatureEditRecord {
                    timestamp,
                    operation: "undo_regenerate".to_string(),
                    ..Default::default()
                });
                info!("Undid feature regeneration on '{}'", character.name);
            }
        }

        self.redo_log.push(entry);
        true
    }

    /// Reapply the newest undone edit. A feature edit replays its recorded
    /// value; a regeneration re-executes the generation request with the
    /// original prompt and keep-list, so its result is not guaranteed to
    /// match the first run.
    pub async fn redo(&mut self) -> bool {
        let Some(entry) = self.redo_log.pop() else {
            warn!("Nothing to redo");
            return false;
        };

        match entry.op.clone() {
            TuneOp::EditFeature {
                feature,
                old_value,
                new_value,
            } => {
                let Some(book) = self.book.as_mut() else {
                    self.redo_log.push(entry);
                    return false;
                };
                let Some(idx) = book.position(&entry.character_id) else {
                    warn!("Cannot redo: no character with id {}", entry.character_id);
                    self.redo_log.push(entry);
                    return false;
                };

                let timestamp = now_iso();
                let character = &mut book.characters[idx];
                character
                    .appearance
                    .structured_features
                    .insert(feature.clone(), new_value.clone());
                character.appearance.edit_history.push(FeatureEditRecord {
                    timestamp,
                    operation: "redo".to_string(),
                    feature: Some(feature.clone()),
                    old_value,
                    new_value: Some(new_value),
                    ..Default::default()
                });
                info!("Redid edit of feature '{}' on '{}'", feature, character.name);

                book.edit_history.push(entry);
                let cap = self.config.tuning.history_size;
                while book.edit_history.len() > cap {
                    book.edit_history.remove(0);
                }
                true
            }
            TuneOp::RegenerateFeatures {
                prompt,
                keep_features,
                ..
            } => {
                let id = entry.character_id.clone();
                match self.regenerate_features(&id, &prompt, &keep_features).await {
                    Some(_) => true,
                    None => {
                        self.redo_log.push(entry);
                        false
                    }
                }
            }
        }
    }

    /// Check the required-feature checklist. Cross-feature consistency is
    /// only examined once every required feature is present.
    pub fn validate(&self, character_id: &str) -> Option<ValidationReport> {
        let character = self.get(character_id)?;

        let mut report = ValidationReport {
            valid: true,
            ..ValidationReport::default()
        };

        if character.appearance.structured_features.is_empty() {
            report.valid = false;
            report.missing_features.push("structured_features".to_string());
            report
                .suggestions
                .push("使用regenerate_features命令生成结构化特征".to_string());
            return Some(report);
        }

        for feature in REQUIRED_FEATURES {
            let missing = character
                .appearance
                .structured_features
                .get(feature)
                .map_or(true, |v| v.is_empty());
            if missing {
                report.valid = false;
                report.missing_features.push(feature.to_string());
                report
                    .suggestions
                    .push(format!("使用edit_feature命令添加{}特征", feature));
            }
        }

        if !report.missing_features.is_empty() {
            return Some(report);
        }

        // All required features present; no cross-feature rules defined yet.
        Some(report)
    }

    /// Append to the bounded edit-log and clear the redo-log: the discipline
    /// every new mutating operation goes through.
    fn record(&mut self, entry: EditLogEntry) {
        if let Some(book) = self.book.as_mut() {
            book.edit_history.push(entry);
            let cap = self.config.tuning.history_size;
            while book.edit_history.len() > cap {
                book.edit_history.remove(0);
            }
        }
        self.redo_log.clear();
    }
}

fn matches_filter(character: &Character, filter: &BTreeMap<String, String>) -> bool {
    let Ok(value) = serde_json::to_value(character) else {
        return false;
    };

    filter.iter().all(|(key, expected)| {
        let mut current = &value;
        for part in key.split('.') {
            match current.get(part) {
                Some(v) => current = v,
                None => return false,
            }
        }
        match current {
            Value::String(s) => s == expected,
            Value::Null => false,
            other => other.to_string() == *expected,
        }
    })
}

fn feature_edit_prompt(
    character: &Character,
    feature: &str,
    instruction: &str,
) -> (String, String) {
    let system = "你是一个专业的文学角色设计师，擅长编辑和优化角色的外观特征描述。\
                  你的任务是根据提供的编辑指令，修改特定角色特征的描述。\
                  请保持与角色其他特征的一致性，并确保描述足够详细和生动。\
                  请严格按照指定的JSON格式返回结果，不要添加任何额外的解释或评论。"
        .to_string();

    let current_feature = character
        .appearance
        .structured_features
        .get(feature)
        .map(String::as_str)
        .unwrap_or("无");

    let mut other_features = character.appearance.structured_features.clone();
    other_features.remove(feature);
    let other_features =
        serde_json::to_string_pretty(&other_features).unwrap_or_else(|_| "{}".to_string());

    let user = format!(
        "请根据以下编辑指令，修改角色\"{}\"的\"{}\"特征描述:\n\n\
         角色基本信息:\n\
         - 性别: {}\n\
         - 年龄: {}\n\
         - 职业: {}\n\n\
         当前特征描述:\n{}\n\n\
         其他相关特征:\n{}\n\n\
         编辑指令:\n{}\n\n\
         请以JSON格式返回修改后的特征描述:\n\n\
         ```json\n\
         {{\n\
           \"edited_feature\": {{\n\
             \"{}\": \"修改后的特征描述\"\n\
           }},\n\
           \"reasoning\": \"修改理由和考虑因素\"\n\
         }}\n\
         ```\n\n\
         重要说明:\n\
         1. 保持与角色其他特征的一致性\n\
         2. 确保描述足够详细和生动，适合用于图像生成\n\
         3. 考虑角色的性别、年龄、职业等基本属性\n\
         4. 确保JSON格式正确，可以被直接解析",
        character.name,
        feature,
        character.attribute_or_unknown("gender"),
        character.attribute_or_unknown("age"),
        character.attribute_or_unknown("occupation"),
        current_feature,
        other_features,
        instruction,
        feature
    );

    (system, user)
}

fn regenerate_prompt(
    character: &Character,
    prompt: &str,
    keep_features: &[String],
) -> (String, String) {
    let system = "你是一个专业的文学角色设计师，擅长创建详细的角色外观描述。\
                  你的任务是根据用户提供的描述和已有信息，重新生成角色的外观特征。\
                  请保留用户指定的特征，仅重新生成其他特征。\
                  请严格按照指定的JSON格式返回结果，不要添加任何额外的解释或评论。"
        .to_string();

    let preserved: BTreeMap<&String, &String> = keep_features
        .iter()
        .filter_map(|k| character.appearance.structured_features.get(k).map(|v| (k, v)))
        .collect();
    let preserved =
        serde_json::to_string_pretty(&preserved).unwrap_or_else(|_| "{}".to_string());

    let user = format!(
        "请根据以下描述，重新生成角色\"{}\"的外观特征:\n\n\
         角色基本信息:\n\
         - 性别: {}\n\
         - 年龄: {}\n\
         - 职业: {}\n\n\
         当前外观描述:\n{}\n\n\
         需要保留的特征:\n{}\n\n\
         用户提供的新描述:\n{}\n\n\
         请以JSON格式返回重新生成的特征:\n\n\
         ```json\n\
         {{\n\
           \"regenerated_appearance\": {{\n\
             \"face\": \"完整的面部描述段落\",\n\
             \"structured_features\": {{\n\
               \"face_shape\": \"脸型描述\",\n\
               \"eyes\": \"眼睛描述\",\n\
               \"nose\": \"鼻子描述\",\n\
               \"mouth\": \"嘴巴描述\",\n\
               \"eyebrows\": \"眉毛描述\",\n\
               \"skin\": \"肤色和肤质描述\",\n\
               \"distinctive_features\": \"其他显著特征\"\n\
             }}\n\
           }}\n\
         }}\n\
         ```\n\n\
         重要说明:\n\
         1. 保留指定的特征，不要修改它们\n\
         2. 根据用户提供的新描述重新生成其他特征\n\
         3. 确保描述足够详细和生动，适合用于图像生成\n\
         4. 保持特征之间的一致性\n\
         5. 确保JSON格式正确，可以被直接解析",
        character.name,
        character.attribute_or_unknown("gender"),
        character.attribute_or_unknown("age"),
        character.attribute_or_unknown("occupation"),
        character.appearance.face.as_deref().unwrap_or(""),
        preserved,
        prompt
    );

    (system, user)
}

fn batch_edit_prompt(
    characters: &[&Character],
    feature: &str,
    instruction: &str,
) -> (String, String) {
    let system = "你是一个专业的文学角色设计师，擅长批量编辑和优化角色的外观特征描述。\
                  你的任务是根据提供的编辑指令，为多个角色修改特定特征的描述。\
                  请为每个角色生成独特的描述，同时保持与编辑指令的一致性。\
                  请严格按照指定的JSON格式返回结果，不要添加任何额外的解释或评论。"
        .to_string();

    let summaries: Vec<Value> = characters
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "name": c.name,
                "gender": c.attribute_or_unknown("gender"),
                "age": c.attribute_or_unknown("age"),
                "occupation": c.attribute_or_unknown("occupation"),
                "current_feature": c
                    .appearance
                    .structured_features
                    .get(feature)
                    .map(String::as_str)
                    .unwrap_or("无"),
            })
        })
        .collect();
    let summaries =
        serde_json::to_string_pretty(&summaries).unwrap_or_else(|_| "[]".to_string());

    let user = format!(
        "请根据以下编辑指令，为多个角色修改\"{}\"特征描述:\n\n\
         角色列表:\n{}\n\n\
         编辑指令:\n{}\n\n\
         请以JSON格式返回修改后的特征描述:\n\n\
         ```json\n\
         {{\n\
           \"batch_edits\": [\n\
             {{\n\
               \"character_id\": \"角色ID\",\n\
               \"character_name\": \"角色名称\",\n\
               \"edited_feature\": \"修改后的特征描述\"\n\
             }}\n\
           ],\n\
           \"reasoning\": \"批量修改的整体考虑因素\"\n\
         }}\n\
         ```\n\n\
         重要说明:\n\
         1. 为每个角色生成独特的描述，避免重复或模板化\n\
         2. 考虑每个角色的性别、年龄、职业等基本属性\n\
         3. 保持与编辑指令的一致性\n\
         4. 确保JSON格式正确，可以被直接解析",
        feature, summaries, instruction
    );

    (system, user)
}
