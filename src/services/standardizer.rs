use crate::core::character::Character;
use crate::services::llm::Llm;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Normalizes a character's free-form appearance description into the fixed
/// structured feature set used by portrait generation.
pub struct FeatureStandardizer<'a> {
    llm: &'a Llm,
}

#[derive(Deserialize)]
struct StandardizationPayload {
    standardized_appearance: Option<StandardizedAppearance>,
}

#[derive(Deserialize)]
struct StandardizedAppearance {
    #[serde(default)]
    face: Option<String>,
    #[serde(default)]
    structured_features: Option<BTreeMap<String, Option<String>>>,
}

impl<'a> FeatureStandardizer<'a> {
    pub fn new(llm: &'a Llm) -> Self {
        Self { llm }
    }

    /// One generation request producing the complete structured feature set,
    /// merged into the character in place. A character with no appearance
    /// material at all is left untouched.
    pub async fn standardize(&self, character: &mut Character) -> Result<()> {
        info!("Standardizing features for '{}'", character.name);

        if character.appearance.is_empty() {
            warn!(
                "Character '{}' has no appearance information, nothing to standardize",
                character.name
            );
            return Ok(());
        }

        let (system, user) = standardization_prompt(character);
        let response = self.llm.query(&system, &user, true).await?;
        let payload: StandardizationPayload = serde_json::from_str(&response)
            .context("Malformed standardization response")?;

        let Some(standardized) = payload.standardized_appearance else {
            warn!(
                "Standardization for '{}' returned no usable data",
                character.name
            );
            return Ok(());
        };

        if let Some(face) = standardized.face {
            character.appearance.face = Some(face);
        }
        if let Some(features) = standardized.structured_features {
            // The standardized set is the complete fixed feature list, so it
            // replaces rather than merges.
            character.appearance.structured_features = features
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect();
        }
        character.appearance.features_standardized = true;

        info!("Standardization for '{}' complete", character.name);
        Ok(())
    }
}

fn standardization_prompt(character: &Character) -> (String, String) {
    let system = "你是一个专业的文学角色设计师，擅长标准化角色的外观特征描述。\
                  你的任务是基于提供的角色信息，生成标准化的面部特征描述。\
                  请严格按照指定的JSON格式返回结果，不要添加任何额外的解释或评论。"
        .to_string();

    let user = format!(
        "请基于以下角色信息，生成标准化的面部特征描述:\n\n\
         角色名称: {}\n\
         性别: {}\n\
         年龄: {}\n\
         职业: {}\n\
         原有描述: {}\n\n\
         请以JSON格式返回结果，必须包含以下字段:\n\n\
         ```json\n\
         {{\n\
           \"standardized_appearance\": {{\n\
             \"face\": \"完整的面部描述段落，整合原有描述和补充内容\",\n\
             \"structured_features\": {{\n\
               \"face_shape\": \"脸型描述（圆形、方形、椭圆形等）\",\n\
               \"eyes\": \"眼睛描述（形状、大小、颜色、特点）\",\n\
               \"nose\": \"鼻子描述（形状、大小、特点）\",\n\
               \"mouth\": \"嘴巴描述（形状、特点）\",\n\
               \"eyebrows\": \"眉毛描述（形状、颜色、特点）\",\n\
               \"skin\": \"肤色和肤质描述\",\n\
               \"distinctive_features\": \"其他显著特征（如疤痕、胎记、雀斑等）\"\n\
             }}\n\
           }}\n\
         }}\n\
         ```\n\n\
         重要说明:\n\
         1. 如果原有描述中已有某些特征信息，请保留并整合到标准化描述中\n\
         2. 对于原有描述中没有的特征，请根据角色的性别、年龄、职业等信息合理推断\n\
         3. 确保描述足够详细，以便用于肖像生成\n\
         4. 确保JSON格式正确，可以被直接解析",
        character.name,
        character.attribute_or_unknown("gender"),
        character.attribute_or_unknown("age"),
        character.attribute_or_unknown("occupation"),
        character.appearance.face.as_deref().unwrap_or("")
    );

    (system, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::LlmClient;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    struct MockLlm {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn chat(&self, _: &str, _: &str, _: bool) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(r#"{"standardized_appearance": {
                "face": "标准化后的面部描述",
                "structured_features": {
                    "face_shape": "方形脸", "eyes": "黑色眼睛", "nose": "高挺",
                    "mouth": "薄唇", "eyebrows": "浓眉", "skin": "白皙",
                    "distinctive_features": null
                }}}"#
                .to_string())
        }
    }

    fn subject() -> Character {
        let mut character = Character {
            id: "char001".to_string(),
            name: "林远".to_string(),
            ..Character::default()
        };
        character.appearance.face = Some("剑眉星目".to_string());
        character
            .appearance
            .structured_features
            .insert("eyes".to_string(), "旧的眼睛描述".to_string());
        character
    }

    #[tokio::test]
    async fn standardize_replaces_features_and_sets_flag() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = Llm::with_client(
            Box::new(MockLlm { calls: calls.clone() }),
            1,
            Duration::from_millis(0),
        );
        let standardizer = FeatureStandardizer::new(&llm);

        let mut character = subject();
        standardizer.standardize(&mut character).await.unwrap();

        assert!(character.appearance.features_standardized);
        assert_eq!(character.appearance.face.as_deref(), Some("标准化后的面部描述"));
        let features = &character.appearance.structured_features;
        assert_eq!(features.get("eyes").map(String::as_str), Some("黑色眼睛"));
        assert_eq!(features.len(), 6);
        // Null-valued features are not materialized.
        assert!(!features.contains_key("distinctive_features"));
    }

    #[tokio::test]
    async fn empty_appearance_is_skipped_without_a_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = Llm::with_client(
            Box::new(MockLlm { calls: calls.clone() }),
            1,
            Duration::from_millis(0),
        );
        let standardizer = FeatureStandardizer::new(&llm);

        let mut character = Character {
            name: "无名".to_string(),
            ..Character::default()
        };
        standardizer.standardize(&mut character).await.unwrap();

        assert!(!character.appearance.features_standardized);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
