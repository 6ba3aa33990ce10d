use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Categorical rank of a character. The wire form is the label set the
/// generation service is instructed to answer with; anything it invents
/// beyond that degrades to `Minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum Importance {
    #[serde(rename = "主角")]
    Protagonist,
    #[serde(rename = "配角")]
    Supporting,
    #[default]
    #[serde(rename = "次要角色")]
    Minor,
}

impl<'de> Deserialize<'de> for Importance {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let label = String::deserialize(deserializer)?;
        Ok(match label.as_str() {
            "主角" => Importance::Protagonist,
            "配角" => Importance::Supporting,
            _ => Importance::Minor,
        })
    }
}

impl Importance {
    pub fn is_main(&self) -> bool {
        matches!(self, Importance::Protagonist | Importance::Supporting)
    }
}

/// A verbatim quote from the source text backing an appearance claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextReference {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

/// One entry of a character's local audit trail. The fields present depend
/// on the operation that produced the entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureEditRecord {
    pub timestamp: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keep_features: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Appearance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clothing: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_references: Vec<TextReference>,
    #[serde(default)]
    pub structured_features: BTreeMap<String, String>,
    #[serde(default)]
    pub user_edited: bool,
    #[serde(default)]
    pub features_standardized: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edit_history: Vec<FeatureEditRecord>,
}

impl Appearance {
    /// True when nothing at all has been recorded yet, in which case there
    /// is no material to standardize from.
    pub fn is_empty(&self) -> bool {
        self.face.is_none()
            && self.body.is_none()
            && self.clothing.is_none()
            && self.text_references.is_empty()
            && self.structured_features.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Character {
    /// Stable identifier ("char001"), assigned once after cross-batch merge.
    #[serde(default)]
    pub id: String,
    /// Dedup key during merge; unique within a collection.
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_appearance: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub appearance: Appearance,
}

impl Character {
    /// Attribute value if present and non-empty.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(|v| v.as_deref())
            .filter(|v| !v.is_empty())
    }

    pub fn attribute_or_unknown(&self, key: &str) -> &str {
        self.attribute(key).unwrap_or("未知")
    }
}

/// Heterogeneous edit operation held in the global edit-log. Each variant
/// carries enough state to invert the change exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "details", rename_all = "snake_case")]
pub enum TuneOp {
    EditFeature {
        feature: String,
        #[serde(default)]
        old_value: Option<String>,
        new_value: String,
    },
    RegenerateFeatures {
        prompt: String,
        #[serde(default)]
        keep_features: Vec<String>,
        old_appearance: Appearance,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditLogEntry {
    pub timestamp: String,
    pub character_id: String,
    #[serde(flatten)]
    pub op: TuneOp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
    #[serde(default)]
    pub total_characters: usize,
    #[serde(default)]
    pub main_characters: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edited: Option<String>,
}

/// The persisted character collection for one book.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterBook {
    pub characters: Vec<Character>,
    #[serde(default)]
    pub metadata: BookMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edit_history: Vec<EditLogEntry>,
}

impl CharacterBook {
    pub fn get(&self, character_id: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.id == character_id)
    }

    pub fn position(&self, character_id: &str) -> Option<usize> {
        self.characters.iter().position(|c| c.id == character_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_wire_labels_round_trip() {
        let json = r#""主角""#;
        let imp: Importance = serde_json::from_str(json).unwrap();
        assert_eq!(imp, Importance::Protagonist);
        assert_eq!(serde_json::to_string(&imp).unwrap(), json);
    }

    #[test]
    fn unknown_importance_label_degrades_to_minor() {
        let imp: Importance = serde_json::from_str(r#""龙套""#).unwrap();
        assert_eq!(imp, Importance::Minor);
    }

    #[test]
    fn edit_log_entry_wire_shape() {
        let entry = EditLogEntry {
            timestamp: "2024-01-01T00:00:00".to_string(),
            character_id: "char001".to_string(),
            op: TuneOp::EditFeature {
                feature: "eyes".to_string(),
                old_value: Some("black".to_string()),
                new_value: "blue".to_string(),
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["operation"], "edit_feature");
        assert_eq!(value["character_id"], "char001");
        assert_eq!(value["details"]["old_value"], "black");
        assert_eq!(value["details"]["new_value"], "blue");

        let back: EditLogEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn appearance_emptiness() {
        let mut appearance = Appearance::default();
        assert!(appearance.is_empty());
        appearance
            .structured_features
            .insert("eyes".to_string(), "黑色眼睛".to_string());
        assert!(!appearance.is_empty());
    }
}
