use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Attribute field types supported by category schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Select,
    Number,
}

/// One entry of a select field's controlled vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedValue {
    pub short_form: String,
    pub full_form: String,
}

/// One named, typed slot in a category schema (e.g. "color").
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AttributeField {
    #[garde(length(min = 1, max = 100))]
    pub key: String,

    #[garde(length(min = 1, max = 200))]
    pub label: String,

    #[garde(skip)]
    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[garde(skip)]
    #[serde(default)]
    pub required: bool,

    #[garde(skip)]
    #[serde(default)]
    pub allowed_values: Vec<AllowedValue>,
}

/// Category schema supplied by the external schema provider.
///
/// Immutable once handed to the pipeline. The core trusts the provider and
/// performs only a structural sanity check (non-empty field list, bounded
/// identifier lengths) via `garde`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CategorySchema {
    #[garde(length(min = 1, max = 100))]
    pub id: String,

    #[garde(skip)]
    #[serde(default = "default_version")]
    pub version: u32,

    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(length(min = 1), dive)]
    pub fields: Vec<AttributeField>,
}

fn default_version() -> u32 {
    1
}

impl CategorySchema {
    /// Prompt-cache identity: schema id plus field count.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.id, self.fields.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_json() -> &'static str {
        r#"{
            "id": "apparel-tops",
            "name": "Apparel / Tops",
            "fields": [
                {
                    "key": "color",
                    "label": "Primary Color",
                    "type": "select",
                    "required": true,
                    "allowed_values": [
                        {"short_form": "blue", "full_form": "Blue"},
                        {"short_form": "red", "full_form": "Red"}
                    ]
                },
                {"key": "material", "label": "Material", "type": "text"},
                {"key": "sleeve_length_cm", "label": "Sleeve Length (cm)", "type": "number"}
            ]
        }"#
    }

    #[test]
    fn test_deserializes_caller_schema() {
        let schema: CategorySchema = serde_json::from_str(schema_json()).unwrap();
        assert_eq!(schema.version, 1); // defaulted
        assert_eq!(schema.fields.len(), 3);
        assert_eq!(schema.fields[0].field_type, FieldType::Select);
        assert!(!schema.fields[1].required);
        schema.validate().unwrap();
    }

    #[test]
    fn test_rejects_empty_field_list() {
        let schema = CategorySchema {
            id: "empty".into(),
            version: 1,
            name: "Empty".into(),
            fields: vec![],
        };
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_id_and_field_count() {
        let schema: CategorySchema = serde_json::from_str(schema_json()).unwrap();
        assert_eq!(schema.fingerprint(), "apparel-tops:3");
    }
}
