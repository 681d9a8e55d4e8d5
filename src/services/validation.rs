use std::collections::BTreeMap;
use std::collections::HashSet;

use serde_json::Value;

use crate::models::extraction::{AttributeResult, AttributeValue};
use crate::models::schema::{AttributeField, CategorySchema, FieldType};

/// Minimum similarity score for a fuzzy vocabulary match to be accepted.
const FUZZY_ACCEPT_THRESHOLD: f64 = 0.8;

/// Validated model output for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedResponse {
    pub attributes: BTreeMap<String, AttributeResult>,
    pub overall_confidence: u8,
}

/// Malformed model output. Treated as transient by the pipeline: a bad body
/// is a property of one sampled completion, so re-asking is allowed under
/// the transport retry budget.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("model output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model output is not a JSON object")]
    NotAnObject,
}

/// Parse and normalize raw model output against the schema.
pub fn validate(raw_content: &str, schema: &CategorySchema) -> Result<ValidatedResponse, ParseError> {
    let stripped = strip_code_fences(raw_content);
    let root: Value = serde_json::from_str(stripped)?;
    let root_obj = root.as_object().ok_or(ParseError::NotAnObject)?;

    // Tolerate both the instructed `{"attributes": {...}}` wrapper and a
    // bare attribute map at the root.
    let attr_obj = match root_obj.get("attributes").and_then(Value::as_object) {
        Some(inner) => inner,
        None => root_obj,
    };

    let mut attributes = BTreeMap::new();
    for field in &schema.fields {
        let entry = attr_obj.get(&field.key);
        attributes.insert(field.key.clone(), validate_field(field, entry));
    }

    let overall_confidence = overall_confidence(attributes.values().map(|a| a.confidence));

    Ok(ValidatedResponse {
        attributes,
        overall_confidence,
    })
}

/// Strip an optional markdown code fence (``` or ```json) around the body.
fn strip_code_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

fn validate_field(field: &AttributeField, entry: Option<&Value>) -> AttributeResult {
    let Some(entry) = entry else {
        return AttributeResult {
            raw_value: String::new(),
            normalized_value: None,
            confidence: 0,
            reasoning: String::new(),
            is_valid: false,
        };
    };

    // Per-field shape is `{value, confidence, reasoning}`; a bare scalar is
    // accepted as the value with zero confidence.
    let (value, confidence_raw, reasoning) = match entry.as_object() {
        Some(obj) => (
            obj.get("value").cloned().unwrap_or(Value::Null),
            obj.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
            obj.get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        None => (entry.clone(), 0.0, String::new()),
    };

    let raw_value = stringify(&value);
    let normalized_value = match field.field_type {
        FieldType::Text => normalize_text(&raw_value),
        FieldType::Number => normalize_number(&raw_value),
        FieldType::Select => normalize_select(field, &raw_value),
    };
    let is_valid = normalized_value.is_some();

    AttributeResult {
        raw_value,
        normalized_value,
        confidence: normalize_confidence(confidence_raw),
        reasoning,
        is_valid,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn normalize_text(raw: &str) -> Option<AttributeValue> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(AttributeValue::Text(trimmed.to_string()))
    }
}

/// Strip non-numeric characters and parse; `None` if nothing parsable is
/// left.
fn normalize_number(raw: &str) -> Option<AttributeValue> {
    let numeric: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    numeric.parse::<f64>().ok().map(AttributeValue::Number)
}

/// Resolve a select value against the field's controlled vocabulary:
/// exact case-sensitive, then case-insensitive, then fuzzy similarity with
/// an acceptance threshold. Unmatched values resolve to `None`.
fn normalize_select(field: &AttributeField, raw: &str) -> Option<AttributeValue> {
    let raw = raw.trim();
    if raw.is_empty() || field.allowed_values.is_empty() {
        return None;
    }

    for allowed in &field.allowed_values {
        if raw == allowed.short_form || raw == allowed.full_form {
            return Some(AttributeValue::Text(allowed.short_form.clone()));
        }
    }

    for allowed in &field.allowed_values {
        if raw.eq_ignore_ascii_case(&allowed.short_form)
            || raw.eq_ignore_ascii_case(&allowed.full_form)
        {
            return Some(AttributeValue::Text(allowed.short_form.clone()));
        }
    }

    let raw_lower = raw.to_lowercase();
    let mut best_score = 0.0_f64;
    let mut best_short: Option<&str> = None;
    for allowed in &field.allowed_values {
        let score = similarity(&raw_lower, &allowed.short_form.to_lowercase())
            .max(similarity(&raw_lower, &allowed.full_form.to_lowercase()));
        if score > best_score {
            best_score = score;
            best_short = Some(&allowed.short_form);
        }
    }

    if best_score > FUZZY_ACCEPT_THRESHOLD {
        best_short.map(|s| AttributeValue::Text(s.to_string()))
    } else {
        None
    }
}

/// Similarity between two strings: identical → 1.0, substring containment
/// either direction → 0.9, otherwise the Jaccard index of the two strings'
/// distinct-character sets.
///
/// The character-set Jaccard ignores order and repetition, so it is a crude
/// approximation rather than token-level similarity ("dog"/"god" score 1.0).
/// Good enough for short controlled-vocabulary terms, where the exact and
/// substring tiers catch most real matches first.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.contains(b) || b.contains(a) {
        return 0.9;
    }

    let set_a: HashSet<char> = a.chars().collect();
    let set_b: HashSet<char> = b.chars().collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Clamp a reported confidence into an integer percentage. Values in (0, 1]
/// are treated as fractions and scaled by 100.
pub fn normalize_confidence(raw: f64) -> u8 {
    let scaled = if raw > 0.0 && raw <= 1.0 {
        raw * 100.0
    } else {
        raw
    };
    scaled.clamp(0.0, 100.0).round() as u8
}

/// Rounded mean of the nonzero field confidences; fields with no extracted
/// value (confidence 0) are excluded. Zero when no field has confidence.
fn overall_confidence(confidences: impl Iterator<Item = u8>) -> u8 {
    let nonzero: Vec<u32> = confidences.filter(|c| *c > 0).map(u32::from).collect();
    if nonzero.is_empty() {
        return 0;
    }
    let sum: u32 = nonzero.iter().sum();
    (sum as f64 / nonzero.len() as f64).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema::AllowedValue;

    fn select_field(key: &str, values: &[(&str, &str)]) -> AttributeField {
        AttributeField {
            key: key.to_string(),
            label: key.to_string(),
            field_type: FieldType::Select,
            required: true,
            allowed_values: values
                .iter()
                .map(|(s, f)| AllowedValue {
                    short_form: s.to_string(),
                    full_form: f.to_string(),
                })
                .collect(),
        }
    }

    fn test_schema() -> CategorySchema {
        CategorySchema {
            id: "apparel-tops".to_string(),
            version: 1,
            name: "Apparel / Tops".to_string(),
            fields: vec![
                select_field("color", &[("blue", "Blue"), ("red", "Red"), ("grn", "Green")]),
                AttributeField {
                    key: "material".to_string(),
                    label: "Material".to_string(),
                    field_type: FieldType::Text,
                    required: false,
                    allowed_values: vec![],
                },
                AttributeField {
                    key: "sleeve_length_cm".to_string(),
                    label: "Sleeve Length".to_string(),
                    field_type: FieldType::Number,
                    required: false,
                    allowed_values: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_similarity_identities() {
        assert_eq!(similarity("blue", "blue"), 1.0);
        assert!(similarity("blu", "blue") > 0.8); // substring rule
        assert_eq!(similarity("abc", "xyz"), 0.0); // disjoint character sets
        assert_eq!(similarity("", "blue"), 0.0);
    }

    #[test]
    fn test_similarity_char_set_jaccard() {
        // {a,b,c} vs {b,c,d}: intersection 2, union 4.
        assert!((similarity("abc", "bcd") - 0.5).abs() < 1e-9);
        // Order and repetition blind: same character sets score 1.0.
        assert_eq!(similarity("doog", "godo"), 1.0);
    }

    #[test]
    fn test_confidence_normalization() {
        assert_eq!(normalize_confidence(0.85), 85);
        assert_eq!(normalize_confidence(120.0), 100);
        assert_eq!(normalize_confidence(-5.0), 0);
        assert_eq!(normalize_confidence(90.0), 90);
        assert_eq!(normalize_confidence(0.0), 0);
    }

    #[test]
    fn test_strips_markdown_fences() {
        let schema = test_schema();
        let body = "```json\n{\"attributes\": {\"color\": {\"value\": \"blue\", \"confidence\": 90, \"reasoning\": \"clearly blue\"}}}\n```";
        let out = validate(body, &schema).unwrap();
        assert_eq!(
            out.attributes["color"].normalized_value,
            Some(AttributeValue::Text("blue".to_string()))
        );
    }

    #[test]
    fn test_select_exact_and_case_insensitive_match() {
        let schema = test_schema();
        let body = r#"{"attributes": {"color": {"value": "Blue", "confidence": 80, "reasoning": ""}}}"#;
        let out = validate(body, &schema).unwrap();
        let color = &out.attributes["color"];
        // "Blue" hits full_form exactly; normalized to short form.
        assert_eq!(color.normalized_value, Some(AttributeValue::Text("blue".into())));
        assert!(color.is_valid);

        let body = r#"{"attributes": {"color": {"value": "RED", "confidence": 80, "reasoning": ""}}}"#;
        let out = validate(body, &schema).unwrap();
        assert_eq!(
            out.attributes["color"].normalized_value,
            Some(AttributeValue::Text("red".into()))
        );
    }

    #[test]
    fn test_select_fuzzy_match_over_threshold() {
        let schema = test_schema();
        // "blu" is a substring of "blue" → 0.9 > 0.8, accepted.
        let body = r#"{"attributes": {"color": {"value": "blu", "confidence": 70, "reasoning": ""}}}"#;
        let out = validate(body, &schema).unwrap();
        assert_eq!(
            out.attributes["color"].normalized_value,
            Some(AttributeValue::Text("blue".into()))
        );
    }

    #[test]
    fn test_select_unmatched_resolves_null_invalid() {
        let schema = test_schema();
        let body = r#"{"attributes": {"color": {"value": "paisley", "confidence": 60, "reasoning": ""}}}"#;
        let out = validate(body, &schema).unwrap();
        let color = &out.attributes["color"];
        assert_eq!(color.normalized_value, None);
        assert!(!color.is_valid);
        assert_eq!(color.raw_value, "paisley");
    }

    #[test]
    fn test_select_normalized_is_always_a_short_form_or_null() {
        let schema = test_schema();
        let shorts: Vec<String> = schema.fields[0]
            .allowed_values
            .iter()
            .map(|v| v.short_form.clone())
            .collect();
        for raw in ["blue", "Blue", "BLUE", "blu", "green", "Green-ish", "paisley", ""] {
            let body = format!(
                r#"{{"attributes": {{"color": {{"value": "{raw}", "confidence": 50, "reasoning": ""}}}}}}"#
            );
            let out = validate(&body, &schema).unwrap();
            match &out.attributes["color"].normalized_value {
                None => {}
                Some(AttributeValue::Text(s)) => assert!(shorts.contains(s), "{s} not in vocabulary"),
                Some(other) => panic!("unexpected normalized value {other:?}"),
            }
        }
    }

    #[test]
    fn test_number_strips_non_numeric() {
        let schema = test_schema();
        let body = r#"{"attributes": {"sleeve_length_cm": {"value": "about 61 cm", "confidence": 75, "reasoning": ""}}}"#;
        let out = validate(body, &schema).unwrap();
        assert_eq!(
            out.attributes["sleeve_length_cm"].normalized_value,
            Some(AttributeValue::Number(61.0))
        );

        let body = r#"{"attributes": {"sleeve_length_cm": {"value": "unknown", "confidence": 10, "reasoning": ""}}}"#;
        let out = validate(body, &schema).unwrap();
        assert_eq!(out.attributes["sleeve_length_cm"].normalized_value, None);
    }

    #[test]
    fn test_overall_confidence_excludes_zeroes() {
        let schema = test_schema();
        let body = r#"{"attributes": {
            "color": {"value": "blue", "confidence": 90, "reasoning": ""},
            "material": {"value": "cotton", "confidence": 70, "reasoning": ""},
            "sleeve_length_cm": {"value": null, "confidence": 0, "reasoning": ""}
        }}"#;
        let out = validate(body, &schema).unwrap();
        assert_eq!(out.overall_confidence, 80);
    }

    #[test]
    fn test_overall_confidence_zero_when_nothing_extracted() {
        let schema = test_schema();
        let body = r#"{"attributes": {}}"#;
        let out = validate(body, &schema).unwrap();
        assert_eq!(out.overall_confidence, 0);
        assert!(out.attributes.values().all(|a| !a.is_valid));
    }

    #[test]
    fn test_fractional_confidence_is_scaled() {
        let schema = test_schema();
        let body = r#"{"attributes": {"material": {"value": "cotton", "confidence": 0.85, "reasoning": ""}}}"#;
        let out = validate(body, &schema).unwrap();
        assert_eq!(out.attributes["material"].confidence, 85);
    }

    #[test]
    fn test_garbage_body_is_a_parse_error() {
        let schema = test_schema();
        assert!(matches!(
            validate("the shirt appears to be blue", &schema),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(validate("[1, 2, 3]", &schema), Err(ParseError::NotAnObject)));
    }

    #[test]
    fn test_bare_attribute_map_without_wrapper_is_accepted() {
        let schema = test_schema();
        let body = r#"{"color": {"value": "red", "confidence": 88, "reasoning": "solid red"}}"#;
        let out = validate(body, &schema).unwrap();
        assert_eq!(
            out.attributes["color"].normalized_value,
            Some(AttributeValue::Text("red".into()))
        );
        assert_eq!(out.attributes["color"].confidence, 88);
    }
}
