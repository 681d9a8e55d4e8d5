use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt::Write as _;

use parking_lot::Mutex;

use crate::models::schema::{CategorySchema, FieldType};

/// Maximum number of schema fields rendered into a prompt.
const MAX_PROMPT_FIELDS: usize = 15;

/// Maximum allowed values listed per select field.
const MAX_ALLOWED_VALUES: usize = 8;

/// Prompt memo cache bounds: FIFO-evict once the high-water mark is hit,
/// trimming back down to the low-water mark.
const CACHE_HIGH_WATER: usize = 64;
const CACHE_LOW_WATER: usize = 48;

/// Builds the extraction instruction prompt for a category schema.
///
/// Output is deterministic per schema fingerprint (id + field count) and is
/// memoized; field and allowed-value lists are truncated so prompt length is
/// bounded regardless of schema size.
pub struct SchemaPromptBuilder {
    cache: Mutex<PromptCache>,
}

struct PromptCache {
    prompts: HashMap<String, String>,
    insertion_order: VecDeque<String>,
}

impl Default for SchemaPromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaPromptBuilder {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(PromptCache {
                prompts: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
        }
    }

    /// Build (or fetch memoized) the instruction prompt for `schema`.
    pub fn build_prompt(&self, schema: &CategorySchema) -> String {
        let fingerprint = schema.fingerprint();

        {
            let cache = self.cache.lock();
            if let Some(prompt) = cache.prompts.get(&fingerprint) {
                return prompt.clone();
            }
        }

        let prompt = render_prompt(schema);

        let mut cache = self.cache.lock();
        if !cache.prompts.contains_key(&fingerprint) {
            cache.prompts.insert(fingerprint.clone(), prompt.clone());
            cache.insertion_order.push_back(fingerprint);

            if cache.prompts.len() > CACHE_HIGH_WATER {
                while cache.prompts.len() > CACHE_LOW_WATER {
                    match cache.insertion_order.pop_front() {
                        Some(oldest) => {
                            cache.prompts.remove(&oldest);
                        }
                        None => break,
                    }
                }
            }
        }

        prompt
    }

    #[cfg(test)]
    fn cached_prompt_count(&self) -> usize {
        self.cache.lock().prompts.len()
    }
}

fn render_prompt(schema: &CategorySchema) -> String {
    let mut out = String::with_capacity(1024);

    let _ = writeln!(
        out,
        "Analyze the product image and extract the following attributes for the \"{}\" category.",
        schema.name
    );
    out.push('\n');

    for field in schema.fields.iter().take(MAX_PROMPT_FIELDS) {
        match field.field_type {
            FieldType::Select => {
                let values: Vec<String> = field
                    .allowed_values
                    .iter()
                    .take(MAX_ALLOWED_VALUES)
                    .map(|v| format!("\"{}\" ({})", v.short_form, v.full_form))
                    .collect();
                let _ = writeln!(
                    out,
                    "- {} (key: {}): choose exactly one of: {}",
                    field.label,
                    field.key,
                    values.join(", ")
                );
            }
            FieldType::Number => {
                let _ = writeln!(
                    out,
                    "- {} (key: {}): a number, digits only",
                    field.label, field.key
                );
            }
            FieldType::Text => {
                let _ = writeln!(
                    out,
                    "- {} (key: {}): free text, be concise",
                    field.label, field.key
                );
            }
        }
    }

    out.push('\n');
    out.push_str(concat!(
        "Respond with ONLY valid JSON, no markdown, in exactly this shape: ",
        "{\"attributes\": {\"<key>\": {\"value\": <extracted value>, ",
        "\"confidence\": <integer 0-100>, \"reasoning\": \"<one short sentence>\"}, ...}, ",
        "\"overallConfidence\": <integer 0-100>}. ",
        "Include every key listed above. If an attribute is not visible, ",
        "use null for its value and 0 for its confidence."
    ));

    out
}
