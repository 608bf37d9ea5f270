use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest},
    LLMError,
};

/// Rewriting styles requested for a fresh population.
pub const STYLES: &[&str] = &[
    "concise",
    "explicit_tool_rules",
    "step_by_step",
    "example_driven",
    "cautious_abstention",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentPrompt {
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct VariantRequest {
    pub base_prompt: String,
    /// Empty for the first generation.
    pub parents: Vec<ParentPrompt>,
    pub n: usize,
    pub instructions: Option<String>,
    pub generation: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedVariant {
    pub text: String,
    #[serde(default)]
    pub style: Option<String>,
}

/// The model that writes prompt variants, as opposed to the models under test.
#[async_trait]
pub trait MetaModel: Send + Sync {
    async fn generate_variants(&self, request: &VariantRequest) -> Result<Vec<GeneratedVariant>, LLMError>;
}

pub struct LlmMetaModel {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
}

impl LlmMetaModel {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.9,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_prompt(request: &VariantRequest) -> String {
        let mut prompt = String::new();
        if request.parents.is_empty() {
            prompt.push_str(&format!(
                "Write {} alternative versions of the system prompt below for an assistant that must decide \
                 when to call tools and fill their arguments precisely.\n\
                 Use a different style for each, drawing from: {}.\n\n\
                 Base prompt:\n\"\"\"\n{}\n\"\"\"\n",
                request.n,
                STYLES.join(", "),
                request.base_prompt
            ));
        } else {
            prompt.push_str(&format!(
                "The following system prompts performed best at tool selection and argument accuracy \
                 (score between 0 and 1). Produce {} new prompts by mutating and recombining them. \
                 Keep what the strongest ones do well.\n\n",
                request.n
            ));
            for (i, parent) in request.parents.iter().enumerate() {
                prompt.push_str(&format!(
                    "Prompt {} (score {:.3}):\n\"\"\"\n{}\n\"\"\"\n\n",
                    i + 1,
                    parent.score,
                    parent.text
                ));
            }
        }
        if let Some(instructions) = request.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
            prompt.push_str(&format!("\nAdditional instructions: {instructions}\n"));
        }
        prompt.push_str(
            "\nRespond with a JSON array only, one object per prompt: \
             [{\"style\": \"<short label>\", \"prompt\": \"<full system prompt>\"}]",
        );
        prompt
    }
}

#[async_trait]
impl MetaModel for LlmMetaModel {
    async fn generate_variants(&self, request: &VariantRequest) -> Result<Vec<GeneratedVariant>, LLMError> {
        let messages = vec![
            ChatMessage::system("You are an expert prompt engineer for tool-using language models."),
            ChatMessage::user(Self::build_prompt(request)),
        ];
        let completion = CompletionRequest::new(self.model.clone(), messages).with_temperature(self.temperature);
        let response = self.provider.complete(completion).await?;
        let content = response
            .message
            .text()
            .ok_or(LLMError::InvalidResponse("meta-model returned no content"))?;

        let variants = parse_variants(content);
        debug!(generation = request.generation, parsed = variants.len(), requested = request.n, "meta-model variants parsed");
        if variants.is_empty() {
            return Err(LLMError::UnparseableVariants(truncate(content, 200)));
        }
        Ok(variants)
    }
}

static RE_NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s+(.+?)\s*$").unwrap());

/// Reads variants from a JSON array (bare, fenced or embedded in prose), falling back to a
/// numbered list.
pub fn parse_variants(content: &str) -> Vec<GeneratedVariant> {
    let candidates = [
        Some(content.trim().to_string()),
        extract_json_from_fenced_block(content),
        extract_array(content),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&candidate) {
            let variants: Vec<GeneratedVariant> = items.iter().filter_map(variant_from_value).collect();
            if !variants.is_empty() {
                return variants;
            }
        }
    }

    RE_NUMBERED
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_matches('"').trim().to_string())
        .filter(|text| !text.is_empty())
        .map(|text| GeneratedVariant { text, style: None })
        .collect()
}

fn variant_from_value(value: &Value) -> Option<GeneratedVariant> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(GeneratedVariant {
            text: text.trim().to_string(),
            style: None,
        }),
        Value::Object(map) => {
            let text = ["prompt", "text", "system_prompt"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))?
                .trim();
            if text.is_empty() {
                return None;
            }
            Some(GeneratedVariant {
                text: text.to_string(),
                style: map.get("style").and_then(Value::as_str).map(str::to_string),
            })
        }
        _ => None,
    }
}

fn extract_json_from_fenced_block(content: &str) -> Option<String> {
    let start = content.find("```json").or_else(|| content.find("```"))?;
    let remainder = &content[start..];
    let after_language = remainder.find('\n')?;
    let body = &remainder[after_language + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

fn extract_array(content: &str) -> Option<String> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    (end > start).then(|| content[start..=end].to_string())
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
