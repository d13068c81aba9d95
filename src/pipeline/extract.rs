//! Extraction client: the narrow seam over the external vision service.
//!
//! [`ExtractionClient`] is the only interface the rest of the pipeline knows
//! about — one call per page image, a structured value tree or a typed
//! [`ExtractionError`] back. The client performs **no retries** internally;
//! the worker pool owns the retry policy so cancellation and tests can
//! intercept at every retry boundary.
//!
//! [`VisionExtractionClient`] is the production implementation over
//! `edgequake-llm`. It builds the extraction prompt, attaches the page PNG,
//! and parses the model's reply into JSON — tolerating replies wrapped in
//! markdown fences, which vision models produce despite instructions, before
//! giving up with `InvalidResponse`.

use crate::config::PipelineConfig;
use crate::error::{DocFieldsError, ExtractionError};
use crate::model::PageImage;
use crate::pipeline::encode;
use crate::prompts::{page_user_message, DEFAULT_EXTRACTION_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// The raw, unvalidated result of extracting one page.
#[derive(Debug, Clone)]
pub struct RawExtraction {
    /// Opaque key/value tree as returned by the service. Shape is validated
    /// later, at the aggregation boundary.
    pub content: Value,
}

/// One extraction call per page image. Implementations must not retry.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn extract(
        &self,
        page: &PageImage,
        model_hint: Option<&str>,
    ) -> Result<RawExtraction, ExtractionError>;

    /// Identifier of the model backing this client, recorded on the job.
    fn model_id(&self) -> String {
        "auto".to_string()
    }
}

// ── Reply parsing ─────────────────────────────────────────────────────────

static RE_FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*\n(.*?)\n```").unwrap());

/// Parse a model reply into a JSON object.
///
/// Accepts a bare JSON object or one wrapped in ``` / ```json fences.
/// Anything else — prose, arrays, scalars — is an [`ExtractionError::InvalidResponse`].
pub fn parse_structured_reply(reply: &str) -> Result<Value, ExtractionError> {
    let trimmed = reply.trim();

    let candidate = if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        Some(v)
    } else if let Some(caps) = RE_FENCED_JSON.captures(trimmed) {
        serde_json::from_str::<Value>(caps[1].trim()).ok()
    } else {
        None
    };

    match candidate {
        Some(v) if v.is_object() => Ok(v),
        Some(v) => Err(ExtractionError::InvalidResponse {
            detail: format!("expected a JSON object, got {}", type_name(&v)),
        }),
        None => Err(ExtractionError::InvalidResponse {
            detail: format!("reply is not JSON: {}", truncate(trimmed, 120)),
        }),
    }
}

/// Page-level confidence reported inside the content tree, if any.
pub fn page_confidence(content: &Value) -> Option<f64> {
    content.get("overall_confidence").and_then(Value::as_f64)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

// ── Production client ─────────────────────────────────────────────────────

/// Extraction client backed by an `edgequake-llm` vision provider.
pub struct VisionExtractionClient {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

impl VisionExtractionClient {
    /// Wrap a pre-constructed provider (tests, custom middleware).
    pub fn from_provider(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            // Low temperature keeps the model faithful to what is on the
            // page — exactly what transcription wants.
            temperature: 0.1,
            max_tokens: 4096,
        }
    }

    /// Resolve a provider from the environment, most-specific first:
    ///
    /// 1. `DOCFIELDS_LLM_PROVIDER` + `DOCFIELDS_MODEL` env pair — explicit
    ///    choice at the execution-environment level.
    /// 2. `OPENAI_API_KEY` present — prefer OpenAI so users with several
    ///    provider keys get a predictable default.
    /// 3. Full auto-detection via `ProviderFactory::from_env`.
    pub fn from_env(config: &PipelineConfig) -> Result<Self, DocFieldsError> {
        if let (Ok(prov), Ok(model)) = (
            std::env::var("DOCFIELDS_LLM_PROVIDER"),
            std::env::var("DOCFIELDS_MODEL"),
        ) {
            if !prov.is_empty() && !model.is_empty() {
                let provider = create_provider(&prov, &model)?;
                return Ok(Self::from_provider(provider, model));
            }
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                let model = config.model.as_deref().unwrap_or("gpt-4.1").to_string();
                let provider = create_provider("openai", &model)?;
                return Ok(Self::from_provider(provider, model));
            }
        }

        let (provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| DocFieldsError::ProviderNotConfigured {
                provider: "auto".to_string(),
                hint: format!(
                    "No vision provider could be auto-detected from environment.\n\
                     Set OPENAI_API_KEY or DOCFIELDS_LLM_PROVIDER + DOCFIELDS_MODEL.\n\
                     Error: {e}"
                ),
            })?;
        let model = config.model.clone().unwrap_or_else(|| "auto".to_string());
        Ok(Self::from_provider(provider, model))
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, DocFieldsError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        DocFieldsError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Map a provider error message onto the extraction taxonomy.
///
/// `edgequake-llm` flattens HTTP failures into display strings, so this
/// sniffs the status code back out. Unknown shapes become a 502-class
/// service error, which the retry policy treats as transient.
fn classify_provider_error(msg: &str) -> ExtractionError {
    let lower = msg.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") {
        return ExtractionError::RateLimited;
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return ExtractionError::Timeout { secs: 0 };
    }
    static RE_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([45]\d{2})\b").unwrap());
    let code = RE_STATUS
        .captures(msg)
        .and_then(|c| c[1].parse::<u16>().ok())
        .unwrap_or(502);
    ExtractionError::ServiceError {
        code,
        detail: truncate(msg, 200),
    }
}

#[async_trait]
impl ExtractionClient for VisionExtractionClient {
    async fn extract(
        &self,
        page: &PageImage,
        _model_hint: Option<&str>,
    ) -> Result<RawExtraction, ExtractionError> {
        let image = encode::to_image_data(&page.png);
        let messages = vec![
            ChatMessage::system(DEFAULT_EXTRACTION_PROMPT),
            ChatMessage::user_with_images(page_user_message(page.page_number), vec![image]),
        ];
        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_provider_error(&format!("{e}")))?;

        debug!(
            "Page {}: {} input tokens, {} output tokens",
            page.page_number, response.prompt_tokens, response.completion_tokens
        );

        let content = parse_structured_reply(&response.content)?;
        Ok(RawExtraction { content })
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_json_object() {
        let v = parse_structured_reply(r#"{"questions": []}"#).unwrap();
        assert!(v.get("questions").is_some());
    }

    #[test]
    fn parses_fenced_json() {
        let reply = "```json\n{\"questions\": [], \"overall_confidence\": 0.9}\n```";
        let v = parse_structured_reply(reply).unwrap();
        assert_eq!(page_confidence(&v), Some(0.9));
    }

    #[test]
    fn parses_anonymous_fence() {
        let reply = "```\n{\"questions\": []}\n```";
        assert!(parse_structured_reply(reply).is_ok());
    }

    #[test]
    fn rejects_prose() {
        let err = parse_structured_reply("I could not read this page, sorry.").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidResponse { .. }));
    }

    #[test]
    fn rejects_non_object_json() {
        let err = parse_structured_reply("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidResponse { .. }));
    }

    #[test]
    fn page_confidence_absent() {
        assert_eq!(page_confidence(&json!({"questions": []})), None);
    }

    #[test]
    fn classify_rate_limit() {
        assert!(matches!(
            classify_provider_error("HTTP 429 Too Many Requests"),
            ExtractionError::RateLimited
        ));
    }

    #[test]
    fn classify_client_error_keeps_code() {
        match classify_provider_error("API error: 401 unauthorized") {
            ExtractionError::ServiceError { code, .. } => assert_eq!(code, 401),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_unknown_is_transient() {
        match classify_provider_error("connection reset by peer") {
            ExtractionError::ServiceError { code, .. } => assert_eq!(code, 502),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
