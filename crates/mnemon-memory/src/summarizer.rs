//! Model-backed summarizers.
//!
//! [`ChatSummarizer`] asks a chat model for a summary: OpenAI and Ollama
//! through the OpenAI-compatible `/chat/completions` endpoint, Gemini through
//! `generateContent`. [`FallbackSummarizer`] pairs it with the offline
//! extractive summarizer so compression and reflection keep working when the
//! provider is unreachable.

use crate::compression::{ExtractiveSummarizer, Summarizer};
use crate::embedding::{GEMINI_BASE_URL, OLLAMA_BASE_URL, OPENAI_BASE_URL};
use async_trait::async_trait;
use mnemon_types::config::{EmbeddingConfig, EmbeddingProvider};
use mnemon_types::error::{MnemonError, MnemonResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

const DEFAULT_OPENAI_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OLLAMA_CHAT_MODEL: &str = "llama3.2";
const DEFAULT_GEMINI_CHAT_MODEL: &str = "gemini-1.5-flash";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TEMPERATURE: f32 = 0.3;

const SYSTEM_PROMPT: &str = "You condense notes for a long-term memory store. \
Keep names, numbers and decisions. Reply with the summary only.";

/// Error type for summary requests.
#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<SummaryError> for MnemonError {
    fn from(e: SummaryError) -> Self {
        MnemonError::Provider(e.to_string())
    }
}

/// Wire format spoken by a chat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatApi {
    /// `POST {base}/chat/completions`
    OpenAiCompatible,
    /// `POST {base}/models/{model}:generateContent`
    Gemini,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

/// Instruction sent as the user turn.
fn user_prompt(text: &str, target_chars: usize) -> String {
    format!("Summarize the following in at most {target_chars} characters.\n\n{text}")
}

/// Output token budget for a summary of `target_chars` characters.
fn max_tokens(target_chars: usize) -> u32 {
    u32::try_from(target_chars / 3 + 32).unwrap_or(u32::MAX)
}

/// Extract the summary from an OpenAI-compatible response body.
pub fn parse_chat_response(body: &str) -> Result<String, SummaryError> {
    let resp: ChatResponse =
        serde_json::from_str(body).map_err(|e| SummaryError::Parse(e.to_string()))?;
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SummaryError::Parse("response has no message content".to_string()))
}

/// Extract the summary from a Gemini `generateContent` response body.
pub fn parse_gemini_response(body: &str) -> Result<String, SummaryError> {
    let resp: GeminiResponse =
        serde_json::from_str(body).map_err(|e| SummaryError::Parse(e.to_string()))?;
    let text: String = resp
        .candidates
        .into_iter()
        .next()
        .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();
    let text = text.trim();
    if text.is_empty() {
        return Err(SummaryError::Parse("response has no candidate text".to_string()));
    }
    Ok(text.to_string())
}

/// Summarizer backed by a remote or local chat model.
pub struct ChatSummarizer {
    api: ChatApi,
    api_key: Zeroizing<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl ChatSummarizer {
    pub fn new(api: ChatApi, api_key: String, base_url: String, model: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            api,
            api_key: Zeroizing::new(api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
        }
    }

    /// The model this summarizer asks.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, text: &str, target_chars: usize) -> reqwest::RequestBuilder {
        let prompt = user_prompt(text, target_chars);
        match self.api {
            ChatApi::OpenAiCompatible => {
                let body = ChatRequest {
                    model: &self.model,
                    messages: vec![
                        ChatMessage {
                            role: "system",
                            content: SYSTEM_PROMPT.to_string(),
                        },
                        ChatMessage {
                            role: "user",
                            content: prompt,
                        },
                    ],
                    temperature: TEMPERATURE,
                    max_tokens: max_tokens(target_chars),
                };
                let url = format!("{}/chat/completions", self.base_url);
                let mut req = self.client.post(url).json(&body);
                if !self.api_key.as_str().is_empty() {
                    req = req.header("Authorization", format!("Bearer {}", self.api_key.as_str()));
                }
                req
            }
            ChatApi::Gemini => {
                let body = GeminiRequest {
                    system_instruction: GeminiContent {
                        role: None,
                        parts: vec![GeminiPart {
                            text: SYSTEM_PROMPT.to_string(),
                        }],
                    },
                    contents: vec![GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![GeminiPart { text: prompt }],
                    }],
                    generation_config: GeminiGenerationConfig {
                        temperature: TEMPERATURE,
                        max_output_tokens: max_tokens(target_chars),
                    },
                };
                let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
                self.client
                    .post(url)
                    .header("x-goog-api-key", self.api_key.as_str())
                    .json(&body)
            }
        }
    }
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(&self, text: &str, target_chars: usize) -> MnemonResult<String> {
        let resp = self
            .request(text, target_chars)
            .send()
            .await
            .map_err(|e| SummaryError::Http(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| SummaryError::Http(e.to_string()))?;
        if status != 200 {
            return Err(SummaryError::Api {
                status,
                message: body,
            }
            .into());
        }

        let summary = match self.api {
            ChatApi::OpenAiCompatible => parse_chat_response(&body)?,
            ChatApi::Gemini => parse_gemini_response(&body)?,
        };
        debug!(
            model = %self.model,
            input_chars = text.chars().count(),
            output_chars = summary.chars().count(),
            "Summarized text"
        );
        Ok(summary)
    }
}

/// Tries `primary` and falls back to `fallback` when it fails or returns nothing.
pub struct FallbackSummarizer {
    primary: Arc<dyn Summarizer>,
    fallback: Arc<dyn Summarizer>,
}

impl FallbackSummarizer {
    pub fn new(primary: Arc<dyn Summarizer>, fallback: Arc<dyn Summarizer>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Summarizer for FallbackSummarizer {
    async fn summarize(&self, text: &str, target_chars: usize) -> MnemonResult<String> {
        match self.primary.summarize(text, target_chars).await {
            Ok(s) if !s.trim().is_empty() => Ok(s),
            Ok(_) => {
                debug!("Summarizer returned nothing, using fallback");
                self.fallback.summarize(text, target_chars).await
            }
            Err(e) => {
                warn!(error = %e, "Summarizer failed, using fallback");
                self.fallback.summarize(text, target_chars).await
            }
        }
    }
}

/// Summarizer matching the configured provider.
///
/// The synthetic provider stays offline and uses the extractive summarizer.
/// Every other provider asks its chat model, falling back to extractive.
pub fn create_summarizer(config: &EmbeddingConfig) -> Arc<dyn Summarizer> {
    let (api, default_url, default_model) = match config.provider {
        EmbeddingProvider::Synthetic => return Arc::new(ExtractiveSummarizer),
        EmbeddingProvider::OpenAi => (
            ChatApi::OpenAiCompatible,
            OPENAI_BASE_URL,
            DEFAULT_OPENAI_CHAT_MODEL,
        ),
        EmbeddingProvider::Ollama => (
            ChatApi::OpenAiCompatible,
            OLLAMA_BASE_URL,
            DEFAULT_OLLAMA_CHAT_MODEL,
        ),
        EmbeddingProvider::Gemini => (ChatApi::Gemini, GEMINI_BASE_URL, DEFAULT_GEMINI_CHAT_MODEL),
    };
    let base_url = config
        .base_url
        .clone()
        .unwrap_or_else(|| default_url.to_string());
    let model = config
        .chat_model
        .clone()
        .unwrap_or_else(|| default_model.to_string());
    debug!(provider = ?config.provider, model = %model, "Using chat summarizer");

    let chat = ChatSummarizer::new(
        api,
        config.api_key.clone().unwrap_or_default(),
        base_url,
        model,
    );
    Arc::new(FallbackSummarizer::new(
        Arc::new(chat),
        Arc::new(ExtractiveSummarizer),
    ))
}
