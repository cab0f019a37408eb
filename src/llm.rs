//! Language model client
//!
//! One `generateContent` call per utterance. The system instruction is
//! prepended to the user text in a single user turn.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::{Error, Result};

/// Reply returned when the model produced no text
pub const EMPTY_REPLY: &str = "[Empty response]";

/// Produces a reply for one utterance
#[async_trait]
pub trait Responder: Send + Sync {
    /// Generate a reply to `text`
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot be reached or rejects the request
    async fn reply(&self, text: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: [RequestPart; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
    response_mime_type: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate, trimmed
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

/// Gemini `generateContent` client
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    config: LlmConfig,
}

impl GeminiClient {
    #[must_use]
    pub fn new(config: LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client, config }
    }

    fn request_body(&self, text: &str) -> GenerateRequest<'static> {
        GenerateRequest {
            contents: [Content {
                role: "user",
                parts: [RequestPart {
                    text: format!("{}\n\n{text}", self.config.system_instruction),
                }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                response_mime_type: "text/plain",
            },
        }
    }
}

#[async_trait]
impl Responder for GeminiClient {
    async fn reply(&self, text: &str) -> Result<String> {
        let key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("GEMINI_API_KEY not set".to_string()))?;

        let url = format!(
            "{}/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        );

        tracing::debug!(model = %self.config.model, chars = text.len(), "LLM request");

        let response = self
            .client
            .post(&url)
            .query(&[("key", key.expose_secret())])
            .json(&self.request_body(text))
            .send()
            .await
            .map_err(|e| Error::Connection(format!("LLM request failed: {}", e.without_url())))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("{status} - {body}")));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("invalid response: {e}")))?;

        let reply = body.text();
        if reply.is_empty() {
            tracing::warn!("LLM returned no text");
            return Ok(EMPTY_REPLY.to_string());
        }
        Ok(reply)
    }
}
