use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::retry::Retryable;
use crate::session::Turn;
use crate::settings::ModelParams;

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.llama-api.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ERROR_BODY_BYTES: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<Turn>,
    pub params: ModelParams,
}

/// How a single upstream call failed. Bodies are kept for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream rejected the credential")]
    Auth { body: String },
    #[error("upstream is throttling requests")]
    RateLimited { body: String },
    #[error("upstream unavailable: {reason}")]
    Transient { reason: String },
    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },
    #[error("unexpected upstream response: {reason}")]
    Shape { reason: String },
}

impl Retryable for UpstreamError {
    fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient { .. })
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Returns the assistant text of the first choice.
    async fn complete(&self, req: &ChatRequest, api_key: &str) -> Result<String, UpstreamError>;
}

/// Client for any `/chat/completions` endpoint speaking the OpenAI schema.
#[derive(Clone)]
pub struct OpenAICompatible {
    pub base_url: String,
    pub model: Option<String>,
    client: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(base_url: impl Into<String>, model: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url: base_url.into(), model, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")] model: Option<&'a str>,
    messages: &'a [Turn],
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    #[serde(default)]
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice { message: Option<OaiMessage> }

#[derive(Debug, Deserialize)]
struct OaiMessage { content: Option<String> }

fn cap_utf8(mut bytes: Vec<u8>, max_bytes: usize) -> String {
    if bytes.len() > max_bytes { bytes.truncate(max_bytes); }
    String::from_utf8_lossy(&bytes).to_string()
}

fn transport_failure(e: &reqwest::Error) -> UpstreamError {
    // reqwest's Display carries the endpoint URL, which must not reach callers.
    let reason = if e.is_timeout() {
        "request timed out"
    } else if e.is_connect() {
        "could not connect"
    } else {
        "transport error"
    };
    UpstreamError::Transient { reason: reason.into() }
}

pub(crate) fn classify_status(status: StatusCode, body: String) -> UpstreamError {
    match status.as_u16() {
        401 | 403 => UpstreamError::Auth { body },
        429 => UpstreamError::RateLimited { body },
        // 524 is the CDN flavour of a gateway timeout
        408 | 502 | 503 | 504 | 524 => UpstreamError::Transient { reason: format!("status {}", status.as_u16()) },
        code => UpstreamError::Status { status: code, body },
    }
}

pub(crate) fn extract_content(body: &[u8]) -> Result<String, UpstreamError> {
    let v: OaiChatResponse = serde_json::from_slice(body)
        .map_err(|e| UpstreamError::Shape { reason: format!("body is not a chat completion: {e}") })?;
    v.choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .ok_or_else(|| UpstreamError::Shape { reason: "missing choices[0].message.content".into() })
}

#[async_trait]
impl ChatModel for OpenAICompatible {
    async fn complete(&self, req: &ChatRequest, api_key: &str) -> Result<String, UpstreamError> {
        let body = OaiChatRequest {
            model: self.model.as_deref(),
            messages: &req.messages,
            stream: false,
            temperature: req.params.temperature,
            max_tokens: req.params.max_tokens,
        };
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_failure(&e))?;

        let status = resp.status();
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) if e.is_timeout() => return Err(transport_failure(&e)),
            Err(_) if !status.is_success() => Default::default(),
            // a body cut off mid-stream is a dropped connection, not a malformed reply
            Err(e) => return Err(transport_failure(&e)),
        };
        if !status.is_success() {
            tracing::warn!(%status, "model call failed");
            return Err(classify_status(status, cap_utf8(bytes.to_vec(), MAX_ERROR_BODY_BYTES)));
        }
        extract_content(&bytes)
    }
}
