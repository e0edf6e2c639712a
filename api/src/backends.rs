use std::time::Duration;

use async_trait::async_trait;
use mindease_core::chat::{BackendTier, ChatBackendResponse, Citation};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::{CloudBackendConfig, LocalBackendConfig};
use crate::retry::AttemptError;
use crate::screening;

const SYSTEM_PROMPT: &str = "\
You are MindEase, a compassionate and emotionally intelligent mental health companion.
You are not a therapist or medical professional. Do not diagnose or give medical advice.
Respond to the emotion first, ask before going deeper, keep answers short to medium length,
and stay hope-oriented. If crisis indicators appear, acknowledge the pain and encourage
immediate human help.";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned HTTP {0}")]
    Status(u16),
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout(_))
    }
}

impl From<AttemptError<BackendError>> for BackendError {
    fn from(err: AttemptError<BackendError>) -> Self {
        match err {
            AttemptError::Timeout(after) => BackendError::Timeout(after),
            AttemptError::Failed(err) => err,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackendRequest<'a> {
    pub user_id: Uuid,
    pub message: &'a str,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;
    fn tier(&self) -> BackendTier;
    async fn chat(&self, request: &BackendRequest<'_>) -> Result<ChatBackendResponse, BackendError>;
}

// --- cloud (OpenAI-compatible chat completions) ---

pub struct CloudBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl CloudBackend {
    pub fn new(client: reqwest::Client, config: &CloudBackendConfig) -> Self {
        Self {
            client,
            url: format!("{}/chat/completions", config.url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// The cloud API does not label risk, so the user's message is screened. The
/// reply is not: supportive replies name the very topics the screen looks for.
fn cloud_response(
    message: &str,
    completion: CompletionResponse,
    fallback_model: &str,
) -> Result<ChatBackendResponse, BackendError> {
    let reply = completion
        .choices
        .into_iter()
        .find_map(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| BackendError::InvalidResponse("completion has no content".to_string()))?;

    let level = screening::screen(message);
    let (label, score) = screening::safety_signal(level);

    Ok(ChatBackendResponse {
        reply,
        safety_label: Some(label.to_string()),
        risk_score: Some(score),
        citations: Vec::new(),
        model_used: completion
            .model
            .unwrap_or_else(|| fallback_model.to_string()),
    })
}

#[async_trait]
impl ChatBackend for CloudBackend {
    fn name(&self) -> &str {
        "cloud"
    }

    fn tier(&self) -> BackendTier {
        BackendTier::Baseline
    }

    async fn chat(&self, request: &BackendRequest<'_>) -> Result<ChatBackendResponse, BackendError> {
        let mut builder = self.client.post(&self.url).json(&json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": request.message},
            ],
            "temperature": 0.7,
        }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }
        let completion = response.json::<CompletionResponse>().await?;
        cloud_response(request.message, completion, &self.model)
    }
}

// --- local retrieval-augmented service ---

pub struct LocalBackend {
    client: reqwest::Client,
    url: String,
}

impl LocalBackend {
    pub fn new(client: reqwest::Client, config: &LocalBackendConfig) -> Self {
        Self {
            client,
            url: format!("{}/chat", config.url.trim_end_matches('/')),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LocalChatResponse {
    reply: Option<String>,
    #[serde(default)]
    meta: Option<LocalChatMeta>,
}

#[derive(Debug, Deserialize)]
struct LocalChatMeta {
    #[serde(default)]
    safety: Option<String>,
    /// Kept loose: a malformed score must reach the classifier as "missing".
    #[serde(default)]
    risk_score: Option<serde_json::Value>,
    #[serde(default)]
    citations: Vec<Citation>,
    #[serde(default)]
    model_used: Option<String>,
}

fn local_response(body: LocalChatResponse) -> Result<ChatBackendResponse, BackendError> {
    let reply = body
        .reply
        .filter(|reply| !reply.trim().is_empty())
        .ok_or_else(|| BackendError::InvalidResponse("empty reply".to_string()))?;
    let meta = body.meta;

    Ok(ChatBackendResponse {
        reply,
        safety_label: meta.as_ref().and_then(|m| m.safety.clone()),
        risk_score: meta
            .as_ref()
            .and_then(|m| m.risk_score.as_ref())
            .and_then(serde_json::Value::as_f64),
        citations: meta
            .as_ref()
            .map(|m| m.citations.clone())
            .unwrap_or_default(),
        model_used: meta
            .and_then(|m| m.model_used)
            .unwrap_or_else(|| "local".to_string()),
    })
}

#[async_trait]
impl ChatBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn tier(&self) -> BackendTier {
        BackendTier::Advanced
    }

    async fn chat(&self, request: &BackendRequest<'_>) -> Result<ChatBackendResponse, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "user_id": request.user_id,
                "message": request.message,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }
        local_response(response.json::<LocalChatResponse>().await?)
    }
}
