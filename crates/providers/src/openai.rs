use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::agent_api::ChatMessage;
use shared::settings::{BackendKind, RemoteConfig};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{CancelHandle, ChatBackend, ChatStream, StreamSink};
use crate::sse::SseParser;

/// Bound for the connectivity test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

// ── Streaming response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<OpenAIError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIStreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    #[serde(default)]
    message: String,
}

// ── Client ───────────────────────────────────────────────────────────

pub struct OpenAIClient {
    http: Client,
    auth_token: String,
    model: String,
    base_url: String,
}

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Accepts `https://host`, `https://host/` and `https://host/v1`.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/v1").unwrap_or(trimmed);
    if trimmed.is_empty() {
        DEFAULT_BASE_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

impl OpenAIClient {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            http: SHARED_HTTP.clone(),
            auth_token: config.api_key.trim().to_string(),
            model: config.model_name.clone(),
            base_url: normalize_base_url(&config.base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn pump(
        http: Client,
        url: String,
        auth_token: String,
        body: serde_json::Value,
        sink: StreamSink,
    ) {
        let resp = match http
            .post(&url)
            .bearer_auth(&auth_token)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "remote chat request failed");
                sink.error(format!("Could not reach the remote API: {}", e));
                return;
            }
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let detail: String = body.chars().take(800).collect();
            if detail.trim().is_empty() {
                sink.error(format!("openai error: {}", status));
            } else {
                sink.error(format!("openai error: {}\n{}", status, detail.trim()));
            }
            return;
        }

        let mut parser = SseParser::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    sink.error(format!("stream read error: {}", e));
                    return;
                }
            };
            for event in parser.feed(&bytes) {
                match Self::handle_data(&event.data, &sink) {
                    EventOutcome::Continue => {}
                    EventOutcome::Done => {
                        sink.done();
                        return;
                    }
                    EventOutcome::Failed(message) => {
                        sink.error(message);
                        return;
                    }
                }
            }
            if sink.is_closed() {
                debug!("chat stream consumer dropped, closing remote request");
                return;
            }
        }

        if let Some(event) = parser.finish() {
            if let EventOutcome::Failed(message) = Self::handle_data(&event.data, &sink) {
                sink.error(message);
                return;
            }
        }
        sink.done();
    }

    fn handle_data(data: &str, sink: &StreamSink) -> EventOutcome {
        let data = data.trim();
        if data == "[DONE]" {
            return EventOutcome::Done;
        }
        if data.is_empty() {
            return EventOutcome::Continue;
        }
        let resp = match serde_json::from_str::<OpenAIStreamResponse>(data) {
            Ok(resp) => resp,
            Err(e) => return EventOutcome::Failed(format!("Malformed stream event: {}", e)),
        };
        if let Some(error) = resp.error {
            return EventOutcome::Failed(format!("openai error: {}", error.message));
        }
        let Some(choice) = resp.choices.first() else {
            return EventOutcome::Continue;
        };
        if let Some(content) = choice.delta.as_ref().and_then(|d| d.content.as_ref()) {
            if !content.is_empty() {
                sink.token(content.clone());
            }
        }
        if choice.finish_reason.is_some() {
            EventOutcome::Done
        } else {
            EventOutcome::Continue
        }
    }
}

enum EventOutcome {
    Continue,
    Done,
    Failed(String),
}

#[async_trait]
impl ChatBackend for OpenAIClient {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteApi
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn is_ready(&self) -> bool {
        !self.auth_token.is_empty() && !self.model.is_empty()
    }

    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<ChatStream> {
        if self.auth_token.is_empty() {
            return Err(anyhow!("No API key configured for the remote API"));
        }
        let body = serde_json::to_value(OpenAIRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
        })?;
        let url = format!("{}/v1/chat/completions", self.base_url);

        let (abort, registration) = AbortHandle::new_pair();
        let (sink, stream) = ChatStream::channel(CancelHandle::from_abort(abort));
        let fut = Self::pump(self.http.clone(), url, self.auth_token.clone(), body, sink);
        tokio::spawn(Abortable::new(fut, registration));
        Ok(stream)
    }

    async fn test_connection(&self) -> bool {
        if self.auth_token.is_empty() {
            return false;
        }
        let url = format!("{}/v1/models", self.base_url);
        match self
            .http
            .get(&url)
            .bearer_auth(&self.auth_token)
            .timeout(TEST_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "remote connection test failed");
                false
            }
        }
    }
}
