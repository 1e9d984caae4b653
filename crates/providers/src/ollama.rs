//! Client for a local Ollama daemon: model listing and NDJSON chat streaming.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::agent_api::ChatMessage;
use shared::settings::{BackendKind, DaemonConfig};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{CancelHandle, ChatBackend, ChatStream, StreamSink};

/// Bound for the availability probe.
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Bound for an explicit model-list refresh.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

// No overall timeout: a generation may legitimately stream for minutes and
// is only ever stopped through its cancel handle.
static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// Each line of the streaming response is one of these.
#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    digest: String,
    #[serde(default)]
    modified_at: String,
}

/// A model installed in the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub name: String,
    pub size: u64,
    pub digest: String,
    pub modified_at: String,
    /// e.g. "1.9 GB", empty when the size is unknown
    pub formatted_size: String,
}

impl From<OllamaTag> for ModelDescriptor {
    fn from(tag: OllamaTag) -> Self {
        Self {
            formatted_size: format_size(tag.size),
            name: tag.name,
            size: tag.size,
            digest: tag.digest,
            modified_at: tag.modified_at,
        }
    }
}

/// Human readable size: GB with one decimal from 1 GiB up, whole MB below.
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return String::new();
    }
    let gb = bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    if gb >= 1.0 {
        return format!("{:.1} GB", gb);
    }
    let mb = bytes as f64 / (1024.0 * 1024.0);
    format!("{:.0} MB", mb)
}

pub struct OllamaClient {
    http: Client,
    base: String,
    model: String,
}

impl OllamaClient {
    pub fn new(config: &DaemonConfig, model: impl Into<String>) -> Self {
        Self::with_base_url(&config.base_url(), model)
    }

    pub fn with_base_url(base: &str, model: impl Into<String>) -> Self {
        Self {
            http: SHARED_HTTP.clone(),
            base: base.trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Query `/api/tags`. Any transport failure, timeout or non-2xx is an `Err`.
    pub async fn list_models(&self, timeout: Duration) -> Result<Vec<ModelDescriptor>> {
        let url = format!("{}/api/tags", self.base);
        let resp = self.http.get(&url).timeout(timeout).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("Failed to list models: {}", resp.status()));
        }
        let body: OllamaTagsResponse = resp.json().await?;
        Ok(body.models.into_iter().map(ModelDescriptor::from).collect())
    }

    async fn pump(http: Client, url: String, body: serde_json::Value, sink: StreamSink) {
        let resp = match http.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "ollama request failed");
                sink.error(format!("Could not reach the local daemon: {}", e));
                return;
            }
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            let detail: String = detail.chars().take(300).collect();
            sink.error(format!("ollama error: {} {}", status, detail.trim()));
            return;
        }

        // Ollama streams line-delimited JSON
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    sink.error(format!("stream read error: {}", e));
                    return;
                }
            };
            buf.extend_from_slice(&bytes);

            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                match Self::handle_line(&line, &sink) {
                    LineOutcome::Continue => {}
                    LineOutcome::Done => {
                        sink.done();
                        return;
                    }
                    LineOutcome::Failed(message) => {
                        sink.error(message);
                        return;
                    }
                }
            }
            if sink.is_closed() {
                debug!("chat stream consumer dropped, closing daemon request");
                return;
            }
        }

        match Self::handle_line(&buf, &sink) {
            LineOutcome::Failed(message) => sink.error(message),
            LineOutcome::Continue | LineOutcome::Done => sink.done(),
        }
    }

    fn handle_line(line: &[u8], sink: &StreamSink) -> LineOutcome {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return LineOutcome::Continue;
        }
        match serde_json::from_str::<OllamaStreamChunk>(line) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    return LineOutcome::Failed(format!("ollama error: {}", error));
                }
                if let Some(msg) = chunk.message {
                    if !msg.content.is_empty() {
                        sink.token(msg.content);
                    }
                }
                if chunk.done {
                    LineOutcome::Done
                } else {
                    LineOutcome::Continue
                }
            }
            Err(e) => LineOutcome::Failed(format!("Failed to parse Ollama stream: {}", e)),
        }
    }
}

enum LineOutcome {
    Continue,
    Done,
    Failed(String),
}

#[async_trait]
impl ChatBackend for OllamaClient {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalDaemon
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn is_ready(&self) -> bool {
        !self.model.is_empty()
    }

    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<ChatStream> {
        if self.model.is_empty() {
            return Err(anyhow!("No local model selected"));
        }
        let body = serde_json::to_value(OllamaChatRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
        })?;
        let url = format!("{}/api/chat", self.base);

        let (abort, registration) = AbortHandle::new_pair();
        let (sink, stream) = ChatStream::channel(CancelHandle::from_abort(abort));
        let fut = Self::pump(self.http.clone(), url, body, sink);
        tokio::spawn(Abortable::new(fut, registration));
        Ok(stream)
    }

    async fn test_connection(&self) -> bool {
        self.list_models(DETECT_TIMEOUT).await.is_ok()
    }
}
