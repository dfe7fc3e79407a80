//! Direct streaming from an OpenAI-compatible chat completions API.
//!
//! The provider speaks HTTP with server-sent events instead of the chat
//! service's WebSocket protocol, so each `ProviderLink` translates a
//! completion stream into the same start/chunk/end/error frames the
//! connection manager already understands.

use crate::api::join_path;
use crate::error::ChatError;
use crate::protocol::{ChatRequest, StreamEvent};
use crate::state::Author;
use crate::transport::{Frame, Link, Transport};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub const TEMPERATURE: f64 = 0.7;
pub const MAX_TOKENS: u32 = 2000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "deepseek")]
    DeepSeek,
}

impl Provider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "deepseek" => Some(Self::DeepSeek),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::DeepSeek => "DeepSeek",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::DeepSeek => "deepseek-chat",
        }
    }

    /// Environment variable holding the API key.
    pub fn key_variable(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::DeepSeek => "deepseek",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub provider: Provider,
    pub api_key: Option<String>,
    pub base_url: Url,
}

impl ProviderSettings {
    pub fn completions_url(&self) -> Result<Url, ChatError> {
        join_path(&self.base_url, "chat/completions")
    }

    fn missing_key(&self) -> String {
        format!(
            "{} API key is not configured. Set {} or providers.{}.api_key in streamchat.yaml.",
            self.provider.label(),
            self.provider.key_variable(),
            self.provider
        )
    }
}

/// Streams completions straight from the provider. One request is in
/// flight per link; the request carries the earlier turns as context.
#[derive(Debug, Clone)]
pub struct ProviderTransport {
    settings: ProviderSettings,
    client: Client,
}

impl ProviderTransport {
    pub fn new(settings: ProviderSettings) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { settings, client }
    }
}

#[async_trait]
impl Transport for ProviderTransport {
    async fn connect(&self, _endpoint: &Url) -> Result<Box<dyn Link>, ChatError> {
        let (frames_tx, frames) = unbounded_channel();
        info!(provider = %self.settings.provider, "using provider stream");
        Ok(Box::new(ProviderLink {
            settings: self.settings.clone(),
            client: self.client.clone(),
            frames_tx,
            frames,
            in_flight: None,
        }))
    }
}

struct ProviderLink {
    settings: ProviderSettings,
    client: Client,
    frames_tx: UnboundedSender<String>,
    frames: UnboundedReceiver<String>,
    in_flight: Option<JoinHandle<()>>,
}

#[async_trait]
impl Link for ProviderLink {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        let request: ChatRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "unreadable request envelope");
                emit(&self.frames_tx, StreamEvent::error("Invalid message format"));
                return Ok(());
            }
        };
        let Some(api_key) = self.settings.api_key.clone() else {
            emit(&self.frames_tx, StreamEvent::error(self.settings.missing_key()));
            return Ok(());
        };
        let url = self.settings.completions_url()?;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.settings.provider.default_model().to_string());
        let body = completion_body(&model, &request);

        if let Some(previous) = self.in_flight.take() {
            previous.abort();
        }
        let client = self.client.clone();
        let frames = self.frames_tx.clone();
        self.in_flight = Some(tokio::spawn(async move {
            stream_completion(client, url, api_key, body, frames).await;
        }));
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, ChatError>> {
        // the link holds a sender, so this only ends when the link does
        self.frames.recv().await.map(|text| Ok(Frame::Text(text)))
    }

    async fn close(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }
}

impl Drop for ProviderLink {
    fn drop(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }
}

fn completion_body(model: &str, request: &ChatRequest) -> Value {
    let mut messages: Vec<Value> = request
        .context
        .iter()
        .map(|message| json!({"role": role(message.role), "content": message.content}))
        .collect();
    messages.push(json!({"role": "user", "content": request.message}));
    json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "temperature": TEMPERATURE,
        "max_tokens": MAX_TOKENS,
    })
}

fn role(author: Author) -> &'static str {
    match author {
        Author::User => "user",
        Author::Assistant => "assistant",
    }
}

fn emit(frames: &UnboundedSender<String>, event: StreamEvent) {
    match event.encode() {
        Ok(text) => {
            let _ = frames.send(text);
        }
        Err(err) => warn!(%err, "failed to encode provider event"),
    }
}

async fn stream_completion(
    client: Client,
    url: Url,
    api_key: String,
    body: Value,
    frames: UnboundedSender<String>,
) {
    emit(&frames, StreamEvent::Start);
    let response = match client
        .post(url.clone())
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!(%err, "provider request failed");
            emit(&frames, StreamEvent::error(err.to_string()));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "provider rejected the request");
        emit(&frames, StreamEvent::error(provider_error(status, &text)));
        return;
    }

    debug!(%url, "provider stream open");
    let mut bytes = response.bytes_stream();
    let mut buffer = String::new();
    while let Some(next) = bytes.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(err) => {
                emit(&frames, StreamEvent::error(format!("Stream read error: {err}")));
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(line_end) = buffer.find('\n') {
            let line: String = buffer.drain(..=line_end).collect();
            match parse_sse_line(&line) {
                Some(SseData::Delta(text)) => emit(&frames, StreamEvent::chunk(text)),
                Some(SseData::Done) => {
                    emit(&frames, StreamEvent::End);
                    return;
                }
                None => {}
            }
        }
    }
    // some providers end the body without a [DONE] marker
    if let Some(SseData::Delta(text)) = parse_sse_line(&buffer) {
        emit(&frames, StreamEvent::chunk(text));
    }
    emit(&frames, StreamEvent::End);
}

/// Error text for a non-2xx provider response: the provider's own
/// `error.message` when it sent one.
fn provider_error(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| {
            format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error")
            )
        })
}

#[derive(Debug, PartialEq, Eq)]
enum SseData {
    Delta(String),
    Done,
}

/// Lines other than `data:` ones, unparsable payloads and empty deltas are
/// skipped.
fn parse_sse_line(line: &str) -> Option<SseData> {
    let data = line.trim().strip_prefix("data: ")?;
    if data == "[DONE]" {
        return Some(SseData::Done);
    }
    let value: Value = serde_json::from_str(data).ok()?;
    let content = value["choices"].get(0)?["delta"]["content"].as_str()?;
    (!content.is_empty()).then(|| SseData::Delta(content.to_string()))
}
