use crate::error::ChatError;
use crate::protocol::{ChatRequest, StreamEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Close code for a clean, caller-initiated shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

/// One established duplex connection.
#[async_trait]
pub trait Link: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError>;

    /// Next inbound frame. `None` means the stream ended without a close frame.
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn next_frame(&mut self) -> Option<Result<Frame, ChatError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, endpoint: &Url) -> Result<Box<dyn Link>, ChatError>;
}

/// Which service answers. Built by `ClientConfig::transport_for`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Websocket,
    Mock,
    /// Straight to an OpenAI-compatible completions API.
    Provider,
}

impl TransportKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            value if value.eq_ignore_ascii_case("websocket") || value.eq_ignore_ascii_case("ws") => {
                Some(Self::Websocket)
            }
            value if value.eq_ignore_ascii_case("mock") => Some(Self::Mock),
            value if value.eq_ignore_ascii_case("provider") => Some(Self::Provider),
            _ => None,
        }
    }
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, endpoint: &Url) -> Result<Box<dyn Link>, ChatError> {
        let (stream, response) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|err| ChatError::Connection(err.to_string()))?;
        tracing::debug!(status = %response.status(), host = ?endpoint.host_str(), "websocket handshake complete");
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| ChatError::Connection(err.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, ChatError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(ChatError::Connection(err.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text))),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => tracing::warn!("ignoring non-utf8 binary frame"),
                },
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    return Some(Ok(Frame::Closed { code, reason }));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client closing".into(),
        };
        if let Err(err) = self.stream.close(Some(frame)).await {
            tracing::debug!(%err, "websocket close handshake failed");
        }
    }
}

/// In-process stand-in for the chat service. Replies to every request with a
/// synthetic answer streamed word by word.
#[derive(Debug, Clone)]
pub struct MockTransport {
    chunk_delay: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl MockTransport {
    pub fn new(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _endpoint: &Url) -> Result<Box<dyn Link>, ChatError> {
        Ok(Box::new(MockLink {
            chunk_delay: self.chunk_delay,
            pending: VecDeque::new(),
            closed: false,
        }))
    }
}

struct MockLink {
    chunk_delay: Duration,
    pending: VecDeque<StreamEvent>,
    closed: bool,
}

impl MockLink {
    fn reply_to(&mut self, request: &ChatRequest) {
        let prompt = request.message.trim();
        if prompt.is_empty() {
            self.pending.push_back(StreamEvent::error("Invalid message format"));
            return;
        }
        let reply = format!(
            "[Mock] Model {:?}: received '{}'.",
            request.model.as_deref().unwrap_or("default"),
            prompt
        );
        self.pending.push_back(StreamEvent::Start);
        for (index, word) in reply.split(' ').enumerate() {
            let piece = if index == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            self.pending.push_back(StreamEvent::chunk(piece));
        }
        self.pending.push_back(StreamEvent::End);
    }
}

#[async_trait]
impl Link for MockLink {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        match serde_json::from_str::<ChatRequest>(&text) {
            Ok(request) => self.reply_to(&request),
            Err(_) => self
                .pending
                .push_back(StreamEvent::error("Invalid message format")),
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, ChatError>> {
        if self.closed {
            return Some(Ok(Frame::Closed {
                code: Some(NORMAL_CLOSURE),
                reason: String::new(),
            }));
        }
        if self.pending.is_empty() {
            return futures::future::pending().await;
        }
        sleep(self.chunk_delay).await;
        let event = self.pending.pop_front()?;
        Some(event.encode().map(Frame::Text))
    }

    async fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
    }
}

/// Scripted in-memory transport. Each `connect` consumes the next scripted
/// outcome; an empty script refuses the connection.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    attempts: Arc<AtomicU32>,
}

enum Scripted {
    Refuse(String),
    Accept(ChannelLink),
}

/// Peer side of a scripted link.
pub struct LinkHandle {
    inbound: Option<UnboundedSender<Frame>>,
    outbound: UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

struct ChannelLink {
    inbound: UnboundedReceiver<Frame>,
    outbound: UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_next(&self, reason: impl Into<String>) {
        self.script.lock().push_back(Scripted::Refuse(reason.into()));
    }

    pub fn accept_next(&self) -> LinkHandle {
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let (outbound_tx, outbound_rx) = unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.script.lock().push_back(Scripted::Accept(ChannelLink {
            inbound: inbound_rx,
            outbound: outbound_tx,
            closed: closed.clone(),
        }));
        LinkHandle {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            closed,
        }
    }

    /// Number of `connect` calls so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, _endpoint: &Url) -> Result<Box<dyn Link>, ChatError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            Some(Scripted::Accept(link)) => Ok(Box::new(link)),
            Some(Scripted::Refuse(reason)) => Err(ChatError::Connection(reason)),
            None => Err(ChatError::Connection("connection refused".to_string())),
        }
    }
}

#[async_trait]
impl Link for ChannelLink {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        self.outbound
            .send(text)
            .map_err(|_| ChatError::Connection("peer went away".to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, ChatError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.close();
    }
}

impl LinkHandle {
    pub fn push(&self, event: &StreamEvent) {
        if let Ok(text) = event.encode() {
            self.push_raw(text);
        }
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Frame::Text(text.into()));
        }
    }

    pub fn close_with(&self, code: u16) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Frame::Closed {
                code: Some(code),
                reason: String::new(),
            });
        }
    }

    /// Ends the stream without a close frame.
    pub fn drop_connection(&mut self) {
        self.inbound.take();
    }

    pub async fn next_request(&mut self) -> Option<ChatRequest> {
        let text = self.outbound.recv().await?;
        serde_json::from_str(&text).ok()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
