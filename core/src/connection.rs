use crate::auth::AuthContext;
use crate::error::ChatError;
use crate::protocol::{ChatRequest, StreamEvent};
use crate::transport::{Frame, Link, Transport, NORMAL_CLOSURE};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Exponential reconnect policy. The n-th retry waits `base * 2^(n-1)`,
/// capped at `cap`; after `max_attempts` failed retries the manager gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}, in {}ms)", delay.as_millis())
            }
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    State(ConnectionState),
    Stream(StreamEvent),
    Failed(ChatError),
}

enum Command {
    Send(String),
    Close,
}

struct Driver {
    commands: UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Owns the single streaming connection of a conversation surface.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    state: Arc<RwLock<ConnectionState>>,
    events_tx: UnboundedSender<ConnectionEvent>,
    driver: Option<Driver>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: BackoffPolicy,
    ) -> (Self, UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        (
            Self {
                transport,
                policy,
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                events_tx,
                driver: None,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Starts connecting unless a connection is live or already being made.
    /// Must be called from within a tokio runtime.
    pub fn open(&mut self, endpoint: &Url, auth: &AuthContext) {
        match self.state() {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting { .. } => {
                debug!(state = %self.state(), "open ignored");
                return;
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }
        if let Some(stale) = self.driver.take() {
            stale.task.abort();
        }

        let endpoint = auth.apply_to(endpoint);
        transition(&self.state, &self.events_tx, ConnectionState::Connecting);
        let (commands, commands_rx) = unbounded_channel();
        let task = tokio::spawn(drive(
            self.transport.clone(),
            endpoint,
            self.policy,
            self.state.clone(),
            self.events_tx.clone(),
            commands_rx,
        ));
        self.driver = Some(Driver { commands, task });
    }

    /// Fire-and-forget transmit of one envelope.
    pub fn send(&self, request: &ChatRequest) -> Result<(), ChatError> {
        if self.state() != ConnectionState::Connected {
            return Err(ChatError::NotConnected);
        }
        let driver = self.driver.as_ref().ok_or(ChatError::NotConnected)?;
        let text = request.encode()?;
        driver
            .commands
            .send(Command::Send(text))
            .map_err(|_| ChatError::NotConnected)
    }

    /// Caller-initiated teardown: cancels any pending retry and closes the
    /// transport with a normal closure.
    pub async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.commands.send(Command::Close);
            if let Err(err) = driver.task.await {
                if !err.is_cancelled() {
                    warn!(%err, "connection task ended abnormally");
                }
            }
        }
        if self.state() != ConnectionState::Disconnected {
            transition(&self.state, &self.events_tx, ConnectionState::Disconnected);
        }
    }
}

impl Drop for ConnectionManager {
    /// Asks the driver to close its link; the task finishes on its own.
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.commands.send(Command::Close);
        }
    }
}

fn transition(
    state: &RwLock<ConnectionState>,
    events: &UnboundedSender<ConnectionEvent>,
    next: ConnectionState,
) {
    debug!(state = %next, "connection state changed");
    *state.write() = next.clone();
    let _ = events.send(ConnectionEvent::State(next));
}

enum Served {
    Closed,
    Lost(ChatError),
}

async fn drive(
    transport: Arc<dyn Transport>,
    endpoint: Url,
    policy: BackoffPolicy,
    state: Arc<RwLock<ConnectionState>>,
    events: UnboundedSender<ConnectionEvent>,
    mut commands: UnboundedReceiver<Command>,
) {
    let mut attempt: u32 = 0;
    loop {
        let failure = match connect_or_close(transport.as_ref(), &endpoint, &mut commands).await {
            None => {
                transition(&state, &events, ConnectionState::Disconnected);
                return;
            }
            Some(Err(err)) => err,
            Some(Ok(link)) => {
                attempt = 0;
                transition(&state, &events, ConnectionState::Connected);
                info!(host = ?endpoint.host_str(), "connected");
                match serve(link, &mut commands, &events).await {
                    Served::Closed => {
                        transition(&state, &events, ConnectionState::Disconnected);
                        return;
                    }
                    Served::Lost(err) => err,
                }
            }
        };

        attempt += 1;
        if attempt > policy.max_attempts {
            warn!(attempts = policy.max_attempts, %failure, "giving up on reconnect");
            transition(&state, &events, ConnectionState::Failed);
            let _ = events.send(ConnectionEvent::Failed(ChatError::ReconnectExhausted {
                attempts: policy.max_attempts,
            }));
            return;
        }
        let delay = policy.delay_for(attempt);
        warn!(%failure, attempt, delay_ms = delay.as_millis() as u64, "connection lost, retrying");
        transition(&state, &events, ConnectionState::Reconnecting { attempt, delay });
        if !wait_or_close(delay, &mut commands).await {
            transition(&state, &events, ConnectionState::Disconnected);
            return;
        }
    }
}

/// `None` when the caller closed (or dropped) the manager while connecting.
async fn connect_or_close(
    transport: &dyn Transport,
    endpoint: &Url,
    commands: &mut UnboundedReceiver<Command>,
) -> Option<Result<Box<dyn Link>, ChatError>> {
    let connecting = transport.connect(endpoint);
    tokio::pin!(connecting);
    loop {
        tokio::select! {
            result = &mut connecting => return Some(result),
            command = commands.recv() => match command {
                Some(Command::Send(_)) => warn!("dropping send issued while connecting"),
                Some(Command::Close) | None => return None,
            },
        }
    }
}

/// `false` when the caller closed the manager during the wait.
async fn wait_or_close(delay: Duration, commands: &mut UnboundedReceiver<Command>) -> bool {
    let timer = tokio::time::sleep(delay);
    tokio::pin!(timer);
    loop {
        tokio::select! {
            _ = &mut timer => return true,
            command = commands.recv() => match command {
                Some(Command::Send(_)) => warn!("dropping send issued while reconnecting"),
                Some(Command::Close) | None => return false,
            },
        }
    }
}

async fn serve(
    mut link: Box<dyn Link>,
    commands: &mut UnboundedReceiver<Command>,
    events: &UnboundedSender<ConnectionEvent>,
) -> Served {
    loop {
        tokio::select! {
            frame = link.next_frame() => match frame {
                Some(Ok(Frame::Text(text))) => match StreamEvent::decode(&text) {
                    Ok(event) => {
                        debug!(kind = event.kind(), "stream event");
                        let _ = events.send(ConnectionEvent::Stream(event));
                    }
                    Err(err) => warn!(%err, "dropping malformed frame"),
                },
                Some(Ok(Frame::Closed { code: Some(NORMAL_CLOSURE), reason })) => {
                    info!(%reason, "server closed the connection");
                    return Served::Closed;
                }
                Some(Ok(Frame::Closed { code, reason })) => {
                    return Served::Lost(ChatError::Connection(format!(
                        "closed with code {}: {reason}",
                        code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
                    )));
                }
                Some(Err(err)) => return Served::Lost(err),
                None => return Served::Lost(ChatError::Connection("stream ended".to_string())),
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if let Err(err) = link.send_text(text).await {
                        return Served::Lost(err);
                    }
                }
                Some(Command::Close) | None => {
                    link.close().await;
                    return Served::Closed;
                }
            },
        }
    }
}
