use crate::api::{records_into_turns, TurnRecord};
use crate::auth::AuthContext;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::ChatError;
use crate::protocol::{ChatRequest, ContextMessage, SessionId};
use crate::state::{AccumulatorPhase, MessageAccumulator, Turn, TurnChange};
use crate::store::{CachedSession, SessionCache};
use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

/// Everything the presentation layer needs to re-render after a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceUpdate {
    Turn(TurnChange),
    Connection(ConnectionState),
    Error(ChatError),
}

/// One conversation: its turns, its connection and its current error.
/// Owned by a single event loop; nothing else mutates the turns.
pub struct ChatSurface {
    connection: ConnectionManager,
    accumulator: MessageAccumulator,
    endpoint: Url,
    auth: AuthContext,
    model: Option<String>,
    session_id: Option<SessionId>,
    cache_key: SessionId,
    created_at: DateTime<Utc>,
    current_error: Option<ChatError>,
    cache: Option<SessionCache>,
    replay_history: bool,
}

impl ChatSurface {
    pub fn new(connection: ConnectionManager, endpoint: Url, auth: AuthContext) -> Self {
        Self {
            connection,
            accumulator: MessageAccumulator::new(),
            endpoint,
            auth,
            model: None,
            session_id: None,
            cache_key: local_session_key(),
            created_at: Utc::now(),
            current_error: None,
            cache: None,
            replay_history: false,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_cache(mut self, cache: SessionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sends every earlier turn along with each message. Needed when the
    /// service on the other end keeps no conversation state.
    pub fn with_history(mut self, replay: bool) -> Self {
        self.replay_history = replay;
        self
    }

    pub fn connect(&mut self) {
        self.connection.open(&self.endpoint, &self.auth);
    }

    pub async fn close(&mut self) {
        self.connection.close().await;
    }

    pub fn turns(&self) -> &[Turn] {
        self.accumulator.turns()
    }

    pub fn turn(&self, id: Uuid) -> Option<&Turn> {
        self.accumulator.turn(id)
    }

    pub fn phase(&self) -> AccumulatorPhase {
        self.accumulator.phase()
    }

    /// True while an assistant reply is streaming in.
    pub fn is_busy(&self) -> bool {
        self.accumulator.is_streaming()
    }

    pub fn title(&self) -> String {
        self.accumulator.title()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        self.model = (!model.trim().is_empty()).then(|| model.trim().to_string());
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Key the local cache uses: the server id when known, else a local one.
    pub fn cache_key(&self) -> &SessionId {
        self.session_id.as_ref().unwrap_or(&self.cache_key)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn current_error(&self) -> Option<&ChatError> {
        self.current_error.as_ref()
    }

    pub fn dismiss_error(&mut self) {
        self.current_error = None;
    }

    /// Appends the user turn and sends it. Blank input is ignored.
    pub fn submit(&mut self, text: &str) -> Vec<SurfaceUpdate> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        let folded = self.accumulator.append_user_turn(text);
        let mut updates: Vec<SurfaceUpdate> =
            folded.changes.into_iter().map(SurfaceUpdate::Turn).collect();
        self.persist();

        let request = ChatRequest {
            message: text.to_string(),
            model: self.model.clone(),
            token: self.auth.bearer(),
            chat_session_id: self.session_id.clone(),
            context: self.context(),
        };
        if let Err(err) = self.connection.send(&request) {
            tracing::warn!(%err, "message not sent");
            updates.push(self.raise(err));
        }
        updates
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<SurfaceUpdate> {
        match event {
            ConnectionEvent::State(state) => {
                if state == ConnectionState::Connected
                    && self
                        .current_error
                        .as_ref()
                        .map(ChatError::is_connection)
                        .unwrap_or(false)
                {
                    self.current_error = None;
                }
                let mut updates = Vec::new();
                if matches!(
                    state,
                    ConnectionState::Reconnecting { .. }
                        | ConnectionState::Failed
                        | ConnectionState::Disconnected
                ) {
                    // the stream feeding the open reply is gone
                    if let Some(change) = self.accumulator.interrupt() {
                        self.persist();
                        updates.push(SurfaceUpdate::Turn(change));
                    }
                }
                updates.push(SurfaceUpdate::Connection(state));
                updates
            }
            ConnectionEvent::Stream(event) => {
                let folded = self.accumulator.on_event(event);
                let settled = folded
                    .changes
                    .iter()
                    .any(|change| matches!(change, TurnChange::Closed(_) | TurnChange::Discarded(_)));
                if settled {
                    self.persist();
                }
                let mut updates: Vec<SurfaceUpdate> =
                    folded.changes.into_iter().map(SurfaceUpdate::Turn).collect();
                if let Some(err) = folded.error {
                    updates.push(self.raise(err));
                }
                updates
            }
            ConnectionEvent::Failed(err) => vec![self.raise(err)],
        }
    }

    /// Clears the current error and reconnects when the connection is down.
    /// Returns whether a new connection attempt was started.
    pub fn retry(&mut self) -> bool {
        self.current_error = None;
        match self.connection.state() {
            ConnectionState::Failed | ConnectionState::Disconnected => {
                self.connect();
                true
            }
            _ => false,
        }
    }

    pub fn new_conversation(&mut self) {
        self.accumulator.reset();
        self.session_id = None;
        self.cache_key = local_session_key();
        self.created_at = Utc::now();
        self.current_error = None;
    }

    /// Loads a server session's stored turns.
    pub fn restore(&mut self, session_id: SessionId, records: Vec<TurnRecord>) {
        let turns = records_into_turns(records);
        self.created_at = turns.first().map(|turn| turn.created_at).unwrap_or_else(Utc::now);
        self.accumulator.restore(turns);
        self.session_id = Some(session_id);
        self.current_error = None;
        self.persist();
    }

    /// Loads a locally cached session.
    pub fn restore_cached(&mut self, cached: CachedSession) {
        self.accumulator.restore(cached.turns);
        if cached.model.is_some() {
            self.model = cached.model;
        }
        self.created_at = cached.created_at;
        match cached.id {
            SessionId::Number(_) => self.session_id = Some(cached.id),
            SessionId::Text(_) => {
                self.session_id = None;
                self.cache_key = cached.id;
            }
        }
        self.current_error = None;
    }

    /// Settled turns before the newest user turn.
    fn context(&self) -> Vec<ContextMessage> {
        if !self.replay_history {
            return Vec::new();
        }
        let turns = self.accumulator.turns();
        turns[..turns.len().saturating_sub(1)]
            .iter()
            .filter(|turn| !turn.text.is_empty())
            .map(|turn| ContextMessage {
                role: turn.author,
                content: turn.text.clone(),
            })
            .collect()
    }

    fn raise(&mut self, err: ChatError) -> SurfaceUpdate {
        self.current_error = Some(err.clone());
        SurfaceUpdate::Error(err)
    }

    fn persist(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        if self.accumulator.turns().is_empty() {
            return;
        }
        let snapshot = CachedSession {
            id: self.cache_key().clone(),
            title: self.accumulator.title(),
            model: self.model.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            turns: self
                .accumulator
                .turns()
                .iter()
                .filter(|turn| Some(turn.id) != self.accumulator.open_turn().map(|open| open.id))
                .cloned()
                .collect(),
        };
        if let Err(err) = cache.save(&snapshot) {
            tracing::warn!(%err, "failed to cache session");
        }
    }
}

fn local_session_key() -> SessionId {
    SessionId::Text(format!("local-{}", Uuid::new_v4()))
}
