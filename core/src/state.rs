use crate::error::ChatError;
use crate::protocol::StreamEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Assistant,
}

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub id: Uuid,
    pub author: Author,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(author: Author, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorPhase {
    Idle,
    AwaitingStart,
    Streaming,
    Closed,
}

/// A single mutation of the turn sequence, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnChange {
    UserAppended(Uuid),
    Opened(Uuid),
    Extended { id: Uuid, delta: String },
    Closed(Uuid),
    Discarded(Uuid),
}

/// Result of folding one stream event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Folded {
    pub changes: Vec<TurnChange>,
    pub error: Option<ChatError>,
}

impl Folded {
    fn change(change: TurnChange) -> Self {
        Self {
            changes: vec![change],
            error: None,
        }
    }
}

/// Folds stream events into an append-only turn sequence. At most one
/// assistant turn is open at a time and only the open turn's text changes.
#[derive(Debug, Clone)]
pub struct MessageAccumulator {
    turns: Vec<Turn>,
    open: Option<Uuid>,
    phase: AccumulatorPhase,
}

impl Default for MessageAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self {
            turns: Vec::new(),
            open: None,
            phase: AccumulatorPhase::Idle,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn phase(&self) -> AccumulatorPhase {
        self.phase
    }

    pub fn open_turn(&self) -> Option<&Turn> {
        let id = self.open?;
        self.turns.iter().find(|turn| turn.id == id)
    }

    pub fn is_streaming(&self) -> bool {
        self.open.is_some()
    }

    pub fn turn(&self, id: Uuid) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.id == id)
    }

    /// Appends a user turn. A reply still open from the previous exchange
    /// is settled first so later chunks cannot land in it.
    pub fn append_user_turn(&mut self, text: impl Into<String>) -> Folded {
        let mut folded = Folded::default();
        if let Some(change) = self.settle_open() {
            tracing::warn!(?change, "user turn appended while a reply was open");
            folded.changes.push(change);
        }
        let turn = Turn::new(Author::User, text);
        folded.changes.push(TurnChange::UserAppended(turn.id));
        self.turns.push(turn);
        self.phase = AccumulatorPhase::AwaitingStart;
        folded
    }

    /// Settles the open reply after its stream was lost: partial text is
    /// kept as a closed turn, an empty turn is discarded.
    pub fn interrupt(&mut self) -> Option<TurnChange> {
        let change = self.settle_open()?;
        self.phase = AccumulatorPhase::Closed;
        Some(change)
    }

    pub fn on_event(&mut self, event: StreamEvent) -> Folded {
        match event {
            StreamEvent::Start => self.start(),
            StreamEvent::Chunk { text } => self.extend(text),
            StreamEvent::End => match self.close_open() {
                Some(id) => Folded::change(TurnChange::Closed(id)),
                None => {
                    tracing::debug!("end received with no open turn");
                    Folded::default()
                }
            },
            StreamEvent::Error { message } => self.fail(message),
        }
    }

    /// Drops every turn, including an open one, without emitting it.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.open = None;
        self.phase = AccumulatorPhase::Idle;
    }

    /// Replaces the sequence with already-closed turns from the server or cache.
    pub fn restore(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
        self.open = None;
        self.phase = AccumulatorPhase::Idle;
    }

    pub fn title(&self) -> String {
        self.turns
            .iter()
            .find(|turn| turn.author == Author::User)
            .map(|turn| title_from(&turn.text))
            .unwrap_or_else(|| DEFAULT_TITLE.to_string())
    }

    fn start(&mut self) -> Folded {
        let mut folded = Folded::default();
        if let Some(previous) = self.close_open() {
            tracing::warn!(turn = %previous, "start received while a turn was open; closing it");
            folded.changes.push(TurnChange::Closed(previous));
        }
        let turn = Turn::new(Author::Assistant, String::new());
        let id = turn.id;
        self.turns.push(turn);
        self.open = Some(id);
        self.phase = AccumulatorPhase::Streaming;
        folded.changes.push(TurnChange::Opened(id));
        folded
    }

    fn extend(&mut self, delta: String) -> Folded {
        let Some(id) = self.open else {
            tracing::warn!(len = delta.len(), "chunk received with no open turn; dropped");
            return Folded::default();
        };
        match self.turns.iter_mut().find(|turn| turn.id == id) {
            Some(turn) => {
                turn.text.push_str(&delta);
                Folded::change(TurnChange::Extended { id, delta })
            }
            None => Folded::default(),
        }
    }

    fn fail(&mut self, message: String) -> Folded {
        let folded = Folded {
            changes: self.settle_open().into_iter().collect(),
            error: Some(ChatError::Upstream(message)),
        };
        self.phase = AccumulatorPhase::Closed;
        folded
    }

    fn settle_open(&mut self) -> Option<TurnChange> {
        let id = self.close_open()?;
        let empty = self.turn(id).map(|turn| turn.text.is_empty()).unwrap_or(false);
        if empty {
            self.turns.retain(|turn| turn.id != id);
            Some(TurnChange::Discarded(id))
        } else {
            Some(TurnChange::Closed(id))
        }
    }

    fn close_open(&mut self) -> Option<Uuid> {
        let id = self.open.take()?;
        self.phase = AccumulatorPhase::Closed;
        Some(id)
    }
}

const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX: usize = 50;

fn title_from(content: &str) -> String {
    let trimmed = content.trim();
    let mut title: String = trimmed
        .chars()
        .take(TITLE_MAX)
        .filter(|ch| !matches!(ch, '#' | '*' | '`' | '_' | '~'))
        .collect();
    if trimmed.chars().count() > TITLE_MAX {
        title.push_str("...");
    }
    if title.trim().is_empty() {
        return "Untitled Chat".to_string();
    }
    title
}
