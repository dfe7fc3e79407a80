use crate::config::{save_preferences, Preferences, Scope};
use crate::ui::ConsoleRenderer;
use anyhow::Result;
use std::io::Write;
use streamchat_core::{ChatSurface, ConnectionEvent, SurfaceUpdate};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

/// One line of user input, after slash-command parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Message(String),
    New,
    Retry,
    Model(String),
    Help,
    Quit,
    Unknown(String),
    Empty,
}

impl InputCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Message(line.to_string());
        };
        let (name, argument) = command
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((command, ""));
        match name {
            "new" => Self::New,
            "retry" => Self::Retry,
            "model" if !argument.is_empty() => Self::Model(argument.to_string()),
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

/// Terminal chat session: feeds stdin lines and connection events into a
/// single surface and renders what changed.
pub struct ChatApp<W: Write> {
    surface: ChatSurface,
    events: UnboundedReceiver<ConnectionEvent>,
    renderer: ConsoleRenderer<W>,
    scope: Scope,
    preferences: Preferences,
}

impl<W: Write> ChatApp<W> {
    pub fn new(
        surface: ChatSurface,
        events: UnboundedReceiver<ConnectionEvent>,
        renderer: ConsoleRenderer<W>,
        scope: Scope,
        preferences: Preferences,
    ) -> Self {
        Self {
            surface,
            events,
            renderer,
            scope,
            preferences,
        }
    }

    pub fn surface(&self) -> &ChatSurface {
        &self.surface
    }

    pub fn into_renderer(self) -> ConsoleRenderer<W> {
        self.renderer
    }

    pub async fn run<R>(&mut self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.renderer.banner(&self.surface)?;
        self.renderer.history(self.surface.turns())?;
        self.surface.connect();

        let mut lines = input.lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("input closed");
                        break;
                    };
                    if !self.on_input(InputCommand::parse(&line)).await? {
                        break;
                    }
                }
                Some(event) = self.events.recv() => self.render(|surface| surface.handle(event))?,
            }
        }

        self.surface.close().await;
        self.remember_session().await;
        Ok(())
    }

    /// `false` once the user asked to leave.
    async fn on_input(&mut self, command: InputCommand) -> Result<bool> {
        match command {
            InputCommand::Empty => {}
            InputCommand::Message(text) => self.render(|surface| surface.submit(&text))?,
            InputCommand::New => {
                self.surface.new_conversation();
                self.renderer.notice("new conversation")?;
            }
            InputCommand::Retry => {
                if self.surface.retry() {
                    self.renderer.notice("reconnecting")?;
                }
            }
            InputCommand::Model(model) => {
                self.surface.set_model(model.clone());
                self.preferences.model = model;
                if let Err(err) = save_preferences(&self.scope, &self.preferences).await {
                    warn!(%err, "failed to save preferences");
                }
                self.renderer
                    .notice(&format!("model set to {}", self.preferences.model))?;
            }
            InputCommand::Help => self.renderer.help()?,
            InputCommand::Quit => return Ok(false),
            InputCommand::Unknown(raw) => self.renderer.notice(&format!("unknown command {raw}"))?,
        }
        Ok(true)
    }

    fn render(&mut self, mutate: impl FnOnce(&mut ChatSurface) -> Vec<SurfaceUpdate>) -> Result<()> {
        for update in mutate(&mut self.surface) {
            self.renderer.apply(&self.surface, &update)?;
        }
        Ok(())
    }

    async fn remember_session(&mut self) {
        let last = self.surface.session_id().cloned();
        if last == self.preferences.last_session {
            return;
        }
        self.preferences.last_session = last;
        if let Err(err) = save_preferences(&self.scope, &self.preferences).await {
            warn!(%err, "failed to save preferences");
        }
    }
}
