use std::io::{self, Write};
use streamchat_core::api::SessionSummary;
use streamchat_core::state::{Author, TurnChange};
use streamchat_core::store::CachedSessionSummary;
use streamchat_core::{ChatSurface, ConnectionState, SurfaceUpdate, Turn};

pub fn role_badge(author: Author) -> &'static str {
    match author {
        Author::User => "you",
        Author::Assistant => "assistant",
    }
}

/// Line-oriented terminal view of a chat surface. Assistant text is written
/// as it streams, so a turn occupies one line that grows in place.
pub struct ConsoleRenderer<W: Write> {
    out: W,
    mid_line: bool,
}

impl ConsoleRenderer<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            mid_line: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn banner(&mut self, surface: &ChatSurface) -> io::Result<()> {
        self.line(&format!(
            "streamchat: {} (model {})",
            surface.title(),
            surface.model().unwrap_or("default")
        ))?;
        self.line("type /help for commands")
    }

    pub fn history(&mut self, turns: &[Turn]) -> io::Result<()> {
        for turn in turns {
            self.line(&format!("{}> {}", role_badge(turn.author), turn.text))?;
        }
        Ok(())
    }

    pub fn help(&mut self) -> io::Result<()> {
        self.line("/new            start a new conversation")?;
        self.line("/retry          dismiss the error and reconnect if needed")?;
        self.line("/model <name>   switch model for the next message")?;
        self.line("/quit           leave")
    }

    pub fn notice(&mut self, text: &str) -> io::Result<()> {
        self.line(&format!("* {text}"))
    }

    pub fn apply(&mut self, surface: &ChatSurface, update: &SurfaceUpdate) -> io::Result<()> {
        match update {
            // The terminal already echoed what the user typed.
            SurfaceUpdate::Turn(TurnChange::UserAppended(_)) => Ok(()),
            SurfaceUpdate::Turn(TurnChange::Opened(_)) => {
                self.break_line()?;
                write!(self.out, "{}> ", role_badge(Author::Assistant))?;
                self.mid_line = true;
                self.out.flush()
            }
            SurfaceUpdate::Turn(TurnChange::Extended { delta, .. }) => {
                write!(self.out, "{delta}")?;
                self.mid_line = true;
                self.out.flush()
            }
            SurfaceUpdate::Turn(TurnChange::Closed(_)) => self.break_line(),
            SurfaceUpdate::Turn(TurnChange::Discarded(_)) => {
                if self.mid_line {
                    write!(self.out, "(no reply)")?;
                }
                self.break_line()
            }
            SurfaceUpdate::Connection(state) => match state {
                ConnectionState::Connected => self.notice("connected"),
                ConnectionState::Connecting => Ok(()),
                ConnectionState::Reconnecting { attempt, delay } => self.notice(&format!(
                    "connection lost, retry {attempt} in {:.1}s",
                    delay.as_secs_f32()
                )),
                ConnectionState::Disconnected => self.notice("disconnected"),
                ConnectionState::Failed => Ok(()),
            },
            SurfaceUpdate::Error(_) => match surface.current_error() {
                Some(err) => self.line(&format!("! {}", err.user_message())),
                None => Ok(()),
            },
        }
    }

    pub fn remote_sessions(&mut self, sessions: &[SessionSummary]) -> io::Result<()> {
        if sessions.is_empty() {
            return self.line("no sessions");
        }
        for session in sessions {
            let when = session
                .created_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            self.line(&format!("{:>6}  {:<16}  {}", session.id, when, session.title))?;
        }
        Ok(())
    }

    pub fn cached_sessions(&mut self, sessions: &[CachedSessionSummary]) -> io::Result<()> {
        for session in sessions {
            self.line(&format!(
                "{:>6}  {:<16}  {} (cached)",
                session.id,
                session.updated_at.format("%Y-%m-%d %H:%M"),
                session.title
            ))?;
        }
        Ok(())
    }

    fn break_line(&mut self) -> io::Result<()> {
        if self.mid_line {
            writeln!(self.out)?;
            self.mid_line = false;
        }
        self.out.flush()
    }

    fn line(&mut self, text: &str) -> io::Result<()> {
        self.break_line()?;
        writeln!(self.out, "{text}")
    }
}
