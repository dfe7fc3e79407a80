use crate::protocol::SessionId;
use crate::state::Turn;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Only the newest sessions are kept on disk.
pub const MAX_CACHED_SESSIONS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub id: SessionId,
    pub title: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedSessionSummary {
    pub id: SessionId,
    pub title: String,
    #[serde(default)]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client-local copy of session turns, keyed by session id. Turns live in
/// `<key>.jsonl`, everything else in `<key>.meta.json`.
#[derive(Clone)]
pub struct SessionCache {
    root: PathBuf,
}

impl SessionCache {
    pub fn new(root: PathBuf) -> Self {
        fs::create_dir_all(root.join("sessions")).ok();
        Self { root }
    }

    pub fn in_memory() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("streamchat-{}", Uuid::new_v4()));
        Self::new(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn transcript_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir().join(format!("{}.jsonl", file_key(id)))
    }

    fn metadata_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir().join(format!("{}.meta.json", file_key(id)))
    }

    /// Writes a full snapshot of the session, then prunes the oldest entries.
    pub fn save(&self, session: &CachedSession) -> Result<()> {
        fs::create_dir_all(self.session_dir())?;
        let mut writer = BufWriter::new(File::create(self.transcript_path(&session.id))?);
        for turn in &session.turns {
            serde_json::to_writer(&mut writer, turn)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        let meta = CachedSessionSummary {
            id: session.id.clone(),
            title: session.title.clone(),
            model: session.model.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        };
        fs::write(
            self.metadata_path(&session.id),
            serde_json::to_vec_pretty(&meta)?,
        )?;
        self.prune(MAX_CACHED_SESSIONS)
    }

    pub fn load(&self, id: &SessionId) -> Result<Option<CachedSession>> {
        let meta_path = self.metadata_path(id);
        if !meta_path.exists() {
            return Ok(None);
        }
        let meta: CachedSessionSummary = serde_json::from_str(&fs::read_to_string(meta_path)?)?;
        let mut turns = Vec::new();
        let transcript = self.transcript_path(id);
        if transcript.exists() {
            let reader = BufReader::new(File::open(transcript)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                turns.push(serde_json::from_str(&line)?);
            }
        }
        Ok(Some(CachedSession {
            id: meta.id,
            title: meta.title,
            model: meta.model,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            turns,
        }))
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<CachedSessionSummary>> {
        let mut sessions = Vec::new();
        let path = self.session_dir();
        if !path.exists() {
            return Ok(sessions);
        }
        for entry in walkdir::WalkDir::new(path)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let is_meta = entry
                .file_name()
                .to_str()
                .map(|name| name.ends_with(".meta.json"))
                .unwrap_or(false);
            if !is_meta {
                continue;
            }
            match fs::read_to_string(entry.path())
                .map_err(anyhow::Error::from)
                .and_then(|contents| Ok(serde_json::from_str::<CachedSessionSummary>(&contents)?))
            {
                Ok(summary) => sessions.push(summary),
                Err(err) => tracing::warn!(%err, path = %entry.path().display(), "skipping unreadable session metadata"),
            }
        }
        sessions.sort_by_key(|s: &CachedSessionSummary| s.updated_at);
        sessions.reverse();
        Ok(sessions)
    }

    pub fn delete(&self, id: &SessionId) -> Result<()> {
        let _ = fs::remove_file(self.transcript_path(id));
        let _ = fs::remove_file(self.metadata_path(id));
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        for summary in self.list()? {
            self.delete(&summary.id)?;
        }
        Ok(())
    }

    fn prune(&self, keep: usize) -> Result<()> {
        for stale in self.list()?.into_iter().skip(keep) {
            tracing::debug!(id = %stale.id, "pruning cached session");
            self.delete(&stale.id)?;
        }
        Ok(())
    }
}

/// Injective mapping from id to file stem: `_` starts a two-digit hex
/// escape for every byte outside `[A-Za-z0-9-]`.
fn file_key(id: &SessionId) -> String {
    let raw = id.to_string();
    let mut key = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            key.push(char::from(byte));
        } else {
            key.push_str(&format!("_{byte:02x}"));
        }
    }
    match id {
        SessionId::Number(_) => format!("n{key}"),
        SessionId::Text(_) => format!("s{key}"),
    }
}
