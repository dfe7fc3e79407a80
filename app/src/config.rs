use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use streamchat_core::protocol::SessionId;
use streamchat_core::transport::TransportKind;
use streamchat_core::{AuthContext, Provider};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    User,
    Directory(PathBuf),
}

impl Scope {
    pub fn root(&self) -> PathBuf {
        match self {
            Scope::User => config_dir(),
            Scope::Directory(path) => path.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preferences {
    #[serde(default = "Preferences::default_model")]
    pub model: String,
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub last_session: Option<SessionId>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            model: Preferences::default_model(),
            transport: None,
            provider: None,
            last_session: None,
        }
    }
}

impl Preferences {
    fn default_model() -> String {
        "gpt-4o".to_string()
    }

    /// Keeps explicitly chosen transport and provider for later runs.
    /// Returns whether anything changed.
    pub fn remember(&mut self, transport: Option<TransportKind>, provider: Option<Provider>) -> bool {
        let before = (self.transport, self.provider);
        if transport.is_some() {
            self.transport = transport;
        }
        if provider.is_some() {
            self.provider = provider;
        }
        before != (self.transport, self.provider)
    }
}

pub async fn load_preferences(scope: &Scope) -> Result<Preferences> {
    let path = preferences_path(scope);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(preferences) => Ok(preferences),
            Err(err) => {
                let defaults = Preferences::default();
                save_preferences(scope, &defaults).await?;
                warn!(
                    error = ?err,
                    "failed to parse preferences.json, resetting to defaults"
                );
                Ok(defaults)
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Preferences::default()),
        Err(err) => Err(err).context("failed to read preferences.json"),
    }
}

pub async fn save_preferences(scope: &Scope, preferences: &Preferences) -> Result<()> {
    write_json(&preferences_path(scope), preferences).await
}

/// Stored credentials. Unreadable files count as signed out.
pub async fn load_auth(scope: &Scope) -> Result<AuthContext> {
    let path = auth_path(scope);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!(error = ?err, "ignoring unreadable auth.json");
            AuthContext::default()
        })),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AuthContext::default()),
        Err(err) => Err(err).context("failed to read auth.json"),
    }
}

pub async fn save_auth(scope: &Scope, auth: &AuthContext) -> Result<()> {
    write_json(&auth_path(scope), auth).await
}

pub async fn clear_auth(scope: &Scope) -> Result<()> {
    match tokio::fs::remove_file(auth_path(scope)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context("failed to remove auth.json"),
    }
}

/// Where the local session cache lives.
pub fn cache_root(scope: &Scope) -> PathBuf {
    match scope {
        Scope::User => BaseDirs::new()
            .map(|base| base.data_local_dir().join("streamchat"))
            .unwrap_or_else(|| PathBuf::from(".streamchat")),
        Scope::Directory(path) => path.join("cache"),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, serialized)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

fn preferences_path(scope: &Scope) -> PathBuf {
    scope.root().join("preferences.json")
}

fn auth_path(scope: &Scope) -> PathBuf {
    scope.root().join("auth.json")
}

fn config_dir() -> PathBuf {
    if let Some(base) = BaseDirs::new() {
        base.config_dir().join("streamchat")
    } else {
        PathBuf::from(".streamchat")
    }
}
