use crate::auth::AuthContext;
use crate::error::ChatError;
use crate::protocol::SessionId;
use crate::state::{Author, Turn};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

/// Session listing entry as returned by the chat service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    #[serde(default)]
    pub title: String,
    #[serde(
        default,
        rename = "createdAt",
        alias = "created_at",
        deserialize_with = "lenient_timestamp"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

/// A stored message as returned by the chat service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnRecord {
    pub id: SessionId,
    pub role: String,
    pub content: String,
    #[serde(
        default,
        rename = "createdAt",
        alias = "created_at",
        deserialize_with = "lenient_timestamp"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl TurnRecord {
    /// `None` for roles the client does not render (system prompts and the like).
    pub fn into_turn(self) -> Option<Turn> {
        let author = match self.role.as_str() {
            "user" => Author::User,
            "assistant" => Author::Assistant,
            other => {
                tracing::debug!(role = other, id = %self.id, "skipping record");
                return None;
            }
        };
        Some(Turn {
            id: Uuid::new_v4(),
            author,
            text: self.content,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

pub fn records_into_turns(records: Vec<TurnRecord>) -> Vec<Turn> {
    records
        .into_iter()
        .filter_map(TurnRecord::into_turn)
        .collect()
}

/// REST client for the backend's session collection.
#[derive(Clone)]
pub struct SessionsClient {
    http: reqwest::Client,
    base: Url,
    auth: AuthContext,
}

impl SessionsClient {
    pub fn new(base: Url, auth: AuthContext) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            auth,
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ChatError> {
        let url = join_path(&self.base, "chat/sessions")?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    pub async fn fetch_turns(&self, id: &SessionId) -> Result<Vec<TurnRecord>, ChatError> {
        let url = join_path(&self.base, &format!("chat/sessions/{id}/messages"))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    pub async fn create_session(&self, title: &str) -> Result<SessionSummary, ChatError> {
        let url = join_path(&self.base, "chat/sessions")?;
        let response = self
            .authorized(self.http.post(url))
            .json(&json!({ "title": title }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Joins `path` below `base`, keeping any path prefix `base` already has.
pub(crate) fn join_path(base: &Url, path: &str) -> Result<Url, ChatError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|err| ChatError::Request(format!("invalid url for {path}: {err}")))
}

/// Maps a non-2xx response to `ChatError::Http`, preferring the JSON `detail`.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| match value.get("detail") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        })
        .unwrap_or_else(|| {
            format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error")
            )
        });
    Err(ChatError::Http {
        status: status.as_u16(),
        detail,
    })
}

/// Accepts RFC 3339 as well as naive timestamps, which are taken as UTC.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}
