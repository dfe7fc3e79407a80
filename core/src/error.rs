/// Errors surfaced by the chat core.
///
/// Transport failures stay inside the connection manager until its retry
/// budget is spent; everything else lands in the chat surface's single
/// current-error slot.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("failed to reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not connected")]
    NotConnected,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("HTTP {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("request failed: {0}")]
    Request(String),
}

impl ChatError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Connection(detail) => format!("Connection problem: {detail}"),
            Self::ReconnectExhausted { .. } => {
                "Failed to reconnect after multiple attempts. Use /retry to try again.".to_string()
            }
            Self::Protocol(detail) => format!("Unexpected message from server: {detail}"),
            Self::NotConnected => "Not connected to the chat service.".to_string(),
            Self::Upstream(message) => message.clone(),
            Self::Http { detail, .. } => detail.clone(),
            Self::Request(detail) => detail.clone(),
        }
    }

    /// Errors that a successful reconnect makes stale.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ReconnectExhausted { .. } | Self::NotConnected
        )
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Http {
                status: status.as_u16(),
                detail: err.to_string(),
            },
            None => Self::Request(err.to_string()),
        }
    }
}
