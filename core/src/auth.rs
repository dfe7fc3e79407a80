use crate::api::{ensure_success, join_path};
use crate::error::ChatError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

/// Who the client is talking as. Passed explicitly to the connection manager
/// and REST clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthContext {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub guest: bool,
}

impl AuthContext {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            guest: false,
        }
    }

    /// Guest access. Some deployments issue a guest token, others accept
    /// an anonymous connection.
    pub fn guest(token: Option<String>) -> Self {
        Self { token, guest: true }
    }

    pub fn is_signed_in(&self) -> bool {
        self.token.is_some() || self.guest
    }

    /// Value for the envelope's `token` field.
    pub fn bearer(&self) -> Option<String> {
        self.token.as_ref().map(|token| format!("Bearer {token}"))
    }

    /// Streaming endpoint with the token attached as a query parameter.
    pub fn apply_to(&self, endpoint: &Url) -> Url {
        let mut url = endpoint.clone();
        if let Some(token) = &self.token {
            let retained: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(key, _)| key != "token")
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(retained)
                .append_pair("token", token);
        }
        url
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "TokenResponse::default_token_type")]
    token_type: String,
}

impl TokenResponse {
    fn default_token_type() -> String {
        "bearer".to_string()
    }
}

/// Talks to the external token-issuing service.
#[derive(Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base: Url,
}

impl AuthClient {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AuthContext, ChatError> {
        let token = self
            .request_token("auth/login", Some((username, password)))
            .await?;
        Ok(AuthContext::with_token(token.access_token))
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<AuthContext, ChatError> {
        let token = self
            .request_token("auth/register", Some((username, password)))
            .await?;
        Ok(AuthContext::with_token(token.access_token))
    }

    pub async fn guest(&self) -> Result<AuthContext, ChatError> {
        let token = self.request_token("auth/guest", None).await?;
        Ok(AuthContext::guest(Some(token.access_token)))
    }

    async fn request_token(
        &self,
        path: &str,
        credentials: Option<(&str, &str)>,
    ) -> Result<TokenResponse, ChatError> {
        let url = join_path(&self.base, path)?;
        let request = self.http.post(url);
        let request = match credentials {
            Some((username, password)) => {
                request.json(&json!({ "username": username, "password": password }))
            }
            None => request.header(reqwest::header::CONTENT_TYPE, "application/json"),
        };
        let response = ensure_success(request.send().await?).await?;
        let token: TokenResponse = response.json().await?;
        if !token.token_type.eq_ignore_ascii_case("bearer") {
            tracing::warn!(token_type = %token.token_type, "unexpected token type");
        }
        Ok(token)
    }
}
