use crate::connection::BackoffPolicy;
use crate::provider::{Provider, ProviderSettings, ProviderTransport};
use crate::transport::{MockTransport, Transport, TransportKind, WsTransport};
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: Url,
    pub ws_url: Url,
    pub transport: TransportKind,
    pub model: Option<String>,
    pub reconnect: BackoffPolicy,
    /// Provider used by the `provider` transport.
    pub provider: Provider,
    pub openai: ProviderSettings,
    pub deepseek: ProviderSettings,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => format!("{detail}. Update streamchat.yaml."),
        }
    }
}

/// Environment overrides, highest precedence.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub api_base: Option<String>,
    pub ws_url: Option<String>,
    pub transport: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub openai_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
}

impl EnvOverrides {
    pub fn from_environment() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|value| !value.trim().is_empty());
        Self {
            api_base: read("STREAMCHAT_API_BASE"),
            ws_url: read("STREAMCHAT_WS_URL"),
            transport: read("STREAMCHAT_TRANSPORT"),
            model: read("STREAMCHAT_MODEL"),
            provider: read("STREAMCHAT_PROVIDER"),
            openai_api_key: read(Provider::OpenAi.key_variable()),
            deepseek_api_key: read(Provider::DeepSeek.key_variable()),
        }
    }
}

impl ClientConfig {
    /// Reads `.env`, then `streamchat.yaml` if one exists, then environment
    /// overrides. A missing file means defaults.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match locate_config_file() {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|err| {
                    ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
                })?;
                tracing::debug!(path = %path.display(), "loaded client config");
                parse_file(&contents)?
            }
            None => ConfigFile::default(),
        };
        resolve(file, EnvOverrides::from_environment())
    }

    pub fn from_yaml(contents: &str, overrides: EnvOverrides) -> Result<Self, ConfigError> {
        resolve(parse_file(contents)?, overrides)
    }

    pub fn provider_settings(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::DeepSeek => &self.deepseek,
        }
    }

    pub fn transport_for(&self, kind: TransportKind, provider: Provider) -> Arc<dyn Transport> {
        match kind {
            TransportKind::Websocket => Arc::new(WsTransport),
            TransportKind::Mock => Arc::new(MockTransport::default()),
            TransportKind::Provider => Arc::new(ProviderTransport::new(
                self.provider_settings(provider).clone(),
            )),
        }
    }
}

fn parse_file(contents: &str) -> Result<ConfigFile, ConfigError> {
    if contents.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    serde_yaml::from_str(contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid streamchat.yaml: {err}")))
}

fn resolve(file: ConfigFile, env: EnvOverrides) -> Result<ClientConfig, ConfigError> {
    let api_base = env
        .api_base
        .or(file.api_base)
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    let api_base = parse_url("api_base", &api_base, &["http", "https"])?;

    let ws_url = env
        .ws_url
        .or(file.ws_url)
        .unwrap_or_else(|| DEFAULT_WS_URL.to_string());
    let ws_url = parse_url("ws_url", &ws_url, &["ws", "wss"])?;

    let transport = match env.transport {
        Some(raw) => TransportKind::parse(&raw)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown transport `{raw}`")))?,
        None => file.transport.unwrap_or(TransportKind::Websocket),
    };

    let model = env
        .model
        .or(file.model)
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty());

    let provider = match env.provider {
        Some(raw) => Provider::parse(&raw)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown provider `{raw}`")))?,
        None => file.provider.unwrap_or(Provider::OpenAi),
    };
    let sections = file.providers.unwrap_or_default();
    let openai = provider_settings(Provider::OpenAi, sections.openai, env.openai_api_key)?;
    let deepseek = provider_settings(Provider::DeepSeek, sections.deepseek, env.deepseek_api_key)?;

    let section = file.reconnect.unwrap_or_default();
    let defaults = BackoffPolicy::default();
    let base_ms = section.base_ms.unwrap_or(defaults.base.as_millis() as u64);
    let cap_ms = section.cap_ms.unwrap_or(defaults.cap.as_millis() as u64);
    let max_attempts = section.max_attempts.unwrap_or(defaults.max_attempts);
    if base_ms == 0 {
        return Err(ConfigError::Invalid(
            "reconnect.base_ms must be positive".to_string(),
        ));
    }
    if cap_ms < base_ms {
        return Err(ConfigError::Invalid(
            "reconnect.cap_ms must not be below reconnect.base_ms".to_string(),
        ));
    }
    if max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "reconnect.max_attempts must be at least 1".to_string(),
        ));
    }

    Ok(ClientConfig {
        api_base,
        ws_url,
        transport,
        model,
        reconnect: BackoffPolicy {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            max_attempts,
        },
        provider,
        openai,
        deepseek,
    })
}

fn provider_settings(
    provider: Provider,
    section: Option<ProviderSection>,
    env_key: Option<String>,
) -> Result<ProviderSettings, ConfigError> {
    let section = section.unwrap_or_default();
    let base_url = section
        .base_url
        .unwrap_or_else(|| provider.default_base_url().to_string());
    let field = format!("providers.{provider}.base_url");
    Ok(ProviderSettings {
        provider,
        api_key: env_key
            .or(section.api_key)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty()),
        base_url: parse_url(&field, &base_url, &["http", "https"])?,
    })
}

fn parse_url(field: &str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ConfigError::Invalid(format!("{field} `{raw}` is not a url: {err}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Invalid(format!(
            "{field} must use one of {}",
            schemes.join(", ")
        )));
    }
    Ok(url)
}

fn locate_config_file() -> Option<PathBuf> {
    config_candidates().into_iter().find(|path| path.exists())
}

fn config_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("streamchat");
        paths.push(config_dir.join("streamchat.yaml"));
        paths.push(config_dir.join("streamchat.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".streamchat").join("streamchat.yaml"));
        paths.push(home_dir.join(".streamchat").join("streamchat.yml"));
    } else {
        paths.push(PathBuf::from("streamchat.yaml"));
        paths.push(PathBuf::from("streamchat.yml"));
    }
    paths
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    api_base: Option<String>,
    ws_url: Option<String>,
    transport: Option<TransportKind>,
    model: Option<String>,
    reconnect: Option<ReconnectSection>,
    provider: Option<Provider>,
    providers: Option<ProvidersSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersSection {
    openai: Option<ProviderSection>,
    deepseek: Option<ProviderSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderSection {
    api_key: Option<String>,
    base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReconnectSection {
    base_ms: Option<u64>,
    cap_ms: Option<u64>,
    max_attempts: Option<u32>,
}
