use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use streamchat::{
    config::{
        cache_root, clear_auth, load_auth, load_preferences, save_auth, save_preferences, Scope,
    },
    ChatApp, ConsoleRenderer,
};
use streamchat_core::protocol::SessionId;
use streamchat_core::telemetry;
use streamchat_core::transport::TransportKind;
use streamchat_core::{
    AuthClient, AuthContext, ChatError, ChatSurface, ClientConfig, ConnectionManager, Provider,
    SessionCache, SessionsClient,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "streamchat", version, about = "Terminal client for a streaming chat service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// Model requested for every message of this session.
    #[arg(long)]
    model: Option<String>,
    /// Resume a server session (or a cached local one) by id.
    #[arg(long)]
    session: Option<String>,
    /// Talk to the built-in mock service for this run only.
    #[arg(long)]
    mock: bool,
    /// Transport to use from now on: websocket, mock or provider.
    #[arg(long, value_parser = parse_transport)]
    transport: Option<TransportKind>,
    /// Provider the `provider` transport streams from: openai or deepseek.
    #[arg(long, value_parser = parse_provider)]
    provider: Option<Provider>,
    /// Keep preferences, credentials and cache under this directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the issued token.
    Login {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Create an account and store the issued token.
    Register {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Continue as a guest.
    Guest,
    /// Forget stored credentials.
    Logout,
    /// List server sessions and locally cached ones.
    Sessions,
}

fn main() -> Result<()> {
    telemetry::init_tracing(telemetry::filter_or("warn"))?;
    let cli = Cli::parse();
    let runtime = Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = ClientConfig::load().map_err(|err| anyhow!(err.user_message()))?;
    let scope = cli
        .data_dir
        .clone()
        .map(Scope::Directory)
        .unwrap_or(Scope::User);

    match &cli.command {
        Some(Command::Login { username, password }) => {
            let password = password_or_prompt(password.clone()).await?;
            let auth = AuthClient::new(config.api_base.clone())
                .login(username, &password)
                .await
                .map_err(user_facing)?;
            save_auth(&scope, &auth).await?;
            println!("signed in as {username}");
            Ok(())
        }
        Some(Command::Register { username, password }) => {
            let password = password_or_prompt(password.clone()).await?;
            let auth = AuthClient::new(config.api_base.clone())
                .register(username, &password)
                .await
                .map_err(user_facing)?;
            save_auth(&scope, &auth).await?;
            println!("registered and signed in as {username}");
            Ok(())
        }
        Some(Command::Guest) => {
            let auth = match AuthClient::new(config.api_base.clone()).guest().await {
                Ok(auth) => auth,
                Err(err) => {
                    warn!(%err, "guest token unavailable, continuing anonymously");
                    AuthContext::guest(None)
                }
            };
            save_auth(&scope, &auth).await?;
            println!("continuing as guest");
            Ok(())
        }
        Some(Command::Logout) => {
            clear_auth(&scope).await?;
            println!("signed out");
            Ok(())
        }
        Some(Command::Sessions) => list_sessions(&config, &scope).await,
        None => chat(&cli, config, scope).await,
    }
}

async fn chat(cli: &Cli, config: ClientConfig, scope: Scope) -> Result<()> {
    let mut preferences = load_preferences(&scope).await?;
    if preferences.remember(cli.transport, cli.provider) {
        save_preferences(&scope, &preferences).await?;
    }
    let auth = load_auth(&scope).await?;
    let transport = if cli.mock {
        TransportKind::Mock
    } else {
        preferences.transport.unwrap_or(config.transport)
    };
    if transport == TransportKind::Websocket && !auth.is_signed_in() {
        bail!("not signed in; run `streamchat login <user>` or `streamchat guest`");
    }
    let provider = preferences.provider.unwrap_or(config.provider);
    let model = cli.model.clone().or_else(|| config.model.clone());
    let model = match transport {
        TransportKind::Provider => model.unwrap_or_else(|| provider.default_model().to_string()),
        _ => model.unwrap_or_else(|| preferences.model.clone()),
    };

    let (connection, events) =
        ConnectionManager::new(config.transport_for(transport, provider), config.reconnect);
    let cache = SessionCache::new(cache_root(&scope));
    let mut surface = ChatSurface::new(connection, config.ws_url.clone(), auth.clone())
        .with_model(Some(model))
        .with_cache(cache.clone())
        .with_history(transport == TransportKind::Provider);

    if let Some(raw) = &cli.session {
        let id = SessionId::parse(raw);
        resume(&mut surface, &config, &auth, &cache, transport, id).await?;
    }

    let mut app = ChatApp::new(
        surface,
        events,
        ConsoleRenderer::stdout(),
        scope,
        preferences,
    );
    app.run(BufReader::new(tokio::io::stdin())).await
}

async fn resume(
    surface: &mut ChatSurface,
    config: &ClientConfig,
    auth: &AuthContext,
    cache: &SessionCache,
    transport: TransportKind,
    id: SessionId,
) -> Result<()> {
    if transport == TransportKind::Websocket && matches!(id, SessionId::Number(_)) {
        let client = SessionsClient::new(config.api_base.clone(), auth.clone());
        match client.fetch_turns(&id).await {
            Ok(records) => {
                surface.restore(id, records);
                return Ok(());
            }
            Err(err) => warn!(%err, session = %id, "falling back to cached session"),
        }
    }
    match cache.load(&id)? {
        Some(cached) => {
            surface.restore_cached(cached);
            Ok(())
        }
        None => bail!("session {id} not found"),
    }
}

async fn list_sessions(config: &ClientConfig, scope: &Scope) -> Result<()> {
    let mut renderer = ConsoleRenderer::stdout();
    let auth = load_auth(scope).await?;
    if auth.token.is_some() {
        match SessionsClient::new(config.api_base.clone(), auth)
            .list_sessions()
            .await
        {
            Ok(sessions) => renderer.remote_sessions(&sessions)?,
            Err(err) => renderer.notice(&err.user_message())?,
        }
    }
    let cache = SessionCache::new(cache_root(scope));
    renderer.cached_sessions(&cache.list()?)?;
    Ok(())
}

async fn password_or_prompt(password: Option<String>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    println!("password:");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await? {
        Some(line) if !line.is_empty() => Ok(line),
        _ => bail!("a password is required"),
    }
}

fn parse_transport(raw: &str) -> Result<TransportKind, String> {
    TransportKind::parse(raw).ok_or_else(|| format!("unknown transport `{raw}`"))
}

fn parse_provider(raw: &str) -> Result<Provider, String> {
    Provider::parse(raw).ok_or_else(|| format!("unknown provider `{raw}`"))
}

fn user_facing(err: ChatError) -> anyhow::Error {
    anyhow!(err.user_message())
}
