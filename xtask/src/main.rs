use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use streamchat_core::{
    telemetry, AuthContext, BackoffPolicy, ChatSurface, ConnectionManager, ConnectionState,
    MockTransport, SessionCache,
};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for streamchat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one exchange against the mock service and check the cached result.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let cache = SessionCache::new(temp_dir.path().to_path_buf());

    runtime.block_on(async {
        let transport = Arc::new(MockTransport::new(Duration::from_millis(5)));
        let (connection, mut events) = ConnectionManager::new(transport, BackoffPolicy::default());
        let mut surface = ChatSurface::new(
            connection,
            Url::parse("ws://localhost:8000/ws")?,
            AuthContext::guest(None),
        )
        .with_model(Some("mock".into()))
        .with_cache(cache.clone());

        surface.connect();
        let mut sent = false;
        let exchange = async {
            while let Some(event) = events.recv().await {
                surface.handle(event);
                if !sent && surface.connection_state() == ConnectionState::Connected {
                    surface.submit("ping from xtask");
                    sent = true;
                }
                if sent && surface.turns().len() == 2 && !surface.is_busy() {
                    break;
                }
            }
        };
        if timeout(Duration::from_secs(10), exchange).await.is_err() {
            bail!("mock exchange did not finish");
        }
        if let Some(err) = surface.current_error() {
            bail!("smoke test failed: {}", err.user_message());
        }
        surface.close().await;
        Ok::<(), anyhow::Error>(())
    })?;

    let sessions = cache.list()?;
    info!(
        "sessions" = sessions.len(),
        "title" = sessions.first().map(|s| s.title.as_str()).unwrap_or(""),
        "smoke test conversation cached"
    );
    if sessions.is_empty() {
        bail!("no session was cached");
    }

    Ok(())
}
