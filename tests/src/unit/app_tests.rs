use super::test_runtime;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use streamchat::config::{load_preferences, Scope};
use streamchat::{ChatApp, ConsoleRenderer, Preferences};
use streamchat_core::protocol::SessionId;
use streamchat_core::{AuthContext, BackoffPolicy, ChatSurface, ConnectionManager, MockTransport};
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, BufReader};
use url::Url;

/// Terminal output the test can read while the app is still writing it.
#[derive(Clone, Default)]
struct Screen(Arc<Mutex<Vec<u8>>>);

impl Screen {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    async fn shows(&self, wanted: &str) {
        let waiting = async {
            while !self.text().contains(wanted) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap_or_else(|_| panic!("screen never showed {wanted:?}: {}", self.text()));
    }
}

impl Write for Screen {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn mock_app<W: Write>(scope: Scope, out: W) -> ChatApp<W> {
    let (connection, events) = ConnectionManager::new(
        Arc::new(MockTransport::new(Duration::from_millis(1))),
        BackoffPolicy::default(),
    );
    let surface = ChatSurface::new(
        connection,
        Url::parse("ws://localhost:8000/ws").expect("url"),
        AuthContext::guest(None),
    )
    .with_model(Some("gpt-4o".into()));
    ChatApp::new(
        surface,
        events,
        ConsoleRenderer::new(out),
        scope,
        Preferences::default(),
    )
}

#[test]
fn mock_conversation_is_rendered() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let screen = Screen::default();
    let output = runtime.block_on(async {
        let mut app = mock_app(Scope::Directory(dir.path().to_path_buf()), screen.clone());
        let (mut keyboard, input) = tokio::io::duplex(256);
        let watcher = screen.clone();
        let typist = tokio::spawn(async move {
            watcher.shows("* connected\n").await;
            keyboard.write_all(b"what is rust?\n").await.expect("write");
            watcher.shows("received 'what is rust?'.\n").await;
            keyboard.write_all(b"/quit\n").await.expect("write");
        });

        app.run(BufReader::new(input)).await.expect("run");
        typist.await.expect("typist");
        assert_eq!(app.surface().turns().len(), 2);
        assert!(!app.surface().is_busy());
        screen.text()
    });

    assert!(output.starts_with("streamchat: New Chat (model gpt-4o)\n"));
    assert!(output.contains("* connected\n"));
    assert!(output.contains("assistant> [Mock] Model \"gpt-4o\": received 'what is rust?'.\n"));
}

#[test]
fn closing_input_remembers_resumed_session() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let scope = Scope::Directory(dir.path().to_path_buf());
    runtime.block_on(async {
        let (connection, events) = ConnectionManager::new(
            Arc::new(MockTransport::new(Duration::from_millis(1))),
            BackoffPolicy::default(),
        );
        let mut surface = ChatSurface::new(
            connection,
            Url::parse("ws://localhost:8000/ws").expect("url"),
            AuthContext::guest(None),
        );
        surface.restore(SessionId::Number(7), Vec::new());
        let mut app = ChatApp::new(
            surface,
            events,
            ConsoleRenderer::new(Vec::new()),
            scope.clone(),
            Preferences::default(),
        );

        app.run(&b""[..]).await.expect("run");

        let preferences = load_preferences(&scope).await.expect("preferences");
        assert_eq!(preferences.last_session, Some(SessionId::Number(7)));
    });
}
