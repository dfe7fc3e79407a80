use super::{fast_policy, test_runtime};
use std::sync::Arc;
use std::time::Duration;
use streamchat_core::protocol::{SessionId, StreamEvent};
use streamchat_core::state::{AccumulatorPhase, Author, TurnChange};
use streamchat_core::{
    AuthContext, ChannelTransport, ChatError, ChatSurface, ConnectionEvent, ConnectionManager,
    ConnectionState, SessionCache, SurfaceUpdate, TurnRecord,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use url::Url;

struct Harness {
    surface: ChatSurface,
    events: UnboundedReceiver<ConnectionEvent>,
    seen: Vec<SurfaceUpdate>,
}

impl Harness {
    fn new(transport: &ChannelTransport) -> Self {
        Self::with_auth(transport, AuthContext::with_token("secret"))
    }

    fn with_auth(transport: &ChannelTransport, auth: AuthContext) -> Self {
        let (connection, events) = ConnectionManager::new(Arc::new(transport.clone()), fast_policy());
        let surface = ChatSurface::new(connection, Url::parse("ws://chat.test/ws").expect("url"), auth)
            .with_model(Some("gpt-4o".into()));
        Self {
            surface,
            events,
            seen: Vec::new(),
        }
    }

    async fn until(&mut self, done: impl Fn(&ChatSurface) -> bool) {
        while !done(&self.surface) {
            let event = timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("no event within 5s")
                .expect("event channel closed");
            let updates = self.surface.handle(event);
            self.seen.extend(updates);
        }
    }

    async fn until_update(&mut self, wanted: impl Fn(&SurfaceUpdate) -> bool) {
        loop {
            let event = timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("no event within 5s")
                .expect("event channel closed");
            let updates = self.surface.handle(event);
            let found = updates.iter().any(&wanted);
            self.seen.extend(updates);
            if found {
                return;
            }
        }
    }

    async fn connected(&mut self) {
        self.until(|s| s.connection_state() == ConnectionState::Connected)
            .await;
    }
}

#[test]
fn question_and_streamed_answer() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let transport = ChannelTransport::new();
        let mut peer = transport.accept_next();
        let mut harness = Harness::new(&transport);

        harness.surface.connect();
        harness.connected().await;
        harness.surface.submit("2+2?");

        let request = peer.next_request().await.expect("request");
        assert_eq!(request.message, "2+2?");
        assert_eq!(request.token.as_deref(), Some("Bearer secret"));

        peer.push(&StreamEvent::Start);
        peer.push(&StreamEvent::chunk("4"));
        peer.push(&StreamEvent::End);
        harness
            .until(|s| s.phase() == AccumulatorPhase::Closed)
            .await;

        let turns: Vec<(Author, &str)> = harness
            .surface
            .turns()
            .iter()
            .map(|turn| (turn.author, turn.text.as_str()))
            .collect();
        assert_eq!(turns, vec![(Author::User, "2+2?"), (Author::Assistant, "4")]);
        assert_eq!(harness.surface.title(), "2+2?");
        assert!(harness.surface.current_error().is_none());
        harness.surface.close().await;
        assert!(peer.was_closed());
    });
}

#[test]
fn dropped_link_settles_partial_turn_and_reconnects() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let transport = ChannelTransport::new();
        let mut first = transport.accept_next();
        let second = transport.accept_next();
        let mut harness = Harness::new(&transport);

        harness.surface.connect();
        harness.connected().await;
        harness.surface.submit("tell me a story");
        first.push(&StreamEvent::Start);
        first.push(&StreamEvent::chunk("Once"));
        harness
            .until(|s| s.turns().len() == 2 && s.turns()[1].text == "Once")
            .await;

        first.drop_connection();
        harness
            .until_update(|update| {
                matches!(update, SurfaceUpdate::Connection(ConnectionState::Reconnecting { .. }))
            })
            .await;
        assert!(!harness.surface.is_busy());
        assert_eq!(harness.surface.phase(), AccumulatorPhase::Closed);
        harness.connected().await;

        second.push(&StreamEvent::Start);
        second.push(&StreamEvent::chunk("Again"));
        second.push(&StreamEvent::End);
        harness
            .until(|s| s.phase() == AccumulatorPhase::Closed)
            .await;

        let texts: Vec<&str> = harness.surface.turns().iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["tell me a story", "Once", "Again"]);
        let closed = harness
            .seen
            .iter()
            .filter(|update| matches!(update, SurfaceUpdate::Turn(TurnChange::Closed(_))))
            .count();
        assert_eq!(closed, 2);
        assert_eq!(transport.attempts(), 2);
        harness.surface.close().await;
    });
}

#[test]
fn exhausted_retries_surface_once_and_retry_recovers() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let transport = ChannelTransport::new();
        let mut harness = Harness::new(&transport);

        harness.surface.connect();
        harness
            .until(|s| s.connection_state() == ConnectionState::Failed && s.current_error().is_some())
            .await;
        assert_eq!(transport.attempts(), 4);
        assert_eq!(
            harness.surface.current_error(),
            Some(&ChatError::ReconnectExhausted { attempts: 3 })
        );
        let delays: Vec<Duration> = harness
            .seen
            .iter()
            .filter_map(|update| match update {
                SurfaceUpdate::Connection(ConnectionState::Reconnecting { delay, .. }) => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4)
            ]
        );

        let _peer = transport.accept_next();
        assert!(harness.surface.retry());
        harness.connected().await;
        assert!(harness.surface.current_error().is_none());
        harness.surface.close().await;
    });
}

#[test]
fn reply_cut_by_exhausted_reconnect_is_cached_and_stays_closed() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let cache = SessionCache::new(dir.path().to_path_buf());
        let transport = ChannelTransport::new();
        let mut peer = transport.accept_next();
        let mut harness = Harness::new(&transport);
        harness.surface = harness.surface.with_cache(cache.clone());

        harness.surface.connect();
        harness.connected().await;
        harness.surface.submit("tell me");
        peer.push(&StreamEvent::Start);
        peer.push(&StreamEvent::chunk("Once upon"));
        harness
            .until(|s| s.turns().len() == 2 && s.turns()[1].text == "Once upon")
            .await;

        peer.drop_connection();
        harness
            .until(|s| s.connection_state() == ConnectionState::Failed && s.current_error().is_some())
            .await;
        assert!(!harness.surface.is_busy());
        assert_eq!(harness.surface.phase(), AccumulatorPhase::Closed);
        let cached = cache
            .load(harness.surface.cache_key())
            .expect("load")
            .expect("cached");
        assert_eq!(cached.turns.len(), 2);

        let updates = harness.surface.submit("hello?");
        assert!(updates.contains(&SurfaceUpdate::Error(ChatError::NotConnected)));
        let late = harness
            .surface
            .handle(ConnectionEvent::Stream(StreamEvent::chunk(" LATE")));
        assert!(late.is_empty());

        let turns: Vec<(Author, &str)> = harness
            .surface
            .turns()
            .iter()
            .map(|turn| (turn.author, turn.text.as_str()))
            .collect();
        assert_eq!(
            turns,
            vec![
                (Author::User, "tell me"),
                (Author::Assistant, "Once upon"),
                (Author::User, "hello?")
            ]
        );
    });
}

#[test]
fn normal_server_closure_stays_disconnected() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let transport = ChannelTransport::new();
        let peer = transport.accept_next();
        let mut harness = Harness::new(&transport);

        harness.surface.connect();
        harness.connected().await;
        peer.close_with(1000);
        harness
            .until(|s| s.connection_state() == ConnectionState::Disconnected)
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.attempts(), 1);
        assert!(!harness
            .seen
            .iter()
            .any(|update| matches!(update, SurfaceUpdate::Connection(ConnectionState::Reconnecting { .. }))));

        let updates = harness.surface.submit("hello?");
        assert!(updates.contains(&SurfaceUpdate::Error(ChatError::NotConnected)));
    });
}

#[test]
fn resumed_session_keeps_server_id_and_cache() {
    let runtime = test_runtime();
    runtime.block_on(async {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let cache = SessionCache::new(dir.path().to_path_buf());
        let transport = ChannelTransport::new();
        let mut peer = transport.accept_next();
        let mut harness = Harness::with_auth(&transport, AuthContext::guest(None));
        harness.surface = harness.surface.with_cache(cache.clone());

        let records: Vec<TurnRecord> = serde_json::from_str(
            r#"[{"id": 1, "role": "user", "content": "earlier question", "createdAt": "2024-05-01T09:00:00"},
                {"id": 2, "role": "assistant", "content": "earlier answer", "createdAt": "2024-05-01T09:00:02"}]"#,
        )
        .expect("records");
        harness.surface.restore(SessionId::Number(42), records);
        assert_eq!(harness.surface.title(), "earlier question");

        harness.surface.connect();
        harness.connected().await;
        harness.surface.submit("follow-up");
        let request = peer.next_request().await.expect("request");
        assert_eq!(request.chat_session_id, Some(SessionId::Number(42)));
        assert!(request.token.is_none());

        let cached = cache
            .load(&SessionId::Number(42))
            .expect("load")
            .expect("cached");
        assert_eq!(cached.turns.len(), 3);
        harness.surface.close().await;
    });
}
