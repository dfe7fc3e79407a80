//! Drives the real WebSocket transport against an in-process server.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use streamchat_core::protocol::{ChatRequest, StreamEvent};
use streamchat_core::state::AccumulatorPhase;
use streamchat_core::transport::WsTransport;
use streamchat_core::{
    AuthContext, BackoffPolicy, ChatSurface, ConnectionEvent, ConnectionManager, ConnectionState,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

#[derive(Clone, Copy)]
enum Behaviour {
    /// Answer each request with start, one chunk per word, end.
    Echo,
    /// Hang up right after the handshake without a close frame.
    HangUp,
    /// Send a normal-closure frame right after the handshake.
    CloseNormally,
}

struct Server {
    endpoint: Url,
    requested_uris: UnboundedReceiver<String>,
    task: JoinHandle<()>,
}

/// Accepts one connection per entry of `script`, in order.
async fn serve(script: Vec<Behaviour>) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (uri_tx, requested_uris) = unbounded_channel();
    let task = tokio::spawn(async move {
        for behaviour in script {
            let (socket, _) = listener.accept().await.expect("accept");
            let ws = handshake(socket, uri_tx.clone()).await;
            match behaviour {
                Behaviour::Echo => echo(ws).await,
                Behaviour::HangUp => drop(ws),
                Behaviour::CloseNormally => {
                    let mut ws = ws;
                    ws.close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "done".into(),
                    }))
                    .await
                    .ok();
                    while let Some(Ok(_)) = ws.next().await {}
                }
            }
        }
    });
    Server {
        endpoint: Url::parse(&format!("ws://{addr}/ws")).expect("url"),
        requested_uris,
        task,
    }
}

async fn handshake(
    socket: TcpStream,
    uris: UnboundedSender<String>,
) -> WebSocketStream<TcpStream> {
    tokio_tungstenite::accept_hdr_async(
        socket,
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let _ = uris.send(request.uri().to_string());
            Ok(response)
        },
    )
    .await
    .expect("handshake")
}

async fn echo(mut ws: WebSocketStream<TcpStream>) {
    while let Some(Ok(message)) = ws.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(request) = serde_json::from_str::<ChatRequest>(&text) else {
            let reply = StreamEvent::error("Invalid message format");
            ws.send(Message::Text(reply.encode().expect("encode"))).await.ok();
            continue;
        };
        let mut replies = vec![StreamEvent::Start];
        for (index, word) in request.message.split(' ').enumerate() {
            let piece = if index == 0 { word.to_string() } else { format!(" {word}") };
            replies.push(StreamEvent::chunk(piece));
        }
        replies.push(StreamEvent::End);
        for reply in replies {
            if ws
                .send(Message::Text(reply.encode().expect("encode")))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(5),
        cap: Duration::from_millis(20),
        max_attempts: 3,
    }
}

fn surface(endpoint: Url) -> (ChatSurface, UnboundedReceiver<ConnectionEvent>) {
    let (connection, events) = ConnectionManager::new(Arc::new(WsTransport), policy());
    (
        ChatSurface::new(connection, endpoint, AuthContext::with_token("jwt-abc")),
        events,
    )
}

async fn pump(
    surface: &mut ChatSurface,
    events: &mut UnboundedReceiver<ConnectionEvent>,
    seen: &mut Vec<ConnectionState>,
    done: impl Fn(&ChatSurface, &[ConnectionState]) -> bool,
) {
    while !done(surface, seen) {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event within 5s")
            .expect("event channel closed");
        if let ConnectionEvent::State(state) = &event {
            seen.push(state.clone());
        }
        surface.handle(event);
    }
}

#[tokio::test]
async fn streams_reply_over_websocket() {
    let mut server = serve(vec![Behaviour::Echo]).await;
    let (mut surface, mut events) = surface(server.endpoint.clone());
    let mut seen = Vec::new();

    surface.connect();
    pump(&mut surface, &mut events, &mut seen, |s, _| {
        s.connection_state() == ConnectionState::Connected
    })
    .await;
    let uri = server.requested_uris.recv().await.expect("uri");
    assert_eq!(uri, "/ws?token=jwt-abc");

    surface.submit("ownership moves values");
    pump(&mut surface, &mut events, &mut seen, |s, _| {
        s.turns().len() == 2 && s.phase() == AccumulatorPhase::Closed
    })
    .await;
    assert_eq!(surface.turns()[1].text, "ownership moves values");

    surface.close().await;
    timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server finished")
        .expect("server task");
}

#[tokio::test]
async fn reconnects_after_server_hangs_up() {
    let server = serve(vec![Behaviour::HangUp, Behaviour::Echo]).await;
    let (mut surface, mut events) = surface(server.endpoint.clone());
    let mut seen = Vec::new();

    surface.connect();
    pump(&mut surface, &mut events, &mut seen, |_, seen| {
        connected_count(seen) >= 2
    })
    .await;

    assert!(seen
        .iter()
        .any(|state| matches!(state, ConnectionState::Reconnecting { attempt: 1, .. })));
    surface.submit("still there");
    pump(&mut surface, &mut events, &mut seen, |s, _| {
        s.phase() == AccumulatorPhase::Closed
    })
    .await;
    assert_eq!(surface.turns()[1].text, "still there");
    surface.close().await;
}

#[tokio::test]
async fn normal_closure_from_server_is_final() {
    let server = serve(vec![Behaviour::CloseNormally]).await;
    let (mut surface, mut events) = surface(server.endpoint.clone());
    let mut seen = Vec::new();

    surface.connect();
    pump(&mut surface, &mut events, &mut seen, |_, seen| {
        seen.last() == Some(&ConnectionState::Disconnected)
    })
    .await;

    assert!(!seen
        .iter()
        .any(|state| matches!(state, ConnectionState::Reconnecting { .. })));
    assert!(surface.current_error().is_none());
}

fn connected_count(seen: &[ConnectionState]) -> usize {
    seen.iter()
        .filter(|state| **state == ConnectionState::Connected)
        .count()
}
