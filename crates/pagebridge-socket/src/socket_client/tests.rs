//! Tests for socket session, dispatch and reconnect behavior.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};

use super::{FrameHandler, SocketClient, SocketConfig, SocketError};
use crate::frame::{InboundFrame, PlatformEvent};

type ServerSocket = WebSocketStream<TcpStream>;

struct RecordingHandler {
    frames: mpsc::UnboundedSender<InboundFrame>,
}

#[async_trait]
impl FrameHandler for RecordingHandler {
    async fn handle_frame(&self, frame: &InboundFrame) -> Result<()> {
        let _ = self.frames.send(frame.clone());
        Ok(())
    }
}

struct FailingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl FrameHandler for FailingHandler {
    async fn handle_frame(&self, _frame: &InboundFrame) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("handler rejected frame")
    }
}

struct PanickingHandler;

#[async_trait]
impl FrameHandler for PanickingHandler {
    async fn handle_frame(&self, _frame: &InboundFrame) -> Result<()> {
        panic!("handler panicked");
    }
}

/// Blocks on the first frame until released, later frames pass through.
struct BlockFirstHandler {
    seen: AtomicUsize,
    release: Arc<Notify>,
    frames: mpsc::UnboundedSender<InboundFrame>,
}

#[async_trait]
impl FrameHandler for BlockFirstHandler {
    async fn handle_frame(&self, frame: &InboundFrame) -> Result<()> {
        if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
            self.release.notified().await;
        }
        let _ = self.frames.send(frame.clone());
        Ok(())
    }
}

fn test_config(addr: SocketAddr, resource_ids: &[&str]) -> SocketConfig {
    let mut config = SocketConfig::new(
        "user-token",
        "u-1",
        resource_ids.iter().map(|id| id.to_string()).collect(),
    );
    config.endpoint = format!("ws://{addr}/socket/websocket?vsn=2.0.0");
    config.reconnect_delay = Duration::from_millis(50);
    config.keepalive_interval = Duration::from_secs(30);
    config.keepalive_timeout = Duration::from_secs(10);
    config.connect_timeout = Duration::from_secs(2);
    config
}

async fn accept_socket(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client should connect before timeout")
        .expect("accept tcp");
    accept_async(stream).await.expect("websocket handshake")
}

async fn recv_json(socket: &mut ServerSocket) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message = socket
                .next()
                .await
                .expect("socket closed before frame")
                .expect("read frame");
            match message {
                WsMessage::Text(text) => {
                    return serde_json::from_str::<Value>(text.as_str()).expect("json frame");
                }
                WsMessage::Close(_) => panic!("socket closed before frame"),
                _ => continue,
            }
        }
    })
    .await
    .expect("frame should arrive before timeout")
}

async fn recv_joins(socket: &mut ServerSocket, count: usize) -> Vec<Value> {
    let mut joins = Vec::new();
    for _ in 0..count {
        joins.push(recv_json(socket).await);
    }
    joins
}

fn update_frame(conversation_id: &str) -> WsMessage {
    WsMessage::Text(
        json!([
            null,
            null,
            "pages:100",
            "pages:update_conversation",
            {"conversation": {"id": conversation_id, "page_id": "100"}}
        ])
        .to_string()
        .into(),
    )
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<InboundFrame>) -> InboundFrame {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler should receive frame before timeout")
        .expect("handler channel open")
}

#[test]
fn unit_socket_config_lists_user_channel_then_resource_channels() {
    let config = SocketConfig::new("t", "u-1", vec!["100".to_string(), "200".to_string()]);
    assert_eq!(
        config.channels(),
        vec![
            "users:u-1".to_string(),
            "pages:100".to_string(),
            "pages:200".to_string()
        ]
    );
}

#[tokio::test]
async fn unit_send_without_session_fails_with_not_connected() {
    let client = SocketClient::new(SocketConfig::new("t", "u-1", Vec::new()));
    let error = client
        .send("users:u-1", "phx_join", json!({}))
        .await
        .expect_err("send should fail");
    assert!(matches!(error, SocketError::NotConnected));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn functional_start_joins_user_and_resource_channels_with_auth_payload() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = Arc::new(SocketClient::new(test_config(addr, &["100", "200"])));
    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.start().await }
    });

    let mut socket = accept_socket(&listener).await;
    let joins = recv_joins(&mut socket, 3).await;

    assert_eq!(joins[0][2], "users:u-1");
    assert_eq!(joins[0][3], "phx_join");
    assert_eq!(
        joins[0][4],
        json!({"accessToken": "user-token", "userId": "u-1", "platform": "web"})
    );
    assert_eq!(joins[1][2], "pages:100");
    assert_eq!(joins[1][4]["pageId"], "100");
    assert_eq!(joins[2][2], "pages:200");

    let refs = joins
        .iter()
        .map(|frame| frame[0].as_str().expect("ref").parse::<u64>().expect("num"))
        .collect::<Vec<_>>();
    assert!(refs.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(joins.iter().all(|frame| frame[0] == frame[1]));

    client.stop().await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("start should return after stop")
        .expect("join");
}

#[tokio::test]
async fn integration_server_close_triggers_reconnect_and_rejoins_every_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = Arc::new(SocketClient::new(test_config(addr, &["100", "200"])));
    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.start().await }
    });

    let mut first = accept_socket(&listener).await;
    let first_joins = recv_joins(&mut first, 3).await;
    first.close(None).await.expect("close first session");
    drop(first);

    let mut second = accept_socket(&listener).await;
    let second_joins = recv_joins(&mut second, 3).await;
    let channels = |joins: &[Value]| {
        joins
            .iter()
            .map(|frame| frame[2].as_str().expect("channel").to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(channels(&first_joins), channels(&second_joins));
    assert_eq!(channels(&second_joins), client.channels());

    client.stop().await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("start should return after stop")
        .expect("join");
}

#[tokio::test]
async fn integration_missing_pong_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let mut config = test_config(addr, &["100"]);
    config.keepalive_interval = Duration::from_millis(50);
    config.keepalive_timeout = Duration::from_millis(100);
    let client = Arc::new(SocketClient::new(config));
    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.start().await }
    });

    let mut first = accept_socket(&listener).await;
    recv_joins(&mut first, 2).await;
    // The server stops reading, so pings are never answered.
    let mut second = accept_socket(&listener).await;
    let joins = recv_joins(&mut second, 2).await;
    assert_eq!(joins[1][2], "pages:100");
    drop(first);

    client.stop().await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("start should return after stop")
        .expect("join");
}

#[tokio::test]
async fn functional_malformed_frames_are_dropped_and_reading_continues() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = Arc::new(SocketClient::new(test_config(addr, &["100"])));
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    client.subscribe(
        PlatformEvent::UpdateConversation,
        Arc::new(RecordingHandler { frames: frames_tx }),
    );
    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.start().await }
    });

    let mut socket = accept_socket(&listener).await;
    recv_joins(&mut socket, 2).await;
    socket
        .send(WsMessage::Text("not json".into()))
        .await
        .expect("send garbage");
    socket
        .send(WsMessage::Text(r#"["1","1","pages:100"]"#.into()))
        .await
        .expect("send short frame");
    socket
        .send(WsMessage::Text(
            r#"["1","1","pages:100","presence_diff",{}]"#.into(),
        ))
        .await
        .expect("send unknown event");
    socket.send(update_frame("c-1")).await.expect("send update");

    let frame = next_frame(&mut frames_rx).await;
    assert_eq!(frame.payload["conversation"]["id"], "c-1");
    assert!(client.is_connected());

    client.stop().await;
    task.await.expect("join");
}

#[tokio::test]
async fn regression_failing_and_panicking_handlers_do_not_block_other_handlers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = Arc::new(SocketClient::new(test_config(addr, &["100"])));
    let failing = Arc::new(FailingHandler {
        calls: AtomicUsize::new(0),
    });
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    client.subscribe(PlatformEvent::UpdateConversation, failing.clone());
    client.subscribe(PlatformEvent::UpdateConversation, Arc::new(PanickingHandler));
    client.subscribe(
        PlatformEvent::UpdateConversation,
        Arc::new(RecordingHandler { frames: frames_tx }),
    );
    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.start().await }
    });

    let mut socket = accept_socket(&listener).await;
    recv_joins(&mut socket, 2).await;
    socket.send(update_frame("c-1")).await.expect("send first");
    socket.send(update_frame("c-2")).await.expect("send second");

    let mut seen = vec![
        next_frame(&mut frames_rx).await.payload["conversation"]["id"].clone(),
        next_frame(&mut frames_rx).await.payload["conversation"]["id"].clone(),
    ];
    seen.sort_by_key(|value| value.to_string());
    assert_eq!(seen, vec![json!("c-1"), json!("c-2")]);
    assert_eq!(failing.calls.load(Ordering::SeqCst), 2);

    client.stop().await;
    task.await.expect("join");
}

#[tokio::test]
async fn regression_slow_handler_does_not_block_subsequent_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = Arc::new(SocketClient::new(test_config(addr, &["100"])));
    let release = Arc::new(Notify::new());
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    client.subscribe(
        PlatformEvent::UpdateConversation,
        Arc::new(BlockFirstHandler {
            seen: AtomicUsize::new(0),
            release: Arc::clone(&release),
            frames: frames_tx,
        }),
    );
    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.start().await }
    });

    let mut socket = accept_socket(&listener).await;
    recv_joins(&mut socket, 2).await;
    socket.send(update_frame("slow")).await.expect("send slow");
    tokio::time::sleep(Duration::from_millis(50)).await;
    socket.send(update_frame("fast")).await.expect("send fast");

    let first = next_frame(&mut frames_rx).await;
    assert_eq!(first.payload["conversation"]["id"], "fast");

    release.notify_one();
    let second = next_frame(&mut frames_rx).await;
    assert_eq!(second.payload["conversation"]["id"], "slow");

    client.stop().await;
    task.await.expect("join");
}

#[tokio::test]
async fn functional_send_after_connect_reaches_server_with_next_ref() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = Arc::new(SocketClient::new(test_config(addr, &[])));
    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.start().await }
    });

    let mut socket = accept_socket(&listener).await;
    let join = recv_json(&mut socket).await;
    assert_eq!(join[0], "1");

    client
        .send("users:u-1", "ping", json!({"n": 1}))
        .await
        .expect("send custom frame");
    let frame = recv_json(&mut socket).await;
    assert_eq!(frame, json!(["2", "2", "users:u-1", "ping", {"n": 1}]));

    client.stop().await;
    task.await.expect("join");
    assert!(client.is_stopped());
}

#[tokio::test]
async fn regression_stop_before_start_returns_immediately() {
    let client = SocketClient::new(SocketConfig::new("t", "u-1", Vec::new()));
    client.stop().await;
    tokio::time::timeout(Duration::from_secs(1), client.start())
        .await
        .expect("start should return immediately once stopped");
}

#[tokio::test(start_paused = true)]
async fn regression_stop_returns_while_sink_is_held_by_a_stuck_send() {
    let client = SocketClient::new(SocketConfig::new("t", "u-1", Vec::new()));
    let held_sink = client.sink.lock().await;

    tokio::time::timeout(Duration::from_secs(5), client.stop())
        .await
        .expect("stop should not wait on a busy sink");
    assert!(client.is_stopped());
    assert!(!client.is_connected());
    drop(held_sink);
}
