use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use httpmock::prelude::*;
use httpmock::Mock;
use pagebridge_core::ConfigSnapshot;
use pagebridge_events::{ResourceEvent, ResourceEventBus, ResourceEventKind};
use pagebridge_runtime::{
    DispatchHandler, FileResourceCatalog, InMemoryConversationStore, PendingConversation,
    PlatformApiClient, PlatformApiConfig, ReloadController, UpdateRouter, UpdateRouterConfig,
    WebhookSupportNotifier,
};
use pagebridge_socket::SocketConfig;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerSocket = WebSocketStream<TcpStream>;

const DEBOUNCE: Duration = Duration::from_millis(300);

struct ChannelDispatcher {
    sender: mpsc::UnboundedSender<PendingConversation>,
}

#[async_trait]
impl DispatchHandler for ChannelDispatcher {
    async fn dispatch(&self, pending: PendingConversation) -> Result<()> {
        let _ = self.sender.send(pending);
        Ok(())
    }
}

struct Deployment {
    _workspace: TempDir,
    catalog_path: PathBuf,
    api: MockServer,
    listener: TcpListener,
    controller: Arc<ReloadController>,
    bus: ResourceEventBus,
    dispatched: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingConversation>>,
}

fn page_json(id: &str, name: &str) -> Value {
    json!({
        "page_id": id,
        "page_name": name,
        "page_access_token": format!("token-{id}"),
        "tags": [
            {"tag_name": "AI handling", "tag_id": 7},
            {"tag_name": "human support", "tag_id": 9}
        ]
    })
}

fn write_catalog(path: &Path, pages: Value) {
    std::fs::write(path, json!({ "pages": pages }).to_string()).expect("write catalog");
}

impl Deployment {
    async fn start(pages: Value) -> Self {
        let workspace = tempfile::tempdir().expect("tempdir");
        let catalog_path = workspace.path().join("pages.json");
        write_catalog(&catalog_path, pages);

        let api = MockServer::start();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let snapshot = ConfigSnapshot::empty_handle();
        let tagger = PlatformApiClient::new(
            PlatformApiConfig {
                api_base: api.base_url(),
                request_timeout_ms: 2_000,
                retry_max_attempts: 1,
                retry_base_delay_ms: 1,
            },
            snapshot.clone(),
        )
        .expect("platform api client");
        let notifier = WebhookSupportNotifier::new(api.url("/support"), "support-secret", 2_000)
            .expect("notifier");
        let (sender, dispatched) = mpsc::unbounded_channel();

        let mut router_config = UpdateRouterConfig::new(
            snapshot,
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(tagger),
            Arc::new(notifier),
            Arc::new(ChannelDispatcher { sender }),
        );
        router_config.debounce_delay = DEBOUNCE;
        let router = Arc::new(UpdateRouter::new(router_config));

        let controller = Arc::new(
            ReloadController::new(
                socket_template(addr),
                Arc::new(FileResourceCatalog::new(&catalog_path)),
                router,
            )
            .with_stop_grace(Duration::from_secs(2)),
        );
        let bus = ResourceEventBus::new();
        bus.subscribe_all(controller.clone());
        controller.start().await.expect("controller start");

        Self {
            _workspace: workspace,
            catalog_path,
            api,
            listener,
            controller,
            bus,
            dispatched: tokio::sync::Mutex::new(dispatched),
        }
    }

    fn mock_tag(&self, resource_id: &str, conversation_id: &str, tag_id: &str) -> Mock<'_> {
        let path = format!("/pages/{resource_id}/conversations/{conversation_id}/tags");
        let tag_body = format!("tag_id={tag_id}");
        let token = format!("token-{resource_id}");
        self.api.mock(|when, then| {
            when.method(POST)
                .path(path)
                .query_param("page_access_token", token)
                .body_includes(tag_body);
            then.status(200).json_body(json!({"success": true}));
        })
    }

    async fn accept_session(&self, expected_channels: usize) -> (ServerSocket, Vec<String>) {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("client should connect before timeout")
            .expect("accept tcp");
        let mut socket = accept_async(stream).await.expect("websocket handshake");
        let mut channels = Vec::new();
        while channels.len() < expected_channels {
            let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("join should arrive before timeout")
                .expect("socket open")
                .expect("read frame");
            if let WsMessage::Text(text) = message {
                let frame = serde_json::from_str::<Value>(text.as_str()).expect("json frame");
                if frame[3] == "phx_join" {
                    channels.push(frame[2].as_str().expect("channel").to_string());
                }
            }
        }
        (socket, channels)
    }

    async fn next_dispatch(&self) -> PendingConversation {
        tokio::time::timeout(Duration::from_secs(5), self.dispatched.lock().await.recv())
            .await
            .expect("dispatch should arrive before timeout")
            .expect("dispatcher alive")
    }

    async fn assert_no_dispatch_within(&self, window: Duration) {
        let extra = tokio::time::timeout(window, self.dispatched.lock().await.recv()).await;
        assert!(extra.is_err(), "unexpected dispatch: {extra:?}");
    }
}

fn socket_template(addr: SocketAddr) -> SocketConfig {
    let mut config = SocketConfig::new("user-token", "u-1", Vec::new());
    config.endpoint = format!("ws://{addr}/socket/websocket?vsn=2.0.0");
    config.reconnect_delay = Duration::from_millis(50);
    config.connect_timeout = Duration::from_secs(2);
    config
}

fn update_frame(resource_id: &str, conversation_id: &str, snippet: &str) -> WsMessage {
    let frame = json!([
        null,
        null,
        format!("pages:{resource_id}"),
        "pages:update_conversation",
        {
            "conversation": {
                "id": conversation_id,
                "page_id": resource_id,
                "type": "INBOX",
                "customers": [{"id": "cust-1", "name": "Lan"}],
                "last_sent_by": {"name": "Lan"},
                "snippet": snippet,
                "tags": [],
                "updated_at": "2026-10-19T08:00:00"
            }
        }
    ]);
    WsMessage::Text(frame.to_string().into())
}

async fn wait_for_calls(mock: &Mock<'_>, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while mock.calls() < expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("mock should be called before timeout");
}

#[tokio::test]
async fn integration_update_burst_is_tagged_and_dispatched_once() {
    let deployment = Deployment::start(json!([page_json("100", "Shop A")])).await;
    let ai_tag = deployment.mock_tag("100", "c-1", "7");

    let (mut socket, channels) = deployment.accept_session(2).await;
    assert_eq!(channels, vec!["users:u-1".to_string(), "pages:100".to_string()]);

    socket
        .send(update_frame("100", "c-1", "hi"))
        .await
        .expect("send first update");
    wait_for_calls(&ai_tag, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    socket
        .send(update_frame("100", "c-1", "is this in stock?"))
        .await
        .expect("send second update");

    let pending = deployment.next_dispatch().await;
    assert_eq!(pending.conversation_id, "c-1");
    assert_eq!(pending.resource_id, "100");
    assert_eq!(pending.customer_name, "Lan");
    assert_eq!(pending.content, "is this in stock?");
    deployment.assert_no_dispatch_within(DEBOUNCE * 2).await;
    assert_eq!(ai_tag.calls(), 2);

    deployment.controller.shutdown().await;
}

#[tokio::test]
async fn integration_media_update_escalates_to_support_without_dispatch() {
    let deployment = Deployment::start(json!([page_json("100", "Shop A")])).await;
    let ai_tag = deployment.mock_tag("100", "c-2", "7");
    let support_tag = deployment.mock_tag("100", "c-2", "9");
    let support = deployment.api.mock(|when, then| {
        when.method(POST)
            .path("/support")
            .header("authorization", "Bearer support-secret")
            .body_includes("customer sent photo or video")
            .body_includes("https://pancake.vn/100?c_id=c-2");
        then.status(200).body("ok");
    });

    let (mut socket, _) = deployment.accept_session(2).await;
    socket
        .send(update_frame("100", "c-2", "[Photo]"))
        .await
        .expect("send media update");

    wait_for_calls(&support, 1).await;
    assert_eq!(ai_tag.calls(), 1);
    assert_eq!(support_tag.calls(), 1);
    deployment.assert_no_dispatch_within(DEBOUNCE * 2).await;

    deployment.controller.shutdown().await;
}

#[tokio::test]
async fn integration_bulk_reload_rejoins_and_routes_new_resource() {
    let deployment = Deployment::start(json!([page_json("100", "Shop A")])).await;
    let (mut first, _) = deployment.accept_session(2).await;

    write_catalog(
        &deployment.catalog_path,
        json!([page_json("100", "Shop A"), page_json("200", "Shop B")]),
    );
    let report = deployment
        .bus
        .emit(ResourceEvent::new(ResourceEventKind::Reloaded, "*"))
        .await;
    assert_eq!(report.listeners, 1);
    assert_eq!(report.failed, 0);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("previous session should close");

    let (mut second, channels) = deployment.accept_session(3).await;
    assert_eq!(
        channels,
        vec![
            "users:u-1".to_string(),
            "pages:100".to_string(),
            "pages:200".to_string()
        ]
    );
    assert_eq!(deployment.controller.reload_count(), 2);

    let ai_tag = deployment.mock_tag("200", "c-3", "7");
    second
        .send(update_frame("200", "c-3", "hello from the new page"))
        .await
        .expect("send update");

    let pending = deployment.next_dispatch().await;
    assert_eq!(pending.resource_id, "200");
    assert_eq!(pending.content, "hello from the new page");
    assert_eq!(ai_tag.calls(), 1);

    deployment.controller.shutdown().await;
}

#[tokio::test]
async fn regression_unreadable_catalog_fails_reload_and_disconnects() {
    let deployment = Deployment::start(json!([page_json("100", "Shop A")])).await;
    let (_socket, _) = deployment.accept_session(2).await;

    std::fs::write(&deployment.catalog_path, "{ not json").expect("corrupt catalog");
    let error = deployment
        .controller
        .reload("page_updated")
        .await
        .expect_err("corrupt catalog should fail");
    assert!(format!("{error:#}").contains("pages.json"));
    assert_eq!(deployment.controller.reload_count(), 1);
    assert!(!deployment.controller.is_connected().await);
    assert!(deployment.controller.active_channels().await.is_empty());

    deployment.controller.shutdown().await;
}
