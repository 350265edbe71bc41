//! Connection manager: connect, join, read, dispatch, reconnect.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::frame::{encode_frame, parse_ws_message, InboundFrame, PlatformEvent};

pub const DEFAULT_SOCKET_ENDPOINT: &str = "wss://pages.fm/socket/websocket?vsn=2.0.0";
pub const DEFAULT_JOIN_EVENT: &str = "phx_join";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const JOIN_PLATFORM: &str = "web";
/// Bound on the close handshake in [`SocketClient::stop`]. The read loop
/// exits on the stop signal regardless.
const STOP_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("keepalive pong not received within {0:?}")]
    KeepaliveTimeout(Duration),
    #[error("websocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Receives decoded frames for one [`PlatformEvent`] kind.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, frame: &InboundFrame) -> Result<()>;
}

/// Settings for one client instance. Resource ids are fixed for the
/// client's lifetime; a new resource set means a new client.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub endpoint: String,
    pub access_token: String,
    pub user_id: String,
    pub resource_ids: Vec<String>,
    pub join_event: String,
    pub reconnect_delay: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub connect_timeout: Duration,
}

impl SocketConfig {
    pub fn new(
        access_token: impl Into<String>,
        user_id: impl Into<String>,
        resource_ids: Vec<String>,
    ) -> Self {
        Self {
            endpoint: DEFAULT_SOCKET_ENDPOINT.to_string(),
            access_token: access_token.into(),
            user_id: user_id.into(),
            resource_ids,
            join_event: DEFAULT_JOIN_EVENT.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// All channels joined on connect, user channel first.
    pub fn channels(&self) -> Vec<String> {
        std::iter::once(user_channel(&self.user_id))
            .chain(self.resource_ids.iter().map(|id| resource_channel(id)))
            .collect()
    }

    fn join_payload(&self, resource_id: Option<&str>) -> Value {
        let mut payload = json!({
            "accessToken": self.access_token,
            "userId": self.user_id,
            "platform": JOIN_PLATFORM,
        });
        if let Some(resource_id) = resource_id {
            payload["pageId"] = Value::String(resource_id.to_string());
        }
        payload
    }
}

pub fn user_channel(user_id: &str) -> String {
    format!("users:{user_id}")
}

pub fn resource_channel(resource_id: &str) -> String {
    format!("pages:{resource_id}")
}

enum SessionEnd {
    Stopped,
    Closed,
}

pub struct SocketClient {
    config: SocketConfig,
    handlers: RwLock<HashMap<PlatformEvent, Vec<Arc<dyn FrameHandler>>>>,
    sink: Mutex<Option<WsSink>>,
    ref_counter: AtomicU64,
    connected: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl SocketClient {
    pub fn new(config: SocketConfig) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Self {
            config,
            handlers: RwLock::new(HashMap::new()),
            sink: Mutex::new(None),
            ref_counter: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn channels(&self) -> Vec<String> {
        self.config.channels()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Registers `handler` for every frame of `kind`. Handlers run in
    /// registration order.
    pub fn subscribe(&self, kind: PlatformEvent, handler: Arc<dyn FrameHandler>) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.entry(kind).or_default().push(handler);
        info!(event = kind.as_str(), "registered socket frame handler");
    }

    /// Transmits one frame on the active session.
    pub async fn send(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), SocketError> {
        let reference = self.next_ref();
        let text = encode_frame(&reference, channel, event, &payload);
        self.send_message(WsMessage::Text(text.into())).await?;
        debug!(channel, event, reference = %reference, "sent socket frame");
        Ok(())
    }

    /// Runs connect/read/reconnect cycles until [`Self::stop`] is called.
    /// Transient failures are logged and retried after the reconnect delay.
    pub async fn start(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut frame_tasks = JoinSet::new();
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match self.run_session(&mut stop_rx, &mut frame_tasks).await {
                Ok(SessionEnd::Stopped) => {
                    info!("socket session stopped on request");
                }
                Ok(SessionEnd::Closed) => {
                    warn!("socket session closed by server");
                }
                Err(error) => {
                    warn!(error = %error, "socket session failed");
                }
            }
            self.clear_session().await;
            if *stop_rx.borrow() {
                break;
            }

            info!(
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "reconnecting socket after delay"
            );
            tokio::select! {
                _ = stop_rx.changed() => {}
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.clear_session().await;
        while let Some(result) = frame_tasks.join_next().await {
            log_frame_task_result(result);
        }
        info!("socket client stopped");
    }

    /// Disables reconnection and closes the active session, if any.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.connected.store(false, Ordering::SeqCst);
        let close = async {
            let mut guard = self.sink.lock().await;
            if let Some(mut sink) = guard.take() {
                if let Err(error) = sink.send(WsMessage::Close(None)).await {
                    debug!(error = %error, "socket close frame was not delivered");
                }
                if let Err(error) = sink.close().await {
                    debug!(error = %error, "socket sink close failed");
                }
            }
        };
        if tokio::time::timeout(STOP_CLOSE_TIMEOUT, close).await.is_err() {
            warn!(
                timeout_ms = STOP_CLOSE_TIMEOUT.as_millis() as u64,
                "socket close did not finish in time"
            );
        }
    }

    async fn run_session(
        &self,
        stop_rx: &mut watch::Receiver<bool>,
        frame_tasks: &mut JoinSet<()>,
    ) -> Result<SessionEnd, SocketError> {
        let connect = connect_async(self.config.endpoint.as_str());
        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| SocketError::ConnectTimeout(self.config.connect_timeout))??;
        let (sink, mut source) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);
        info!(endpoint = %self.config.endpoint, "socket connected");

        self.join_channels().await?;

        let keepalive_interval = self.config.keepalive_interval;
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let pong_wait = async move {
                match pong_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return Ok(SessionEnd::Stopped);
                    }
                }
                maybe_message = source.next() => {
                    let Some(message) = maybe_message else {
                        return Ok(SessionEnd::Closed);
                    };
                    match message? {
                        WsMessage::Pong(_) => {
                            pong_deadline = None;
                        }
                        WsMessage::Close(close_frame) => {
                            debug!(?close_frame, "socket close frame received");
                            return Ok(SessionEnd::Closed);
                        }
                        message => match parse_ws_message(message) {
                            Ok(Some(frame)) => self.dispatch_frame(frame, frame_tasks),
                            Ok(None) => {}
                            Err(error) => {
                                warn!(error = %error, "dropping malformed socket frame");
                            }
                        },
                    }
                }
                _ = keepalive.tick() => {
                    let keepalive_timeout = self.config.keepalive_timeout;
                    tokio::time::timeout(
                        keepalive_timeout,
                        self.send_message(WsMessage::Ping(Vec::new().into())),
                    )
                    .await
                    .map_err(|_| SocketError::KeepaliveTimeout(keepalive_timeout))??;
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.keepalive_timeout);
                    }
                }
                _ = pong_wait => {
                    return Err(SocketError::KeepaliveTimeout(self.config.keepalive_timeout));
                }
                Some(result) = frame_tasks.join_next(), if !frame_tasks.is_empty() => {
                    log_frame_task_result(result);
                }
            }
        }
    }

    async fn join_channels(&self) -> Result<(), SocketError> {
        let join_event = self.config.join_event.as_str();
        self.send(
            &user_channel(&self.config.user_id),
            join_event,
            self.config.join_payload(None),
        )
        .await?;
        for resource_id in &self.config.resource_ids {
            self.send(
                &resource_channel(resource_id),
                join_event,
                self.config.join_payload(Some(resource_id)),
            )
            .await?;
        }
        info!(
            user_id = %self.config.user_id,
            channels = self.config.resource_ids.len() + 1,
            "joined socket channels"
        );
        Ok(())
    }

    fn dispatch_frame(&self, frame: InboundFrame, frame_tasks: &mut JoinSet<()>) {
        let Some(kind) = frame.kind() else {
            debug!(channel = %frame.channel, event = %frame.event, "no route for socket event");
            return;
        };
        if kind == PlatformEvent::Reply {
            if let Some(status) = frame.reply_status().filter(|status| *status != "ok") {
                warn!(channel = %frame.channel, status, "channel reply was not ok");
            }
        }

        let handlers = self.handlers_for(kind);
        if handlers.is_empty() {
            debug!(channel = %frame.channel, event = kind.as_str(), "no handler for socket event");
            return;
        }

        frame_tasks.spawn(async move {
            for handler in handlers {
                let outcome = AssertUnwindSafe(handler.handle_frame(&frame))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        warn!(
                            channel = %frame.channel,
                            event = %frame.event,
                            error = %format!("{error:#}"),
                            "socket frame handler failed"
                        );
                    }
                    Err(_) => {
                        error!(
                            channel = %frame.channel,
                            event = %frame.event,
                            "socket frame handler panicked"
                        );
                    }
                }
            }
        });
    }

    fn handlers_for(&self, kind: PlatformEvent) -> Vec<Arc<dyn FrameHandler>> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(&kind).cloned().unwrap_or_default()
    }

    async fn send_message(&self, message: WsMessage) -> Result<(), SocketError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(SocketError::NotConnected);
        };
        if let Err(error) = sink.send(message).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(SocketError::Transport(error));
        }
        Ok(())
    }

    async fn clear_session(&self) {
        self.sink.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn next_ref(&self) -> String {
        (self.ref_counter.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

fn log_frame_task_result(result: Result<(), JoinError>) {
    if let Err(error) = result {
        if error.is_panic() {
            error!("socket frame task panicked");
        } else {
            debug!("socket frame task cancelled");
        }
    }
}

#[cfg(test)]
mod tests;
