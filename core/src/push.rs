//! Push transport - Pusher protocol client over WebSocket

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::session::{Session, SessionGuard};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

const PRIVATE_PREFIX: &str = "private-";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One event as delivered by the pub/sub service, before it is narrowed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Logical channel name, e.g. `conversation.12`.
    pub channel: String,
    pub event: String,
    pub data: Value,
}

/// Channel-level pub/sub operations. Reconnection is the transport's business.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn subscribe(&self, channel: &str) -> Result<()>;

    fn unsubscribe(&self, channel: &str);
}

enum Command {
    Subscribe(String, oneshot::Sender<Result<()>>),
    Unsubscribe(String),
}

// ============================================================================
// Pusher socket
// ============================================================================

pub struct PusherSocket {
    commands: mpsc::UnboundedSender<Command>,
}

impl PusherSocket {
    /// Spawns the connection task and returns the socket plus its event stream.
    ///
    /// The task keeps reconnecting until `cancel` fires.
    pub fn start(
        config: &ClientConfig,
        session: Session,
        guard: SessionGuard,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RawEvent>)> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let connection = Connection {
            url: config.push_url()?.to_string(),
            auth_url: config.auth_url()?.to_string(),
            http: Client::builder().timeout(Duration::from_secs(15)).build()?,
            session,
            guard,
            channels: BTreeSet::new(),
            commands: cmd_rx,
            events: event_tx,
            cancel,
        };
        tokio::spawn(connection.run());

        Ok((Self { commands: cmd_tx }, event_rx))
    }
}

#[async_trait]
impl PushTransport for PusherSocket {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe(channel.to_string(), tx))
            .map_err(|_| Error::Push("push connection closed".into()))?;
        rx.await
            .map_err(|_| Error::Push("push connection closed".into()))?
    }

    fn unsubscribe(&self, channel: &str) {
        let _ = self.commands.send(Command::Unsubscribe(channel.to_string()));
    }
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Frame {
    /// Pusher double-encodes `data` as a JSON string.
    fn payload(&self) -> Value {
        match &self.data {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| self.data.clone()),
            other => other.clone(),
        }
    }
}

enum Closed {
    Cancelled,
    Dropped,
}

struct Connection {
    url: String,
    auth_url: String,
    http: Client,
    session: Session,
    guard: SessionGuard,
    channels: BTreeSet<String>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<RawEvent>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.cancel.is_cancelled() || self.guard.is_invalidated() {
                break;
            }

            match self.connect().await {
                Ok((ws, socket_id)) => {
                    tracing::info!("Push connection established");
                    backoff = INITIAL_BACKOFF;
                    match self.pump(ws, socket_id).await {
                        Closed::Cancelled => break,
                        Closed::Dropped => tracing::warn!("Push connection dropped"),
                    }
                }
                Err(Error::Cancelled) => break,
                Err(e) => tracing::warn!(error = %e, "Push connection failed"),
            }

            if !self.wait_offline(backoff).await {
                break;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        tracing::debug!("Push connection task stopped");
    }

    /// Opens the socket and waits for the greeting. Channel changes made in
    /// the meantime are recorded and joined once connected.
    async fn connect(&mut self) -> Result<(Socket, String)> {
        let greeting = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(self.url.clone()));
        tokio::pin!(greeting);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                r = &mut greeting => {
                    return r.map_err(|_| Error::Push("push handshake timed out".into()))?;
                }
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => remember(&mut self.channels, cmd),
                    None => return Err(Error::Cancelled),
                },
            }
        }
    }

    /// Sleeps out the backoff while still accepting channel changes.
    async fn wait_offline(&mut self, backoff: Duration) -> bool {
        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => remember(&mut self.channels, cmd),
                    None => return false,
                },
            }
        }
    }

    async fn pump(&mut self, ws: Socket, socket_id: String) -> Closed {
        let (mut write, mut read) = ws.split();

        // Known channels still to be joined on this connection.
        let mut pending: Vec<String> = self.channels.iter().cloned().collect();
        let mut retry_backoff = INITIAL_BACKOFF;
        let retry = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(retry);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Closed::Cancelled;
                }
                _ = &mut retry, if !pending.is_empty() => {
                    pending = self.resubscribe(&mut write, &socket_id, pending).await;
                    if self.guard.is_invalidated() {
                        return Closed::Cancelled;
                    }
                    if !pending.is_empty() {
                        tracing::warn!(channels = ?pending, retry_in = ?retry_backoff, "Resubscribe incomplete");
                        retry.as_mut().reset(Instant::now() + retry_backoff);
                        retry_backoff = (retry_backoff * 2).min(MAX_BACKOFF);
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Subscribe(channel, reply)) => {
                        let result = self.send_subscribe(&mut write, &socket_id, &channel).await;
                        if result.is_ok() {
                            pending.retain(|c| *c != channel);
                            self.channels.insert(channel);
                        }
                        let _ = reply.send(result);
                    }
                    Some(Command::Unsubscribe(channel)) => {
                        pending.retain(|c| *c != channel);
                        self.channels.remove(&channel);
                        let frame = json!({
                            "event": "pusher:unsubscribe",
                            "data": { "channel": wire_name(&channel) }
                        });
                        if write.send(WsMessage::Text(frame.to_string())).await.is_err() {
                            return Closed::Dropped;
                        }
                    }
                    None => return Closed::Cancelled,
                },
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) = self.handle_frame(&text) {
                            if write.send(WsMessage::Text(reply)).await.is_err() {
                                return Closed::Dropped;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return Closed::Dropped,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    /// Returns a frame to write back, if the protocol requires one.
    fn handle_frame(&self, text: &str) -> Option<String> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable push frame");
                return None;
            }
        };

        match frame.event.as_str() {
            "pusher:ping" => {
                return Some(json!({ "event": "pusher:pong", "data": {} }).to_string());
            }
            "pusher:error" => {
                tracing::warn!(data = %frame.payload(), "Push service error");
                return None;
            }
            "pusher_internal:subscription_succeeded" => {
                tracing::debug!(channel = ?frame.channel, "Push subscription confirmed");
                return None;
            }
            _ => {}
        }

        if let Some(ref channel) = frame.channel {
            let channel = channel
                .strip_prefix(PRIVATE_PREFIX)
                .unwrap_or(channel)
                .to_string();
            let _ = self.events.send(RawEvent {
                channel,
                data: frame.payload(),
                event: frame.event,
            });
        }
        None
    }

    /// Returns the channels that still could not be joined.
    async fn resubscribe<S>(&self, write: &mut S, socket_id: &str, channels: Vec<String>) -> Vec<String>
    where
        S: futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let mut failed = Vec::new();
        for channel in channels {
            if !self.channels.contains(&channel) {
                continue;
            }
            if let Err(e) = self.send_subscribe(write, socket_id, &channel).await {
                tracing::warn!(channel = %channel, error = %e, "Resubscribe failed");
                failed.push(channel);
            }
        }
        failed
    }

    async fn send_subscribe<S>(&self, write: &mut S, socket_id: &str, channel: &str) -> Result<()>
    where
        S: futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let name = wire_name(channel);
        let auth = self.authorize(socket_id, &name).await?;
        let frame = json!({
            "event": "pusher:subscribe",
            "data": { "channel": name, "auth": auth }
        });
        write.send(WsMessage::Text(frame.to_string())).await?;
        Ok(())
    }

    async fn authorize(&self, socket_id: &str, channel_name: &str) -> Result<String> {
        let resp = self
            .http
            .post(&self.auth_url)
            .header("Authorization", self.session.bearer())
            .header("Accept", "application/json")
            .json(&json!({ "socket_id": socket_id, "channel_name": channel_name }))
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => {
                self.guard.invalidate();
                return Err(Error::Unauthorized);
            }
            status if !status.is_success() => {
                return Err(Error::Status {
                    status: status.as_u16(),
                    message: format!("channel auth refused for {}", channel_name),
                });
            }
            _ => {}
        }

        let body: Value = resp.json().await?;
        body["auth"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Push("channel auth response without signature".into()))
    }
}

async fn handshake(url: String) -> Result<(Socket, String)> {
    let (mut ws, _) = connect_async(url.as_str()).await?;

    // The server greets with the socket id used for channel auth.
    while let Some(msg) = ws.next().await {
        if let WsMessage::Text(text) = msg? {
            let frame: Frame = serde_json::from_str(&text)?;
            match frame.event.as_str() {
                "pusher:connection_established" => {
                    let socket_id = frame.payload()["socket_id"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    return Ok((ws, socket_id));
                }
                "pusher:error" => {
                    return Err(Error::Push(frame.payload()["message"].to_string()));
                }
                _ => {}
            }
        }
    }

    Err(Error::Push("connection closed before handshake".into()))
}

/// Offline bookkeeping: channels are joined on the next connection.
fn remember(channels: &mut BTreeSet<String>, cmd: Command) {
    match cmd {
        Command::Subscribe(channel, reply) => {
            channels.insert(channel);
            let _ = reply.send(Ok(()));
        }
        Command::Unsubscribe(channel) => {
            channels.remove(&channel);
        }
    }
}

fn wire_name(channel: &str) -> String {
    format!("{}{}", PRIVATE_PREFIX, channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn connection(
        url: String,
        auth_url: String,
    ) -> (Connection, mpsc::UnboundedSender<Command>, mpsc::UnboundedReceiver<RawEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            url,
            auth_url,
            http: Client::new(),
            session: Session::new(7, crate::models::Role::User, "t"),
            guard: SessionGuard::new(),
            channels: BTreeSet::new(),
            commands: cmd_rx,
            events: event_tx,
            cancel: CancellationToken::new(),
        };
        (connection, cmd_tx, event_rx)
    }

    /// Accepts TCP connections and never answers.
    async fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr.to_string()
    }

    /// Pusher endpoint that greets, then reports every channel subscribed.
    async fn serve_push(listener: TcpListener, subscribed: mpsc::UnboundedSender<String>) {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let greeting = json!({
            "event": "pusher:connection_established",
            "data": json!({ "socket_id": "1.1", "activity_timeout": 120 }).to_string()
        });
        ws.send(WsMessage::Text(greeting.to_string())).await.unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            if let WsMessage::Text(text) = msg {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["event"] == "pusher:subscribe" {
                    let channel = frame["data"]["channel"].as_str().unwrap_or_default();
                    let _ = subscribed.send(channel.to_string());
                }
            }
        }
    }

    /// Channel authorizer that refuses the first request and signs the rest.
    async fn serve_auth(listener: TcpListener, attempts: Arc<AtomicUsize>) {
        while let Ok((mut stream, _)) = listener.accept().await {
            read_request(&mut stream).await;
            let response = if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_string()
            } else {
                let body = r#"{"auth":"local:signature"}"#;
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                )
            };
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }

    async fn read_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    #[test]
    fn frame_payload_decodes_double_encoded_data() {
        let frame: Frame = serde_json::from_str(
            r#"{"event":"App\\Events\\CallInitiated","channel":"private-user.5","data":"{\"call\":{\"id\":1}}"}"#,
        )
        .unwrap();

        assert_eq!(frame.payload()["call"]["id"], 1);
        assert_eq!(frame.channel.as_deref(), Some("private-user.5"));
    }

    #[tokio::test]
    async fn frames_are_routed_without_private_prefix() {
        let (connection, cmd_tx, mut event_rx) = connection(String::new(), String::new());
        drop(cmd_tx);

        let ping = connection.handle_frame(r#"{"event":"pusher:ping","data":{}}"#);
        assert!(ping.unwrap().contains("pusher:pong"));

        let none = connection.handle_frame(
            r#"{"event":"MessageSent","channel":"private-conversation.3","data":"{\"message\":{}}"}"#,
        );
        assert!(none.is_none());

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.channel, "conversation.3");
        assert_eq!(event.event, "MessageSent");
    }

    #[tokio::test]
    async fn silent_server_blocks_neither_subscribe_nor_shutdown() {
        let addr = silent_server().await;
        let (connection, commands, _events) =
            connection(format!("ws://{}/app/local", addr), format!("http://{}/broadcasting/auth", addr));
        let cancel = connection.cancel.clone();
        let task = tokio::spawn(connection.run());
        let socket = PusherSocket { commands };

        let subscribed = tokio::time::timeout(Duration::from_secs(2), socket.subscribe("user.7")).await;
        assert!(matches!(subscribed, Ok(Ok(()))));

        cancel.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(2), task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_gives_up_after_timeout() {
        let addr = silent_server().await;
        let (mut connection, _commands, _events) =
            connection(format!("ws://{}/app/local", addr), format!("http://{}/broadcasting/auth", addr));

        match connection.connect().await {
            Err(Error::Push(message)) => assert!(message.contains("timed out"), "{}", message),
            other => panic!("unexpected {:?}", other.map(|(_, socket_id)| socket_id)),
        }
    }

    #[tokio::test]
    async fn refused_resubscribe_is_retried_on_the_same_connection() {
        let push = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let auth = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let push_addr = push.local_addr().unwrap();
        let auth_addr = auth.local_addr().unwrap();

        let (subscribed_tx, mut subscribed) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve_push(push, subscribed_tx));
        tokio::spawn(serve_auth(auth, attempts.clone()));

        let (mut connection, _commands, _events) = connection(
            format!("ws://{}/app/local", push_addr),
            format!("http://{}/broadcasting/auth", auth_addr),
        );
        connection.channels.insert("user.7".to_string());
        let cancel = connection.cancel.clone();
        tokio::spawn(connection.run());

        let channel = tokio::time::timeout(Duration::from_secs(5), subscribed.recv())
            .await
            .unwrap();
        assert_eq!(channel.as_deref(), Some("private-user.7"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        cancel.cancel();
    }
}
