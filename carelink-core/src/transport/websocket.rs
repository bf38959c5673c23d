//! Socket.IO client over a raw WebSocket (`tokio-tungstenite`).
//!
//! Only the `websocket` Engine.IO transport is spoken; there is no
//! long-polling upgrade path. One reader task decodes frames and answers
//! pings, one writer task owns the sink.

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{socket_url, SocketConnector, SocketEmitter, SocketEvent, SocketLink};
use crate::error::{ChatError, ChatResult};
use crate::protocol::packet::{EnginePacket, OpenPayload, PacketKind, SocketPacket};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_EVENT_BUFFER: usize = 256;
const OUTGOING_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    auth: Option<Value>,
    handshake_timeout: Duration,
    event_buffer: usize,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            auth: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload sent with the Socket.IO `CONNECT` packet.
    pub fn with_auth(mut self, auth: Value) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    async fn handshake<R, W>(&self, read: &mut R, write: &mut W) -> ChatResult<OpenPayload>
    where
        R: Stream<Item = Result<Message, WsError>> + Unpin,
        W: Sink<Message, Error = WsError> + Unpin,
    {
        let open = match next_engine_packet(read).await? {
            EnginePacket::Open(open) => open,
            other => {
                return Err(ChatError::HandshakeFailed(format!(
                    "expected open packet, got {:?}",
                    other
                )))
            }
        };
        debug!(sid = %open.sid, ping_interval = open.ping_interval, "Engine session opened");

        let connect = SocketPacket::connect(self.auth.clone()).encode();
        write
            .send(Message::Text(EnginePacket::Message(connect).encode()))
            .await?;

        loop {
            match next_engine_packet(read).await? {
                EnginePacket::Ping(data) => {
                    write
                        .send(Message::Text(EnginePacket::Pong(data).encode()))
                        .await?;
                }
                EnginePacket::Message(data) => {
                    let packet = SocketPacket::decode(&data)?;
                    match packet.kind {
                        PacketKind::Connect => return Ok(open),
                        PacketKind::ConnectError => {
                            let reason = packet
                                .data
                                .as_ref()
                                .and_then(|d| d.get("message"))
                                .and_then(Value::as_str)
                                .unwrap_or("connection refused by server")
                                .to_string();
                            return Err(ChatError::ServerRejected(reason));
                        }
                        kind => debug!(?kind, "Ignoring packet before connect ack"),
                    }
                }
                EnginePacket::Close => {
                    return Err(ChatError::ConnectionClosed(
                        "server closed during handshake".to_string(),
                    ))
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &Url) -> ChatResult<SocketLink> {
        let url = socket_url(endpoint)?;
        debug!(url = %url, "Opening websocket");

        let timeout_err = || ChatError::ConnectionFailed {
            endpoint: endpoint.to_string(),
            message: format!("handshake timed out after {:?}", self.handshake_timeout),
        };

        let (stream, _response) = tokio::time::timeout(
            self.handshake_timeout,
            connect_async(url.as_str()),
        )
        .await
        .map_err(|_| timeout_err())??;

        let (mut write, mut read) = stream.split();
        let open = tokio::time::timeout(
            self.handshake_timeout,
            self.handshake(&mut read, &mut write),
        )
        .await
        .map_err(|_| timeout_err())??;

        info!(endpoint = %endpoint, sid = %open.sid, "Socket connected");

        let (event_tx, event_rx) = mpsc::channel(self.event_buffer);
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_BUFFER);
        let open_flag = Arc::new(AtomicBool::new(true));

        event_tx
            .send(SocketEvent::new("connect", json!({ "sid": open.sid })))
            .await
            .map_err(|_| ChatError::Internal("event receiver dropped".to_string()))?;

        let idle_timeout = Duration::from_millis(open.ping_interval + open.ping_timeout);
        let writer = tokio::spawn(write_loop(write, out_rx));
        let reader = tokio::spawn(read_loop(
            read,
            out_tx.clone(),
            event_tx,
            open_flag.clone(),
            idle_timeout,
        ));

        Ok(SocketLink {
            emitter: Arc::new(WebSocketEmitter {
                outgoing: out_tx,
                open: open_flag,
                tasks: Mutex::new(vec![reader, writer]),
            }),
            events: event_rx,
        })
    }
}

struct WebSocketEmitter {
    outgoing: mpsc::Sender<Message>,
    open: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketEmitter {
    fn abort_reader(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The writer drains queued frames and exits once every sender is gone.
        if let Some(reader) = tasks.first() {
            reader.abort();
        }
        tasks.clear();
    }
}

#[async_trait]
impl SocketEmitter for WebSocketEmitter {
    async fn emit(&self, event: &str, payload: Value) -> ChatResult<()> {
        if !self.is_open() {
            return Err(ChatError::NotConnected);
        }
        let frame = EnginePacket::Message(SocketPacket::event(event, payload).encode()).encode();
        self.outgoing
            .send(Message::Text(frame))
            .await
            .map_err(|_| ChatError::ConnectionClosed("socket writer stopped".to_string()))
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let disconnect = EnginePacket::Message(SocketPacket::disconnect().encode()).encode();
        let _ = self.outgoing.send(Message::Text(disconnect)).await;
        let _ = self.outgoing.send(Message::Close(None)).await;
        self.abort_reader();
        debug!("Socket closed by client");
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketEmitter {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.abort_reader();
    }
}

async fn next_engine_packet<R>(read: &mut R) -> ChatResult<EnginePacket>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match read.next().await {
            None | Some(Ok(Message::Close(_))) => {
                return Err(ChatError::ConnectionClosed(
                    "closed during handshake".to_string(),
                ))
            }
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => return EnginePacket::decode(&text),
            Some(Ok(_)) => continue,
        }
    }
}

async fn write_loop<W>(mut write: W, mut outgoing: mpsc::Receiver<Message>)
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(frame) = outgoing.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = write.send(frame).await {
            debug!(error = %e, "Socket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = write.close().await;
}

async fn read_loop<R>(
    mut read: R,
    outgoing: mpsc::Sender<Message>,
    events: mpsc::Sender<SocketEvent>,
    open: Arc<AtomicBool>,
    idle_timeout: Duration,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        let text = match tokio::time::timeout(idle_timeout, read.next()).await {
            Err(_) => break "ping timeout".to_string(),
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break "transport close".to_string(),
            Ok(Some(Err(e))) => break format!("transport error: {}", e),
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => continue,
        };

        let packet = match EnginePacket::decode(&text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable engine frame");
                continue;
            }
        };

        match packet {
            EnginePacket::Ping(data) => {
                let _ = outgoing
                    .send(Message::Text(EnginePacket::Pong(data).encode()))
                    .await;
            }
            EnginePacket::Close => break "server close".to_string(),
            EnginePacket::Message(data) => match SocketPacket::decode(&data) {
                Ok(packet) => match packet.kind {
                    PacketKind::Event | PacketKind::BinaryEvent => {
                        let Some((name, payload)) = packet.event_parts() else {
                            warn!("Event packet without a name");
                            continue;
                        };
                        if events.send(SocketEvent::new(name, payload)).await.is_err() {
                            break "event receiver dropped".to_string();
                        }
                    }
                    PacketKind::Disconnect => break "io server disconnect".to_string(),
                    PacketKind::ConnectError => {
                        let payload = packet.data.unwrap_or(Value::Null);
                        if events
                            .send(SocketEvent::new("connect_error", payload))
                            .await
                            .is_err()
                        {
                            break "event receiver dropped".to_string();
                        }
                    }
                    kind => debug!(?kind, "Ignoring socket packet"),
                },
                Err(e) => warn!(error = %e, "Dropping malformed socket packet"),
            },
            _ => {}
        }
    };

    open.store(false, Ordering::SeqCst);
    info!(reason = %reason, "Socket disconnected");
    let _ = events.send(SocketEvent::new("disconnect", json!(reason))).await;
}
