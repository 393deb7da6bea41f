//! Socket.IO client over the WebSocket transport.
//!
//! Only what the chat server uses: Engine.IO v4 open/ping/close and
//! Socket.IO v5 events in the default namespace, all as text frames.
//! Binary attachments and acknowledgements are not supported.

use super::{ChannelHandle, InboundEvent, OutboundEvent, RealtimeConnector};
use crate::chat::{Message, MessageRecord};
use crate::config::Config;
use crate::entity::PeerId;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_ONLINE_USERS: &str = "getOnlineUsers";
const EVENT_NEW_MESSAGE: &str = "newMessage";
const EVENT_SEND_MESSAGE: &str = "sendMessage";

// Engine.IO packets
const EIO_OPEN: char = '0';
const EIO_CLOSE: char = '1';
const EIO_PING: char = '2';
const EIO_PONG: &str = "3";
const EIO_MESSAGE: char = '4';

// Socket.IO packets, carried inside an Engine.IO message
const SIO_CONNECT: char = '0';
const SIO_DISCONNECT: char = '1';
const SIO_EVENT: char = '2';
const SIO_CONNECT_ERROR: char = '4';

/// Connect to the default namespace.
const CONNECT_DEFAULT_NAMESPACE: &str = "40";

/// A decoded text frame.
#[derive(Debug, PartialEq)]
enum Packet {
    /// Engine.IO handshake; we answer with a namespace connect
    Open,
    Ping,
    /// The namespace accepted us
    Connected,
    Event(InboundEvent),
    /// Engine.IO close, namespace disconnect or a refused connect
    Closed(String),
    /// Valid but irrelevant to us
    Ignored,
}

#[derive(Debug, Serialize)]
struct SendMessageData<'a> {
    to: &'a str,
    message: MessageRecord,
}

/// Realtime channel to a Socket.IO server. Reconnects after a fixed delay
/// until the handle is closed.
pub struct SocketIoConnector {
    url: String,
    reconnect_delay: Duration,
}

impl SocketIoConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.socket_url.clone(),
            reconnect_delay: config.reconnect_delay,
        }
    }

    fn endpoint(&self, identity: &PeerId) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.url)
            .map_err(|e| ChatError::Config(format!("invalid socket URL '{}': {}", self.url, e)))?;
        url.query_pairs_mut()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket")
            .append_pair("userId", identity.as_str());
        Ok(url.to_string())
    }
}

#[async_trait]
impl RealtimeConnector for SocketIoConnector {
    async fn connect(
        &self,
        identity: &PeerId,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) -> Result<ChannelHandle> {
        let endpoint = self.endpoint(identity)?;
        let connection_id = format!("rt_{}", Uuid::new_v4().simple());

        info!("Opening realtime channel {} for {}", connection_id, identity);
        let (stream, _) = connect_async(endpoint.as_str()).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let session = Session {
            connection_id: connection_id.clone(),
            endpoint,
            reconnect_delay: self.reconnect_delay,
            inbound,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(session.run(stream));

        Ok(ChannelHandle::new(connection_id, outbound_tx, shutdown_tx))
    }
}

struct Session {
    connection_id: String,
    endpoint: String,
    reconnect_delay: Duration,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    shutdown: oneshot::Receiver<()>,
}

enum Exit {
    Closed,
    Lost,
}

impl Session {
    async fn run(mut self, mut stream: WsStream) {
        loop {
            match self.pump(stream).await {
                Exit::Closed => break,
                Exit::Lost => {
                    warn!("Realtime channel {} lost", self.connection_id);
                    if self.inbound.send(InboundEvent::Disconnected).is_err() {
                        break;
                    }
                }
            }

            match self.reconnect().await {
                Some(next) => {
                    stream = next;
                    if self.inbound.send(InboundEvent::Reconnected).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        debug!("Realtime channel {} finished", self.connection_id);
    }

    async fn pump(&mut self, stream: WsStream) -> Exit {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    let _ = write.send(WsMessage::text(EIO_CLOSE.to_string())).await;
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Exit::Closed;
                }
                Some(event) = self.outbound.recv() => {
                    let text = match encode(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode outbound event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(WsMessage::text(text)).await {
                        warn!("Realtime send failed: {}", e);
                        return Exit::Lost;
                    }
                }
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | None => return Exit::Lost,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("Realtime read failed: {}", e);
                            return Exit::Lost;
                        }
                    };

                    let reply = match decode(text.as_str()) {
                        Ok(Packet::Open) => Some(CONNECT_DEFAULT_NAMESPACE),
                        Ok(Packet::Ping) => Some(EIO_PONG),
                        Ok(Packet::Connected) => {
                            debug!("Realtime channel {} joined namespace", self.connection_id);
                            None
                        }
                        Ok(Packet::Event(event)) => {
                            if self.inbound.send(event).is_err() {
                                return Exit::Closed;
                            }
                            None
                        }
                        Ok(Packet::Closed(reason)) => {
                            warn!("Realtime server closed channel {}: {}", self.connection_id, reason);
                            return Exit::Lost;
                        }
                        Ok(Packet::Ignored) => {
                            debug!("Ignoring realtime frame: {}", text.as_str());
                            None
                        }
                        Err(e) => {
                            warn!("Malformed realtime frame: {}", e);
                            None
                        }
                    };

                    if let Some(reply) = reply {
                        if let Err(e) = write.send(WsMessage::text(reply.to_string())).await {
                            warn!("Realtime send failed: {}", e);
                            return Exit::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Retry until connected or closed. `None` means the handle was closed.
    async fn reconnect(&mut self) -> Option<WsStream> {
        loop {
            tokio::select! {
                _ = &mut self.shutdown => return None,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            match connect_async(self.endpoint.as_str()).await {
                Ok((stream, _)) => {
                    info!("Realtime channel {} reconnected", self.connection_id);
                    return Some(stream);
                }
                Err(e) => warn!("Realtime reconnect failed: {}", e),
            }
        }
    }
}

/// `42["sendMessage", {"to": .., "message": ..}]`
fn encode(event: &OutboundEvent) -> Result<String> {
    let (name, data) = match event {
        OutboundEvent::MessageSent { to, message } => (
            EVENT_SEND_MESSAGE,
            serde_json::to_value(SendMessageData {
                to: to.as_str(),
                message: MessageRecord::from(message),
            })?,
        ),
    };
    let payload = serde_json::to_string(&Value::Array(vec![Value::from(name), data]))?;
    Ok(format!("{}{}{}", EIO_MESSAGE, SIO_EVENT, payload))
}

fn decode(text: &str) -> Result<Packet> {
    let mut chars = text.chars();
    match chars.next() {
        Some(EIO_OPEN) => Ok(Packet::Open),
        Some(EIO_CLOSE) => Ok(Packet::Closed("transport closed".to_string())),
        Some(EIO_PING) => Ok(Packet::Ping),
        Some(EIO_MESSAGE) => decode_socket_packet(chars.as_str()),
        Some(_) => Ok(Packet::Ignored),
        None => Err(ChatError::Realtime("empty frame".to_string())),
    }
}

fn decode_socket_packet(text: &str) -> Result<Packet> {
    let mut chars = text.chars();
    let kind = chars.next();
    let body = chars.as_str();

    match kind {
        Some(SIO_CONNECT) => Ok(Packet::Connected),
        Some(SIO_DISCONNECT) => Ok(Packet::Closed("disconnected by server".to_string())),
        Some(SIO_CONNECT_ERROR) => Ok(Packet::Closed(format!("connect refused: {}", body))),
        Some(SIO_EVENT) => {
            // Skip an optional namespace ("/ns,") and ack id before the array
            let body = match body.strip_prefix('/') {
                Some(rest) => rest.split_once(',').map(|(_, r)| r).unwrap_or(""),
                None => body,
            };
            let body = body.trim_start_matches(|c: char| c.is_ascii_digit());

            let mut args: Vec<Value> = serde_json::from_str(body)?;
            if args.is_empty() {
                return Err(ChatError::Realtime("event without a name".to_string()));
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                other => {
                    return Err(ChatError::Realtime(format!("event name is not a string: {}", other)))
                }
            };
            let data = args.into_iter().next().unwrap_or(Value::Null);
            decode_event(&name, data)
        }
        _ => Ok(Packet::Ignored),
    }
}

fn decode_event(name: &str, data: Value) -> Result<Packet> {
    match name {
        EVENT_ONLINE_USERS => {
            let ids: Vec<String> = serde_json::from_value(data)?;
            Ok(Packet::Event(InboundEvent::OnlinePeers(
                ids.into_iter().map(PeerId::new).collect(),
            )))
        }
        EVENT_NEW_MESSAGE => {
            let record: MessageRecord = serde_json::from_value(data)?;
            Ok(Packet::Event(InboundEvent::NewMessage(Message::try_from(
                record,
            )?)))
        }
        _ => Ok(Packet::Ignored),
    }
}
