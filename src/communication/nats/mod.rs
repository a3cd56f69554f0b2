/**
 * communication/nats/mod.rs
 *
 * NATS client speaking the text protocol over a (TLS) WebSocket.
 * Self-signed broker certificates can be allowed for development.
 */

mod protocol;

use self::protocol::ServerOp;
use super::transport::{Connection, Message, Subscription, TransportError, SUBSCRIPTION_CAPACITY};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_NAME: &str = "natdial";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Subscribers = Arc<Mutex<HashMap<u64, mpsc::Sender<Message>>>>;

#[derive(Clone)]
pub struct NatsConnection {
    url: String,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    subscribers: Subscribers,
    next_sid: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl NatsConnection {
    /// Connect to a broker at `ws://` or `wss://` url
    pub async fn connect(url: &str, allow_invalid_certs: bool) -> Result<Self, TransportError> {
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid broker url {}: {}", url, e)))?;

        let mut tls_builder = TlsConnector::builder();
        tls_builder.danger_accept_invalid_certs(allow_invalid_certs);
        let tls = tls_builder
            .build()
            .map_err(|e| TransportError::Connect(format!("TLS setup failed: {}", e)))?;

        let handshake = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            true,
            Some(Connector::NativeTls(tls)),
        );
        let (ws_stream, _resp) = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| TransportError::Connect(format!("{}: handshake timed out", url)))?
            .map_err(|e| TransportError::Connect(format!("{}: {}", url, e)))?;

        let (mut sink, mut stream) = ws_stream.split();

        // Server speaks first with INFO
        let mut buffer = Vec::new();
        let info = tokio::time::timeout(CONNECT_TIMEOUT, read_op(&mut stream, &mut buffer))
            .await
            .map_err(|_| TransportError::Connect(format!("{}: no INFO from server", url)))??;
        match info {
            ServerOp::Info(info) => debug!(url, %info, "broker info received"),
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected INFO, got {:?}",
                    other
                )))
            }
        }

        let mut hello = protocol::connect_command(CLIENT_NAME);
        hello.extend_from_slice(protocol::PING);
        sink.send(WsMessage::Binary(hello))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let connection = Self {
            url: url.to_string(),
            outgoing,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_sid: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        };

        tokio::spawn(write_loop(sink, outgoing_rx, connection.shutdown.clone()));
        tokio::spawn(read_loop(
            stream,
            buffer,
            connection.outgoing.clone(),
            connection.subscribers.clone(),
            connection.shutdown.clone(),
        ));

        info!(url, "connected to broker");
        Ok(connection)
    }

    fn send_raw(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outgoing.send(bytes).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Connection for NatsConnection {
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        trace!(subject, bytes = payload.len(), "publish");
        self.send_raw(protocol::pub_command(subject, reply, payload))
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sid, tx);

        if let Err(e) = self.send_raw(protocol::sub_command(subject, sid)) {
            self.subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&sid);
            return Err(e);
        }
        Ok(Subscription::new(sid, subject, rx))
    }

    async fn unsubscribe(&self, sid: u64) -> Result<(), TransportError> {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&sid);
        if removed.is_some() {
            self.send_raw(protocol::unsub_command(sid))?;
        }
        Ok(())
    }

    fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!(url = %self.url, "closing broker connection");
        }
        self.shutdown.cancel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

async fn read_op(
    stream: &mut SplitStream<WsStream>,
    buffer: &mut Vec<u8>,
) -> Result<ServerOp, TransportError> {
    loop {
        if let Some((op, used)) = protocol::parse(buffer.as_slice())? {
            buffer.drain(..used);
            return Ok(op);
        }
        match stream.next().await {
            Some(Ok(WsMessage::Binary(data))) => buffer.extend_from_slice(&data),
            Some(Ok(WsMessage::Text(text))) => buffer.extend_from_slice(text.as_bytes()),
            Some(Ok(WsMessage::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(WsMessage::Binary(frame)).await {
                    warn!("broker write failed: {}", e);
                    shutdown.cancel();
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    mut buffer: Vec<u8>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    subscribers: Subscribers,
    shutdown: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            _ = shutdown.cancelled() => break,
            op = read_op(&mut stream, &mut buffer) => op,
        };

        match op {
            Ok(ServerOp::Msg {
                subject,
                sid,
                reply,
                payload,
            }) => {
                let subscriber = subscribers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&sid)
                    .cloned();
                let Some(subscriber) = subscriber else {
                    trace!(sid, subject, "message for unknown subscription");
                    continue;
                };
                let message = Message {
                    subject,
                    reply,
                    payload,
                };
                if subscriber.try_send(message).is_err() {
                    warn!(sid, "dropping message for slow subscriber");
                }
            }
            Ok(ServerOp::Ping) => {
                let _ = outgoing.send(protocol::PONG.to_vec());
            }
            Ok(ServerOp::Err(message)) => warn!(%message, "broker reported error"),
            Ok(ServerOp::Info(_)) | Ok(ServerOp::Pong) | Ok(ServerOp::Ok) => {}
            Err(e) => {
                warn!("broker connection lost: {}", e);
                break;
            }
        }
    }

    shutdown.cancel();
    subscribers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}
