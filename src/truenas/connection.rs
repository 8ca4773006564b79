//! WebSocket Connection Management
//!
//! This module handles the persistent WebSocket connection to the TrueNAS
//! middleware. A single authenticated connection is shared by every caller:
//!
//! - **Writer**: the sink half sits behind an async mutex, so frames from
//!   concurrent callers never interleave.
//! - **Reader**: a background task routes each `result` or `error` frame to
//!   the caller that owns its request id.
//! - **Reconnect**: when the reader sees the socket close, every request still
//!   waiting on that connection fails and the next call dials again.

use crate::config::TrueNasConfig;
use crate::error::{ClientError, Result};
use crate::truenas::transport::Transport;
use crate::truenas::types::{DdpConnect, DdpPong, MethodRequest, Params, ServerMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const AUTH_METHOD: &str = "auth.login_with_api_key";

/// A request waiting for its `result` frame.
struct Pending {
    generation: u64,
    method: String,
    reply: oneshot::Sender<Result<Value>>,
}

type PendingTable = DashMap<String, Pending>;

/// Drops a request's pending entry however its caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// An authenticated connection and its reader task
struct ActiveConnection {
    sink: Arc<Mutex<WsSink>>,
    alive: Arc<AtomicBool>,
    generation: u64,
    reader: JoinHandle<()>,
}

/// Manages a persistent WebSocket connection to TrueNAS
pub struct ConnectionManager {
    config: Arc<TrueNasConfig>,
    request_timeout: Duration,
    connection: Mutex<Option<ActiveConnection>>,
    pending: Arc<PendingTable>,
    request_id: AtomicU64,
    generation: AtomicU64,
}

impl ConnectionManager {
    /// Create a new connection manager; no connection is opened yet.
    pub fn new(config: Arc<TrueNasConfig>, request_timeout: Duration) -> Self {
        Self {
            config,
            request_timeout,
            connection: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            request_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn next_id(&self) -> String {
        format!("req{}", self.request_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn websocket_url(&self) -> String {
        let protocol = if self.config.use_tls { "wss" } else { "ws" };
        format!("{}://{}/websocket", protocol, self.config.host)
    }

    /// Opens and authenticates the connection if it is not already up.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_connected().await.map(|_| ())
    }

    /// Returns the writer and generation of a live connection, dialing first
    /// if needed. Holding the connection lock here serializes reconnects.
    async fn ensure_connected(&self) -> Result<(Arc<Mutex<WsSink>>, u64, Arc<AtomicBool>)> {
        let mut conn_guard = self.connection.lock().await;

        if let Some(conn) = conn_guard.as_ref() {
            if conn.alive.load(Ordering::SeqCst) {
                return Ok((conn.sink.clone(), conn.generation, conn.alive.clone()));
            }
            warn!("WebSocket connection lost, reconnecting");
        }

        if let Some(stale) = conn_guard.take() {
            stale.reader.abort();
            self.pending.retain(|_, p| p.generation != stale.generation);
        }

        info!("Establishing WebSocket connection to TrueNAS...");
        let mut stream = self.connect_websocket().await?;

        info!("Authenticating with TrueNAS...");
        self.handshake(&mut stream).await?;
        info!("Successfully authenticated to TrueNAS");

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, stream) = stream.split();
        let sink = Arc::new(Mutex::new(sink));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            stream,
            sink.clone(),
            self.pending.clone(),
            alive.clone(),
            generation,
        ));

        *conn_guard = Some(ActiveConnection {
            sink: sink.clone(),
            alive: alive.clone(),
            generation,
            reader,
        });

        Ok((sink, generation, alive))
    }

    async fn connect_websocket(&self) -> Result<WsStream> {
        let url = self.websocket_url();
        debug!("Connecting to {}", url);

        let connecting = async {
            if self.config.use_tls && !self.config.verify_ssl {
                // Appliances usually ship self-signed certificates
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()
                    .map_err(|e| ClientError::Config(e.to_string()))?;

                let connector = tokio_tungstenite::Connector::NativeTls(connector);
                tokio_tungstenite::connect_async_tls_with_config(&url, None, false, Some(connector))
                    .await
                    .map_err(ClientError::WebSocket)
            } else {
                connect_async(&url).await.map_err(ClientError::WebSocket)
            }
        };

        let (ws_stream, _) = tokio::time::timeout(self.request_timeout, connecting)
            .await
            .map_err(|_| {
                ClientError::Transport(format!(
                    "timed out connecting to {} after {:?}",
                    url, self.request_timeout
                ))
            })??;

        Ok(ws_stream)
    }

    /// DDP connect followed by API key login, on the unsplit stream.
    async fn handshake(&self, stream: &mut WsStream) -> Result<()> {
        let connect_msg = serde_json::to_string(&DdpConnect::default())?;
        stream.send(Message::Text(connect_msg.into())).await?;

        let connected = self
            .read_until(stream, |msg| msg.msg == "connected" || msg.msg == "failed")
            .await?;
        if connected.msg == "failed" {
            return Err(ClientError::Transport(
                "middleware rejected the DDP protocol version".to_string(),
            ));
        }
        debug!("DDP session {:?}", connected.session);

        let auth_id = self.next_id();
        let auth_request = MethodRequest::new(
            auth_id.clone(),
            AUTH_METHOD,
            Params::Positional(vec![Value::String(
                self.config.api_key.expose_secret().trim().to_string(),
            )]),
        );
        stream
            .send(Message::Text(serde_json::to_string(&auth_request)?.into()))
            .await?;

        let response = self
            .read_until(stream, |msg| {
                msg.msg == "result" && msg.id.as_deref() == Some(auth_id.as_str())
            })
            .await?;

        if let Some(message) = response.error_message() {
            return Err(ClientError::Auth(message));
        }

        match response.result {
            Some(Value::Bool(true)) => Ok(()),
            _ => Err(ClientError::Auth(
                "API key rejected by TrueNAS".to_string(),
            )),
        }
    }

    /// Reads frames until one satisfies `wanted`, bounded by the request timeout.
    async fn read_until<F>(&self, stream: &mut WsStream, wanted: F) -> Result<ServerMessage>
    where
        F: Fn(&ServerMessage) -> bool,
    {
        let reading = async {
            while let Some(frame) = stream.next().await {
                let Message::Text(text) = frame? else {
                    continue;
                };
                let msg: ServerMessage = serde_json::from_str(&text)?;
                if wanted(&msg) {
                    return Ok(msg);
                }
                debug!("Skipping {} frame during handshake", msg.msg);
            }
            Err(ClientError::Transport(
                "connection closed during handshake".to_string(),
            ))
        };

        tokio::time::timeout(self.request_timeout, reading)
            .await
            .map_err(|_| ClientError::Transport("handshake timed out".to_string()))?
    }

    /// Close the connection
    pub async fn close(&self) {
        let mut conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.take() {
            conn.alive.store(false, Ordering::SeqCst);
            let _ = conn.sink.lock().await.close().await;
            conn.reader.abort();
            self.pending.retain(|_, p| p.generation != conn.generation);
            info!("WebSocket connection closed");
        }
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn call(&self, method: &str, params: Params) -> Result<Value> {
        let (sink, generation, alive) = self.ensure_connected().await?;

        let id = self.next_id();
        let request_json = serde_json::to_string(&MethodRequest::new(id.clone(), method, params))?;

        let (reply, response) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            Pending {
                generation,
                method: method.to_string(),
                reply,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        // The reader may have drained this generation before we registered.
        if !alive.load(Ordering::SeqCst) {
            return Err(ClientError::Transport(format!(
                "connection lost before sending {}",
                method
            )));
        }

        debug!("Sending request {}: {}", id, method);
        let sent = sink.lock().await.send(Message::Text(request_json.into())).await;
        if let Err(e) = sent {
            alive.store(false, Ordering::SeqCst);
            return Err(ClientError::WebSocket(e));
        }

        match tokio::time::timeout(self.request_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Transport(format!(
                "connection closed before {} returned",
                method
            ))),
            Err(_) => Err(ClientError::Transport(format!(
                "{} timed out after {:?}",
                method, self.request_timeout
            ))),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get_mut().take() {
            conn.reader.abort();
        }
        debug!("ConnectionManager dropped");
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    sink: Arc<Mutex<WsSink>>,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
    generation: u64,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket read error: {}", e);
                break;
            }
        };

        let msg: ServerMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                fail_malformed(&text, e, &pending);
                continue;
            }
        };

        match msg.msg.as_str() {
            "result" | "error" => {
                let Some(id) = msg.id.as_deref() else {
                    warn!("Middleware error without request id: {:?}", msg.error_message());
                    continue;
                };
                let Some((_, waiter)) = pending.remove(id) else {
                    debug!("No caller waiting for {}", id);
                    continue;
                };

                let outcome = match msg.error_message() {
                    Some(message) => {
                        if message.contains("ENOTAUTHENTICATED") {
                            warn!("Session expired, will re-authenticate on next request");
                            alive.store(false, Ordering::SeqCst);
                        }
                        Err(ClientError::Remote {
                            method: waiter.method,
                            message,
                        })
                    }
                    None if msg.msg == "error" => Err(ClientError::Remote {
                        method: waiter.method,
                        message: "middleware returned an error frame without details".to_string(),
                    }),
                    None => Ok(msg.result.unwrap_or(Value::Null)),
                };
                let _ = waiter.reply.send(outcome);
            }
            "ping" => {
                let pong = DdpPong::reply_to(msg.id);
                if let Ok(text) = serde_json::to_string(&pong) {
                    let _ = sink.lock().await.send(Message::Text(text.into())).await;
                }
            }
            other => debug!("Ignoring {} frame", other),
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Dropping the reply senders fails every caller still waiting here.
    pending.retain(|_, p| p.generation != generation);
    debug!("Reader for connection {} stopped", generation);
}

/// A frame that is not valid DDP still fails its caller when the request id
/// can be recovered, instead of leaving it to time out.
fn fail_malformed(text: &str, error: serde_json::Error, pending: &PendingTable) {
    let id = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|frame| frame.get("id").and_then(Value::as_str).map(str::to_string));

    match id.and_then(|id| pending.remove(&id)) {
        Some((id, waiter)) => {
            warn!("Malformed reply to {} ({}): {}", id, waiter.method, error);
            let _ = waiter.reply.send(Err(ClientError::Decode(error)));
        }
        None => warn!("Ignoring malformed frame: {}", error),
    }
}
