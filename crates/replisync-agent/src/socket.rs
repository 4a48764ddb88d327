//! Reconnecting WebSocket transport.
//!
//! ```text
//!                start_connect
//!  DISCONNECTED ──────────────▶ CONNECTING ──open──▶ CONNECTED
//!       ▲                          │  ▲                  │
//!       │ unreachable /            │  │ timer            │ close / failure /
//!       │ stop_connect        fail │  │                  │ idle timeout
//!       │                          ▼  │                  ▼
//!       └──────────────────────  RECONNECTING ◀──────────┘
//! ```
//!
//! Every opened connection gets a fresh epoch. Reader and writer tasks carry
//! the epoch they were started with, and only the first loss report for the
//! current epoch is acted on.

use crate::config::{ConnectivityChecker, FrameEncoding, ProxyConfig, SocketConfig};
use crate::error::TransportError;
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use replisync_proto::Message;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Close code for a planned shutdown.
pub const NORMAL_CLOSE: u16 = 1000;

/// Close code reported when the peer went away without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1001;

const MAX_PROXY_RESPONSE: usize = 8 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Status {
    /// No connection and no reconnect scheduled
    Disconnected = -1,
    /// A connection attempt is in flight
    Connecting = 0,
    /// Connected
    Connected = 1,
    /// A reconnect attempt is scheduled
    Reconnecting = 2,
}

impl Status {
    /// Numeric status code.
    #[must_use]
    pub fn code(self) -> i8 {
        self as i8
    }
}

/// Receives transport notifications.
///
/// Callbacks run on the transport's tasks and must not block.
pub trait SocketListener: Send + Sync {
    /// The connection opened.
    fn on_open(&self);

    /// A message arrived.
    fn on_message(&self, message: Message);

    /// The connection closed with a close code.
    fn on_closed(&self, code: u16, reason: &str);

    /// The connection failed.
    fn on_failure(&self, error: &str);

    /// A reconnect attempt was scheduled.
    fn on_reconnect(&self, attempt: u32, delay: Duration);
}

/// Delay before the `attempt`-th consecutive reconnect (1-based).
#[must_use]
pub fn backoff_delay(attempt: u32, interval: Duration, max: Duration) -> Duration {
    interval.saturating_mul(attempt).min(max)
}

enum Loss {
    Closed { code: u16, reason: String },
    Failure(String),
}

struct Connection {
    epoch: u64,
    outbound: mpsc::Sender<Frame>,
    writer: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    fn abort(self) {
        self.writer.abort();
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

struct SocketInner {
    config: SocketConfig,
    url: Url,
    authorization: Option<HeaderValue>,
    connector: Option<Connector>,
    checker: ConnectivityChecker,
    status: Mutex<Status>,
    manual_close: AtomicBool,
    attempts: AtomicU32,
    epoch: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    connection: Mutex<Option<Connection>>,
    listener: RwLock<Option<Arc<dyn SocketListener>>>,
}

/// A persistent duplex connection to the replication endpoint.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ReplicaSocket {
    inner: Arc<SocketInner>,
}

impl ReplicaSocket {
    /// Validate the endpoint and prepare TLS.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the URL is not `ws`/`wss`, the credentials
    /// cannot be sent as a header, or TLS cannot be configured.
    pub fn new(config: SocketConfig, checker: ConnectivityChecker) -> Result<Self, TransportError> {
        let url = Url::parse(&config.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", config.url)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            scheme => {
                return Err(TransportError::InvalidUrl(format!(
                    "{}: unsupported scheme '{scheme}'",
                    config.url
                )));
            }
        }
        if url.host_str().is_none() {
            return Err(TransportError::InvalidUrl(format!(
                "{}: missing host",
                config.url
            )));
        }

        let authorization = config
            .auth
            .header_value()
            .map(|value| {
                HeaderValue::from_str(&value)
                    .map_err(|e| TransportError::InvalidHeader(e.to_string()))
            })
            .transpose()?;

        let connector = if config.accept_all_certificates {
            tracing::warn!(url = %url, "TLS certificate verification is disabled");
            Some(relaxed_connector()?)
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(SocketInner {
                config,
                url,
                authorization,
                connector,
                checker,
                status: Mutex::new(Status::Disconnected),
                manual_close: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                reconnect_task: Mutex::new(None),
                connection: Mutex::new(None),
                listener: RwLock::new(None),
            }),
        })
    }

    /// Install the notification target.
    pub fn set_listener(&self, listener: Arc<dyn SocketListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Current state.
    #[must_use]
    pub fn status(&self) -> Status {
        *self.inner.status.lock()
    }

    /// Check if connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Consecutive failed attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Connect, waiting at most `connect_timeout` for the handshake.
    ///
    /// Failures are not returned: they schedule a reconnect, or leave the
    /// socket disconnected when the network is unreachable. Returns the
    /// state after the attempt.
    pub async fn start_connect(&self) -> Status {
        self.inner.manual_close.store(false, Ordering::SeqCst);
        build_connect(self.inner.clone()).await;
        self.status()
    }

    /// Close with a normal close code and cancel any pending reconnect.
    pub fn stop_connect(&self, reason: &str) {
        let inner = &self.inner;
        inner.manual_close.store(true, Ordering::SeqCst);
        cancel_reconnect(inner);
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        *inner.status.lock() = Status::Disconnected;

        let Some(connection) = inner.connection.lock().take() else {
            return;
        };

        let frame = Frame::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        }));
        if connection.outbound.try_send(frame).is_err() {
            connection.writer.abort();
        }
        if let Some(reader) = connection.reader {
            reader.abort();
        }

        tracing::info!(url = %inner.url, reason, "Connection closed");
        if let Some(listener) = listener(inner) {
            listener.on_closed(NORMAL_CLOSE, reason);
        }
    }

    /// Queue one message for sending.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] when not connected,
    /// [`TransportError::Backpressure`] when the outbound queue is full, or
    /// [`TransportError::SendFailed`] when the connection died (a reconnect
    /// is scheduled).
    pub fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let frame = match self.inner.config.encoding {
            FrameEncoding::Json => Frame::Text(message.to_json()?),
            FrameEncoding::Cbor => Frame::Binary(message.to_cbor()?),
        };

        let (outbound, epoch) = {
            let connection = self.inner.connection.lock();
            let Some(connection) = connection.as_ref() else {
                return Err(TransportError::NotConnected);
            };
            (connection.outbound.clone(), connection.epoch)
        };

        match outbound.try_send(frame) {
            Ok(()) => {
                tracing::trace!(
                    id = %message.header().id,
                    message_type = %message.message_type(),
                    "Queued message"
                );
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    message_type = %message.message_type(),
                    capacity = self.inner.config.outbound_capacity,
                    "Outbound queue full"
                );
                Err(TransportError::Backpressure)
            }
            Err(TrySendError::Closed(_)) => {
                connection_lost(
                    &self.inner,
                    epoch,
                    Loss::Failure("connection writer stopped".to_string()),
                );
                Err(TransportError::SendFailed(
                    "connection writer stopped".to_string(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for ReplicaSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSocket")
            .field("url", &self.inner.url.as_str())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn listener(inner: &SocketInner) -> Option<Arc<dyn SocketListener>> {
    inner.listener.read().clone()
}

fn build_connect(inner: Arc<SocketInner>) -> BoxFuture<'static, ()> {
    async move {
        if !inner.checker.is_reachable() {
            tracing::info!(url = %inner.url, "Network unreachable, staying disconnected");
            *inner.status.lock() = Status::Disconnected;
            return;
        }

        {
            let mut status = inner.status.lock();
            if matches!(*status, Status::Connected | Status::Connecting) {
                return;
            }
            *status = Status::Connecting;
        }

        tracing::debug!(url = %inner.url, "Connecting");
        let timeout = inner.config.connect_timeout;
        let outcome = match tokio::time::timeout(timeout, open(&inner)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        match outcome {
            Ok(stream) => on_open(&inner, stream),
            Err(err) => {
                tracing::warn!(url = %inner.url, error = %err, "Connection attempt failed");
                *inner.status.lock() = Status::Disconnected;
                if let Some(listener) = listener(&inner) {
                    listener.on_failure(&err.to_string());
                }
                try_reconnect(&inner);
            }
        }
    }
    .boxed()
}

async fn open(inner: &SocketInner) -> Result<WsStream, TransportError> {
    let host = inner
        .url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(format!("{}: missing host", inner.url)))?;
    let port = inner.url.port_or_known_default().unwrap_or(80);

    let stream = match &inner.config.proxy {
        Some(proxy) => tunnel(proxy, host, port).await?,
        None => TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Connect(format!("{host}:{port}: {e}")))?,
    };
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(error = %err, "Failed to set TCP_NODELAY");
    }

    let mut request = inner
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    if let Some(value) = &inner.authorization {
        request.headers_mut().insert(AUTHORIZATION, value.clone());
    }

    let (stream, response) =
        client_async_tls_with_config(request, stream, None, inner.connector.clone())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
    tracing::debug!(status = %response.status(), "WebSocket handshake complete");
    Ok(stream)
}

/// Open a tunnel through an HTTP `CONNECT` proxy.
async fn tunnel(proxy: &ProxyConfig, host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| {
            TransportError::Connect(format!("proxy {}:{}: {e}", proxy.host, proxy.port))
        })?;

    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| TransportError::Connect(format!("proxy write: {e}")))?;

    // Read byte by byte so nothing past the header is consumed.
    let mut response = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_PROXY_RESPONSE {
            return Err(TransportError::Connect(
                "proxy response header too large".to_string(),
            ));
        }
        let read = stream
            .read(&mut byte)
            .await
            .map_err(|e| TransportError::Connect(format!("proxy read: {e}")))?;
        if read == 0 {
            return Err(TransportError::Connect(
                "proxy closed the tunnel".to_string(),
            ));
        }
        response.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(TransportError::Connect(format!(
            "proxy refused tunnel: {status_line}"
        )));
    }
    Ok(stream)
}

fn on_open(inner: &Arc<SocketInner>, stream: WsStream) {
    if inner.manual_close.load(Ordering::SeqCst) {
        tracing::debug!("Connection opened after stop, dropping it");
        *inner.status.lock() = Status::Disconnected;
        return;
    }

    let (sink, stream) = stream.split();
    let (outbound, queue) = mpsc::channel(inner.config.outbound_capacity.max(1));
    let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let writer = tokio::spawn(write_loop(inner.clone(), epoch, sink, queue));

    *inner.connection.lock() = Some(Connection {
        epoch,
        outbound,
        writer,
        reader: None,
    });
    *inner.status.lock() = Status::Connected;
    cancel_reconnect(inner);

    tracing::info!(url = %inner.url, epoch, "Connected");
    if let Some(listener) = listener(inner) {
        listener.on_open();
    }

    let reader = tokio::spawn(read_loop(inner.clone(), epoch, stream));
    match inner.connection.lock().as_mut() {
        Some(connection) if connection.epoch == epoch => connection.reader = Some(reader),
        _ => reader.abort(),
    }
}

async fn write_loop(
    inner: Arc<SocketInner>,
    epoch: u64,
    mut sink: SplitSink<WsStream, Frame>,
    mut queue: mpsc::Receiver<Frame>,
) {
    let heartbeat = inner
        .config
        .heartbeat_interval
        .max(Duration::from_millis(10));
    let write_timeout = inner.config.write_timeout;
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            _ = ticker.tick() => Frame::Ping(Vec::new()),
        };

        let closing = matches!(frame, Frame::Close(_));
        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                connection_lost(&inner, epoch, Loss::Failure(err.to_string()));
                return;
            }
            Err(_) => {
                connection_lost(
                    &inner,
                    epoch,
                    Loss::Failure(format!("write timed out after {write_timeout:?}")),
                );
                return;
            }
        }
        if closing {
            return;
        }
    }
}

async fn read_loop(inner: Arc<SocketInner>, epoch: u64, mut stream: SplitStream<WsStream>) {
    let idle = inner.config.idle_timeout();

    loop {
        let frame = match tokio::time::timeout(idle, stream.next()).await {
            Err(_) => {
                connection_lost(
                    &inner,
                    epoch,
                    Loss::Failure(format!("no traffic for {idle:?}")),
                );
                return;
            }
            Ok(None) => {
                connection_lost(
                    &inner,
                    epoch,
                    Loss::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: "stream ended".to_string(),
                    },
                );
                return;
            }
            Ok(Some(Err(err))) => {
                connection_lost(&inner, epoch, Loss::Failure(err.to_string()));
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let decoded = match frame {
            Frame::Text(text) => Message::from_json(&text),
            Frame::Binary(bytes) => Message::from_cbor(&bytes),
            Frame::Close(frame) => {
                let (code, reason) = frame.map_or((ABNORMAL_CLOSE, String::new()), |f| {
                    (u16::from(f.code), f.reason.into_owned())
                });
                connection_lost(&inner, epoch, Loss::Closed { code, reason });
                return;
            }
            Frame::Ping(_) | Frame::Pong(_) | Frame::Frame(_) => continue,
        };

        if inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        match decoded {
            Ok(message) => {
                tracing::trace!(
                    id = %message.header().id,
                    message_type = %message.message_type(),
                    "Received message"
                );
                if let Some(listener) = listener(&inner) {
                    listener.on_message(message);
                }
            }
            Err(err) => tracing::warn!(error = %err, "Dropped undecodable frame"),
        }
    }
}

fn connection_lost(inner: &Arc<SocketInner>, epoch: u64, loss: Loss) {
    if inner
        .epoch
        .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    if let Some(connection) = inner.connection.lock().take() {
        connection.abort();
    }
    *inner.status.lock() = Status::Disconnected;

    let listener = listener(inner);
    match loss {
        Loss::Closed { code, reason } => {
            tracing::info!(url = %inner.url, code, reason = %reason, "Connection closed by peer");
            if let Some(listener) = listener {
                listener.on_closed(code, &reason);
            }
        }
        Loss::Failure(error) => {
            tracing::warn!(url = %inner.url, error = %error, "Connection lost");
            if let Some(listener) = listener {
                listener.on_failure(&error);
            }
        }
    }

    try_reconnect(inner);
}

fn try_reconnect(inner: &Arc<SocketInner>) {
    if inner.manual_close.load(Ordering::SeqCst) {
        return;
    }

    if !inner.checker.is_reachable() {
        tracing::info!(url = %inner.url, "Network unreachable, not scheduling reconnect");
        *inner.status.lock() = Status::Disconnected;
        return;
    }

    *inner.status.lock() = Status::Reconnecting;
    let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
    let delay = backoff_delay(
        attempt,
        inner.config.reconnect_interval,
        inner.config.reconnect_max,
    );
    tracing::info!(url = %inner.url, attempt, ?delay, "Scheduling reconnect");
    if let Some(listener) = listener(inner) {
        listener.on_reconnect(attempt, delay);
    }

    let mut slot = inner.reconnect_task.lock();
    let task_inner = inner.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task_inner.reconnect_task.lock().take();
        build_connect(task_inner).await;
    });
    if let Some(previous) = slot.replace(task) {
        previous.abort();
    }
}

fn cancel_reconnect(inner: &SocketInner) {
    if let Some(task) = inner.reconnect_task.lock().take() {
        task.abort();
    }
    inner.attempts.store(0, Ordering::SeqCst);
}

fn relaxed_connector() -> Result<Connector, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAllCertificates(provider)))
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

/// Accepts any server certificate.
#[derive(Debug)]
struct AcceptAllCertificates(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAllCertificates {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
