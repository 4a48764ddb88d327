//! Replica and agent configuration.

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Reports whether the network is reachable.
///
/// Consulted before every connect and reconnect so an offline replica does
/// not spin on failing attempts.
#[derive(Clone)]
pub struct ConnectivityChecker(Arc<dyn Fn() -> bool + Send + Sync>);

impl ConnectivityChecker {
    /// Wrap a reachability callback.
    pub fn new(check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(check))
    }

    /// A checker that always reports reachable.
    #[must_use]
    pub fn always() -> Self {
        Self::new(|| true)
    }

    /// Run the check.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        (self.0)()
    }
}

impl Default for ConnectivityChecker {
    fn default() -> Self {
        Self::always()
    }
}

impl std::fmt::Debug for ConnectivityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectivityChecker")
    }
}

/// Credentials presented to the remote endpoint.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Authentication {
    /// No credentials
    #[default]
    None,
    /// JWT bearer token
    Bearer(String),
    /// HTTP basic credentials
    Basic {
        /// User name
        user: String,
        /// Password
        password: String,
    },
}

impl Authentication {
    /// `Authorization` header value, if any.
    #[must_use]
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Bearer(token) => Some(format!("Bearer {token}")),
            Self::Basic { user, password } => {
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
                Some(format!("Basic {encoded}"))
            }
        }
    }

    /// User name stamped on message headers.
    #[must_use]
    pub fn user_name(&self) -> Option<String> {
        match self {
            Self::Basic { user, .. } => Some(user.clone()),
            Self::None | Self::Bearer(_) => None,
        }
    }
}

impl std::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer(_) => f.write_str("Bearer(***)"),
            Self::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .finish_non_exhaustive(),
        }
    }
}

/// HTTP `CONNECT` proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
}

impl ProxyConfig {
    /// Parse `host:port`.
    ///
    /// # Errors
    ///
    /// Returns error if the value is not `host:port`.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value
            .strip_prefix("http://")
            .unwrap_or(value)
            .trim_end_matches('/');
        let Some((host, port)) = value.rsplit_once(':') else {
            bail!("proxy must be host:port, got '{value}'");
        };
        if host.is_empty() {
            bail!("proxy host is empty");
        }
        let port = port
            .parse()
            .with_context(|| format!("invalid proxy port '{port}'"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Frame encoding for outbound messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameEncoding {
    /// JSON text frames
    #[default]
    Json,
    /// CBOR binary frames
    Cbor,
}

/// Transport settings.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Endpoint URL (`ws://` or `wss://`)
    pub url: String,
    /// Credentials
    pub auth: Authentication,
    /// Optional HTTP proxy
    pub proxy: Option<ProxyConfig>,
    /// Skip certificate verification (test environments only)
    pub accept_all_certificates: bool,
    /// Bound on TCP connect plus WebSocket handshake
    pub connect_timeout: Duration,
    /// Bound on inbound silence before the connection counts as dead
    pub read_timeout: Duration,
    /// Bound on a single frame write
    pub write_timeout: Duration,
    /// Ping interval while connected
    pub heartbeat_interval: Duration,
    /// Backoff step between reconnect attempts
    pub reconnect_interval: Duration,
    /// Backoff ceiling
    pub reconnect_max: Duration,
    /// Outbound queue capacity in frames
    pub outbound_capacity: usize,
    /// Outbound frame encoding
    pub encoding: FrameEncoding,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9090/replica".to_string(),
            auth: Authentication::None,
            proxy: None,
            accept_all_certificates: false,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(10),
            reconnect_max: Duration::from_secs(120),
            outbound_capacity: 1024,
            encoding: FrameEncoding::Json,
        }
    }
}

impl SocketConfig {
    /// Inbound silence after which the connection is treated as half-open.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.read_timeout.max(self.heartbeat_interval * 2)
    }
}

/// Replication settings.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Transport settings
    pub socket: SocketConfig,
    /// Documents per batch page
    pub chunk_size: usize,
    /// Delay between batch pages
    pub debounce: Duration,
    /// Local changes queued for publishing
    pub change_capacity: usize,
    /// Fixed replica id; generated and persisted when absent
    pub replica_id: Option<String>,
    /// Network reachability check
    pub connectivity: ConnectivityChecker,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            chunk_size: 10,
            debounce: Duration::from_secs(1),
            change_capacity: 1024,
            replica_id: None,
            connectivity: ConnectivityChecker::always(),
        }
    }
}

/// Agent binary configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Collection to replicate
    pub collection: String,
    /// SQLite database path
    pub db_path: PathBuf,
    /// Replication settings
    pub replica: ReplicaConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collection: "default".to_string(),
            db_path: PathBuf::from("./replisync.db"),
            replica: ReplicaConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REPLISYNC_REMOTE`: endpoint URL
    /// - `REPLISYNC_COLLECTION`: collection name
    /// - `REPLISYNC_DB_PATH`: SQLite database path
    /// - `REPLISYNC_REPLICA_ID`: fixed replica id
    /// - `REPLISYNC_JWT`: bearer token
    /// - `REPLISYNC_USER` / `REPLISYNC_PASSWORD`: basic credentials
    /// - `REPLISYNC_PROXY`: HTTP proxy `host:port`
    /// - `REPLISYNC_ACCEPT_ALL_CERTS`: `true` to skip TLS verification
    /// - `REPLISYNC_TIMEOUT_MS`: connect/read/write timeout
    /// - `REPLISYNC_CHUNK_SIZE`: documents per batch page
    /// - `REPLISYNC_DEBOUNCE_MS`: delay between batch pages
    /// - `REPLISYNC_CBOR`: `true` to send binary frames
    ///
    /// # Errors
    ///
    /// Returns error if a variable has an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable has an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let replica = &mut config.replica;

        if let Some(remote) = lookup("REPLISYNC_REMOTE") {
            replica.socket.url = remote;
        }

        if let Some(collection) = lookup("REPLISYNC_COLLECTION") {
            config.collection = collection;
        }

        if let Some(db_path) = lookup("REPLISYNC_DB_PATH") {
            config.db_path = PathBuf::from(db_path);
        }

        replica.replica_id = lookup("REPLISYNC_REPLICA_ID");

        if let Some(token) = lookup("REPLISYNC_JWT") {
            replica.socket.auth = Authentication::Bearer(token);
        } else if let Some(user) = lookup("REPLISYNC_USER") {
            let password = lookup("REPLISYNC_PASSWORD")
                .context("REPLISYNC_USER is set but REPLISYNC_PASSWORD is missing")?;
            replica.socket.auth = Authentication::Basic { user, password };
        }

        if let Some(proxy) = lookup("REPLISYNC_PROXY") {
            replica.socket.proxy =
                Some(ProxyConfig::parse(&proxy).context("Invalid REPLISYNC_PROXY")?);
        }

        if let Some(flag) = lookup("REPLISYNC_ACCEPT_ALL_CERTS") {
            replica.socket.accept_all_certificates =
                parse_flag(&flag).context("Invalid REPLISYNC_ACCEPT_ALL_CERTS")?;
        }

        if let Some(ms) = lookup("REPLISYNC_TIMEOUT_MS") {
            let timeout = Duration::from_millis(ms.parse().context("Invalid REPLISYNC_TIMEOUT_MS")?);
            replica.socket.connect_timeout = timeout;
            replica.socket.read_timeout = timeout;
            replica.socket.write_timeout = timeout;
        }

        if let Some(size) = lookup("REPLISYNC_CHUNK_SIZE") {
            replica.chunk_size = size.parse().context("Invalid REPLISYNC_CHUNK_SIZE")?;
            if replica.chunk_size == 0 {
                bail!("REPLISYNC_CHUNK_SIZE must be positive");
            }
        }

        if let Some(ms) = lookup("REPLISYNC_DEBOUNCE_MS") {
            replica.debounce =
                Duration::from_millis(ms.parse().context("Invalid REPLISYNC_DEBOUNCE_MS")?);
        }

        if let Some(flag) = lookup("REPLISYNC_CBOR") {
            if parse_flag(&flag).context("Invalid REPLISYNC_CBOR")? {
                replica.socket.encoding = FrameEncoding::Cbor;
            }
        }

        Ok(config)
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}
