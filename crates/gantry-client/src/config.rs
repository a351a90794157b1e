//! Remote endpoint and dial configuration

use crate::error::DialError;
use http::uri::{Authority, Scheme, Uri};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// HTTP protocol version used for remote connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpProtocol {
    /// HTTP/1.1, one call per connection at a time
    #[default]
    Http1,
    /// HTTP/2 with prior knowledge
    Http2,
}

/// Address of a remote gateway target, e.g. `http://127.0.0.1:9090`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Endpoint {
    authority: Authority,
}

impl Endpoint {
    /// Parse an endpoint; only the `http` scheme is supported
    pub fn parse(s: &str) -> Result<Self, DialError> {
        let uri: Uri = s
            .parse()
            .map_err(|e| DialError::InvalidEndpoint(format!("{}: {}", s, e)))?;
        if uri.scheme() != Some(&Scheme::HTTP) {
            return Err(DialError::InvalidEndpoint(format!("{}: scheme must be http", s)));
        }
        if !matches!(uri.path(), "" | "/") {
            return Err(DialError::InvalidEndpoint(format!("{}: endpoint cannot have a path", s)));
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| DialError::InvalidEndpoint(format!("{}: missing host", s)))?;
        Ok(Self { authority })
    }

    pub fn host(&self) -> &str {
        self.authority.host()
    }

    /// Port, defaulting to 80
    pub fn port(&self) -> u16 {
        self.authority.port_u16().unwrap_or(80)
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Absolute URI of a path on this endpoint
    pub fn uri(&self, path: &str) -> Result<Uri, http::Error> {
        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path)
            .build()
    }
}

impl FromStr for Endpoint {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = DialError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.authority)
    }
}

/// Connection pool limits
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound of open connections (idle plus checked out)
    pub max_connections: usize,
    /// How long a call waits for a free connection before failing
    pub acquire_timeout_ms: u64,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Options used when dialing a remote endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialOptions {
    /// HTTP protocol version
    pub http_protocol: HttpProtocol,
    /// TCP connect plus handshake timeout
    pub connect_timeout_ms: u64,
    /// Connection pool limits
    pub pool: PoolConfig,
    /// Compress request bodies with zstd
    pub enable_compression: bool,
    /// zstd level used when compression is enabled
    pub compression_level: i32,
    /// HTTP/2 only: enable adaptive flow control window
    pub http2_adaptive_window: bool,
    /// HTTP/2 only: initial stream window size
    pub http2_initial_stream_window_size: Option<u32>,
    /// HTTP/2 only: keep alive ping interval
    pub http2_keep_alive_interval_ms: Option<u64>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            http_protocol: HttpProtocol::Http1,
            connect_timeout_ms: 5_000,
            pool: PoolConfig::default(),
            enable_compression: false,
            compression_level: 3,
            http2_adaptive_window: true,
            http2_initial_stream_window_size: Some(1024 * 1024),
            http2_keep_alive_interval_ms: None,
        }
    }
}

impl DialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Set HTTP protocol version
    pub fn http_protocol(mut self, protocol: HttpProtocol) -> Self {
        self.http_protocol = protocol;
        self
    }

    /// Use HTTP/2 with prior knowledge
    pub fn http2_only(self) -> Self {
        self.http_protocol(HttpProtocol::Http2)
    }

    pub fn connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Set the maximum number of open connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.pool.max_connections = max;
        self
    }

    pub fn acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.pool.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Enable zstd compression of request bodies
    pub fn enable_compression(mut self, enable: bool) -> Self {
        self.enable_compression = enable;
        self
    }

    /// Set the compression level (0-22, default 3)
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn http2_keep_alive_interval_ms(mut self, interval_ms: u64) -> Self {
        self.http2_keep_alive_interval_ms = Some(interval_ms);
        self
    }
}
