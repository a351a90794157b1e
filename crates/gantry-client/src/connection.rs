//! HTTP connections to a remote endpoint

use crate::config::{DialOptions, Endpoint, HttpProtocol};
use crate::error::DialError;
use crate::pool::Dialer;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

enum Sender {
    Http1(http1::SendRequest<Full<Bytes>>),
    Http2(http2::SendRequest<Full<Bytes>>),
}

/// One HTTP connection, carrying one call at a time
pub struct HttpConnection {
    sender: Sender,
}

impl HttpConnection {
    pub fn protocol(&self) -> HttpProtocol {
        match self.sender {
            Sender::Http1(_) => HttpProtocol::Http1,
            Sender::Http2(_) => HttpProtocol::Http2,
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.sender {
            Sender::Http1(s) => s.is_closed(),
            Sender::Http2(s) => s.is_closed(),
        }
    }

    /// Send a request once the connection is ready for it
    pub async fn send(&mut self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, hyper::Error> {
        match &mut self.sender {
            Sender::Http1(s) => {
                s.ready().await?;
                s.send_request(req).await
            }
            Sender::Http2(s) => {
                s.ready().await?;
                s.send_request(req).await
            }
        }
    }
}

/// Dials TCP connections and runs the HTTP handshake
#[derive(Debug, Clone)]
pub struct HttpDialer {
    endpoint: Endpoint,
    options: DialOptions,
}

impl HttpDialer {
    pub fn new(endpoint: Endpoint, options: DialOptions) -> Self {
        Self { endpoint, options }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &DialOptions {
        &self.options
    }

    async fn connect(&self) -> Result<HttpConnection, DialError> {
        let endpoint = self.endpoint.to_string();
        let stream = TcpStream::connect((self.endpoint.host(), self.endpoint.port()))
            .await
            .map_err(|source| DialError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on connection to {}: {}", endpoint, e);
        }
        let io = TokioIo::new(stream);

        let sender = match self.options.http_protocol {
            HttpProtocol::Http1 => {
                let (sender, conn) = http1::handshake(io)
                    .await
                    .map_err(|source| DialError::Handshake {
                        endpoint: endpoint.clone(),
                        source,
                    })?;
                tokio::spawn(async move {
                    if let Err(err) = conn.await {
                        debug!("HTTP/1 connection closed with error: {}", err);
                    }
                });
                Sender::Http1(sender)
            }
            HttpProtocol::Http2 => {
                let mut builder = http2::Builder::new(TokioExecutor::new());
                builder
                    .timer(TokioTimer::new())
                    .adaptive_window(self.options.http2_adaptive_window);
                if let Some(size) = self.options.http2_initial_stream_window_size {
                    builder.initial_stream_window_size(size);
                }
                if let Some(interval) = self.options.http2_keep_alive_interval_ms {
                    builder.keep_alive_interval(Duration::from_millis(interval));
                }
                let (sender, conn) = builder
                    .handshake(io)
                    .await
                    .map_err(|source| DialError::Handshake {
                        endpoint: endpoint.clone(),
                        source,
                    })?;
                tokio::spawn(async move {
                    if let Err(err) = conn.await {
                        debug!("HTTP/2 connection closed with error: {}", err);
                    }
                });
                Sender::Http2(sender)
            }
        };

        debug!("Connected to {} over {:?}", endpoint, self.options.http_protocol);
        Ok(HttpConnection { sender })
    }
}

impl Dialer for HttpDialer {
    type Connection = HttpConnection;

    async fn dial(&self) -> Result<HttpConnection, DialError> {
        tokio::time::timeout(self.options.connect_timeout(), self.connect())
            .await
            .map_err(|_| DialError::Timeout(self.endpoint.to_string()))?
    }

    fn is_reusable(&self, conn: &HttpConnection) -> bool {
        !conn.is_closed()
    }
}
