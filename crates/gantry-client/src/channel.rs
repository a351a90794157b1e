//! Channel to a remote gateway target

use crate::config::{DialOptions, Endpoint, HttpProtocol};
use crate::connection::HttpDialer;
use crate::error::{DialError, PoolError};
use crate::pool::{Pool, PoolStatus, Pooled};
use bytes::Bytes;
use gantry_core::wire::{rpc_path, CONTENT_TYPE_PROTO, METADATA_HEADER_PREFIX};
use gantry_core::{
    encode_timeout, CallContext, Code, FrameParser, MessageStream, MetadataMap, MetadataSink, Status,
    TIMEOUT_HEADER,
};
use http::{header, Method, Request, StatusCode};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, instrument, warn};

/// Pooled handle to a remote gateway target
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct Channel {
    pool: Pool<HttpDialer>,
}

impl Channel {
    /// Create a channel and open its first connection
    ///
    /// Fails when the endpoint cannot be reached.
    pub async fn dial(endpoint: Endpoint, options: DialOptions) -> Result<Self, DialError> {
        let channel = Self::lazy(endpoint, options);
        let conn = channel
            .pool
            .acquire()
            .await
            .map_err(|e| match e {
                PoolError::Dial(e) => e,
                other => DialError::Timeout(format!("{}: {}", channel.endpoint(), other)),
            })?;
        drop(conn);
        debug!("Channel to {} ready", channel.endpoint());
        Ok(channel)
    }

    /// Create a channel that connects on first use
    pub fn lazy(endpoint: Endpoint, options: DialOptions) -> Self {
        let pool_config = options.pool.clone();
        Self {
            pool: Pool::new(HttpDialer::new(endpoint, options), pool_config),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.pool.dialer().endpoint()
    }

    pub fn options(&self) -> &DialOptions {
        self.pool.dialer().options()
    }

    /// Close the channel; in-flight calls finish, new calls fail with `Unavailable`
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Make a unary call
    ///
    /// Response header and trailer metadata are appended to `metadata_out` as
    /// they arrive, whether the call succeeds or fails.
    #[instrument(
        skip(self, ctx, method, request, metadata_out),
        fields(
            rpc.service = method.parent_service().full_name(),
            rpc.method = method.name(),
            rpc.system = "gantry",
            peer = %self.endpoint()
        )
    )]
    pub async fn unary(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        request: &DynamicMessage,
        metadata_out: &MetadataSink,
    ) -> Result<DynamicMessage, Status> {
        let mut frames = self.start(ctx, method, request, metadata_out).await?;

        let message = match frames.next().await {
            Some(Ok(message)) => message,
            Some(Err(status)) => {
                frames.drain().await;
                return Err(status);
            }
            None => return Err(Status::internal("unary call returned no message")),
        };
        match frames.next().await {
            None => Ok(message),
            Some(Ok(_)) => Err(Status::internal("unary call returned more than one message")),
            Some(Err(status)) => {
                frames.drain().await;
                Err(status)
            }
        }
    }

    /// Make a server-streaming call
    ///
    /// Header metadata is appended to `metadata_out` before this returns,
    /// trailer metadata once the stream has ended. The pooled connection is
    /// held until the stream ends or is dropped.
    #[instrument(
        skip(self, ctx, method, request, metadata_out),
        fields(
            rpc.service = method.parent_service().full_name(),
            rpc.method = method.name(),
            rpc.system = "gantry",
            rpc.streaming = "server",
            peer = %self.endpoint()
        )
    )]
    pub async fn server_streaming(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        request: &DynamicMessage,
        metadata_out: &MetadataSink,
    ) -> Result<MessageStream, Status> {
        let frames = self.start(ctx, method, request, metadata_out).await?;
        Ok(Box::pin(frames))
    }

    async fn start(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        request: &DynamicMessage,
        metadata_out: &MetadataSink,
    ) -> Result<ResponseFrameStream, Status> {
        let req = self.build_request(ctx, method, request)?;

        let mut conn = self.pool.acquire().await.map_err(|e| {
            warn!("No connection to {}: {}", self.endpoint(), e);
            Status::from(e)
        })?;
        conn.begin();
        let response = conn
            .send(req)
            .await
            .map_err(|e| Status::unavailable(format!("failed to send request: {}", e)))?;

        metadata_out.extend_headers(&MetadataMap::from_headers(response.headers(), METADATA_HEADER_PREFIX));

        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Status::unavailable(format!("failed to read error response: {}", e)))?
                .to_bytes();
            conn.finish();
            return Err(parse_error_body(status, &body));
        }

        Ok(ResponseFrameStream::new(
            response.into_body(),
            conn,
            method.output(),
            metadata_out.clone(),
        ))
    }

    fn build_request(
        &self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        request: &DynamicMessage,
    ) -> Result<Request<Full<Bytes>>, Status> {
        let path = rpc_path(method.parent_service().full_name(), method.name());
        let mut body = Bytes::from(prost::Message::encode_to_vec(request));

        let options = self.options();
        let mut builder = Request::builder()
            .method(Method::POST)
            .header(header::CONTENT_TYPE, CONTENT_TYPE_PROTO);
        builder = match options.http_protocol {
            HttpProtocol::Http1 => builder
                .uri(path.as_str())
                .header(header::HOST, self.endpoint().authority().as_str()),
            HttpProtocol::Http2 => builder.uri(
                self.endpoint()
                    .uri(&path)
                    .map_err(|e| Status::internal(format!("invalid request uri: {}", e)))?,
            ),
        };

        if options.enable_compression {
            body = zstd::encode_all(&body[..], options.compression_level)
                .map(Bytes::from)
                .map_err(|e| Status::internal(format!("compression failed: {}", e)))?;
            builder = builder.header(header::CONTENT_ENCODING, "zstd");
        }
        if let Some(remaining) = ctx.remaining() {
            builder = builder.header(TIMEOUT_HEADER, encode_timeout(remaining));
        }

        let mut req = builder
            .body(Full::new(body))
            .map_err(|e| Status::internal(format!("failed to build request: {}", e)))?;
        ctx.request_metadata()
            .write_headers(req.headers_mut(), METADATA_HEADER_PREFIX);
        Ok(req)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.endpoint().to_string())
            .field("status", &self.status())
            .finish()
    }
}

/// Map a non-2xx response to a status; the body is a JSON status when the
/// remote produced it
fn parse_error_body(http_status: StatusCode, body: &[u8]) -> Status {
    if let Ok(status) = serde_json::from_slice::<Status>(body) {
        return status;
    }
    let code = match http_status {
        StatusCode::BAD_REQUEST => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        _ => Code::Unknown,
    };
    Status::new(
        code,
        format!(
            "remote call failed with HTTP {}: {}",
            http_status,
            String::from_utf8_lossy(body)
        ),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Frames,
    Draining,
    Done,
}

/// Stream adapter that parses frames from the HTTP response body
///
/// Yields one message per DATA frame. A status carried by an ERROR frame is
/// yielded after the END_STREAM frame has been read, so trailers are recorded
/// first. The pooled connection goes back to the pool once the body has been
/// read to the end, and is discarded if the stream is dropped earlier.
struct ResponseFrameStream {
    body: Incoming,
    parser: FrameParser,
    conn: Option<Pooled<HttpDialer>>,
    descriptor: MessageDescriptor,
    metadata: MetadataSink,
    failed: Option<Status>,
    state: ReadState,
}

impl ResponseFrameStream {
    fn new(body: Incoming, conn: Pooled<HttpDialer>, descriptor: MessageDescriptor, metadata: MetadataSink) -> Self {
        Self {
            body,
            parser: FrameParser::new(),
            conn: Some(conn),
            descriptor,
            metadata,
            failed: None,
            state: ReadState::Frames,
        }
    }

    /// Consume the rest of the stream so trailers are recorded
    async fn drain(&mut self) {
        while self.next().await.is_some() {}
    }

    fn finish(&mut self) -> Option<Result<DynamicMessage, Status>> {
        self.state = ReadState::Done;
        if let Some(mut conn) = self.conn.take() {
            conn.finish();
        }
        self.failed.take().map(Err)
    }

    fn abort(&mut self, status: Status) -> Option<Result<DynamicMessage, Status>> {
        warn!("Remote stream interrupted: {}", status);
        self.state = ReadState::Done;
        // Dropped while in flight, so never reused
        self.conn.take();
        Some(Err(status))
    }
}

impl Stream for ResponseFrameStream {
    type Item = Result<DynamicMessage, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.state {
                ReadState::Done => return Poll::Ready(None),
                ReadState::Draining => {}
                ReadState::Frames => match self.parser.parse_frame() {
                    Ok(Some(frame)) if frame.flags.is_end_stream() => {
                        match serde_json::from_slice::<MetadataMap>(&frame.payload) {
                            Ok(trailers) => self.metadata.extend_trailers(&trailers),
                            Err(e) => debug!("Ignoring malformed trailers: {}", e),
                        }
                        self.state = ReadState::Draining;
                        continue;
                    }
                    Ok(Some(frame)) if frame.flags.is_error() => {
                        let status = serde_json::from_slice::<Status>(&frame.payload).unwrap_or_else(|e| {
                            Status::internal(format!("malformed error frame: {}", e))
                        });
                        self.failed = Some(status);
                        continue;
                    }
                    Ok(Some(frame)) if frame.flags.is_data() => {
                        if self.failed.is_some() {
                            continue;
                        }
                        return match DynamicMessage::decode(self.descriptor.clone(), frame.payload) {
                            Ok(message) => Poll::Ready(Some(Ok(message))),
                            Err(e) => {
                                Poll::Ready(self.abort(Status::internal(format!("failed to decode response: {}", e))))
                            }
                        };
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => return Poll::Ready(self.abort(Status::internal(e.to_string()))),
                },
            }

            match Pin::new(&mut self.body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        if self.state == ReadState::Frames {
                            self.parser.feed(&data);
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(self.abort(Status::unavailable(format!("connection error: {}", e))));
                }
                Poll::Ready(None) if self.state == ReadState::Draining => return Poll::Ready(self.finish()),
                Poll::Ready(None) => {
                    return Poll::Ready(self.abort(Status::internal("stream ended before END_STREAM")));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
