//! Writing RPC results as HTTP responses
//!
//! Unary results become a single encoded body. Server streams are written
//! element by element as they are produced, either newline-delimited or as
//! Server-Sent Events.
//!
//! A stream that fails after its first element cannot change the status line
//! any more. The failure is reported in-band instead: a final
//! `{"error": {...}}` element, an `event: error` SSE event, or, when the
//! encoding has no way to express it, an aborted body.

use crate::dispatch::ResponseMetadata;
use crate::error::{MarshalError, StreamInterrupted};
use crate::marshal::{content_type, JsonMarshaler, Marshaler};
use crate::status::error_value;
use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::Stream;
use gantry_core::{CallMetadata, MessageStream, MetadataMap, Status};
use http::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, TE, TRAILER};
use http::StatusCode;
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody};
use prost_reflect::{DynamicMessage, FieldDescriptor, Value};
use serde::Serialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio_util::sync::DropGuard;
use tracing::warn;

/// Default prefix of header metadata written as response headers
pub const DEFAULT_HEADER_PREFIX: &str = "gantry-metadata-";
/// Default prefix of trailer metadata written as response trailers
pub const DEFAULT_TRAILER_PREFIX: &str = "gantry-trailer-";

/// How metadata is written on a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseOptions {
    pub header_prefix: String,
    pub trailer_prefix: String,
    /// The client accepts trailers (`TE: trailers`)
    pub trailers: bool,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            header_prefix: DEFAULT_HEADER_PREFIX.to_string(),
            trailer_prefix: DEFAULT_TRAILER_PREFIX.to_string(),
            trailers: false,
        }
    }
}

impl ResponseOptions {
    /// Trailer fields to send, if the client accepts them and there are any
    pub fn trailers_for(&self, trailers: &MetadataMap) -> Option<HeaderMap> {
        if !self.trailers || trailers.is_empty() {
            return None;
        }
        let mut map = HeaderMap::new();
        trailers.write_headers(&mut map, &self.trailer_prefix);
        (!map.is_empty()).then_some(map)
    }
}

/// Whether the request advertised `TE: trailers`
pub fn accepts_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| t.split(';').next())
        .any(|t| t.trim().eq_ignore_ascii_case("trailers"))
}

/// Announce trailer names in the `Trailer` header
pub(crate) fn trailer_announcement(headers: &mut HeaderMap, trailers: &HeaderMap) {
    let names: Vec<&str> = trailers.keys().map(HeaderName::as_str).collect();
    if let Ok(value) = HeaderValue::from_str(&names.join(", ")) {
        headers.insert(TRAILER, value);
    }
}

/// Complete response with a fixed body
pub(crate) fn respond(
    status: StatusCode,
    content_type: &str,
    body: Bytes,
    metadata: &CallMetadata,
    options: &ResponseOptions,
) -> Response {
    let mut headers = HeaderMap::new();
    metadata.headers.write_headers(&mut headers, &options.header_prefix);
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }

    let body = match options.trailers_for(&metadata.trailers) {
        Some(trailers) => {
            trailer_announcement(&mut headers, &trailers);
            Body::new(Full::new(body).with_trailers(async move { Some(Ok::<_, Infallible>(trailers)) }))
        }
        None => Body::from(body),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// The message written as body: the whole response or one of its fields
pub fn select_response_body(message: &DynamicMessage, field: Option<&FieldDescriptor>) -> DynamicMessage {
    let Some(field) = field else {
        return message.clone();
    };
    match message.get_field(field).as_ref() {
        Value::Message(selected) => selected.clone(),
        _ => message.clone(),
    }
}

/// Write a unary result with status 200
pub fn forward_unary(
    message: &DynamicMessage,
    marshaler: &dyn Marshaler,
    response_body: Option<&FieldDescriptor>,
    metadata: &CallMetadata,
    options: &ResponseOptions,
) -> Result<Response, MarshalError> {
    let body = marshaler.encode(&select_response_body(message, response_body))?;
    Ok(respond(StatusCode::OK, marshaler.content_type(), body, metadata, options))
}

/// SSE event
#[derive(Debug, Clone, Serialize)]
pub struct SseEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl SseEvent {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            event: None,
            data,
            id: None,
        }
    }

    pub fn with_event(mut self, event: &str) -> Self {
        self.event = Some(event.to_string());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Format as SSE text
    pub fn to_sse_string(&self) -> Result<String, serde_json::Error> {
        let mut result = String::new();

        if let Some(ref event) = self.event {
            result.push_str(&format!("event: {}\n", event));
        }

        if let Some(ref id) = self.id {
            result.push_str(&format!("id: {}\n", id));
        }

        // Data must be JSON-serialized on a single line
        result.push_str(&format!("data: {}\n", serde_json::to_string(&self.data)?));

        // Empty line to signal end of event
        result.push('\n');

        Ok(result)
    }
}

/// Encoding of a server-streaming response
#[derive(Debug, Clone)]
pub enum StreamFormat {
    /// One element per chunk, encoded by the marshaler with its delimiter
    Delimited(Arc<dyn Marshaler>),
    /// Server-Sent Events carrying JSON elements
    Sse(JsonMarshaler),
}

impl StreamFormat {
    /// SSE when the client asks for `text/event-stream`, else delimited
    pub fn negotiate(accept: Option<&str>, outbound: Arc<dyn Marshaler>, json: &JsonMarshaler) -> Self {
        let wants_sse = accept.is_some_and(|accept| {
            accept
                .split(',')
                .filter_map(|entry| entry.split(';').next())
                .any(|mime| mime.trim().eq_ignore_ascii_case(content_type::SSE))
        });
        if wants_sse {
            StreamFormat::Sse(json.clone())
        } else {
            StreamFormat::Delimited(outbound)
        }
    }

    pub fn content_type(&self) -> &str {
        match self {
            StreamFormat::Delimited(marshaler) => marshaler.stream_content_type(),
            StreamFormat::Sse(_) => content_type::SSE,
        }
    }

    fn encode(&self, message: &DynamicMessage, seq: usize) -> Result<Bytes, MarshalError> {
        match self {
            StreamFormat::Delimited(marshaler) => marshaler.encode_stream_item(message),
            StreamFormat::Sse(json) => {
                let event = SseEvent::new(json.to_value(message)?).with_id(seq.to_string());
                Ok(Bytes::from(event.to_sse_string()?))
            }
        }
    }

    fn error_marker(&self, status: &Status) -> Result<Bytes, MarshalError> {
        match self {
            StreamFormat::Delimited(marshaler) => {
                let value = serde_json::json!({ "error": error_value(status) });
                let mut marker = marshaler.encode_value(&value)?.to_vec();
                marker.extend_from_slice(marshaler.stream_delimiter());
                Ok(Bytes::from(marker))
            }
            StreamFormat::Sse(_) => {
                let event = SseEvent::new(error_value(status)).with_event("error");
                Ok(Bytes::from(event.to_sse_string()?))
            }
        }
    }
}

enum State {
    Streaming,
    Trailers,
    Done,
}

/// Body of a server-streaming response
struct ForwardStream {
    inner: MessageStream,
    format: StreamFormat,
    response_body: Option<FieldDescriptor>,
    metadata: ResponseMetadata,
    options: ResponseOptions,
    sent: usize,
    state: State,
    _guard: Option<DropGuard>,
}

impl ForwardStream {
    fn fail(&mut self, status: Status) -> Poll<Option<Result<Frame<Bytes>, StreamInterrupted>>> {
        let interrupted = StreamInterrupted {
            sent: self.sent,
            status,
        };
        warn!("{}", interrupted);
        self.state = State::Trailers;
        match self.format.error_marker(&interrupted.status) {
            Ok(marker) => Poll::Ready(Some(Ok(Frame::data(marker)))),
            Err(_) => {
                self.state = State::Done;
                Poll::Ready(Some(Err(interrupted)))
            }
        }
    }
}

impl Stream for ForwardStream {
    type Item = Result<Frame<Bytes>, StreamInterrupted>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.state {
                State::Streaming => match ready!(this.inner.as_mut().poll_next(cx)) {
                    Some(Ok(message)) => {
                        let selected = select_response_body(&message, this.response_body.as_ref());
                        match this.format.encode(&selected, this.sent) {
                            Ok(chunk) => {
                                this.sent += 1;
                                return Poll::Ready(Some(Ok(Frame::data(chunk))));
                            }
                            Err(e) => {
                                return this.fail(Status::internal(format!(
                                    "failed to encode stream element: {}",
                                    e
                                )))
                            }
                        }
                    }
                    Some(Err(status)) => return this.fail(status),
                    None => this.state = State::Trailers,
                },
                State::Trailers => {
                    this.state = State::Done;
                    let trailers = this.metadata.snapshot().trailers;
                    if let Some(trailers) = this.options.trailers_for(&trailers) {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                }
                State::Done => return Poll::Ready(None),
            }
        }
    }
}

/// Write a server stream with status 200
///
/// Header metadata known when the stream starts is written as headers;
/// trailers are sent after the last element when the client accepts them.
/// `guard` is held until the body is dropped.
pub fn forward_stream(
    stream: MessageStream,
    format: StreamFormat,
    response_body: Option<FieldDescriptor>,
    metadata: ResponseMetadata,
    options: ResponseOptions,
    guard: Option<DropGuard>,
) -> Response {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    metadata
        .snapshot()
        .headers
        .write_headers(headers, &options.header_prefix);
    if let Ok(value) = HeaderValue::from_str(format.content_type()) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let body = ForwardStream {
        inner: stream,
        format,
        response_body,
        metadata,
        options,
        sent: 0,
        state: State::Streaming,
        _guard: guard,
    };
    *response.body_mut() = Body::new(StreamBody::new(body));
    response
}
