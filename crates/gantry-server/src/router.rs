//! HTTP router for RPC methods
//!
//! Routes match the pattern: /{package}.{Service}/{Method}

use crate::contract::ServiceContract;
use crate::middleware::read_request_body;
use bytes::Bytes;
use gantry_core::wire::{parse_rpc_path, rpc_path, CONTENT_TYPE_PROTO, CONTENT_TYPE_STATUS, METADATA_HEADER_PREFIX};
use gantry_core::{
    parse_timeout, CallContext, Frame, MessageStream, MetadataMap, MetadataSink, Reply, RpcMethod, Status,
    TIMEOUT_HEADER,
};
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame as HyperFrame;
use prost_reflect::DynamicMessage;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{Instant, Sleep};
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

/// Body of every response produced by the router
pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// RPC Router
#[derive(Debug, Default)]
pub struct RpcRouter {
    contracts: HashMap<String, ServiceContract>,
}

impl RpcRouter {
    /// Create a new router
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve every method of a contract; replaces a contract of the same service
    pub fn add_contract(&mut self, contract: ServiceContract) {
        self.contracts.insert(contract.name().to_string(), contract);
    }

    /// True when the service is served by this router
    pub fn contains(&self, service: &str) -> bool {
        self.contracts.contains_key(service)
    }

    /// Names of the served services
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }

    /// Route an incoming request
    pub async fn route<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        if req.method() != Method::POST {
            return status_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &Status::unimplemented("only POST is supported for RPC calls"),
            );
        }

        let path = req.uri().path().to_string();
        let Some((service, method)) = parse_rpc_path(&path) else {
            return status_response(
                StatusCode::NOT_FOUND,
                &Status::unimplemented(format!("no method at path {}", path)),
            );
        };
        let Some((contract, descriptor)) = self
            .contracts
            .get(service)
            .and_then(|c| c.method(method).map(|m| (c, m)))
        else {
            return status_response(
                StatusCode::NOT_FOUND,
                &Status::unimplemented(format!("unknown method {}", path)),
            );
        };

        let (parts, body) = req.into_parts();
        let bytes = match read_request_body(&parts.headers, body).await {
            Ok(bytes) => bytes,
            Err(status) => return status_response(StatusCode::BAD_REQUEST, &status),
        };
        let request = match DynamicMessage::decode(descriptor.input(), bytes) {
            Ok(request) => request,
            Err(e) => {
                return status_response(
                    StatusCode::BAD_REQUEST,
                    &Status::invalid_argument(format!("failed to decode request: {}", e)),
                )
            }
        };

        // Dropping the response body (client gone) cancels the call
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();

        let mut ctx = CallContext::new()
            .with_cancellation(token.clone())
            .with_request_metadata(MetadataMap::from_headers(&parts.headers, METADATA_HEADER_PREFIX));
        if let Some(timeout) = parts
            .headers
            .get(TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_timeout)
        {
            ctx = ctx.with_timeout(timeout);
        }
        ctx.annotate(RpcMethod::new(rpc_path(service, method)));

        let deadline = ctx.deadline();
        let sink = ctx.response_metadata().clone();
        debug!("Dispatching {} (deadline: {:?})", path, ctx.remaining());

        let result = run_until(&token, deadline, contract.call(method, ctx, request)).await;
        let messages: MessageStream = match result {
            Ok(Reply::Unary(message)) => Box::pin(tokio_stream::once(Ok(message))),
            Ok(Reply::Streaming(stream)) => stream,
            Err(status) => {
                debug!("{} failed: {}", path, status);
                Box::pin(tokio_stream::once(Err(status)))
            }
        };

        let mut response = Response::new(
            StreamBody::new(FramedReplyStream::new(messages, sink.clone(), deadline, guard)).boxed_unsync(),
        );
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_PROTO));
        sink.headers()
            .write_headers(response.headers_mut(), METADATA_HEADER_PREFIX);
        response
    }
}

/// Await `fut` unless the call is cancelled or its deadline passes first
pub async fn run_until<F, T>(token: &CancellationToken, deadline: Option<Instant>, fut: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    // Cancellation and expiry win over a handler that completes in the same poll
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Status::canceled("call cancelled")),
        _ = expired => Err(Status::deadline_exceeded("deadline exceeded")),
        result = fut => result,
    }
}

/// Response with a JSON status body, used before any frame is written
pub fn status_response(code: StatusCode, status: &Status) -> Response<ResponseBody> {
    let json = status.to_json().unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)).boxed_unsync());
    *response.status_mut() = code;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_STATUS));
    response
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Streaming,
    Ending,
    Done,
}

/// Stream adapter that turns reply messages into wire frames
///
/// Yields one DATA frame per message, an ERROR frame when the reply fails or
/// the deadline passes, and always ends with END_STREAM carrying the trailers
/// recorded in the metadata sink at that point.
pub struct FramedReplyStream {
    inner: MessageStream,
    sink: MetadataSink,
    deadline: Option<Pin<Box<Sleep>>>,
    state: StreamState,
    _guard: DropGuard,
}

impl FramedReplyStream {
    pub fn new(inner: MessageStream, sink: MetadataSink, deadline: Option<Instant>, guard: DropGuard) -> Self {
        Self {
            inner,
            sink,
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            state: StreamState::Streaming,
            _guard: guard,
        }
    }

    fn error_frame(&mut self, status: &Status) -> HyperFrame<Bytes> {
        self.state = StreamState::Ending;
        let json = status.to_json().unwrap_or_else(|_| "{}".to_string());
        HyperFrame::data(Frame::error(Bytes::from(json)).encode())
    }

    fn end_frame(&mut self) -> HyperFrame<Bytes> {
        self.state = StreamState::Done;
        let trailers = serde_json::to_vec(&self.sink.trailers()).unwrap_or_else(|_| b"[]".to_vec());
        HyperFrame::data(Frame::end_stream(Bytes::from(trailers)).encode())
    }
}

impl Stream for FramedReplyStream {
    type Item = Result<HyperFrame<Bytes>, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.state {
            StreamState::Done => return Poll::Ready(None),
            StreamState::Ending => return Poll::Ready(Some(Ok(this.end_frame()))),
            StreamState::Streaming => {}
        }

        if let Some(sleep) = this.deadline.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                let status = Status::deadline_exceeded("deadline exceeded while streaming");
                return Poll::Ready(Some(Ok(this.error_frame(&status))));
            }
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(message))) => {
                let payload = Bytes::from(prost::Message::encode_to_vec(&message));
                Poll::Ready(Some(Ok(HyperFrame::data(Frame::data(payload).encode()))))
            }
            Poll::Ready(Some(Err(status))) => Poll::Ready(Some(Ok(this.error_frame(&status)))),
            Poll::Ready(None) => Poll::Ready(Some(Ok(this.end_frame()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{Code, FrameParser};
    use gantry_proto::system::v1::{Idp, IdpEvent, Metadata, WatchIdpsRequest};
    use gantry_proto::IDP_SERVICE;
    use prost::Message;
    use std::time::Duration;

    fn router() -> RpcRouter {
        let pool = gantry_proto::descriptor_pool().unwrap();
        let contract = ServiceContract::from_pool(&pool, IDP_SERVICE)
            .unwrap()
            .unary_typed("GetIdp", |ctx, req: Idp| async move {
                let name = req.metadata.map(|m| m.name).unwrap_or_default();
                match name.as_str() {
                    "missing" => Err(Status::not_found(format!("idp {} not found", name))),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(Idp::default())
                    }
                    _ => {
                        ctx.response_metadata().append_header("x-served-by", "local");
                        ctx.response_metadata().append_trailer("x-revision", "7");
                        Ok(Idp {
                            kind: "Idp".to_string(),
                            metadata: Some(Metadata {
                                name,
                                ..Default::default()
                            }),
                            ..Default::default()
                        })
                    }
                }
            })
            .unwrap()
            .server_streaming_typed("WatchIdps", |_ctx, req: WatchIdpsRequest| async move {
                let events: Vec<Result<IdpEvent, Status>> = (0..req.max_events)
                    .map(|i| {
                        Ok(IdpEvent {
                            r#type: format!("event-{}", i),
                            idp: None,
                        })
                    })
                    .chain(std::iter::once(Err(Status::unavailable("watch closed"))))
                    .collect();
                Ok(tokio_stream::iter(events))
            })
            .unwrap();

        let mut router = RpcRouter::new();
        router.add_contract(contract);
        router
    }

    fn get_idp(name: &str) -> Request<Full<Bytes>> {
        let body = Idp {
            metadata: Some(Metadata {
                name: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
        .encode_to_vec();
        Request::post(rpc_path(IDP_SERVICE, "GetIdp"))
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }

    async fn frames(response: Response<ResponseBody>) -> Vec<Frame> {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let mut parser = FrameParser::new();
        parser.feed(&bytes);
        let mut frames = Vec::new();
        while let Some(frame) = parser.parse_frame().unwrap() {
            frames.push(frame);
        }
        assert!(parser.is_empty());
        frames
    }

    #[tokio::test]
    async fn test_unary_call() {
        let response = router().route(get_idp("okta1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["gantry-meta-x-served-by"], "local");

        let frames = frames(response).await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].flags.is_data());
        let idp = Idp::decode(frames[0].payload.clone()).unwrap();
        assert_eq!(idp.metadata.unwrap().name, "okta1");

        assert!(frames[1].flags.is_end_stream());
        let trailers: MetadataMap = serde_json::from_slice(&frames[1].payload).unwrap();
        assert_eq!(trailers.get("x-revision"), Some("7"));
    }

    #[tokio::test]
    async fn test_handler_error_is_error_frame() {
        let response = router().route(get_idp("missing")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let frames = frames(response).await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].flags.is_error());
        let status: Status = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(status.code, Code::NotFound);
        assert_eq!(status.message, "idp missing not found");
        assert!(frames[1].flags.is_end_stream());
    }

    #[tokio::test]
    async fn test_streaming_call_then_error() {
        let body = WatchIdpsRequest {
            partner: String::new(),
            max_events: 2,
        }
        .encode_to_vec();
        let request = Request::post(rpc_path(IDP_SERVICE, "WatchIdps"))
            .body(Full::new(Bytes::from(body)))
            .unwrap();

        let frames = frames(router().route(request).await).await;
        let kinds: Vec<_> = frames
            .iter()
            .map(|f| (f.flags.is_data(), f.flags.is_error(), f.flags.is_end_stream()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (true, false, false),
                (true, false, false),
                (false, true, false),
                (false, false, true)
            ]
        );
        let second = IdpEvent::decode(frames[1].payload.clone()).unwrap();
        assert_eq!(second.r#type, "event-1");
    }

    #[tokio::test]
    async fn test_deadline_from_header() {
        let mut request = get_idp("slow");
        request
            .headers_mut()
            .insert(TIMEOUT_HEADER, HeaderValue::from_static("20m"));

        let frames = frames(router().route(request).await).await;
        let status: Status = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(status.code, Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_rejections_before_dispatch() {
        let router = router();

        let get = Request::get(rpc_path(IDP_SERVICE, "GetIdp"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(router.route(get).await.status(), StatusCode::METHOD_NOT_ALLOWED);

        let unknown = Request::post("/nope.Service/Call")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = router.route(unknown).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let status: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.code, Code::Unimplemented);

        let garbage = Request::post(rpc_path(IDP_SERVICE, "GetIdp"))
            .body(Full::new(Bytes::from_static(&[0xFF, 0xFF, 0xFF])))
            .unwrap();
        assert_eq!(router.route(garbage).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), Status> = run_until(&token, None, std::future::pending()).await;
        assert_eq!(result.unwrap_err().code, Code::Canceled);
    }

    #[tokio::test]
    async fn test_run_until_cancelled_beats_ready_handler() {
        let token = CancellationToken::new();
        token.cancel();
        for _ in 0..32 {
            let result = run_until(&token, None, async { Ok::<_, Status>(()) }).await;
            assert_eq!(result.unwrap_err().code, Code::Canceled);
        }
    }

    #[tokio::test]
    async fn test_run_until_expired_beats_ready_handler() {
        let token = CancellationToken::new();
        let deadline = Some(Instant::now() + Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        for _ in 0..32 {
            let result = run_until(&token, deadline, async { Ok::<_, Status>(()) }).await;
            assert_eq!(result.unwrap_err().code, Code::DeadlineExceeded);
        }
    }
}
