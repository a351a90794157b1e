//! Call dispatch: context derivation, interceptors, invocation

use crate::binding::OperationBinding;
use crate::config::GatewayConfig;
use gantry_core::{
    parse_timeout, CallContext, CallMetadata, HttpPathPattern, MessageStream, MetadataMap, MetadataSink, Reply,
    RpcMethod, Status, TIMEOUT_HEADER,
};
use gantry_server::run_until;
use http::header::{HeaderMap, HOST};
use prost_reflect::DynamicMessage;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

/// Runs before every call and may rewrite the context or request
///
/// Returning an error aborts the call with that status.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, ctx: &mut CallContext, request: &mut DynamicMessage) -> Result<(), Status>;
}

impl<F> Interceptor for F
where
    F: Fn(&mut CallContext, &mut DynamicMessage) -> Result<(), Status> + Send + Sync,
{
    fn intercept(&self, ctx: &mut CallContext, request: &mut DynamicMessage) -> Result<(), Status> {
        self(ctx, request)
    }
}

/// Metadata of a call as seen by the response writer
///
/// Handler metadata comes first, transport metadata after it. Reading is
/// deferred so trailers recorded when a stream ends are included.
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    handler: MetadataSink,
    transport: MetadataSink,
}

impl ResponseMetadata {
    pub fn new(handler: MetadataSink, transport: MetadataSink) -> Self {
        Self { handler, transport }
    }

    pub fn snapshot(&self) -> CallMetadata {
        self.handler.snapshot().join(&self.transport.snapshot())
    }
}

/// Successful dispatch
pub struct Outcome {
    pub reply: Reply,
    pub metadata: ResponseMetadata,
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outcome")
            .field("reply", &self.reply)
            .field("metadata", &self.metadata.snapshot())
            .finish()
    }
}

/// Failed dispatch, with whatever metadata was produced before the failure
#[derive(Debug)]
pub struct Failure {
    pub status: Status,
    pub metadata: CallMetadata,
}

/// Invokes bound operations
#[derive(Clone, Default)]
pub struct Dispatcher {
    interceptors: Vec<Arc<dyn Interceptor>>,
    default_timeout: Option<Duration>,
    metadata_prefix: String,
    forward_headers: Vec<String>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("interceptors", &self.interceptors.len())
            .field("default_timeout", &self.default_timeout)
            .field("metadata_prefix", &self.metadata_prefix)
            .field("forward_headers", &self.forward_headers)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            interceptors: Vec::new(),
            default_timeout: config.default_timeout(),
            metadata_prefix: config.header_prefix.to_ascii_lowercase(),
            forward_headers: config
                .forward_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Append an interceptor; interceptors run in registration order
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Request metadata carried by HTTP headers
    ///
    /// Prefixed headers are forwarded with the prefix stripped, configured
    /// headers under their own name, and `Host` as `x-forwarded-host`.
    pub fn incoming_metadata(&self, headers: &HeaderMap) -> MetadataMap {
        let mut metadata = MetadataMap::from_headers(headers, &self.metadata_prefix);
        for name in &self.forward_headers {
            for value in headers.get_all(name.as_str()) {
                if let Ok(value) = value.to_str() {
                    metadata.append(name, value);
                }
            }
        }
        if let Some(host) = headers.get(HOST).and_then(|h| h.to_str().ok()) {
            metadata.append("x-forwarded-host", host);
        }
        metadata
    }

    /// Derive the context of one request
    ///
    /// `token` is cancelled when the request goes away; the context gets a
    /// child of it. The deadline is the earlier of the default timeout and the
    /// `gantry-timeout` header.
    pub fn context(&self, headers: &HeaderMap, token: &CancellationToken) -> Result<CallContext, Status> {
        let mut ctx = CallContext::new()
            .with_cancellation(token.child_token())
            .with_request_metadata(self.incoming_metadata(headers));
        if let Some(timeout) = self.default_timeout {
            ctx = ctx.with_timeout(timeout);
        }
        if let Some(value) = headers.get(TIMEOUT_HEADER) {
            let timeout = value
                .to_str()
                .ok()
                .and_then(parse_timeout)
                .ok_or_else(|| Status::invalid_argument(format!("invalid {} header", TIMEOUT_HEADER)))?;
            ctx = ctx.with_timeout(timeout);
        }
        Ok(ctx)
    }

    /// Invoke `binding` with a bound request
    pub async fn dispatch(
        &self,
        mut ctx: CallContext,
        template: &str,
        binding: &OperationBinding,
        mut request: DynamicMessage,
    ) -> Result<Outcome, Failure> {
        let operation = binding.name();
        ctx.annotate(RpcMethod::new(operation.as_str()));
        ctx.annotate(HttpPathPattern::new(template));

        let handler = ctx.response_metadata().clone();
        for interceptor in &self.interceptors {
            if let Err(status) = interceptor.intercept(&mut ctx, &mut request) {
                debug!("Call to {} rejected by interceptor: {}", operation, status);
                return Err(Failure {
                    status,
                    metadata: handler.snapshot(),
                });
            }
        }

        let transport = MetadataSink::new();
        let token = ctx.cancellation().clone();
        let deadline = ctx.deadline();
        let result = run_until(&token, deadline, binding.invoke(ctx, request, &transport)).await;
        let metadata = ResponseMetadata::new(handler, transport);

        match result {
            Ok(Reply::Unary(message)) => Ok(Outcome {
                reply: Reply::Unary(message),
                metadata,
            }),
            Ok(Reply::Streaming(stream)) => Ok(Outcome {
                reply: Reply::Streaming(Box::pin(GuardedStream::new(stream, token, deadline))),
                metadata,
            }),
            Err(status) => {
                debug!("Call to {} failed: {}", operation, status);
                Err(Failure {
                    status,
                    metadata: metadata.snapshot(),
                })
            }
        }
    }
}

/// Ends a response stream on cancellation or deadline
struct GuardedStream {
    inner: MessageStream,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    deadline: Option<Pin<Box<Sleep>>>,
    done: bool,
}

impl GuardedStream {
    fn new(inner: MessageStream, token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.cancelled_owned()),
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            done: false,
        }
    }
}

impl Stream for GuardedStream {
    type Item = Result<DynamicMessage, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.done = true;
            return Poll::Ready(Some(Err(Status::canceled("call cancelled"))));
        }
        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.done = true;
                return Poll::Ready(Some(Err(Status::deadline_exceeded("deadline exceeded"))));
            }
        }
        let item = this.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = item {
            this.done = true;
        }
        item
    }
}
