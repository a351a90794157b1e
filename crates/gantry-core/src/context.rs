//! Per-call context.

use crate::metadata::{MetadataMap, MetadataSink};
use http::Extensions;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fully qualified operation name of the current call, e.g.
/// `/gantry.system.v1.IdpService/GetIdp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMethod(String);

impl RpcMethod {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// HTTP path template the call was routed by (not the literal request path)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpPathPattern(String);

impl HttpPathPattern {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Context installed for every call, local or remote
///
/// Carries the cancellation token and deadline of the call, the metadata the
/// caller sent, a sink for metadata produced while handling the call, and an
/// opaque extension map for annotations such as [`RpcMethod`].
#[derive(Clone)]
pub struct CallContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    request_metadata: MetadataMap,
    response_metadata: MetadataSink,
    extensions: Extensions,
}

impl CallContext {
    /// Create a context with a fresh cancellation token and no deadline
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: None,
            request_metadata: MetadataMap::new(),
            response_metadata: MetadataSink::new(),
            extensions: Extensions::new(),
        }
    }

    /// Use `token` for cancellation
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Set an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now; keeps an earlier existing deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn with_request_metadata(mut self, metadata: MetadataMap) -> Self {
        self.request_metadata = metadata;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the call is cancelled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` without a deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Metadata sent by the caller
    pub fn request_metadata(&self) -> &MetadataMap {
        &self.request_metadata
    }

    /// Sink for header and trailer metadata produced while handling the call
    pub fn response_metadata(&self) -> &MetadataSink {
        &self.response_metadata
    }

    /// Record an annotation; replaces any previous annotation of the same type
    pub fn annotate<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.extensions.insert(value);
    }

    /// Look up an annotation by type
    pub fn annotation<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("deadline", &self.deadline)
            .field("request_metadata", &self.request_metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotations_by_type() {
        let mut ctx = CallContext::new();
        ctx.annotate(RpcMethod::new("/a.B/C"));
        ctx.annotate(HttpPathPattern::new("/v1/things/{name}"));

        assert_eq!(ctx.annotation::<RpcMethod>().unwrap().as_str(), "/a.B/C");
        assert_eq!(
            ctx.annotation::<HttpPathPattern>().unwrap().as_str(),
            "/v1/things/{name}"
        );
    }

    #[tokio::test]
    async fn test_timeout_keeps_earliest_deadline() {
        let ctx = CallContext::new()
            .with_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancel_through_shared_token() {
        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(token.child_token());
        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
