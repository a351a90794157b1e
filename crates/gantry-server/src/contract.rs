//! Service contracts: a service descriptor plus one handler per method.
//!
//! Handlers work on [`DynamicMessage`]s described by the contract's
//! descriptors. The `*_typed` registration helpers adapt handlers written
//! against generated prost structs by transcoding through the wire format.

use gantry_core::{CallContext, Reply, Status};
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor, ServiceDescriptor};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};

/// Boxed future returned by handlers
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply, Status>> + Send>>;

/// Type-erased handler of one method
pub type Handler = Arc<dyn Fn(CallContext, DynamicMessage) -> HandlerFuture + Send + Sync>;

/// Contract registration errors
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("Service not found in descriptor pool: {0}")]
    UnknownService(String),

    #[error("Method {method} not found on service {service}")]
    UnknownMethod { service: String, method: String },

    #[error("Method {method} is {actual}, handler registered as {registered}")]
    StreamingMismatch {
        method: String,
        actual: &'static str,
        registered: &'static str,
    },
}

/// Typed service contract served in-process
#[derive(Clone)]
pub struct ServiceContract {
    descriptor: ServiceDescriptor,
    handlers: HashMap<String, Handler>,
}

impl ServiceContract {
    /// Create a contract without handlers
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            handlers: HashMap::new(),
        }
    }

    /// Create a contract for a service looked up by full name
    pub fn from_pool(pool: &DescriptorPool, service: &str) -> Result<Self, ContractError> {
        pool.get_service_by_name(service)
            .map(Self::new)
            .ok_or_else(|| ContractError::UnknownService(service.to_string()))
    }

    /// Service descriptor
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Fully qualified service name
    pub fn name(&self) -> &str {
        self.descriptor.full_name()
    }

    /// Look up a method descriptor by name
    pub fn method(&self, name: &str) -> Option<MethodDescriptor> {
        self.descriptor.methods().find(|m| m.name() == name)
    }

    /// Handler registered for a method
    pub fn handler(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).cloned()
    }

    /// Register a unary handler
    pub fn unary<F, Fut>(self, method: &str, handler: F) -> Result<Self, ContractError>
    where
        F: Fn(CallContext, DynamicMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DynamicMessage, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(method, false, move |ctx, request| {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler(ctx, request).await.map(Reply::Unary) })
        })
    }

    /// Register a server-streaming handler
    pub fn server_streaming<F, Fut, S>(self, method: &str, handler: F) -> Result<Self, ContractError>
    where
        F: Fn(CallContext, DynamicMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<DynamicMessage, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.insert(method, true, move |ctx, request| {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler(ctx, request).await.map(Reply::streaming) })
        })
    }

    /// Register a unary handler written against prost structs
    pub fn unary_typed<Req, Resp, F, Fut>(self, method: &str, handler: F) -> Result<Self, ContractError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let output = self.output_of(method)?;
        let handler = Arc::new(handler);
        self.unary(method, move |ctx, request| {
            let handler = Arc::clone(&handler);
            let output = output.clone();
            async move {
                let request = to_typed::<Req>(&request)?;
                let response = handler(ctx, request).await?;
                to_dynamic(&output, &response)
            }
        })
    }

    /// Register a server-streaming handler written against prost structs
    pub fn server_streaming_typed<Req, Resp, F, Fut, S>(
        self,
        method: &str,
        handler: F,
    ) -> Result<Self, ContractError>
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let output = self.output_of(method)?;
        let handler = Arc::new(handler);
        self.server_streaming(method, move |ctx, request| {
            let handler = Arc::clone(&handler);
            let output = output.clone();
            async move {
                let request = to_typed::<Req>(&request)?;
                let stream = handler(ctx, request).await?;
                Ok(stream.map(move |item| item.and_then(|resp| to_dynamic(&output, &resp))))
            }
        })
    }

    /// Invoke a method of this contract
    ///
    /// Methods without a registered handler answer `Unimplemented`.
    pub async fn call(&self, method: &str, ctx: CallContext, request: DynamicMessage) -> Result<Reply, Status> {
        match self.handlers.get(method) {
            Some(handler) => handler(ctx, request).await,
            None => Err(Status::unimplemented(format!(
                "method {}/{} is not implemented",
                self.name(),
                method
            ))),
        }
    }

    fn output_of(&self, method: &str) -> Result<MessageDescriptor, ContractError> {
        self.method(method)
            .map(|m| m.output())
            .ok_or_else(|| self.unknown_method(method))
    }

    fn unknown_method(&self, method: &str) -> ContractError {
        ContractError::UnknownMethod {
            service: self.name().to_string(),
            method: method.to_string(),
        }
    }

    fn insert<F>(mut self, method: &str, streaming: bool, handler: F) -> Result<Self, ContractError>
    where
        F: Fn(CallContext, DynamicMessage) -> HandlerFuture + Send + Sync + 'static,
    {
        let descriptor = self.method(method).ok_or_else(|| self.unknown_method(method))?;
        if descriptor.is_server_streaming() != streaming || descriptor.is_client_streaming() {
            return Err(ContractError::StreamingMismatch {
                method: descriptor.full_name().to_string(),
                actual: streaming_kind(&descriptor),
                registered: if streaming { "server-streaming" } else { "unary" },
            });
        }
        self.handlers.insert(method.to_string(), Arc::new(handler));
        Ok(self)
    }
}

impl fmt::Debug for ServiceContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.handlers.keys().collect();
        methods.sort();
        f.debug_struct("ServiceContract")
            .field("service", &self.name())
            .field("handlers", &methods)
            .finish()
    }
}

fn streaming_kind(method: &MethodDescriptor) -> &'static str {
    match (method.is_client_streaming(), method.is_server_streaming()) {
        (false, false) => "unary",
        (false, true) => "server-streaming",
        (true, false) => "client-streaming",
        (true, true) => "bidirectional",
    }
}

// Dynamic -> bytes -> concrete keeps the adapters free of reflection on the
// concrete types.
fn to_typed<T: prost::Message + Default>(message: &DynamicMessage) -> Result<T, Status> {
    let bytes = prost::Message::encode_to_vec(message);
    T::decode(bytes.as_slice())
        .map_err(|e| Status::invalid_argument(format!("failed to decode request: {}", e)))
}

fn to_dynamic<T: prost::Message>(descriptor: &MessageDescriptor, message: &T) -> Result<DynamicMessage, Status> {
    DynamicMessage::decode(descriptor.clone(), message.encode_to_vec().as_slice())
        .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_proto::system::v1::{Idp, IdpEvent, Metadata, WatchIdpsRequest};
    use gantry_proto::IDP_SERVICE;

    fn contract() -> ServiceContract {
        let pool = gantry_proto::descriptor_pool().unwrap();
        ServiceContract::from_pool(&pool, IDP_SERVICE).unwrap()
    }

    fn get_request(contract: &ServiceContract, name: &str) -> DynamicMessage {
        let idp = Idp {
            metadata: Some(Metadata {
                name: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        to_dynamic(&contract.method("GetIdp").unwrap().input(), &idp).unwrap()
    }

    #[tokio::test]
    async fn test_typed_unary_handler() {
        let contract = contract()
            .unary_typed("GetIdp", |_ctx, req: Idp| async move {
                let mut idp = req;
                idp.kind = "Idp".to_string();
                Ok(idp)
            })
            .unwrap();

        let request = get_request(&contract, "okta1");
        let reply = contract.call("GetIdp", CallContext::new(), request).await.unwrap();
        let Reply::Unary(message) = reply else {
            panic!("expected unary reply");
        };
        let idp: Idp = to_typed(&message).unwrap();
        assert_eq!(idp.kind, "Idp");
        assert_eq!(idp.metadata.unwrap().name, "okta1");
    }

    #[tokio::test]
    async fn test_typed_streaming_handler() {
        let contract = contract()
            .server_streaming_typed("WatchIdps", |_ctx, req: WatchIdpsRequest| async move {
                let events = (0..req.max_events).map(|i| {
                    Ok(IdpEvent {
                        r#type: format!("event-{}", i),
                        idp: None,
                    })
                });
                Ok(tokio_stream::iter(events.collect::<Vec<_>>()))
            })
            .unwrap();

        let method = contract.method("WatchIdps").unwrap();
        let request = to_dynamic(
            &method.input(),
            &WatchIdpsRequest {
                partner: String::new(),
                max_events: 3,
            },
        )
        .unwrap();

        let Reply::Streaming(stream) = contract.call("WatchIdps", CallContext::new(), request).await.unwrap() else {
            panic!("expected streaming reply");
        };
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        let last: IdpEvent = to_typed(items[2].as_ref().unwrap()).unwrap();
        assert_eq!(last.r#type, "event-2");
    }

    #[tokio::test]
    async fn test_missing_handler_is_unimplemented() {
        let contract = contract();
        let request = get_request(&contract, "x");
        let err = contract.call("GetIdp", CallContext::new(), request).await.unwrap_err();
        assert_eq!(err.code, gantry_core::Code::Unimplemented);
    }

    #[test]
    fn test_streaming_mismatch_rejected() {
        let result = contract().unary("WatchIdps", |_ctx, req| async move { Ok(req) });
        assert!(matches!(result, Err(ContractError::StreamingMismatch { .. })));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let result = contract().unary("Nope", |_ctx, req| async move { Ok(req) });
        assert!(matches!(result, Err(ContractError::UnknownMethod { .. })));
    }
}
