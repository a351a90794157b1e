//! Route registry and HTTP request handling

use crate::binder::{bind_path_params, bind_query, QueryFilter};
use crate::binding::OperationBinding;
use crate::config::GatewayConfig;
use crate::dispatch::{Dispatcher, Failure, Interceptor, Outcome};
use crate::error::{DecodeError, GatewayError, RegistrationError};
use crate::forward::{accepts_trailers, forward_stream, forward_unary, ResponseOptions, StreamFormat};
use crate::marshal::{JsonMarshaler, Marshaler, MarshalerRegistry};
use crate::pattern::{Captures, PathPattern, Shape};
use crate::rule::{http_rules, RouteSpec};
use crate::status::error_response;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use gantry_client::Channel;
use gantry_core::{CallMetadata, Reply, Status};
use gantry_server::ServiceContract;
use http::header::{HeaderMap, HeaderName, ACCEPT, CONTENT_TYPE};
use http::Method;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, ServiceDescriptor, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the request body goes
#[derive(Debug, Clone)]
enum BodySelector {
    /// Requests carry no body
    None,
    /// The body is the whole request message
    Whole,
    /// The body is one top-level message field
    Field {
        field: FieldDescriptor,
        message: MessageDescriptor,
    },
}

/// Compiled route
#[derive(Debug)]
pub struct Route {
    method: Method,
    pattern: PathPattern,
    binding: OperationBinding,
    body: BodySelector,
    response_body: Option<FieldDescriptor>,
    query: QueryFilter,
    bound: Vec<String>,
}

impl Route {
    fn compile(spec: RouteSpec, binding: OperationBinding) -> Result<Self, RegistrationError> {
        let method = binding.method().clone();
        let operation = binding.name();
        if method.is_client_streaming() {
            return Err(RegistrationError::UnsupportedStreaming(operation));
        }

        let pattern = PathPattern::compile(&spec.template).map_err(|source| RegistrationError::Pattern {
            template: spec.template.clone(),
            source,
        })?;
        let input = method.input();
        let mut bound = Vec::new();
        for capture in pattern.capture_names() {
            check_field_path(&operation, &input, capture)?;
            bound.push(capture.to_string());
        }

        let body = match spec.body.as_deref() {
            None => BodySelector::None,
            Some("*") => BodySelector::Whole,
            Some(name) => {
                let field = message_field(&operation, &input, name, "body")?;
                bound.push(field.name().to_string());
                match field.kind() {
                    Kind::Message(message) => BodySelector::Field { field, message },
                    _ => {
                        return Err(RegistrationError::InvalidSelector {
                            operation,
                            field: name.to_string(),
                            role: "body",
                        })
                    }
                }
            }
        };
        let response_body = spec
            .response_body
            .as_deref()
            .map(|name| message_field(&operation, &method.output(), name, "response body"))
            .transpose()?;

        Ok(Self {
            method: spec.method,
            pattern,
            binding,
            body,
            response_body,
            query: spec.query,
            bound,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        self.pattern.template()
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn binding(&self) -> &OperationBinding {
        &self.binding
    }

    /// `/package.Service/Method` of the bound operation
    pub fn operation(&self) -> String {
        self.binding.name()
    }
}

/// Field by proto name, then JSON name
fn find_field(message: &MessageDescriptor, name: &str) -> Option<FieldDescriptor> {
    message
        .get_field_by_name(name)
        .or_else(|| message.get_field_by_json_name(name))
}

/// Every segment of a dotted capture path names a field, and all but the
/// last name singular message fields
fn check_field_path(operation: &str, input: &MessageDescriptor, path: &str) -> Result<(), RegistrationError> {
    let mut message = input.clone();
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let field = find_field(&message, segment).ok_or_else(|| RegistrationError::UnknownField {
            operation: operation.to_string(),
            field: path.to_string(),
            message: message.full_name().to_string(),
        })?;
        if segments.peek().is_none() {
            break;
        }
        message = match field.kind() {
            Kind::Message(next) if !field.is_list() && !field.is_map() => next,
            _ => {
                return Err(RegistrationError::InvalidSelector {
                    operation: operation.to_string(),
                    field: path.to_string(),
                    role: "path capture",
                })
            }
        };
    }
    Ok(())
}

/// Top-level singular message field used as a body selector
fn message_field(
    operation: &str,
    message: &MessageDescriptor,
    name: &str,
    role: &'static str,
) -> Result<FieldDescriptor, RegistrationError> {
    let field = find_field(message, name).ok_or_else(|| RegistrationError::UnknownField {
        operation: operation.to_string(),
        field: name.to_string(),
        message: message.full_name().to_string(),
    })?;
    if field.is_list() || field.is_map() || !matches!(field.kind(), Kind::Message(_)) {
        return Err(RegistrationError::InvalidSelector {
            operation: operation.to_string(),
            field: name.to_string(),
            role,
        });
    }
    Ok(field)
}

/// Routes keyed by HTTP method, in registration order
///
/// Routes ending in a `:verb` are tried first, then the first matching
/// route in registration order wins.
#[derive(Debug, Default)]
pub struct RouteTable {
    by_method: HashMap<Method, Vec<Arc<Route>>>,
    shapes: HashMap<(Method, Shape), String>,
    order: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Add a route; two routes of one method with the same shape collide
    pub fn insert(&mut self, route: Route) -> Result<(), RegistrationError> {
        let key = (route.method.clone(), route.pattern.shape());
        if let Some(existing) = self.shapes.get(&key) {
            return Err(RegistrationError::Collision {
                method: route.method.clone(),
                template: route.template().to_string(),
                existing: existing.clone(),
            });
        }
        self.shapes.insert(key, route.template().to_string());

        let route = Arc::new(route);
        self.by_method
            .entry(route.method.clone())
            .or_default()
            .push(Arc::clone(&route));
        self.order.push(route);
        Ok(())
    }

    /// Find the route of a request
    ///
    /// A path served only under other methods is `MethodNotAllowed`.
    pub fn lookup(&self, method: &Method, path: &str) -> Result<(&Arc<Route>, Captures), GatewayError> {
        if let Some(routes) = self.by_method.get(method) {
            // A verb-less capture would otherwise swallow the `:verb` suffix
            let verbs = routes.iter().filter(|route| route.pattern.verb().is_some());
            let plain = routes.iter().filter(|route| route.pattern.verb().is_none());
            for route in verbs.chain(plain) {
                if let Some(captures) = route.pattern.matches(path) {
                    return Ok((route, captures));
                }
            }
        }

        let other_method = self
            .order
            .iter()
            .any(|route| route.method != *method && route.pattern.matches(path).is_some());
        if other_method {
            Err(GatewayError::MethodNotAllowed {
                method: method.clone(),
                path: path.to_string(),
            })
        } else {
            Err(GatewayError::NoRoute(path.to_string()))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.order.iter().map(AsRef::as_ref)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

enum Source {
    Contract(ServiceContract),
    Remote(Channel, ServiceDescriptor),
    Route(RouteSpec, OperationBinding),
}

/// Builder for a [`Gateway`]
///
/// Registration is checked by [`GatewayBuilder::build`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    marshalers: Option<MarshalerRegistry>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    sources: Vec<Source>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            marshalers: None,
            interceptors: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Route every annotated method of a local contract
    pub fn register_contract(mut self, contract: ServiceContract) -> Self {
        self.sources.push(Source::Contract(contract));
        self
    }

    /// Route every annotated method of a service served behind `channel`
    pub fn register_remote(mut self, channel: Channel, service: ServiceDescriptor) -> Self {
        self.sources.push(Source::Remote(channel, service));
        self
    }

    /// Add an explicit route
    pub fn route(mut self, spec: RouteSpec, binding: OperationBinding) -> Self {
        self.sources.push(Source::Route(spec, binding));
        self
    }

    /// Replace the marshalers built from the JSON options of the config
    pub fn marshalers(mut self, marshalers: MarshalerRegistry) -> Self {
        self.marshalers = Some(marshalers);
        self
    }

    /// Append an interceptor; interceptors run in registration order
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Compile and check every route
    pub fn build(self) -> Result<Gateway, RegistrationError> {
        let mut table = RouteTable::default();
        for source in self.sources {
            match source {
                Source::Contract(contract) => {
                    for method in contract.descriptor().methods() {
                        for spec in http_rules(&method)? {
                            let binding = OperationBinding::Local {
                                contract: contract.clone(),
                                method: method.clone(),
                            };
                            table.insert(Route::compile(spec, binding)?)?;
                        }
                    }
                }
                Source::Remote(channel, service) => {
                    for method in service.methods() {
                        for spec in http_rules(&method)? {
                            let binding = OperationBinding::remote(channel.clone(), method.clone());
                            table.insert(Route::compile(spec, binding)?)?;
                        }
                    }
                }
                Source::Route(spec, binding) => table.insert(Route::compile(spec, binding)?)?,
            }
        }

        for route in table.iter() {
            debug!(
                "Route {} {} -> {}{}",
                route.method(),
                route.template(),
                route.operation(),
                if route.binding().is_remote() { " (remote)" } else { "" }
            );
        }
        info!("Gateway built with {} routes", table.len());

        let dispatcher = self
            .interceptors
            .into_iter()
            .fold(Dispatcher::new(&self.config), Dispatcher::with_interceptor);
        let marshalers = self
            .marshalers
            .unwrap_or_else(|| MarshalerRegistry::new(self.config.json.clone()));
        let json = JsonMarshaler::new(self.config.json.clone());

        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                table,
                dispatcher,
                marshalers,
                json,
                config: self.config,
            }),
        })
    }
}

/// HTTP front of local and remote operations
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    table: RouteTable,
    dispatcher: Dispatcher,
    marshalers: MarshalerRegistry,
    json: JsonMarshaler,
    config: GatewayConfig,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Registered routes, in registration order
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.inner.table.iter()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Axum router serving every route
    pub fn into_router(self) -> Router {
        Router::new().fallback(handle).with_state(self.inner)
    }

    /// Serve requests accepted by `listener`
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Gantry gateway listening on {}", listener.local_addr()?);
        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Gantry gateway stopped");
        Ok(())
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle(State(gateway): State<Arc<GatewayInner>>, request: Request) -> Response {
    gateway.handle(request).await
}

impl GatewayInner {
    async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let accept = header_str(&parts.headers, ACCEPT);
        let (inbound, outbound) = self
            .marshalers
            .for_request(header_str(&parts.headers, CONTENT_TYPE), accept);
        let options = ResponseOptions {
            header_prefix: self.config.header_prefix.clone(),
            trailer_prefix: self.config.trailer_prefix.clone(),
            trailers: accepts_trailers(&parts.headers),
        };
        let path = parts.uri.path();
        debug!("{} {}", parts.method, path);

        let (route, captures) = match self.table.lookup(&parts.method, path) {
            Ok(found) => found,
            Err(err) => return self.error(err, &CallMetadata::new(), outbound.as_ref(), &options),
        };

        // Dropping this future cancels the call
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let ctx = match self.dispatcher.context(&parts.headers, &token) {
            Ok(ctx) => ctx,
            Err(status) => return self.error(status.into(), &CallMetadata::new(), outbound.as_ref(), &options),
        };

        let request = match self
            .bind(route, &captures, parts.uri.query(), body, inbound.as_ref())
            .await
        {
            Ok(request) => request,
            Err(err) => return self.error(err, &CallMetadata::new(), outbound.as_ref(), &options),
        };

        match self
            .dispatcher
            .dispatch(ctx, route.template(), &route.binding, request)
            .await
        {
            Ok(Outcome {
                reply: Reply::Unary(message),
                metadata,
            }) => {
                let metadata = metadata.snapshot();
                match forward_unary(
                    &message,
                    outbound.as_ref(),
                    route.response_body.as_ref(),
                    &metadata,
                    &options,
                ) {
                    Ok(response) => response,
                    Err(err) => {
                        warn!("Failed to encode response of {}: {}", route.operation(), err);
                        let status = Status::internal(err.to_string());
                        self.error(status.into(), &metadata, outbound.as_ref(), &options)
                    }
                }
            }
            Ok(Outcome {
                reply: Reply::Streaming(stream),
                metadata,
            }) => {
                let format = StreamFormat::negotiate(accept, outbound, &self.json);
                forward_stream(
                    stream,
                    format,
                    route.response_body.clone(),
                    metadata,
                    options,
                    Some(guard),
                )
            }
            Err(Failure { status, metadata }) => {
                self.error(status.into(), &metadata, outbound.as_ref(), &options)
            }
        }
    }

    /// Build the request message from the path, query and body
    ///
    /// Path captures are bound last so they win over the body.
    async fn bind(
        &self,
        route: &Route,
        captures: &Captures,
        query: Option<&str>,
        body: Body,
        inbound: &dyn Marshaler,
    ) -> Result<DynamicMessage, GatewayError> {
        let input = route.binding.method().input();
        let body = match route.body {
            BodySelector::None => Bytes::new(),
            BodySelector::Whole | BodySelector::Field { .. } => self.read_body(body).await?,
        };
        let mut request = match &route.body {
            BodySelector::Whole => inbound.decode(&body, &input)?,
            BodySelector::None | BodySelector::Field { .. } => DynamicMessage::new(input),
        };

        if !matches!(route.body, BodySelector::Whole) {
            if let Some(query) = query {
                bind_query(&mut request, query, &route.query, &route.bound)?;
            }
        }
        if let BodySelector::Field { field, message } = &route.body {
            let decoded = inbound.decode(&body, message)?;
            request.set_field(field, Value::Message(decoded));
        }
        bind_path_params(&mut request, captures)?;
        Ok(request)
    }

    async fn read_body(&self, body: Body) -> Result<Bytes, DecodeError> {
        axum::body::to_bytes(body, self.config.max_body_bytes)
            .await
            .map_err(|e| DecodeError::Read(e.to_string()))
    }

    fn error(
        &self,
        err: GatewayError,
        metadata: &CallMetadata,
        outbound: &dyn Marshaler,
        options: &ResponseOptions,
    ) -> Response {
        let http = err.status_code(self.config.canceled_status);
        debug!("Responding {}: {}", http, err);
        error_response(http, &err.to_status(), outbound, &self.json, metadata, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::content_type;
    use gantry_client::{DialOptions, Endpoint};
    use gantry_core::{CallContext, Code};
    use gantry_proto::system::v1::{Idp, IdpEvent, IdpList, IdpSpec, ListIdpsRequest, ListMetadata, Metadata, WatchIdpsRequest};
    use gantry_proto::IDP_SERVICE;
    use gantry_server::GantryServer;
    use http::StatusCode;
    use http_body_util::BodyExt;
    use prost::Message;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    type Slot = Arc<Mutex<Option<CancellationToken>>>;

    fn idp_named(name: &str) -> Idp {
        Idp {
            metadata: Some(Metadata {
                name: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn contract_with(slot: Slot) -> ServiceContract {
        let pool = gantry_proto::descriptor_pool().unwrap();
        ServiceContract::from_pool(&pool, IDP_SERVICE)
            .unwrap()
            .unary_typed("GetIdp", |ctx: CallContext, mut idp: Idp| async move {
                let name = idp.metadata.as_ref().map(|m| m.name.clone()).unwrap_or_default();
                if name == "missing" {
                    return Err(Status::not_found(format!("idp {} not found", name)));
                }
                if name == "slow" {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                ctx.response_metadata().append_header("x-served-by", "idp");
                ctx.response_metadata().append_trailer("x-cost", "1");
                idp.kind = "Idp".to_string();
                Ok(idp)
            })
            .unwrap()
            .unary_typed("CreateIdp", |ctx: CallContext, mut idp: Idp| async move {
                ctx.response_metadata().append_header("x-served-by", "idp");
                ctx.response_metadata().append_trailer("x-cost", "2");
                idp.kind = "Idp".to_string();
                Ok(idp)
            })
            .unwrap()
            .unary_typed("UpdateIdp", |_ctx: CallContext, idp: Idp| async move { Ok(idp) })
            .unwrap()
            .unary_typed("ListIdps", |_ctx: CallContext, req: ListIdpsRequest| async move {
                Ok(IdpList {
                    kind: "IdpList".to_string(),
                    metadata: Some(ListMetadata {
                        limit: req.limit,
                        ..Default::default()
                    }),
                    items: req.kinds.iter().map(|_| Idp::default()).collect(),
                    ..Default::default()
                })
            })
            .unwrap()
            .unary_typed("DeleteIdp", move |ctx: CallContext, _idp: Idp| {
                let slot = Arc::clone(&slot);
                async move {
                    *slot.lock().unwrap() = Some(ctx.cancellation().clone());
                    ctx.cancelled().await;
                    Ok(())
                }
            })
            .unwrap()
            .server_streaming_typed("WatchIdps", |_ctx: CallContext, req: WatchIdpsRequest| async move {
                let event = |kind: &str| IdpEvent {
                    r#type: kind.to_string(),
                    idp: Some(idp_named("okta1")),
                };
                let mut events: Vec<Result<IdpEvent, Status>> = vec![Ok(event("ADDED")), Ok(event("MODIFIED"))];
                if req.partner == "broken" {
                    events.truncate(1);
                    events.push(Err(Status::internal("backend lost")));
                }
                Ok(tokio_stream::iter(events))
            })
            .unwrap()
    }

    fn contract() -> ServiceContract {
        contract_with(Slot::default())
    }

    fn router() -> Router {
        Gateway::builder()
            .register_contract(contract())
            .build()
            .unwrap()
            .into_router()
    }

    fn get(uri: &str) -> Request {
        http::Request::get(uri).body(Body::empty()).unwrap()
    }

    fn send_json(method: Method, uri: &str, body: &str) -> Request {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, content_type::JSON)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn call(router: &Router, request: Request) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_get_binds_path_capture() {
        let response = call(&router(), get("/auth/v3/sso/idp/okta1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], content_type::JSON);
        assert_eq!(response.headers()["gantry-metadata-x-served-by"], "idp");

        let body = json(response).await;
        assert_eq!(body["metadata"]["name"], "okta1");
        assert_eq!(body["kind"], "Idp");
    }

    #[tokio::test]
    async fn test_create_without_trailers() {
        let request = send_json(Method::POST, "/auth/v3/sso/idp", r#"{"spec":{"name":"test"}}"#);
        let response = call(&router(), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(http::header::TRAILER).is_none());

        let collected = response.into_body().collect().await.unwrap();
        assert!(collected.trailers().is_none());
        let body: serde_json::Value = serde_json::from_slice(&collected.to_bytes()).unwrap();
        assert_eq!(body["spec"]["name"], "test");
        assert_eq!(body["kind"], "Idp");
    }

    #[tokio::test]
    async fn test_create_with_trailers() {
        let mut request = send_json(Method::POST, "/auth/v3/sso/idp", r#"{"spec":{"name":"test"}}"#);
        request
            .headers_mut()
            .insert(http::header::TE, http::HeaderValue::from_static("trailers"));
        let response = call(&router(), request).await;
        assert_eq!(response.headers()[http::header::TRAILER], "gantry-trailer-x-cost");
        let collected = response.into_body().collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["gantry-trailer-x-cost"], "2");
    }

    #[tokio::test]
    async fn test_not_found_status() {
        let response = call(&router(), get("/auth/v3/sso/idp/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json(response).await;
        assert_eq!(body["code"], Code::NotFound.as_i32());
        assert_eq!(body["message"], "idp missing not found");
    }

    #[tokio::test]
    async fn test_route_errors() {
        let router = router();
        let response = call(&router, send_json(Method::PATCH, "/auth/v3/sso/idp", "{}")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = call(&router, get("/auth/v4/unknown")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json(response).await;
        assert_eq!(body["code"], Code::NotFound.as_i32());
    }

    #[tokio::test]
    async fn test_query_binding() {
        let router = router();
        let uri = "/auth/v3/sso/idp?limit=5&kinds=IDP_KIND_SAML&kinds=2&unknown=1";
        let response = call(&router, get(uri)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["metadata"]["limit"], "5");
        assert_eq!(body["items"].as_array().unwrap().len(), 2);

        let response = call(&router, get("/auth/v3/sso/idp?limit=many")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json(response).await;
        assert_eq!(body["code"], Code::InvalidArgument.as_i32());
        assert!(body["message"].as_str().unwrap().contains("limit"));
    }

    #[tokio::test]
    async fn test_body_field_selector() {
        let request = send_json(
            Method::PATCH,
            "/auth/v3/sso/idp/okta1/spec",
            r#"{"name":"renamed","priority":3}"#,
        );
        let response = call(&router(), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["metadata"]["name"], "okta1");
        assert_eq!(body["spec"]["name"], "renamed");
        assert_eq!(body["spec"]["priority"], 3);
    }

    #[tokio::test]
    async fn test_path_wins_over_body() {
        let request = send_json(
            Method::PUT,
            "/auth/v3/sso/idp/okta1",
            r#"{"metadata":{"name":"other","partner":"p1"}}"#,
        );
        let body = json(call(&router(), request).await).await;
        assert_eq!(body["metadata"]["name"], "okta1");
        assert_eq!(body["metadata"]["partner"], "p1");
    }

    #[tokio::test]
    async fn test_put_round_trips_untouched_fields() {
        let mut input = serde_json::json!({
            "apiVersion": "v3",
            "kind": "Idp",
            "metadata": {
                "name": "other",
                "description": "primary sso",
                "partner": "p1",
                "labels": {"tier": "gold"}
            },
            "spec": {
                "name": "okta",
                "domain": "example.com",
                "acsUrl": "https://example.com/acs",
                "saveConfig": true,
                "priority": 3,
                "weight": 0.5,
                "groups": ["admins", "ops"],
                "kind": "IDP_KIND_SAML",
                "maxSessions": "10",
                "port": 8443
            }
        });
        let request = send_json(Method::PUT, "/auth/v3/sso/idp/okta1", &input.to_string());
        let response = call(&router(), request).await;
        assert_eq!(response.status(), StatusCode::OK);

        input["metadata"]["name"] = serde_json::json!("okta1");
        assert_eq!(json(response).await, input);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let request = send_json(Method::POST, "/auth/v3/sso/idp", "{not json");
        let response = call(&router(), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], Code::InvalidArgument.as_i32());
    }

    #[tokio::test]
    async fn test_body_limit() {
        let gateway = Gateway::builder()
            .config(GatewayConfig::default().max_body_bytes(8))
            .register_contract(contract())
            .build()
            .unwrap();
        let request = send_json(Method::POST, "/auth/v3/sso/idp", r#"{"spec":{"name":"test"}}"#);
        let response = call(&gateway.into_router(), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_protobuf_negotiation() {
        let idp = Idp {
            spec: Some(IdpSpec {
                name: "test".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let request = http::Request::post("/auth/v3/sso/idp")
            .header(CONTENT_TYPE, content_type::PROTOBUF)
            .header(ACCEPT, content_type::PROTOBUF)
            .body(Body::from(idp.encode_to_vec()))
            .unwrap();
        let response = call(&router(), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], content_type::PROTOBUF);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let created = Idp::decode(body).unwrap();
        assert_eq!(created.kind, "Idp");
        assert_eq!(created.spec.unwrap().name, "test");
    }

    #[tokio::test]
    async fn test_invalid_timeout_header() {
        let mut request = get("/auth/v3/sso/idp/okta1");
        request
            .headers_mut()
            .insert("gantry-timeout", http::HeaderValue::from_static("soon"));
        let response = call(&router(), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_interceptor_rejects() {
        let router = Gateway::builder()
            .register_contract(contract())
            .interceptor(Arc::new(|ctx: &mut CallContext, _: &mut DynamicMessage| -> Result<(), Status> {
                if ctx.request_metadata().get("authorization").is_none() {
                    return Err(Status::unauthenticated("missing credentials"));
                }
                Ok(())
            }))
            .build()
            .unwrap()
            .into_router();

        let response = call(&router, get("/auth/v3/sso/idp/okta1")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = get("/auth/v3/sso/idp/okta1");
        request
            .headers_mut()
            .insert("authorization", http::HeaderValue::from_static("Bearer t"));
        assert_eq!(call(&router, request).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_watch_ndjson() {
        let response = call(&router(), get("/auth/v3/sso/idp:watch")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], content_type::NDJSON);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let lines: Vec<serde_json::Value> = std::str::from_utf8(&body)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["result"]["type"], "ADDED");
        assert_eq!(lines[1]["result"]["idp"]["metadata"]["name"], "okta1");
    }

    #[tokio::test]
    async fn test_watch_sse_error() {
        let request = http::Request::get("/auth/v3/sso/idp:watch?partner=broken")
            .header(ACCEPT, content_type::SSE)
            .body(Body::empty())
            .unwrap();
        let response = call(&router(), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], content_type::SSE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.starts_with("id: 0\n"));
        assert!(text.contains("event: error\n"));
        assert!(text.contains("backend lost"));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_call() {
        let slot = Slot::default();
        let router = Gateway::builder()
            .register_contract(contract_with(Arc::clone(&slot)))
            .build()
            .unwrap()
            .into_router();

        let request = http::Request::delete("/auth/v3/sso/idp/okta1")
            .body(Body::empty())
            .unwrap();
        let abandoned = tokio::time::timeout(Duration::from_millis(50), call(&router, request)).await;
        assert!(abandoned.is_err());

        let token = slot.lock().unwrap().clone().unwrap();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();

        let response = call(&router, get("/auth/v3/sso/idp/okta1")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    async fn remote_channel(options: DialOptions) -> Channel {
        let addr = GantryServer::builder()
            .contract(contract())
            .build()
            .spawn_local()
            .await
            .unwrap();
        let endpoint: Endpoint = format!("http://{}", addr).parse().unwrap();
        Channel::dial(endpoint, options).await.unwrap()
    }

    fn remote_router(channel: Channel) -> Router {
        let service = contract().descriptor().clone();
        Gateway::builder()
            .register_remote(channel, service)
            .build()
            .unwrap()
            .into_router()
    }

    #[tokio::test]
    async fn test_remote_binding() {
        let router = remote_router(remote_channel(DialOptions::default()).await);

        let response = call(&router, get("/auth/v3/sso/idp/okta1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["gantry-metadata-x-served-by"], "idp");
        let body = json(response).await;
        assert_eq!(body["metadata"]["name"], "okta1");

        let response = call(&router, get("/auth/v3/sso/idp/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = call(&router, get("/auth/v3/sso/idp:watch")).await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(std::str::from_utf8(&body).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_bounded_pool() {
        let channel = remote_channel(DialOptions::default().max_connections(2)).await;
        let router = remote_router(channel.clone());

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let router = router.clone();
                tokio::spawn(async move { router.oneshot(get("/auth/v3/sso/idp/slow")).await.unwrap() })
            })
            .collect();
        for call in calls {
            assert_eq!(call.await.unwrap().status(), StatusCode::OK);
        }
        assert!(channel.status().open <= 2);
    }

    fn binding(method: &str) -> OperationBinding {
        OperationBinding::local(contract(), method).unwrap()
    }

    #[test]
    fn test_collision_is_registration_error() {
        let err = Gateway::builder()
            .route(RouteSpec::get("/v1/idp/{kind}"), binding("GetIdp"))
            .route(RouteSpec::get("/v1/idp/{api_version}"), binding("GetIdp"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::Collision { .. }));

        let built = Gateway::builder()
            .route(RouteSpec::get("/v1/idp/{kind}"), binding("GetIdp"))
            .route(RouteSpec::delete("/v1/idp/{kind}"), binding("DeleteIdp"))
            .build();
        assert!(built.is_ok());
    }

    #[test]
    fn test_invalid_routes() {
        let err = Gateway::builder()
            .route(RouteSpec::get("/v1/idp/{nope}"), binding("GetIdp"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::UnknownField { .. }));

        let err = Gateway::builder()
            .route(RouteSpec::post("/v1/idp").with_body("kind"), binding("CreateIdp"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::InvalidSelector { role: "body", .. }));

        let err = Gateway::builder()
            .route(RouteSpec::get("/v1/idp/{kind.name}"), binding("GetIdp"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::InvalidSelector { .. }));

        let err = Gateway::builder()
            .route(RouteSpec::get("v1/idp"), binding("GetIdp"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::Pattern { .. }));
    }

    #[tokio::test]
    async fn test_verb_route_not_shadowed_by_capture() {
        let router = Gateway::builder()
            .route(RouteSpec::get("/v1/idp/{metadata.name}"), binding("GetIdp"))
            .route(RouteSpec::get("/v1/idp/{metadata.name}:cancel"), binding("UpdateIdp"))
            .build()
            .unwrap()
            .into_router();

        let body = json(call(&router, get("/v1/idp/okta1:cancel?kind=cancel")).await).await;
        assert_eq!(body["metadata"]["name"], "okta1");
        assert_eq!(body["kind"], "cancel");

        let body = json(call(&router, get("/v1/idp/okta1?kind=cancel")).await).await;
        assert_eq!(body["metadata"]["name"], "okta1");
        assert_eq!(body["kind"], "Idp");
    }

    #[tokio::test]
    async fn test_response_body_selector() {
        let router = Gateway::builder()
            .route(
                RouteSpec::get("/v1/idp/{metadata.name}/spec").with_response_body("spec"),
                binding("UpdateIdp"),
            )
            .build()
            .unwrap()
            .into_router();
        let response = call(&router, get("/v1/idp/okta1/spec?spec.name=saml")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body, serde_json::json!({"name": "saml"}));
    }

    #[test]
    fn test_routes_from_annotations() {
        let gateway = Gateway::builder().register_contract(contract()).build().unwrap();
        let routes: Vec<(String, String)> = gateway
            .routes()
            .map(|r| (r.method().to_string(), r.template().to_string()))
            .collect();
        assert_eq!(routes.len(), 7);
        assert!(routes.contains(&("PATCH".to_string(), "/auth/v3/sso/idp/{metadata.name}/spec".to_string())));
        assert!(routes.contains(&("GET".to_string(), "/auth/v3/sso/idp:watch".to_string())));
    }
}
