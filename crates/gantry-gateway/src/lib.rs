//! HTTP/REST gateway for Gantry RPC operations.
//!
//! This crate provides:
//! - Google API style path templates with captures, wildcards and verbs
//! - Request message binding from path captures, query and body
//! - JSON and protobuf marshalers negotiated per request
//! - Local and remote operation bindings behind one dispatcher
//! - Unary and server-streaming responses with header and trailer metadata
//! - Routes read from `google.api.http` method options

pub mod binder;
pub mod binding;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod marshal;
pub mod pattern;
pub mod router;
pub mod rule;
pub mod status;

pub use binder::{BindError, QueryFilter};
pub use binding::OperationBinding;
pub use config::GatewayConfig;
pub use dispatch::{Dispatcher, Interceptor, Outcome};
pub use error::{DecodeError, GatewayError, MarshalError, RegistrationError, StreamInterrupted};
pub use forward::{ResponseOptions, StreamFormat};
pub use marshal::{JsonMarshaler, JsonOptions, Marshaler, MarshalerRegistry, ProtoMarshaler};
pub use pattern::{Captures, PathPattern, PatternError};
pub use router::{Gateway, GatewayBuilder, Route, RouteTable};
pub use rule::{http_rules, RouteSpec};
pub use status::{http_status, CanceledStatus};
