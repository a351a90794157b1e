//! Core types for the Gantry HTTP/RPC gateway.
//!
//! This crate provides the foundation types shared by every Gantry component:
//! - RPC status model ([`Code`], [`Status`])
//! - Call metadata (ordered header/trailer multi-maps)
//! - Per-call context with cancellation, deadline and opaque annotations
//! - Reply types for unary and server-streaming operations
//! - Stream framing and header conventions of the remote wire protocol

pub mod context;
pub mod deadline;
pub mod error;
pub mod framing;
pub mod metadata;
pub mod reply;
pub mod wire;

pub use context::{CallContext, HttpPathPattern, RpcMethod};
pub use deadline::{encode_timeout, parse_timeout, TIMEOUT_HEADER};
pub use error::{Code, Status};
pub use framing::{Frame, FrameError, FrameFlags, FrameParser};
pub use metadata::{CallMetadata, MetadataMap, MetadataSink};
pub use reply::{MessageStream, Reply};
