//! Error types for the gateway

use crate::binder::BindError;
use crate::pattern::PatternError;
use crate::status::{http_status, CanceledStatus};
use gantry_core::{Code, Status};
use gantry_server::ContractError;
use http::{Method, StatusCode};
use thiserror::Error;

/// Route registration errors; fatal at startup
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Invalid path template {template:?}: {source}")]
    Pattern {
        template: String,
        #[source]
        source: PatternError,
    },

    #[error("Route {method} {template} collides with {existing}")]
    Collision {
        method: Method,
        template: String,
        existing: String,
    },

    #[error("Method {method} not found on service {service}")]
    UnknownMethod { service: String, method: String },

    #[error("Operation {operation}: no field {field:?} in {message}")]
    UnknownField {
        operation: String,
        field: String,
        message: String,
    },

    #[error("Operation {operation}: {field:?} must be a singular message field to be used as {role}")]
    InvalidSelector {
        operation: String,
        field: String,
        role: &'static str,
    },

    #[error("Operation {0} is client or bidirectional streaming, which cannot be exposed over HTTP")]
    UnsupportedStreaming(String),

    #[error("Operation {operation}: invalid HTTP method {method:?}")]
    InvalidMethod { operation: String, method: String },

    #[error("Operation {operation}: malformed google.api.http rule: {reason}")]
    InvalidRule { operation: String, reason: String },

    #[error(transparent)]
    Contract(#[from] ContractError),
}

/// Malformed request body
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Failed to read request body: {0}")]
    Read(String),

    #[error("Invalid {content_type} body: {message}")]
    Body { content_type: String, message: String },
}

/// Marshaling failures
#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("{0} cannot encode this value")]
    Unsupported(&'static str),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mid-stream failure of a server-streaming response
///
/// The status line was already sent; the failure is reported in-band.
#[derive(Debug, Error)]
#[error("Stream interrupted after {sent} messages: {status}")]
pub struct StreamInterrupted {
    pub sent: usize,
    pub status: Status,
}

/// Request-time gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No route for {0}")]
    NoRoute(String),

    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed { method: Method, path: String },

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Status(#[from] Status),
}

impl GatewayError {
    /// Status written in the error body
    pub fn to_status(&self) -> Status {
        match self {
            GatewayError::NoRoute(path) => Status::not_found(format!("no route for {}", path)),
            GatewayError::MethodNotAllowed { method, path } => {
                Status::unimplemented(format!("method {} not allowed for {}", method, path))
            }
            GatewayError::Bind(err) => Status::invalid_argument(err.to_string()),
            GatewayError::Decode(err) => Status::invalid_argument(err.to_string()),
            GatewayError::Status(status) => status.clone(),
        }
    }

    /// HTTP status of the error response
    pub fn status_code(&self, canceled: CanceledStatus) -> StatusCode {
        match self {
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::NoRoute(_) => StatusCode::NOT_FOUND,
            GatewayError::Bind(_) | GatewayError::Decode(_) => StatusCode::BAD_REQUEST,
            GatewayError::Status(status) => http_status(status.code, canceled),
        }
    }

    pub fn code(&self) -> Code {
        self.to_status().code
    }
}
