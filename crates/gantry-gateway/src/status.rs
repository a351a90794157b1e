//! Mapping RPC errors to HTTP responses

use crate::forward::{respond, ResponseOptions};
use crate::marshal::Marshaler;
use axum::response::Response;
use gantry_core::{CallMetadata, Code, Status};
use http::StatusCode;
use serde::Deserialize;
use tracing::warn;

/// HTTP status used for `Canceled`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanceledStatus {
    /// Nonstandard 499 Client Closed Request
    #[default]
    ClientClosedRequest,
    /// 408 Request Timeout, for clients that reject nonstandard codes
    RequestTimeout,
}

/// HTTP status for an RPC code
pub fn http_status(code: Code, canceled: CanceledStatus) -> StatusCode {
    match code {
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Canceled => match canceled {
            CanceledStatus::ClientClosedRequest => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
            CanceledStatus::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
        },
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal | Code::Unknown | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON value of an error body: `{"code", "message", "details"}`
pub fn error_value(status: &Status) -> serde_json::Value {
    serde_json::json!({
        "code": status.code.as_i32(),
        "message": status.message,
        "details": status.details,
    })
}

/// Build an error response
///
/// The body is encoded with `marshaler`, or with `fallback` when `marshaler`
/// cannot encode arbitrary values. Header metadata is applied and trailer
/// metadata is sent when the client accepts trailers.
pub fn error_response(
    http: StatusCode,
    status: &Status,
    marshaler: &dyn Marshaler,
    fallback: &dyn Marshaler,
    metadata: &CallMetadata,
    options: &ResponseOptions,
) -> Response {
    let value = error_value(status);
    let (body, content_type) = match marshaler.encode_value(&value) {
        Ok(body) => (body, marshaler.content_type().to_string()),
        Err(_) => match fallback.encode_value(&value) {
            Ok(body) => (body, fallback.content_type().to_string()),
            Err(e) => {
                warn!("Failed to encode error body: {}", e);
                (bytes::Bytes::from(status.message.clone()), "text/plain".to_string())
            }
        },
    };

    respond(http, &content_type, body, metadata, options)
}
