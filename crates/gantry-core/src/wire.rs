//! Conventions of the remote wire protocol.
//!
//! A remote call is `POST /{package.Service}/{Method}` with the protobuf-encoded
//! request as body. The response body is a sequence of [`Frame`](crate::Frame)s:
//! DATA frames carry encoded messages, an ERROR frame carries a JSON
//! [`Status`](crate::Status) and the final END_STREAM frame carries JSON trailer
//! metadata. The END_STREAM frame is written after an ERROR frame as well.
//! Calls rejected before any frame is written answer with a non-2xx status
//! and a JSON `Status` body.

/// Content type of protobuf request bodies and framed responses
pub const CONTENT_TYPE_PROTO: &str = "application/proto";

/// Content type of JSON error bodies
pub const CONTENT_TYPE_STATUS: &str = "application/json";

/// Prefix of HTTP headers that carry call metadata
pub const METADATA_HEADER_PREFIX: &str = "gantry-meta-";

/// Build the request path of a method: `/{service}/{method}`
pub fn rpc_path(service: &str, method: &str) -> String {
    format!("/{}/{}", service, method)
}

/// Parse a request path into (service, method)
/// Expected format: "/{package}.{Service}/{Method}"
pub fn parse_rpc_path(path: &str) -> Option<(&str, &str)> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let (service, method) = path.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}
