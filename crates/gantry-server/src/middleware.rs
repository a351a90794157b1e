//! Request body handling for the RPC server
//!
//! Request bodies may be zstd compressed (`Content-Encoding: zstd`).

use bytes::Bytes;
use gantry_core::Status;
use http::{header, HeaderMap};
use http_body::Body;
use http_body_util::BodyExt;

/// Compression level for zstd
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Minimum body size worth compressing (in bytes)
pub const MIN_COMPRESS_SIZE: usize = 1024;

/// Compress bytes using zstd
pub fn compress_zstd(data: &[u8], level: i32) -> Result<Bytes, Status> {
    zstd::encode_all(data, level)
        .map(Bytes::from)
        .map_err(|e| Status::internal(format!("compression failed: {}", e)))
}

/// Decompress bytes using zstd
pub fn decompress_zstd(data: &[u8]) -> Result<Bytes, Status> {
    zstd::decode_all(data)
        .map(Bytes::from)
        .map_err(|e| Status::invalid_argument(format!("decompression failed: {}", e)))
}

/// True when the headers declare a zstd encoded body
pub fn is_zstd(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .map(|v| v == "zstd")
        .unwrap_or(false)
}

/// Read a request body to the end and undo its content encoding
pub async fn read_request_body<B>(headers: &HeaderMap, body: B) -> Result<Bytes, Status>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let bytes = body
        .collect()
        .await
        .map_err(|e| Status::canceled(format!("failed to read request body: {}", e)))?
        .to_bytes();

    match headers.get(header::CONTENT_ENCODING) {
        None => Ok(bytes),
        Some(_) if is_zstd(headers) => decompress_zstd(&bytes),
        Some(other) => Err(Status::unimplemented(format!(
            "unsupported content encoding {:?}",
            other
        ))),
    }
}
