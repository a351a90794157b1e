//! Gateway configuration

use crate::forward::{DEFAULT_HEADER_PREFIX, DEFAULT_TRAILER_PREFIX};
use crate::marshal::JsonOptions;
use crate::status::CanceledStatus;
use serde::Deserialize;
use std::time::Duration;

/// Default request body limit (4 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Deadline applied to every call; a shorter `gantry-timeout` header wins
    pub default_timeout_ms: Option<u64>,
    /// Prefix of header metadata on responses, and of request headers
    /// forwarded as metadata with the prefix stripped
    pub header_prefix: String,
    /// Prefix of trailer metadata on responses
    pub trailer_prefix: String,
    /// Request headers forwarded as metadata under their own name
    pub forward_headers: Vec<String>,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// HTTP status for cancelled calls
    pub canceled_status: CanceledStatus,
    /// JSON encoding options
    pub json: JsonOptions,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            header_prefix: DEFAULT_HEADER_PREFIX.to_string(),
            trailer_prefix: DEFAULT_TRAILER_PREFIX.to_string(),
            forward_headers: vec!["authorization".to_string(), "x-request-id".to_string()],
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            canceled_status: CanceledStatus::default(),
            json: JsonOptions::default(),
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    /// Set the default call timeout
    pub fn default_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = Some(ms);
        self
    }

    /// Forward a request header as metadata
    pub fn forward_header(mut self, name: impl Into<String>) -> Self {
        self.forward_headers.push(name.into().to_ascii_lowercase());
        self
    }

    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub fn canceled_status(mut self, status: CanceledStatus) -> Self {
        self.canceled_status = status;
        self
    }

    pub fn json(mut self, options: JsonOptions) -> Self {
        self.json = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.default_timeout(), None);
        assert_eq!(config.header_prefix, "gantry-metadata-");
        assert_eq!(config.trailer_prefix, "gantry-trailer-");
        assert_eq!(config.max_body_bytes, 4 * 1024 * 1024);
        assert!(config.forward_headers.contains(&"authorization".to_string()));
    }

    #[test]
    fn test_builder() {
        let config = GatewayConfig::new()
            .default_timeout_ms(1500)
            .forward_header("X-Tenant")
            .canceled_status(CanceledStatus::RequestTimeout);
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.forward_headers.last().map(String::as_str), Some("x-tenant"));
        assert_eq!(config.canceled_status, CanceledStatus::RequestTimeout);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "default_timeout_ms": 2000,
            "canceled_status": "request_timeout",
            "json": {"emit_unpopulated": true}
        }))
        .unwrap();
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.canceled_status, CanceledStatus::RequestTimeout);
        assert!(config.json.emit_unpopulated);
        assert!(!config.json.strict);
        assert_eq!(config.header_prefix, "gantry-metadata-");
    }
}
