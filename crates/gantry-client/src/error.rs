//! Client error types

use gantry_core::Status;

/// Failure to establish a connection to a remote endpoint
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP handshake with {endpoint} failed: {source}")]
    Handshake {
        endpoint: String,
        #[source]
        source: hyper::Error,
    },

    #[error("Connecting to {0} timed out")]
    Timeout(String),
}

/// Failure to check out a pooled connection
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Timed out waiting for a free connection")]
    Timeout,

    #[error("Connection pool is closed")]
    Closed,

    #[error(transparent)]
    Dial(#[from] DialError),
}

impl From<DialError> for Status {
    fn from(err: DialError) -> Self {
        Status::unavailable(err.to_string())
    }
}

impl From<PoolError> for Status {
    fn from(err: PoolError) -> Self {
        Status::unavailable(err.to_string())
    }
}
