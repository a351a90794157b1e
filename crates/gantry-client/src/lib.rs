//! Remote connection side of the Gantry gateway.
//!
//! This crate provides:
//! - Endpoint and dial configuration
//! - A bounded connection pool over a pluggable dialer
//! - HTTP/1.1 and HTTP/2 connections to a remote RPC server
//! - `Channel` for unary and server-streaming calls with call metadata

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;

pub use channel::Channel;
pub use config::{DialOptions, Endpoint, HttpProtocol, PoolConfig};
pub use connection::{HttpConnection, HttpDialer};
pub use error::{DialError, PoolError};
pub use pool::{Dialer, Pool, PoolStatus, Pooled};
