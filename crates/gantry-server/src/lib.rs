//! RPC server side of the Gantry gateway.
//!
//! This crate provides:
//! - Service contracts binding handlers to a service descriptor
//! - HTTP router serving contracts over the remote wire protocol
//! - Request body decompression
//! - Server runtime

pub mod contract;
pub mod middleware;
pub mod router;
pub mod server;

pub use contract::{ContractError, Handler, HandlerFuture, ServiceContract};
pub use router::{run_until, status_response, FramedReplyStream, ResponseBody, RpcRouter};
pub use server::{GantryServer, ServerBuilder};
