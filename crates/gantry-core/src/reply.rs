//! Reply types for unary and server-streaming operations

use crate::error::Status;
use prost_reflect::DynamicMessage;
use std::fmt;
use std::pin::Pin;
use tokio_stream::Stream;

/// Stream of response messages of a server-streaming operation
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<DynamicMessage, Status>> + Send>>;

/// Successful result of an operation: one message or a stream of messages
pub enum Reply {
    /// Unary response (single message)
    Unary(DynamicMessage),
    /// Server-streaming response (messages delivered as they are produced)
    Streaming(MessageStream),
}

impl Reply {
    /// Create a unary reply
    pub fn unary(message: DynamicMessage) -> Self {
        Self::Unary(message)
    }

    /// Create a streaming reply
    pub fn streaming<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<DynamicMessage, Status>> + Send + 'static,
    {
        Self::Streaming(Box::pin(stream))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Reply::Streaming(_))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Unary(message) => f.debug_tuple("Unary").field(message).finish(),
            Reply::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}
