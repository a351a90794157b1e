//! Local and remote operation bindings

use crate::error::RegistrationError;
use gantry_client::Channel;
use gantry_core::{CallContext, MetadataSink, Reply, Status};
use gantry_server::ServiceContract;
use prost_reflect::{DynamicMessage, MethodDescriptor};

/// How a routed operation is invoked
///
/// Chosen once at registration. Both variants take the same context and
/// request and report metadata the same way, so nothing downstream can tell
/// them apart.
#[derive(Debug, Clone)]
pub enum OperationBinding {
    /// In-process handler of a service contract
    Local {
        contract: ServiceContract,
        method: MethodDescriptor,
    },
    /// Call through a pooled channel to another process
    Remote {
        channel: Channel,
        method: MethodDescriptor,
    },
}

impl OperationBinding {
    /// Bind a method of a local contract
    pub fn local(contract: ServiceContract, method: &str) -> Result<Self, RegistrationError> {
        let descriptor = contract
            .method(method)
            .ok_or_else(|| RegistrationError::UnknownMethod {
                service: contract.name().to_string(),
                method: method.to_string(),
            })?;
        Ok(OperationBinding::Local {
            contract,
            method: descriptor,
        })
    }

    /// Bind a method served by a remote process
    pub fn remote(channel: Channel, method: MethodDescriptor) -> Self {
        OperationBinding::Remote { channel, method }
    }

    pub fn method(&self) -> &MethodDescriptor {
        match self {
            OperationBinding::Local { method, .. } | OperationBinding::Remote { method, .. } => method,
        }
    }

    /// Fully qualified operation name, `/package.Service/Method`
    pub fn name(&self) -> String {
        let method = self.method();
        format!("/{}/{}", method.parent_service().full_name(), method.name())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, OperationBinding::Remote { .. })
    }

    /// Invoke the operation
    ///
    /// Handler metadata goes to the context's response sink; metadata produced
    /// by the transport goes to `metadata_out`.
    pub async fn invoke(
        &self,
        ctx: CallContext,
        request: DynamicMessage,
        metadata_out: &MetadataSink,
    ) -> Result<Reply, Status> {
        match self {
            OperationBinding::Local { contract, method } => contract.call(method.name(), ctx, request).await,
            OperationBinding::Remote { channel, method } => {
                if method.is_server_streaming() {
                    let stream = channel
                        .server_streaming(&ctx, method, &request, metadata_out)
                        .await?;
                    Ok(Reply::Streaming(stream))
                } else {
                    let message = channel.unary(&ctx, method, &request, metadata_out).await?;
                    Ok(Reply::Unary(message))
                }
            }
        }
    }
}
