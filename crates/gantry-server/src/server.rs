//! Gantry RPC server implementation

use crate::contract::ServiceContract;
use crate::router::RpcRouter;
use http::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// RPC server exposing service contracts to remote gateways
#[derive(Debug, Clone)]
pub struct GantryServer {
    router: Arc<RpcRouter>,
}

impl GantryServer {
    /// Create a new server with a router
    pub fn new(router: RpcRouter) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    /// Create a builder for configuring the server
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn router(&self) -> &RpcRouter {
        &self.router
    }

    /// Serve on the given address until the process exits
    pub async fn serve(self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve connections accepted by `listener` until `shutdown` resolves
    ///
    /// Connections already accepted keep running after shutdown.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Gantry RPC server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Gantry RPC server shutting down");
                    return Ok(());
                }
            };
            debug!("Accepted connection from {}", remote_addr);
            let router = Arc::clone(&self.router);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                    let router = Arc::clone(&router);
                    async move { Ok::<_, hyper::Error>(router.route(req).await) }
                });

                if let Err(err) = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    error!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }

    /// Bind an ephemeral port on localhost and serve in a background task
    pub async fn spawn_local(self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(err) = self.serve_with_shutdown(listener, std::future::pending()).await {
                error!("Gantry RPC server on {} stopped: {}", addr, err);
            }
        });
        Ok(addr)
    }
}

/// Builder for creating a Gantry RPC server
#[derive(Debug, Default)]
pub struct ServerBuilder {
    router: RpcRouter,
}

impl ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve every method of a contract
    pub fn contract(mut self, contract: ServiceContract) -> Self {
        self.router.add_contract(contract);
        self
    }

    /// Build the server
    pub fn build(self) -> GantryServer {
        GantryServer::new(self.router)
    }
}
