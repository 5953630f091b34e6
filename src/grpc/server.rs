//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::bulwark::v1::guard_service_server::GuardServiceServer;
use super::service::GuardServiceImpl;
use crate::error::{BulwarkError, Result};
use crate::guard::Guard;

/// gRPC server for the guard service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The shared guard instance
    guard: Arc<Guard>,
}

impl GrpcServer {
    /// Create a new gRPC server.
    pub fn new(addr: SocketAddr, guard: Arc<Guard>) -> Self {
        Self { addr, guard }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = GuardServiceImpl::new(self.guard);

        info!(
            addr = %self.addr,
            "Starting gRPC server for GuardService with graceful shutdown"
        );

        Server::builder()
            .add_service(GuardServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                BulwarkError::Grpc(e)
            })
    }
}
