//! gRPC server module for the guard service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::GuardServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod bulwark {
        pub mod v1 {
            tonic::include_proto!("bulwark.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::bulwark::v1::{
    guard_service_server::GuardServiceServer, DecideRequest, DecideResponse, Verdict,
};
