//! gRPC surface of the agent.
//!
//! `pb` holds the types generated from `proto/firecracker/v1/agent.proto`;
//! `server` implements the service on top of the VM manager.

pub mod server;

/// Generated protobuf/gRPC types.
pub mod pb {
    tonic::include_proto!("firecracker.v1");
}
