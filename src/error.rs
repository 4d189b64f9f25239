//! Error types for the agent.
//!
//! Every fallible operation in the crate returns [`AgentError`]. The variants
//! correspond to the failure domains of VM creation (storage, network,
//! process supervision, control API) plus the usual request-level rejections,
//! and each maps onto a gRPC status code via `From<AgentError> for Status`.

use thiserror::Error;
use tonic::Status;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors produced while managing VMs.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Request failed validation before reaching the orchestrator.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A VM with the requested id is already registered.
    #[error("VM {0} already exists")]
    AlreadyExists(String),

    /// No VM with the requested id is registered.
    #[error("VM {0} not found")]
    NotFound(String),

    /// The operation is not possible for this VM (e.g. restarting a stopped
    /// Firecracker VM, which must be recreated instead).
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Preparing the per-VM storage tree failed.
    #[error("storage setup failed: {0}")]
    StorageSetup(String),

    /// Bridge or TAP manipulation failed.
    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    /// The Firecracker (or jailer) process could not be spawned.
    #[error("failed to spawn process: {0}")]
    SupervisorSpawn(#[source] std::io::Error),

    /// The process started but its API socket never appeared in time.
    #[error("process not ready: {0}")]
    SupervisorNotReady(String),

    /// The Firecracker API answered with a non-2xx status.
    #[error("Firecracker API rejected request with status {status}: {body}")]
    ControlApiRejected { status: u16, body: String },

    /// Connecting to or exchanging bytes with the API socket failed.
    #[error("Firecracker API transport error: {0}")]
    ControlApiTransport(String),

    /// The API answered 2xx but the body was not valid JSON.
    #[error("failed to decode Firecracker API response: {0}")]
    ControlApiDecode(#[source] serde_json::Error),
}

impl From<AgentError> for Status {
    fn from(err: AgentError) -> Self {
        let message = err.to_string();
        match err {
            AgentError::InvalidArgument(_) => Status::invalid_argument(message),
            AgentError::AlreadyExists(_) => Status::already_exists(message),
            AgentError::NotFound(_) => Status::not_found(message),
            AgentError::NotSupported(_) => Status::failed_precondition(message),
            AgentError::StorageSetup(_)
            | AgentError::NetworkSetup(_)
            | AgentError::SupervisorSpawn(_)
            | AgentError::SupervisorNotReady(_)
            | AgentError::ControlApiRejected { .. }
            | AgentError::ControlApiTransport(_)
            | AgentError::ControlApiDecode(_) => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_code_mapping() {
        let cases: Vec<(AgentError, Code)> = vec![
            (
                AgentError::InvalidArgument("vcpu".into()),
                Code::InvalidArgument,
            ),
            (AgentError::AlreadyExists("vm-1".into()), Code::AlreadyExists),
            (AgentError::NotFound("vm-1".into()), Code::NotFound),
            (
                AgentError::NotSupported("restart".into()),
                Code::FailedPrecondition,
            ),
            (AgentError::StorageSetup("disk full".into()), Code::Internal),
            (AgentError::NetworkSetup("no bridge".into()), Code::Internal),
            (
                AgentError::SupervisorNotReady("socket timeout".into()),
                Code::Internal,
            ),
            (
                AgentError::ControlApiRejected {
                    status: 400,
                    body: "bad drive".into(),
                },
                Code::Internal,
            ),
            (
                AgentError::ControlApiTransport("connection refused".into()),
                Code::Internal,
            ),
        ];

        for (err, code) in cases {
            let status: Status = err.into();
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn test_rejected_error_preserves_fault_body() {
        let err = AgentError::ControlApiRejected {
            status: 400,
            body: r#"{"fault_message":"bad drive"}"#.into(),
        };
        let text = err.to_string();
        assert!(text.contains("400"));
        assert!(text.contains("bad drive"));
    }
}
