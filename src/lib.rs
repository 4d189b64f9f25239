//! fc-agent: a gRPC agent for managing Firecracker microVMs on a single
//! Linux host.
//!
//! Remote orchestrators call the agent to create, stop, delete, and observe
//! VMs; the agent turns each call into the coordinated manipulation of a
//! supervised Firecracker process, a TAP attachment on a shared bridge, and
//! a per-VM storage tree (optionally inside a chroot jail).
//!
//! # Modules
//!
//! - `vm` - VM lifecycle: control API client, process supervision, orchestration
//! - `network` - bridge and TAP device management
//! - `storage` - per-VM storage and jail trees
//! - `events` - lifecycle event bus feeding the watch stream
//! - `grpc` - generated protobuf types and the service implementation
//! - `config` - YAML configuration with defaults
//! - `metrics` - Prometheus collectors and endpoint
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use fc_agent::{config::Config, events::EventBus, vm::Manager};
//!
//! let cfg = Arc::new(Config::load("configs/agent.yaml")?);
//! let events = Arc::new(EventBus::new());
//! let manager = Arc::new(Manager::new(cfg, events));
//! manager.init_host().await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod grpc;
pub mod metrics;
pub mod network;
pub mod storage;
pub mod vm;

pub use error::{AgentError, Result};

/// Agent version, reported by HealthCheck and GetHostInfo.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
