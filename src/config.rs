//! Agent configuration.
//!
//! Loaded once at startup from a YAML file. Every key has a documented
//! default so a minimal file (or an empty one) yields a usable configuration;
//! unknown keys are ignored for forward compatibility.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub firecracker: FirecrackerConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub monitoring: MonitoringConfig,
    pub log: LogConfig,
}

/// gRPC listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 50051,
        }
    }
}

/// Paths to the Firecracker binaries and default guest images, plus jailer
/// settings. The four paths have no built-in default and must be configured
/// before VMs can be created (requests may still override the kernel and
/// rootfs per VM). The jailer is enabled by default; direct execution is
/// meant for bring-up and development only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    pub binary_path: String,
    pub jailer_path: String,
    pub kernel_path: String,
    pub rootfs_path: String,
    pub use_jailer: bool,
    pub jail_uid: u32,
    pub jail_gid: u32,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary_path: String::new(),
            jailer_path: String::new(),
            kernel_path: String::new(),
            rootfs_path: String::new(),
            use_jailer: true,
            jail_uid: 1000,
            jail_gid: 1000,
        }
    }
}

/// Host bridge and TAP naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bridge_name: String,
    /// Bridge address in CIDR form (e.g. "172.16.0.1/24"). When set, it is
    /// assigned to the bridge and its IP portion becomes the guests' gateway.
    pub bridge_ip: Option<String>,
    pub tap_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "br0".to_string(),
            bridge_ip: None,
            tap_prefix: "vmtap".to_string(),
        }
    }
}

/// Per-VM storage root and staging strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub vms_dir: String,
    /// When true, the rootfs is staged as a qcow2 copy-on-write overlay and
    /// the kernel is shared by reference instead of copied.
    pub use_overlay: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            vms_dir: "/srv/firecracker/vms".to_string(),
            use_overlay: false,
        }
    }
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub metrics_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            metrics_port: 9090,
        }
    }
}

/// Logging level and output format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// "json" or "text".
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Missing keys fall back to their defaults; an empty file yields the
    /// full default configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AgentError::InvalidArgument(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
            .map_err(|e| AgentError::InvalidArgument(format!("failed to parse config: {}", e)))
    }
}
