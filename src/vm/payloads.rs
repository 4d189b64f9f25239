//! Request payloads for the Firecracker control API.
//!
//! These structs mirror the JSON bodies of the PUT endpoints the agent uses
//! during the configuration handshake.

use serde::Serialize;

/// Kernel image and command line (`PUT /boot-source`).
#[derive(Serialize, Debug, Clone)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

/// vCPU and memory sizing (`PUT /machine-config`).
#[derive(Serialize, Debug, Clone)]
pub struct MachineConfig {
    pub vcpu_count: i32,
    pub mem_size_mib: i32,
    pub smt: bool,
}

/// Block device attachment (`PUT /drives/{drive_id}`).
#[derive(Serialize, Debug, Clone)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// Network interface attachment (`PUT /network-interfaces/{iface_id}`).
#[derive(Serialize, Debug, Clone)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

/// Instance action (`PUT /actions`): "InstanceStart", "SendCtrlAltDel", or
/// "FlushMetrics".
#[derive(Serialize, Debug, Clone)]
pub struct InstanceAction {
    pub action_type: String,
}
