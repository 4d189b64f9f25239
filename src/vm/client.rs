//! Firecracker control API client.
//!
//! HTTP/1.1 over a Unix domain socket; the monitor ignores the authority in
//! the request line. One client is bound to one VM's socket for the VM's
//! lifetime. Calls carry a fixed deadline and are never retried; a failed
//! handshake step aborts the whole create and the caller unwinds.

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;

use crate::error::{AgentError, Result};

use super::payloads::*;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Per-call deadline for control API requests.
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one VM's control socket.
#[derive(Debug)]
pub struct FirecrackerClient {
    client: HyperClient,
    socket_path: String,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Configure the kernel image and command line.
    pub async fn set_boot_source(
        &self,
        kernel_image_path: impl Into<String>,
        boot_args: Option<String>,
    ) -> Result<()> {
        self.put(
            "/boot-source",
            BootSource {
                kernel_image_path: kernel_image_path.into(),
                boot_args,
            },
        )
        .await
    }

    /// Configure vCPU count and memory size. SMT stays disabled.
    pub async fn set_machine_config(&self, vcpu_count: i32, mem_size_mib: i32) -> Result<()> {
        self.put(
            "/machine-config",
            MachineConfig {
                vcpu_count,
                mem_size_mib,
                smt: false,
            },
        )
        .await
    }

    /// Attach a block device.
    pub async fn add_drive(
        &self,
        drive_id: impl Into<String>,
        path_on_host: impl Into<String>,
        is_root_device: bool,
        is_read_only: bool,
    ) -> Result<()> {
        let drive_id = drive_id.into();
        let endpoint = format!("/drives/{}", drive_id);
        self.put(
            &endpoint,
            Drive {
                drive_id,
                path_on_host: path_on_host.into(),
                is_root_device,
                is_read_only,
            },
        )
        .await
    }

    /// Attach a network interface backed by a host TAP device.
    pub async fn add_network_interface(
        &self,
        iface_id: impl Into<String>,
        host_dev_name: impl Into<String>,
        guest_mac: Option<String>,
    ) -> Result<()> {
        let iface_id = iface_id.into();
        let endpoint = format!("/network-interfaces/{}", iface_id);
        self.put(
            &endpoint,
            NetworkInterface {
                iface_id,
                host_dev_name: host_dev_name.into(),
                guest_mac,
            },
        )
        .await
    }

    /// Boot the configured guest.
    pub async fn start_instance(&self) -> Result<()> {
        self.action("InstanceStart").await
    }

    /// Ask the guest to shut down via Ctrl+Alt+Del.
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.action("SendCtrlAltDel").await
    }

    /// Flush the monitor's metrics to its configured sink.
    pub async fn flush_metrics(&self) -> Result<()> {
        self.action("FlushMetrics").await
    }

    /// Fetch the instance description (`GET /`).
    pub async fn get_instance_info(&self) -> Result<serde_json::Value> {
        let body = self.get("/").await?;
        serde_json::from_slice(&body).map_err(AgentError::ControlApiDecode)
    }

    async fn action(&self, action_type: &str) -> Result<()> {
        self.put(
            "/actions",
            InstanceAction {
                action_type: action_type.to_string(),
            },
        )
        .await
    }

    async fn put<T: Serialize>(&self, endpoint: &str, body: T) -> Result<()> {
        let json = serde_json::to_string(&body)
            .map_err(|e| AgentError::ControlApiTransport(format!("failed to encode body: {}", e)))?;
        self.request(hyper::Method::PUT, endpoint, Bytes::from(json))
            .await
            .map(|_| ())
    }

    async fn get(&self, endpoint: &str) -> Result<Bytes> {
        self.request(hyper::Method::GET, endpoint, Bytes::new())
            .await
    }

    async fn request(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: Bytes,
    ) -> Result<Bytes> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(body))
            .map_err(|e| AgentError::ControlApiTransport(format!("failed to build request: {}", e)))?;

        let response = tokio::time::timeout(API_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| {
                AgentError::ControlApiTransport(format!(
                    "request to {} timed out after {:?}",
                    endpoint, API_TIMEOUT
                ))
            })?
            .map_err(|e| AgentError::ControlApiTransport(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| AgentError::ControlApiTransport(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(AgentError::ControlApiRejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).to_string(),
            });
        }

        Ok(body)
    }
}
