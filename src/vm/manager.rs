//! VM lifecycle orchestration.
//!
//! The manager owns the in-memory VM registry and composes storage, network,
//! process supervision, and the control API handshake into transactional
//! operations. Creation acquires resources in a fixed order and unwinds them
//! in reverse on any failure, so a failed create leaves nothing behind and a
//! successful one leaves everything registered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::events::{now_unix, EventBus};
use crate::grpc::pb;
use crate::metrics;
use crate::network::NetworkManager;
use crate::storage::{StorageManager, VmStorage};

use super::process::{self, ProcessMode, VmProcess};

/// Kernel command line used for every guest; the `ip=` argument is appended
/// when the caller assigns an address.
const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Wait between a successful Ctrl+Alt+Del and the SIGTERM follow-up.
const GRACEFUL_SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

/// A registered VM: its observable info plus the resources backing it.
pub struct VmRecord {
    pub info: pb::VmInfo,
    pub process: VmProcess,
    pub tap_device: String,
}

/// Orchestrates VM lifecycles and owns the registry.
pub struct Manager {
    cfg: Arc<Config>,
    network: NetworkManager,
    storage: StorageManager,
    events: Arc<EventBus>,
    vms: RwLock<HashMap<String, VmRecord>>,
}

/// Resources acquired so far during a create, released in reverse order when
/// the operation does not commit. Every release is best-effort.
#[derive(Default)]
struct Unwind {
    process: Option<VmProcess>,
    tap: Option<String>,
    jail_vm: Option<String>,
    storage_vm: Option<String>,
}

impl Unwind {
    async fn run(self, manager: &Manager) {
        if let Some(process) = self.process {
            process.kill().await;
        }
        if let Some(tap) = self.tap {
            if let Err(e) = manager.network.delete_tap(&tap).await {
                tracing::warn!(tap_device = %tap, error = %e, "rollback: failed to delete TAP device");
            }
        }
        if let Some(vm_id) = self.jail_vm {
            if let Err(e) = manager.storage.cleanup_jail(&vm_id) {
                tracing::warn!(vm_id = %vm_id, error = %e, "rollback: failed to clean up jail");
            }
        }
        if let Some(vm_id) = self.storage_vm {
            if let Err(e) = manager.storage.cleanup_vm_storage(&vm_id) {
                tracing::warn!(vm_id = %vm_id, error = %e, "rollback: failed to clean up storage");
            }
        }
    }
}

impl Manager {
    pub fn new(cfg: Arc<Config>, events: Arc<EventBus>) -> Self {
        let network = NetworkManager::new(
            cfg.network.bridge_name.clone(),
            cfg.network.bridge_ip.clone(),
            cfg.network.tap_prefix.clone(),
        );
        let storage = StorageManager::new(cfg.storage.vms_dir.clone(), cfg.storage.use_overlay);

        Self {
            cfg,
            network,
            storage,
            events,
            vms: RwLock::new(HashMap::new()),
        }
    }

    /// Prepare the host: bridge up and VMs directory present. Called once at
    /// agent startup.
    pub async fn init_host(&self) -> Result<()> {
        tracing::info!("initializing Firecracker manager");
        self.network.ensure_bridge().await?;
        self.storage.ensure_vms_dir()?;
        Ok(())
    }

    /// Create a VM and boot its guest.
    ///
    /// Holds the registry write lock for the whole operation: creates are
    /// serialized against each other and against deletes, which keeps the
    /// one-record-per-id invariant and the rollback discipline trivial.
    pub async fn create_vm(&self, req: &pb::CreateVmRequest) -> Result<pb::VmInfo> {
        let mut vms = self.vms.write().await;

        if vms.contains_key(&req.vm_id) {
            return Err(AgentError::AlreadyExists(req.vm_id.clone()));
        }

        tracing::info!(vm_id = %req.vm_id, "creating VM");

        // Request overrides beat configured defaults.
        let kernel_path = if req.kernel_path.is_empty() {
            PathBuf::from(&self.cfg.firecracker.kernel_path)
        } else {
            PathBuf::from(&req.kernel_path)
        };
        let rootfs_path = if req.rootfs_path.is_empty() {
            PathBuf::from(&self.cfg.firecracker.rootfs_path)
        } else {
            PathBuf::from(&req.rootfs_path)
        };

        let mut unwind = Unwind::default();
        match self
            .provision(req, &kernel_path, &rootfs_path, &mut unwind)
            .await
        {
            Ok((storage, process, tap_device)) => {
                let info = pb::VmInfo {
                    vm_id: req.vm_id.clone(),
                    state: pb::VmState::Running as i32,
                    vcpu_count: req.vcpu_count,
                    memory_mib: req.memory_mib,
                    ip_address: req.ip_address.clone(),
                    socket_path: storage.socket_path.to_string_lossy().to_string(),
                    created_at: now_unix(),
                    metadata: req.metadata.clone(),
                };

                vms.insert(
                    req.vm_id.clone(),
                    VmRecord {
                        info: info.clone(),
                        process,
                        tap_device: tap_device.clone(),
                    },
                );

                metrics::VMS_CREATED.inc();
                metrics::VMS_RUNNING.set(running_count(&vms) as f64);

                tracing::info!(
                    vm_id = %req.vm_id,
                    vcpus = req.vcpu_count,
                    memory_mib = req.memory_mib,
                    tap_device = %tap_device,
                    "VM created successfully"
                );

                self.publish(
                    &req.vm_id,
                    pb::VmState::Running,
                    pb::EventType::Created,
                    "VM created successfully",
                );

                Ok(info)
            }
            Err(e) => {
                tracing::error!(vm_id = %req.vm_id, error = %e, "VM creation failed, rolling back");
                unwind.run(self).await;
                Err(e)
            }
        }
    }

    /// Acquire storage, network, and the supervised process, then run the
    /// configuration handshake. Registers each acquired resource on the
    /// unwind stack before moving on.
    async fn provision(
        &self,
        req: &pb::CreateVmRequest,
        kernel_path: &Path,
        rootfs_path: &Path,
        unwind: &mut Unwind,
    ) -> Result<(VmStorage, VmProcess, String)> {
        let vm_id = &req.vm_id;

        let (jail, storage) = if self.cfg.firecracker.use_jailer {
            tracing::info!(vm_id = %vm_id, "using Firecracker jailer for isolation");
            unwind.jail_vm = Some(vm_id.clone());
            unwind.storage_vm = Some(vm_id.clone());
            let (jail, storage) = self
                .storage
                .setup_jail(
                    vm_id,
                    kernel_path,
                    rootfs_path,
                    Path::new(&self.cfg.firecracker.binary_path),
                    self.cfg.firecracker.jail_uid,
                    self.cfg.firecracker.jail_gid,
                )
                .await?;
            (Some(jail), storage)
        } else {
            tracing::warn!(vm_id = %vm_id, "running Firecracker without jailer");
            unwind.storage_vm = Some(vm_id.clone());
            let storage = self
                .storage
                .prepare_vm_storage(vm_id, kernel_path, rootfs_path)
                .await?;
            (None, storage)
        };

        let tap_device = self.network.create_tap(vm_id).await?;
        unwind.tap = Some(tap_device.clone());

        let mac_address = self.network.generate_mac(vm_id);

        let process = match &jail {
            Some(jail) => {
                process::start_jailed(&self.cfg.firecracker.jailer_path, vm_id, jail, &storage)
                    .await?
            }
            None => {
                process::start_direct(
                    &self.cfg.firecracker.binary_path,
                    &storage.socket_path,
                    &storage.log_path,
                )
                .await?
            }
        };

        if let Err(e) = self
            .configure_and_boot(&process, &storage, req, &tap_device, &mac_address)
            .await
        {
            // Killing the process tears down whatever the monitor held; no
            // extra unwind entries for individual handshake steps.
            unwind.process = Some(process);
            return Err(e);
        }

        Ok((storage, process, tap_device))
    }

    /// The fixed configuration sequence. Order matters: the monitor
    /// validates referenced resources at InstanceStart.
    async fn configure_and_boot(
        &self,
        process: &VmProcess,
        storage: &VmStorage,
        req: &pb::CreateVmRequest,
        tap_device: &str,
        mac_address: &str,
    ) -> Result<()> {
        let client = &process.client;
        let boot_args = self.build_boot_args(&req.ip_address);

        client
            .set_boot_source(
                storage.kernel_path.to_string_lossy().to_string(),
                Some(boot_args),
            )
            .await?;

        client
            .set_machine_config(req.vcpu_count, req.memory_mib)
            .await?;

        client
            .add_drive(
                "rootfs",
                storage.rootfs_path.to_string_lossy().to_string(),
                true,
                false,
            )
            .await?;

        client
            .add_network_interface("eth0", tap_device, Some(mac_address.to_string()))
            .await?;

        client.start_instance().await
    }

    /// Kernel command line for the guest. With an assigned address the guest
    /// gets a static `ip=` stanza pointing at the bridge gateway.
    fn build_boot_args(&self, ip_address: &str) -> String {
        if ip_address.is_empty() {
            return DEFAULT_BOOT_ARGS.to_string();
        }

        let gateway = self
            .network
            .bridge_ip()
            .map(extract_gateway_ip)
            .unwrap_or_default();

        format!(
            "{} ip={}:{}:{}:255.255.255.0::eth0:off",
            DEFAULT_BOOT_ARGS, ip_address, gateway, gateway
        )
    }

    /// Start an existing VM.
    ///
    /// Firecracker cannot restart a guest whose vCPUs have exited: if the
    /// supervisor is still running this is an idempotent success, otherwise
    /// the VM must be recreated.
    pub async fn start_vm(&self, vm_id: &str) -> Result<()> {
        let vms = self.vms.read().await;
        let record = vms
            .get(vm_id)
            .ok_or_else(|| AgentError::NotFound(vm_id.to_string()))?;

        if record.process.is_running() {
            tracing::info!(vm_id = %vm_id, "VM is already running");
            drop(vms);
            self.publish(vm_id, pb::VmState::Running, pb::EventType::Started, "VM started");
            return Ok(());
        }

        Err(AgentError::NotSupported(format!(
            "VM {} cannot be restarted; Firecracker VMs must be recreated",
            vm_id
        )))
    }

    /// Stop a running VM, gracefully unless forced. The record stays in the
    /// registry with state Stopped.
    pub async fn stop_vm(&self, vm_id: &str, force: bool) -> Result<()> {
        let vms = self.vms.read().await;
        let record = vms
            .get(vm_id)
            .ok_or_else(|| AgentError::NotFound(vm_id.to_string()))?;

        tracing::info!(vm_id = %vm_id, force = force, "stopping VM");

        if force {
            record.process.kill().await;
        } else {
            match record.process.client.send_ctrl_alt_del().await {
                Ok(()) => {
                    tokio::time::sleep(GRACEFUL_SHUTDOWN_WAIT).await;
                    record.process.stop().await;
                }
                Err(e) => {
                    tracing::warn!(vm_id = %vm_id, error = %e, "Ctrl+Alt+Del failed, forcing kill");
                    record.process.kill().await;
                }
            }
        }

        drop(vms);

        let mut vms = self.vms.write().await;
        if let Some(record) = vms.get_mut(vm_id) {
            record.info.state = pb::VmState::Stopped as i32;
        }
        metrics::VMS_RUNNING.set(running_count(&vms) as f64);
        drop(vms);

        self.publish(vm_id, pb::VmState::Stopped, pb::EventType::Stopped, "VM stopped");
        Ok(())
    }

    /// Delete a VM and release its resources: supervisor, TAP, jail tree,
    /// storage tree, in that order. Cleanup failures are logged, not
    /// propagated, so the id becomes reusable.
    pub async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        let mut vms = self.vms.write().await;
        let record = vms
            .get(vm_id)
            .ok_or_else(|| AgentError::NotFound(vm_id.to_string()))?;

        tracing::info!(vm_id = %vm_id, "deleting VM");

        record.process.kill().await;

        if let Err(e) = self.network.delete_tap(&record.tap_device).await {
            tracing::warn!(vm_id = %vm_id, error = %e, "failed to delete TAP device");
        }

        if record.process.mode() == ProcessMode::Jailed {
            if let Err(e) = self.storage.cleanup_jail(vm_id) {
                tracing::warn!(vm_id = %vm_id, error = %e, "failed to clean up jail directory");
            }
        }

        if let Err(e) = self.storage.cleanup_vm_storage(vm_id) {
            tracing::warn!(vm_id = %vm_id, error = %e, "failed to clean up VM storage");
        }

        vms.remove(vm_id);
        metrics::VMS_RUNNING.set(running_count(&vms) as f64);
        drop(vms);

        tracing::info!(vm_id = %vm_id, "VM deleted");
        self.publish(vm_id, pb::VmState::Deleting, pb::EventType::Deleted, "VM deleted");
        Ok(())
    }

    /// Observable info for one VM, with the state recomputed against the
    /// supervisor's liveness.
    pub async fn get_vm(&self, vm_id: &str) -> Result<pb::VmInfo> {
        let vms = self.vms.read().await;
        let record = vms
            .get(vm_id)
            .ok_or_else(|| AgentError::NotFound(vm_id.to_string()))?;
        Ok(project_info(record))
    }

    /// Observable info for every VM.
    pub async fn list_vms(&self) -> Vec<pb::VmInfo> {
        let vms = self.vms.read().await;
        vms.values().map(project_info).collect()
    }

    fn publish(&self, vm_id: &str, state: pb::VmState, event_type: pb::EventType, message: &str) {
        self.events.broadcast(pb::VmEvent {
            vm_id: vm_id.to_string(),
            state: state as i32,
            message: message.to_string(),
            timestamp: now_unix(),
            r#type: event_type as i32,
        });
    }
}

/// A projection never hands out the internal record. The recorded state is
/// advisory once the process has exited; detecting that here does not mutate
/// the record (mutation needs the write lock, on Stop or Delete).
fn project_info(record: &VmRecord) -> pb::VmInfo {
    let mut info = record.info.clone();
    if info.state == pb::VmState::Running as i32 && !record.process.is_running() {
        info.state = pb::VmState::Stopped as i32;
    }
    info
}

fn running_count(vms: &HashMap<String, VmRecord>) -> usize {
    vms.values()
        .filter(|record| {
            record.info.state == pb::VmState::Running as i32 && record.process.is_running()
        })
        .count()
}

/// IP portion of a CIDR string ("172.16.0.1/24" -> "172.16.0.1"). Falls back
/// to the raw value when it does not parse.
fn extract_gateway_ip(cidr: &str) -> String {
    match cidr.split_once('/') {
        Some((ip, _)) if ip.parse::<std::net::IpAddr>().is_ok() => ip.to_string(),
        _ => {
            tracing::warn!(cidr = %cidr, "failed to parse bridge CIDR, using raw value");
            cidr.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn manager_with(bridge_ip: Option<&str>) -> Manager {
        let mut cfg = Config::default();
        cfg.network.bridge_ip = bridge_ip.map(|s| s.to_string());
        Manager::new(Arc::new(cfg), Arc::new(EventBus::new()))
    }

    #[test]
    fn test_extract_gateway_ip() {
        assert_eq!(extract_gateway_ip("172.16.0.1/24"), "172.16.0.1");
        assert_eq!(extract_gateway_ip("10.0.0.254/16"), "10.0.0.254");
        // Unparseable values pass through untouched.
        assert_eq!(extract_gateway_ip("not-a-cidr"), "not-a-cidr");
    }

    #[test]
    fn test_boot_args_without_ip() {
        let m = manager_with(Some("172.16.0.1/24"));
        assert_eq!(
            m.build_boot_args(""),
            "console=ttyS0 reboot=k panic=1 pci=off"
        );
    }

    #[test]
    fn test_boot_args_with_ip() {
        let m = manager_with(Some("172.16.0.1/24"));
        assert_eq!(
            m.build_boot_args("172.16.0.10"),
            "console=ttyS0 reboot=k panic=1 pci=off \
             ip=172.16.0.10:172.16.0.1:172.16.0.1:255.255.255.0::eth0:off"
        );
    }

    #[test]
    fn test_boot_args_without_bridge_ip() {
        let m = manager_with(None);
        assert_eq!(
            m.build_boot_args("172.16.0.10"),
            "console=ttyS0 reboot=k panic=1 pci=off ip=172.16.0.10:::255.255.255.0::eth0:off"
        );
    }
}
