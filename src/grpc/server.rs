//! FirecrackerAgent service implementation.
//!
//! Thin layer over the VM manager: validates requests, maps orchestrator
//! errors onto gRPC statuses, publishes error events for failed mutations,
//! and bridges the event bus into server-streaming watchers.

use std::sync::Arc;
use std::time::Instant;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::error::AgentError;
use crate::events::{now_unix, EventBus};
use crate::metrics;
use crate::vm::Manager;
use crate::VERSION;

use super::pb;
use super::pb::firecracker_agent_server::FirecrackerAgent;

/// Upper bound on vCPUs per VM.
const MAX_VCPUS: i32 = 32;

/// Minimum guest memory in MiB.
const MIN_MEMORY_MIB: i32 = 128;

/// The agent's gRPC service.
pub struct AgentService {
    manager: Arc<Manager>,
    events: Arc<EventBus>,
    start_time: Instant,
}

impl AgentService {
    pub fn new(manager: Arc<Manager>, events: Arc<EventBus>, start_time: Instant) -> Self {
        Self {
            manager,
            events,
            start_time,
        }
    }

    fn publish_error(&self, vm_id: &str, error: &AgentError) {
        self.events.broadcast(pb::VmEvent {
            vm_id: vm_id.to_string(),
            state: pb::VmState::Error as i32,
            message: error.to_string(),
            timestamp: now_unix(),
            r#type: pb::EventType::Error as i32,
        });
    }
}

/// Record duration and outcome of a handled call.
fn observe(method: &str, start: Instant, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    metrics::GRPC_REQUESTS_TOTAL
        .with_label_values(&[method, status])
        .inc();
    metrics::VM_OPERATION_DURATION
        .with_label_values(&[method])
        .observe(start.elapsed().as_secs_f64());
    tracing::info!(method = method, status = status, duration = ?start.elapsed(), "gRPC call completed");
}

fn require_vm_id(vm_id: &str) -> Result<(), Status> {
    if vm_id.is_empty() {
        return Err(Status::invalid_argument("vm_id is required"));
    }
    Ok(())
}

#[tonic::async_trait]
impl FirecrackerAgent for AgentService {
    async fn create_vm(
        &self,
        request: Request<pb::CreateVmRequest>,
    ) -> Result<Response<pb::CreateVmResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        tracing::info!(vm_id = %req.vm_id, "CreateVm request");

        require_vm_id(&req.vm_id)?;
        if req.vcpu_count < 1 || req.vcpu_count > MAX_VCPUS {
            return Err(Status::invalid_argument(format!(
                "vcpu_count must be between 1 and {}",
                MAX_VCPUS
            )));
        }
        if req.memory_mib < MIN_MEMORY_MIB {
            return Err(Status::invalid_argument(format!(
                "memory_mib must be at least {}",
                MIN_MEMORY_MIB
            )));
        }

        // Detached task: a caller that cancels mid-create still ends up with
        // either a committed record or a completed rollback, never half of
        // one.
        let manager = self.manager.clone();
        let task_req = req.clone();
        let result = match tokio::spawn(async move { manager.create_vm(&task_req).await }).await {
            Ok(result) => result,
            Err(e) => return Err(Status::internal(format!("create task failed: {}", e))),
        };

        match result {
            Ok(info) => {
                observe("CreateVm", start, true);
                Ok(Response::new(pb::CreateVmResponse {
                    vm_id: info.vm_id,
                    state: info.state,
                    socket_path: info.socket_path,
                    created_at: info.created_at,
                    error_message: String::new(),
                }))
            }
            Err(e) => {
                tracing::error!(vm_id = %req.vm_id, error = %e, "failed to create VM");
                self.publish_error(&req.vm_id, &e);
                observe("CreateVm", start, false);
                Ok(Response::new(pb::CreateVmResponse {
                    vm_id: req.vm_id,
                    state: pb::VmState::Error as i32,
                    socket_path: String::new(),
                    created_at: 0,
                    error_message: e.to_string(),
                }))
            }
        }
    }

    async fn start_vm(
        &self,
        request: Request<pb::StartVmRequest>,
    ) -> Result<Response<pb::StartVmResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        tracing::info!(vm_id = %req.vm_id, "StartVm request");
        require_vm_id(&req.vm_id)?;

        match self.manager.start_vm(&req.vm_id).await {
            Ok(()) => {
                observe("StartVm", start, true);
                Ok(Response::new(pb::StartVmResponse {
                    vm_id: req.vm_id,
                    state: pb::VmState::Running as i32,
                }))
            }
            Err(e) => {
                tracing::error!(vm_id = %req.vm_id, error = %e, "failed to start VM");
                self.publish_error(&req.vm_id, &e);
                observe("StartVm", start, false);
                Err(e.into())
            }
        }
    }

    async fn stop_vm(
        &self,
        request: Request<pb::StopVmRequest>,
    ) -> Result<Response<pb::StopVmResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        tracing::info!(vm_id = %req.vm_id, force = req.force, "StopVm request");
        require_vm_id(&req.vm_id)?;

        let manager = self.manager.clone();
        let vm_id = req.vm_id.clone();
        let force = req.force;
        let result = match tokio::spawn(async move { manager.stop_vm(&vm_id, force).await }).await
        {
            Ok(result) => result,
            Err(e) => return Err(Status::internal(format!("stop task failed: {}", e))),
        };

        match result {
            Ok(()) => {
                observe("StopVm", start, true);
                Ok(Response::new(pb::StopVmResponse {
                    vm_id: req.vm_id,
                    state: pb::VmState::Stopped as i32,
                }))
            }
            Err(e) => {
                tracing::error!(vm_id = %req.vm_id, error = %e, "failed to stop VM");
                self.publish_error(&req.vm_id, &e);
                observe("StopVm", start, false);
                Err(e.into())
            }
        }
    }

    async fn delete_vm(
        &self,
        request: Request<pb::DeleteVmRequest>,
    ) -> Result<Response<pb::DeleteVmResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        tracing::info!(vm_id = %req.vm_id, "DeleteVm request");
        require_vm_id(&req.vm_id)?;

        // Detached for the same reason as create: resource release must run
        // to completion even if the caller goes away.
        let manager = self.manager.clone();
        let vm_id = req.vm_id.clone();
        let result = match tokio::spawn(async move { manager.delete_vm(&vm_id).await }).await {
            Ok(result) => result,
            Err(e) => return Err(Status::internal(format!("delete task failed: {}", e))),
        };

        match result {
            Ok(()) => {
                observe("DeleteVm", start, true);
                Ok(Response::new(pb::DeleteVmResponse {
                    vm_id: req.vm_id,
                    success: true,
                    error_message: String::new(),
                }))
            }
            Err(e) => {
                tracing::error!(vm_id = %req.vm_id, error = %e, "failed to delete VM");
                self.publish_error(&req.vm_id, &e);
                observe("DeleteVm", start, false);
                Ok(Response::new(pb::DeleteVmResponse {
                    vm_id: req.vm_id,
                    success: false,
                    error_message: e.to_string(),
                }))
            }
        }
    }

    async fn get_vm(
        &self,
        request: Request<pb::GetVmRequest>,
    ) -> Result<Response<pb::GetVmResponse>, Status> {
        let start = Instant::now();
        let req = request.into_inner();

        tracing::debug!(vm_id = %req.vm_id, "GetVm request");
        require_vm_id(&req.vm_id)?;

        match self.manager.get_vm(&req.vm_id).await {
            Ok(info) => {
                observe("GetVm", start, true);
                Ok(Response::new(pb::GetVmResponse { vm: Some(info) }))
            }
            Err(e) => {
                observe("GetVm", start, false);
                Err(e.into())
            }
        }
    }

    async fn list_vms(
        &self,
        _request: Request<pb::ListVmsRequest>,
    ) -> Result<Response<pb::ListVmsResponse>, Status> {
        let start = Instant::now();
        tracing::debug!("ListVms request");

        let vms = self.manager.list_vms().await;
        let total_count = vms.len() as i32;

        observe("ListVms", start, true);
        Ok(Response::new(pb::ListVmsResponse { vms, total_count }))
    }

    type WatchVmEventsStream = ReceiverStream<Result<pb::VmEvent, Status>>;

    async fn watch_vm_events(
        &self,
        request: Request<pb::WatchVmEventsRequest>,
    ) -> Result<Response<Self::WatchVmEventsStream>, Status> {
        let req = request.into_inner();
        let filter = req.vm_id;

        tracing::info!(vm_id_filter = %filter, "client watching VM events");

        let subscriber_id = format!("watch-{}", Uuid::now_v7());
        let mut bus_rx = self.events.subscribe(&subscriber_id);
        let events = self.events.clone();

        let (tx, rx) = tokio::sync::mpsc::channel(crate::events::EVENT_BUFFER);

        tokio::spawn(async move {
            while let Some(event) = bus_rx.recv().await {
                if !filter.is_empty() && event.vm_id != filter {
                    continue;
                }
                if tx.send(Ok(event)).await.is_err() {
                    // Client hung up.
                    break;
                }
            }
            events.unsubscribe(&subscriber_id);
            tracing::info!(subscriber_id = %subscriber_id, "event watcher closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_host_info(
        &self,
        _request: Request<pb::GetHostInfoRequest>,
    ) -> Result<Response<pb::GetHostInfoResponse>, Status> {
        tracing::debug!("GetHostInfo request");

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut sys = sysinfo::System::new_all();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let running_vms = self.manager.list_vms().await.len() as i32;

        Ok(Response::new(pb::GetHostInfoResponse {
            hostname,
            total_cpus: sys.cpus().len() as i32,
            total_memory_mib: (sys.total_memory() / 1024 / 1024) as i64,
            available_memory_mib: (sys.available_memory() / 1024 / 1024) as i64,
            running_vms,
            cpu_usage: sys.global_cpu_usage(),
            version: VERSION.to_string(),
        }))
    }

    async fn health_check(
        &self,
        _request: Request<pb::HealthCheckRequest>,
    ) -> Result<Response<pb::HealthCheckResponse>, Status> {
        Ok(Response::new(pb::HealthCheckResponse {
            healthy: true,
            version: VERSION.to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs() as i64,
        }))
    }
}
