//! Service-level tests for the agent.
//!
//! These exercise validation, error mapping, event streaming, and the
//! rollback guarantees of failed creates through the gRPC service without a
//! real Firecracker binary. Scenarios that boot an actual guest need root, a
//! bridge, and the firecracker binary, and are marked #[ignore].

use std::sync::Arc;
use std::time::Instant;

use tokio_stream::StreamExt;
use tonic::{Code, Request};

use fc_agent::config::Config;
use fc_agent::events::{now_unix, EventBus};
use fc_agent::grpc::pb;
use fc_agent::grpc::pb::firecracker_agent_server::FirecrackerAgent;
use fc_agent::grpc::server::AgentService;
use fc_agent::vm::Manager;

struct TestAgent {
    service: AgentService,
    events: Arc<EventBus>,
    _dir: tempfile::TempDir,
}

/// Agent wired to a scratch VMs directory, no jailer, no host setup.
fn test_agent() -> TestAgent {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config::default();
    cfg.firecracker.use_jailer = false;
    cfg.storage.vms_dir = dir.path().join("vms").to_string_lossy().to_string();
    cfg.network.tap_prefix = "fctest".to_string();

    let events = Arc::new(EventBus::new());
    let manager = Arc::new(Manager::new(Arc::new(cfg), events.clone()));
    let service = AgentService::new(manager, events.clone(), Instant::now());

    TestAgent {
        service,
        events,
        _dir: dir,
    }
}

fn create_request(vm_id: &str, vcpu_count: i32, memory_mib: i32) -> pb::CreateVmRequest {
    pb::CreateVmRequest {
        vm_id: vm_id.to_string(),
        vcpu_count,
        memory_mib,
        ip_address: String::new(),
        kernel_path: String::new(),
        rootfs_path: String::new(),
        metadata: Default::default(),
    }
}

fn event(vm_id: &str, event_type: pb::EventType) -> pb::VmEvent {
    pb::VmEvent {
        vm_id: vm_id.to_string(),
        state: pb::VmState::Running as i32,
        message: "VM created successfully".to_string(),
        timestamp: now_unix(),
        r#type: event_type as i32,
    }
}

#[tokio::test]
async fn test_create_validation_boundaries() {
    let agent = test_agent();

    // Rejected outright.
    for (vm_id, vcpu, mem) in [
        ("", 2, 512),
        ("vm-1", 0, 512),
        ("vm-1", 33, 512),
        ("vm-1", 2, 127),
    ] {
        let status = agent
            .service
            .create_vm(Request::new(create_request(vm_id, vcpu, mem)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument, "{:?}", (vm_id, vcpu, mem));
    }

    // Boundary values pass validation; they then fail inside the
    // orchestrator (no kernel configured) with the error embedded in the
    // response instead of an InvalidArgument status.
    for (vcpu, mem) in [(1, 128), (32, 128)] {
        let response = agent
            .service
            .create_vm(Request::new(create_request("vm-boundary", vcpu, mem)))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.state, pb::VmState::Error as i32);
        assert!(!response.error_message.is_empty());
        assert!(!response.error_message.contains("must be"));
    }
}

#[tokio::test]
async fn test_failed_create_leaves_nothing_behind() {
    let agent = test_agent();
    let mut rx = agent.events.subscribe("observer");

    let response = agent
        .service
        .create_vm(Request::new(create_request("vm-unwind", 2, 512)))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.vm_id, "vm-unwind");
    assert_eq!(response.state, pb::VmState::Error as i32);
    assert!(!response.error_message.is_empty());

    // No registry entry.
    let status = agent
        .service
        .get_vm(Request::new(pb::GetVmRequest {
            vm_id: "vm-unwind".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    // No storage tree.
    assert!(!agent._dir.path().join("vms").join("vm-unwind").exists());
    assert!(!agent
        ._dir
        .path()
        .join("vms")
        .join("firecracker")
        .join("vm-unwind")
        .exists());

    // An Error event was published for the failed mutation.
    let published = rx.recv().await.unwrap();
    assert_eq!(published.vm_id, "vm-unwind");
    assert_eq!(published.r#type, pb::EventType::Error as i32);
}

#[tokio::test]
async fn test_unknown_vm_mappings() {
    let agent = test_agent();

    let status = agent
        .service
        .get_vm(Request::new(pb::GetVmRequest {
            vm_id: "ghost".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let status = agent
        .service
        .stop_vm(Request::new(pb::StopVmRequest {
            vm_id: "ghost".to_string(),
            force: false,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let status = agent
        .service
        .start_vm(Request::new(pb::StartVmRequest {
            vm_id: "ghost".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    // Delete reports the failure in the response body.
    let response = agent
        .service
        .delete_vm(Request::new(pb::DeleteVmRequest {
            vm_id: "ghost".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!response.success);
    assert!(response.error_message.contains("not found"));
}

#[tokio::test]
async fn test_empty_vm_id_rejected_everywhere() {
    let agent = test_agent();

    assert_eq!(
        agent
            .service
            .start_vm(Request::new(pb::StartVmRequest { vm_id: String::new() }))
            .await
            .unwrap_err()
            .code(),
        Code::InvalidArgument
    );
    assert_eq!(
        agent
            .service
            .stop_vm(Request::new(pb::StopVmRequest {
                vm_id: String::new(),
                force: true,
            }))
            .await
            .unwrap_err()
            .code(),
        Code::InvalidArgument
    );
    assert_eq!(
        agent
            .service
            .delete_vm(Request::new(pb::DeleteVmRequest { vm_id: String::new() }))
            .await
            .unwrap_err()
            .code(),
        Code::InvalidArgument
    );
    assert_eq!(
        agent
            .service
            .get_vm(Request::new(pb::GetVmRequest { vm_id: String::new() }))
            .await
            .unwrap_err()
            .code(),
        Code::InvalidArgument
    );
}

#[tokio::test]
async fn test_list_vms_empty() {
    let agent = test_agent();

    let response = agent
        .service
        .list_vms(Request::new(pb::ListVmsRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.total_count, 0);
    assert!(response.vms.is_empty());
}

#[tokio::test]
async fn test_health_check() {
    let agent = test_agent();

    let response = agent
        .service
        .health_check(Request::new(pb::HealthCheckRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert!(response.healthy);
    assert_eq!(response.version, fc_agent::VERSION);
    assert!(response.uptime_seconds >= 0);
}

#[tokio::test]
async fn test_get_host_info() {
    let agent = test_agent();

    let response = agent
        .service
        .get_host_info(Request::new(pb::GetHostInfoRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert!(!response.hostname.is_empty());
    assert!(response.total_cpus >= 1);
    assert!(response.total_memory_mib > 0);
    assert!(response.available_memory_mib <= response.total_memory_mib);
    assert_eq!(response.running_vms, 0);
    assert_eq!(response.version, fc_agent::VERSION);
}

#[tokio::test]
async fn test_watch_filters_by_vm_id() {
    let agent = test_agent();

    let mut stream = agent
        .service
        .watch_vm_events(Request::new(pb::WatchVmEventsRequest {
            vm_id: "vm-A".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();

    // The watcher task subscribes before the call returns, so these are
    // seen by the bus.
    agent.events.broadcast(event("vm-B", pb::EventType::Created));
    agent.events.broadcast(event("vm-A", pb::EventType::Created));

    let received = stream.next().await.unwrap().unwrap();
    assert_eq!(received.vm_id, "vm-A");
    assert_eq!(received.r#type, pb::EventType::Created as i32);

    // Nothing else is pending: the vm-B event was filtered out.
    let nothing =
        tokio::time::timeout(std::time::Duration::from_millis(200), stream.next()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_watch_empty_filter_receives_all() {
    let agent = test_agent();

    let mut stream = agent
        .service
        .watch_vm_events(Request::new(pb::WatchVmEventsRequest {
            vm_id: String::new(),
        }))
        .await
        .unwrap()
        .into_inner();

    agent.events.broadcast(event("vm-B", pb::EventType::Created));
    agent.events.broadcast(event("vm-A", pb::EventType::Stopped));

    assert_eq!(stream.next().await.unwrap().unwrap().vm_id, "vm-B");
    assert_eq!(stream.next().await.unwrap().unwrap().vm_id, "vm-A");
}

#[tokio::test]
async fn test_watcher_unsubscribes_after_client_disconnect() {
    let agent = test_agent();

    let stream = agent
        .service
        .watch_vm_events(Request::new(pb::WatchVmEventsRequest {
            vm_id: String::new(),
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(agent.events.subscriber_count(), 1);
    drop(stream);

    // The next broadcast makes the forwarding task notice the hangup.
    agent.events.broadcast(event("vm-X", pb::EventType::Created));

    let mut cleaned = false;
    for _ in 0..50 {
        if agent.events.subscriber_count() == 0 {
            cleaned = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(cleaned, "watcher should unsubscribe once the client is gone");
}

/// Full lifecycle against a real Firecracker binary. Needs root, iproute2,
/// and firecracker/kernel/rootfs paths in the environment.
#[tokio::test]
#[ignore]
async fn test_full_lifecycle_direct_mode() {
    let binary = std::env::var("FC_AGENT_TEST_FIRECRACKER").expect("firecracker path");
    let kernel = std::env::var("FC_AGENT_TEST_KERNEL").expect("kernel path");
    let rootfs = std::env::var("FC_AGENT_TEST_ROOTFS").expect("rootfs path");

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config::default();
    cfg.firecracker.use_jailer = false;
    cfg.firecracker.binary_path = binary;
    cfg.firecracker.kernel_path = kernel;
    cfg.firecracker.rootfs_path = rootfs;
    cfg.storage.vms_dir = dir.path().join("vms").to_string_lossy().to_string();

    let events = Arc::new(EventBus::new());
    let manager = Arc::new(Manager::new(Arc::new(cfg), events.clone()));
    manager.init_host().await.unwrap();
    let service = AgentService::new(manager, events, Instant::now());

    let created = service
        .create_vm(Request::new(create_request("vm-e2e", 2, 512)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(created.state, pb::VmState::Running as i32);
    assert!(created.socket_path.ends_with("vm-e2e/firecracker.socket"));

    let listed = service
        .list_vms(Request::new(pb::ListVmsRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.total_count, 1);

    // Duplicate create must not disturb the existing VM.
    let dup = service
        .create_vm(Request::new(create_request("vm-e2e", 1, 256)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(dup.state, pb::VmState::Error as i32);
    assert!(dup.error_message.contains("already exists"));

    let deleted = service
        .delete_vm(Request::new(pb::DeleteVmRequest {
            vm_id: "vm-e2e".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(deleted.success);
    assert!(!dir.path().join("vms").join("vm-e2e").exists());
}
