//! Firecracker process supervision.
//!
//! Spawns the monitor either directly or through its jailer, waits for the
//! control socket to appear, and reaps the child from a background task so a
//! VM that dies on its own never leaves a zombie. Termination escalates from
//! SIGTERM to SIGKILL.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{AgentError, Result};
use crate::storage::{JailLayout, VmStorage};

use super::client::FirecrackerClient;

/// How long to wait for the control socket in direct mode.
pub const DIRECT_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the control socket in jailed mode; building the
/// chroot and entering the cgroup takes noticeably longer.
pub const JAILED_SOCKET_TIMEOUT: Duration = Duration::from_secs(20);

/// Interval between socket existence checks.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period after SIGTERM before escalating to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Short pause after SIGKILL so the background reaper can run.
const REAP_WAIT: Duration = Duration::from_millis(100);

/// Pause after spawning the jailer before checking it survived startup.
const JAILER_STARTUP_WAIT: Duration = Duration::from_millis(500);

/// How the monitor process was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    Direct,
    Jailed,
}

/// A supervised Firecracker process.
///
/// The OS child handle is owned by the reaper task; the supervisor observes
/// and signals the process by pid.
#[derive(Debug)]
pub struct VmProcess {
    pid: i32,
    socket_path: PathBuf,
    mode: ProcessMode,
    /// Jail id directory, kept for post-mortem awareness when jailed.
    jail_dir: Option<PathBuf>,
    /// Control API client bound to this process's socket.
    pub client: FirecrackerClient,
}

impl VmProcess {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    pub fn jail_dir(&self) -> Option<&Path> {
        self.jail_dir.as_deref()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// True while the process exists (signal 0 delivery succeeds).
    pub fn is_running(&self) -> bool {
        unsafe { libc::kill(self.pid, 0) == 0 }
    }

    /// Graceful stop: SIGTERM, poll up to the grace period, then SIGKILL.
    /// Removes the socket file afterwards.
    pub async fn stop(&self) {
        tracing::info!(pid = self.pid, "stopping Firecracker process");

        if unsafe { libc::kill(self.pid, libc::SIGTERM) } != 0 {
            // Already gone.
            self.remove_socket();
            return;
        }

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while tokio::time::Instant::now() < deadline {
            if !self.is_running() {
                tracing::info!(pid = self.pid, "Firecracker process stopped gracefully");
                self.remove_socket();
                return;
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        tracing::warn!(pid = self.pid, "SIGTERM grace expired, forcing kill");
        unsafe { libc::kill(self.pid, libc::SIGKILL) };
        tokio::time::sleep(REAP_WAIT).await;
        self.remove_socket();
    }

    /// Immediate SIGKILL, then a short pause so the reaper can collect the
    /// exit status. Removes the socket file.
    pub async fn kill(&self) {
        tracing::info!(pid = self.pid, "killing Firecracker process");

        if unsafe { libc::kill(self.pid, libc::SIGKILL) } != 0 {
            tracing::debug!(pid = self.pid, "process already gone");
        }
        tokio::time::sleep(REAP_WAIT).await;
        self.remove_socket();
    }

    fn remove_socket(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "failed to remove socket file"
                );
            }
        }
    }
}

/// Start the monitor directly (no jailer).
///
/// The child runs in its own process group with stdout/stderr appended to
/// the VM's log file. Returns once the control socket exists.
pub async fn start_direct(
    binary_path: &str,
    socket_path: &Path,
    log_path: &Path,
) -> Result<VmProcess> {
    tracing::info!(
        binary = %binary_path,
        socket = %socket_path.display(),
        log = %log_path.display(),
        "starting Firecracker process"
    );

    let _ = std::fs::remove_file(socket_path);
    let log_file = open_log(log_path)?;
    let log_clone = log_file
        .try_clone()
        .map_err(AgentError::SupervisorSpawn)?;

    let mut child = Command::new(binary_path)
        .arg("--api-sock")
        .arg(socket_path)
        .arg("--log-path")
        .arg(log_path)
        .arg("--level")
        .arg("Info")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_clone))
        .process_group(0)
        .spawn()
        .map_err(AgentError::SupervisorSpawn)?;

    let pid = child_pid(&child)?;
    spawn_reaper(child, pid);

    tracing::info!(pid = pid, socket = %socket_path.display(), "Firecracker process started");

    if let Err(e) = wait_for_socket(socket_path, DIRECT_SOCKET_TIMEOUT).await {
        kill_and_scrub(pid, socket_path);
        return Err(AgentError::SupervisorNotReady(format!(
            "{}; log tail: {}",
            e,
            log_tail(log_path)
        )));
    }

    Ok(VmProcess {
        pid,
        socket_path: socket_path.to_path_buf(),
        mode: ProcessMode::Direct,
        jail_dir: None,
        client: FirecrackerClient::new(socket_path.to_string_lossy().to_string()),
    })
}

/// Start the monitor through the Firecracker jailer.
///
/// The jail tree must already be staged (see `StorageManager::setup_jail`);
/// the jailer chroots into it, drops to the configured uid/gid, enters a v2
/// cgroup, and execs the copied monitor binary.
pub async fn start_jailed(
    jailer_path: &str,
    vm_id: &str,
    jail: &JailLayout,
    storage: &VmStorage,
) -> Result<VmProcess> {
    tracing::info!(
        jailer = %jailer_path,
        vm_id = %vm_id,
        uid = jail.uid,
        gid = jail.gid,
        "starting Firecracker with jailer"
    );

    let log_file = open_log(&storage.log_path)?;
    let log_clone = log_file
        .try_clone()
        .map_err(AgentError::SupervisorSpawn)?;

    let mut child = Command::new(jailer_path)
        .arg("--id")
        .arg(vm_id)
        .arg("--uid")
        .arg(jail.uid.to_string())
        .arg("--gid")
        .arg(jail.gid.to_string())
        .arg("--chroot-base-dir")
        .arg(&jail.base_dir)
        .arg("--exec-file")
        .arg(&jail.exec_file)
        .arg("--cgroup-version")
        .arg("2")
        .arg("--")
        .arg("--api-sock")
        .arg("/run/firecracker.socket")
        .arg("--boot-timer")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_clone))
        .process_group(0)
        .spawn()
        .map_err(AgentError::SupervisorSpawn)?;

    let pid = child_pid(&child)?;
    spawn_reaper(child, pid);

    tracing::info!(pid = pid, vm_id = %vm_id, "jailer started, waiting for socket");

    // The jailer fails fast on bad arguments or a missing chroot tree; catch
    // that before settling into the socket poll.
    tokio::time::sleep(JAILER_STARTUP_WAIT).await;
    if unsafe { libc::kill(pid, 0) } != 0 {
        return Err(AgentError::SupervisorNotReady(format!(
            "jailer exited immediately; log tail: {}",
            log_tail(&storage.log_path)
        )));
    }

    if let Err(e) = wait_for_socket(&storage.socket_path, JAILED_SOCKET_TIMEOUT).await {
        kill_and_scrub(pid, &storage.socket_path);
        return Err(AgentError::SupervisorNotReady(format!(
            "{}; jailer log tail: {}",
            e,
            log_tail(&storage.log_path)
        )));
    }

    tracing::info!(socket = %storage.socket_path.display(), "socket ready, jailer initialized");

    Ok(VmProcess {
        pid,
        socket_path: storage.socket_path.clone(),
        mode: ProcessMode::Jailed,
        jail_dir: Some(jail.id_dir.clone()),
        client: FirecrackerClient::new(storage.socket_path.to_string_lossy().to_string()),
    })
}

/// Poll for a socket file to appear, checking every 100 ms.
pub async fn wait_for_socket(socket_path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if socket_path.exists() {
            return Ok(());
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }

    Err(AgentError::SupervisorNotReady(format!(
        "timeout waiting for socket {}",
        socket_path.display()
    )))
}

fn open_log(log_path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(AgentError::SupervisorSpawn)
}

fn child_pid(child: &tokio::process::Child) -> Result<i32> {
    child
        .id()
        .map(|pid| pid as i32)
        .ok_or_else(|| {
            AgentError::SupervisorSpawn(std::io::Error::other("spawned child has no pid"))
        })
}

/// Wait on the child from a background task so it is reaped no matter how
/// the VM exits.
fn spawn_reaper(mut child: tokio::process::Child, pid: i32) {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::info!(pid = pid, "Firecracker process exited cleanly");
            }
            Ok(status) => {
                tracing::warn!(pid = pid, status = %status, "Firecracker process exited");
            }
            Err(e) => {
                tracing::warn!(pid = pid, error = %e, "failed to wait on Firecracker process");
            }
        }
    });
}

fn kill_and_scrub(pid: i32, socket_path: &Path) {
    unsafe { libc::kill(pid, libc::SIGKILL) };
    let _ = std::fs::remove_file(socket_path);
}

/// Last portion of the child's log, for embedding in readiness errors.
fn log_tail(log_path: &Path) -> String {
    const TAIL_BYTES: usize = 2048;
    match std::fs::read(log_path) {
        Ok(contents) => {
            let start = contents.len().saturating_sub(TAIL_BYTES);
            String::from_utf8_lossy(&contents[start..]).trim().to_string()
        }
        Err(_) => String::from("<no log>"),
    }
}
