//! Per-VM storage layout.
//!
//! Stages kernel and rootfs images into a per-VM directory, either by copy or
//! as a qcow2 copy-on-write overlay, and builds the chroot tree consumed by
//! the Firecracker jailer. Teardown is recursive and tolerates trees that are
//! already gone.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::{AgentError, Result};

/// Paths of a prepared VM storage tree.
///
/// In jailed mode `kernel_path` and `rootfs_path` are the paths the monitor
/// sees inside its chroot, while `socket_path` stays host-visible.
#[derive(Debug, Clone)]
pub struct VmStorage {
    pub vm_dir: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
}

/// Layout of a jail built for the Firecracker jailer.
///
/// The jailer chroots into `root_dir`; the monitor binary, kernel, and
/// rootfs are staged inside it before privileges are dropped.
#[derive(Debug, Clone)]
pub struct JailLayout {
    /// Directory passed to the jailer as `--chroot-base-dir`.
    pub base_dir: PathBuf,
    /// `<base_dir>/firecracker/<vm_id>`, removed wholesale on cleanup.
    pub id_dir: PathBuf,
    /// `<id_dir>/root`, the chroot root.
    pub root_dir: PathBuf,
    /// Host-visible path of the monitor binary copied into the jail; the
    /// jailer re-resolves it after chrooting.
    pub exec_file: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

/// Manages per-VM storage trees under a common root.
pub struct StorageManager {
    vms_dir: PathBuf,
    use_overlay: bool,
}

impl StorageManager {
    pub fn new(vms_dir: impl Into<PathBuf>, use_overlay: bool) -> Self {
        Self {
            vms_dir: vms_dir.into(),
            use_overlay,
        }
    }

    pub fn vms_dir(&self) -> &Path {
        &self.vms_dir
    }

    /// Create the VMs root directory if missing.
    pub fn ensure_vms_dir(&self) -> Result<()> {
        create_dir_0755(&self.vms_dir).map_err(|e| {
            AgentError::StorageSetup(format!(
                "failed to create VMs directory {}: {}",
                self.vms_dir.display(),
                e
            ))
        })
    }

    /// Directory holding a VM's files in non-jailed mode (and its log file
    /// in jailed mode).
    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.vms_dir.join(vm_id)
    }

    /// Jail id directory for a VM: `<vms_dir>/firecracker/<vm_id>`.
    pub fn jail_id_dir(&self, vm_id: &str) -> PathBuf {
        self.vms_dir.join("firecracker").join(vm_id)
    }

    /// Prepare storage for a VM running without the jailer.
    ///
    /// With overlays enabled the kernel is referenced in place and the
    /// rootfs becomes a qcow2 image backed by the shared raw image;
    /// otherwise both are copied into the VM directory.
    pub async fn prepare_vm_storage(
        &self,
        vm_id: &str,
        kernel_src: &Path,
        rootfs_src: &Path,
    ) -> Result<VmStorage> {
        let vm_dir = self.vm_dir(vm_id);

        tracing::info!(vm_id = %vm_id, vm_dir = %vm_dir.display(), "preparing VM storage");

        create_dir_0755(&vm_dir).map_err(|e| {
            AgentError::StorageSetup(format!(
                "failed to create VM directory {}: {}",
                vm_dir.display(),
                e
            ))
        })?;

        let kernel_path = if self.use_overlay {
            // Shared kernel, referenced in place.
            kernel_src.to_path_buf()
        } else {
            let dst = vm_dir.join("vmlinux.bin");
            copy_file(kernel_src, &dst).await?;
            dst
        };

        let rootfs_path = vm_dir.join("rootfs.ext4");
        if self.use_overlay {
            self.create_overlay(rootfs_src, &rootfs_path, &vm_dir).await?;
        } else {
            copy_file(rootfs_src, &rootfs_path).await?;
        }

        let storage = VmStorage {
            socket_path: vm_dir.join("firecracker.socket"),
            log_path: vm_dir.join("firecracker.log"),
            vm_dir,
            kernel_path,
            rootfs_path,
        };

        tracing::info!(
            vm_id = %vm_id,
            kernel_path = %storage.kernel_path.display(),
            rootfs_path = %storage.rootfs_path.display(),
            "VM storage prepared"
        );

        Ok(storage)
    }

    /// Build the chroot tree for a jailed VM and stage the monitor binary,
    /// kernel, and rootfs inside it.
    ///
    /// Files are copied and chowned before the jailer drops privileges;
    /// chown failures are logged and tolerated. Returns the jail layout and
    /// a [`VmStorage`] whose kernel/rootfs paths are chroot-relative.
    pub async fn setup_jail(
        &self,
        vm_id: &str,
        kernel_src: &Path,
        rootfs_src: &Path,
        firecracker_binary: &Path,
        uid: u32,
        gid: u32,
    ) -> Result<(JailLayout, VmStorage)> {
        verify_source_file(firecracker_binary, "firecracker binary")?;
        verify_source_file(kernel_src, "kernel")?;
        verify_source_file(rootfs_src, "rootfs")?;

        let id_dir = self.jail_id_dir(vm_id);
        let root_dir = id_dir.join("root");
        let run_dir = root_dir.join("run");

        tracing::info!(
            vm_id = %vm_id,
            root_dir = %root_dir.display(),
            "preparing jail directory"
        );

        for dir in [&root_dir, &run_dir] {
            create_dir_0755(dir).map_err(|e| {
                AgentError::StorageSetup(format!(
                    "failed to create jail directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        // The log lives outside the chroot so it survives jail teardown
        // ordering and stays readable by the agent.
        let vm_dir = self.vm_dir(vm_id);
        create_dir_0755(&vm_dir).map_err(|e| {
            AgentError::StorageSetup(format!(
                "failed to create VM directory {}: {}",
                vm_dir.display(),
                e
            ))
        })?;

        let jailed_binary = root_dir.join("firecracker");
        let jailed_kernel = root_dir.join("vmlinux");
        let jailed_rootfs = root_dir.join("rootfs.ext4");

        copy_file(firecracker_binary, &jailed_binary).await?;
        copy_file(kernel_src, &jailed_kernel).await?;
        copy_file(rootfs_src, &jailed_rootfs).await?;

        for path in [&root_dir, &run_dir, &jailed_binary, &jailed_kernel, &jailed_rootfs] {
            if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
                tracing::warn!(path = %path.display(), error = %e, "failed to chown jail path");
            }
        }

        // Stale socket from a previous VM with the same id.
        let socket_path = run_dir.join("firecracker.socket");
        let _ = std::fs::remove_file(&socket_path);

        let layout = JailLayout {
            base_dir: self.vms_dir.clone(),
            id_dir: id_dir.clone(),
            root_dir,
            exec_file: jailed_binary,
            uid,
            gid,
        };

        let storage = VmStorage {
            vm_dir: id_dir,
            kernel_path: PathBuf::from("/vmlinux"),
            rootfs_path: PathBuf::from("/rootfs.ext4"),
            socket_path,
            log_path: vm_dir.join("firecracker.log"),
        };

        Ok((layout, storage))
    }

    /// Remove a VM's storage tree. Missing trees are not an error.
    pub fn cleanup_vm_storage(&self, vm_id: &str) -> Result<()> {
        let vm_dir = self.vm_dir(vm_id);
        tracing::info!(vm_id = %vm_id, vm_dir = %vm_dir.display(), "cleaning up VM storage");
        remove_tree(&vm_dir)
    }

    /// Remove a VM's jail tree. Missing trees are not an error.
    pub fn cleanup_jail(&self, vm_id: &str) -> Result<()> {
        let id_dir = self.jail_id_dir(vm_id);
        tracing::info!(vm_id = %vm_id, jail_dir = %id_dir.display(), "cleaning up jail directory");
        remove_tree(&id_dir)
    }

    /// Create a qcow2 overlay backed by the shared raw rootfs, plus the
    /// scratch directories used by overlay-aware guests.
    async fn create_overlay(
        &self,
        base: &Path,
        overlay: &Path,
        vm_dir: &Path,
    ) -> Result<()> {
        for dir in [vm_dir.join("upper"), vm_dir.join("work")] {
            create_dir_0755(&dir).map_err(|e| {
                AgentError::StorageSetup(format!(
                    "failed to create overlay dir {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let output = Command::new("qemu-img")
            .arg("create")
            .arg("-f")
            .arg("qcow2")
            .arg("-b")
            .arg(base)
            .arg("-F")
            .arg("raw")
            .arg(overlay)
            .output()
            .await
            .map_err(|e| AgentError::StorageSetup(format!("failed to run qemu-img: {}", e)))?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(AgentError::StorageSetup(format!(
                "qemu-img create failed: {}",
                combined.trim()
            )));
        }

        tracing::info!(overlay = %overlay.display(), "overlay image created");
        Ok(())
    }
}

/// Copy a file preserving mode and times, creating the destination's parent
/// directories as needed.
pub async fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        create_dir_0755(parent).map_err(|e| {
            AgentError::StorageSetup(format!(
                "failed to create parent dir {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let output = Command::new("cp")
        .arg("-p")
        .arg(src)
        .arg(dst)
        .output()
        .await
        .map_err(|e| AgentError::StorageSetup(format!("failed to run cp: {}", e)))?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(AgentError::StorageSetup(format!(
            "cp {} -> {} failed: {}",
            src.display(),
            dst.display(),
            combined.trim()
        )));
    }

    Ok(())
}

/// The jailer chroots and drops privileges before touching these, so any
/// problem has to be caught while the agent can still report it.
fn verify_source_file(path: &Path, description: &str) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        AgentError::StorageSetup(format!(
            "{} not found at {}: {}",
            description,
            path.display(),
            e
        ))
    })?;
    if metadata.is_dir() {
        return Err(AgentError::StorageSetup(format!(
            "{} at {} is a directory, not a file",
            description,
            path.display()
        )));
    }
    Ok(())
}

/// mkdir -p with an explicit 0755 mode. The jailer's dropped-privilege user
/// must be able to traverse these trees, so the mode cannot be left to
/// whatever 0777-minus-umask the default creation would produce.
fn create_dir_0755(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
}

fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AgentError::StorageSetup(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}
