//! Host network attachments for VMs.
//!
//! Each VM gets a TAP device enslaved to a shared bridge, plus a
//! deterministic locally-administered MAC derived from its id. All interface
//! manipulation shells out to ip(8); nothing here retries, the caller unwinds
//! on failure.

use tokio::process::Command;

use crate::error::{AgentError, Result};

/// Manages the shared bridge and per-VM TAP devices.
pub struct NetworkManager {
    bridge_name: String,
    bridge_ip: Option<String>,
    tap_prefix: String,
}

impl NetworkManager {
    pub fn new(
        bridge_name: impl Into<String>,
        bridge_ip: Option<String>,
        tap_prefix: impl Into<String>,
    ) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            bridge_ip,
            tap_prefix: tap_prefix.into(),
        }
    }

    pub fn bridge_name(&self) -> &str {
        &self.bridge_name
    }

    /// Bridge address in CIDR form, if configured.
    pub fn bridge_ip(&self) -> Option<&str> {
        self.bridge_ip.as_deref()
    }

    /// Name of the TAP device for a VM: `<prefix>-<first 8 chars of id>`.
    pub fn tap_name(&self, vm_id: &str) -> String {
        let short = vm_id.get(..8).unwrap_or(vm_id);
        format!("{}-{}", self.tap_prefix, short)
    }

    /// Make sure the bridge exists, is up, and carries the configured
    /// address. Safe to call repeatedly.
    pub async fn ensure_bridge(&self) -> Result<()> {
        tracing::info!(bridge = %self.bridge_name, "ensuring bridge exists");

        let exists = Command::new("ip")
            .args(["link", "show", &self.bridge_name])
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false);

        if !exists {
            tracing::info!(bridge = %self.bridge_name, "creating bridge");
            run_ip(&["link", "add", "name", &self.bridge_name, "type", "bridge"]).await?;
        }

        run_ip(&["link", "set", &self.bridge_name, "up"]).await?;

        if let Some(bridge_ip) = &self.bridge_ip {
            let listing = Command::new("ip")
                .args(["addr", "show", &self.bridge_name])
                .output()
                .await
                .map_err(|e| AgentError::NetworkSetup(format!("failed to run ip addr: {}", e)))?;
            let listing = String::from_utf8_lossy(&listing.stdout).to_string();

            if !listing.contains(bridge_ip.as_str()) {
                tracing::info!(bridge = %self.bridge_name, ip = %bridge_ip, "assigning bridge address");
                if let Err(e) =
                    run_ip(&["addr", "add", bridge_ip, "dev", &self.bridge_name]).await
                {
                    // "File exists" means the address is already there but the
                    // listing match missed it.
                    let already = matches!(
                        &e,
                        AgentError::NetworkSetup(msg) if msg.contains("File exists")
                    );
                    if !already {
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Create a TAP device for the VM, bring it up, and enslave it to the
    /// bridge. Any failure after creation removes the device again.
    pub async fn create_tap(&self, vm_id: &str) -> Result<String> {
        let tap_name = self.tap_name(vm_id);
        tracing::info!(tap_device = %tap_name, "creating TAP device");

        run_ip(&["tuntap", "add", &tap_name, "mode", "tap"]).await?;

        if let Err(e) = run_ip(&["link", "set", &tap_name, "up"]).await {
            let _ = self.delete_tap(&tap_name).await;
            return Err(e);
        }

        if let Err(e) = run_ip(&["link", "set", &tap_name, "master", &self.bridge_name]).await {
            let _ = self.delete_tap(&tap_name).await;
            return Err(e);
        }

        tracing::info!(tap_device = %tap_name, bridge = %self.bridge_name, "TAP device attached to bridge");
        Ok(tap_name)
    }

    /// Remove a TAP device. A device that is already gone is success.
    pub async fn delete_tap(&self, tap_name: &str) -> Result<()> {
        tracing::info!(tap_device = %tap_name, "deleting TAP device");

        match run_ip(&["link", "delete", tap_name]).await {
            Ok(()) => Ok(()),
            Err(AgentError::NetworkSetup(msg)) if msg.contains("Cannot find device") => {
                tracing::warn!(tap_device = %tap_name, "TAP device not found, already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Derive a deterministic locally-administered unicast MAC from the VM
    /// id. The same id always yields the same address; distinct ids collide
    /// only if their byte pairs XOR equal.
    pub fn generate_mac(&self, vm_id: &str) -> String {
        let bytes = vm_id.as_bytes();
        let mut mac = String::from("02:FC");
        for i in 0..4 {
            if i * 2 + 1 < bytes.len() {
                mac.push_str(&format!(":{:02x}", bytes[i * 2] ^ bytes[i * 2 + 1]));
            } else {
                mac.push_str(":00");
            }
        }
        mac
    }
}

/// Run an ip(8) subcommand, folding a failure exit into `NetworkSetup` with
/// the combined output attached.
async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| AgentError::NetworkSetup(format!("failed to run ip {}: {}", args[0], e)))?;

    if output.status.success() {
        return Ok(());
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(AgentError::NetworkSetup(format!(
        "ip {} failed: {}",
        args.join(" "),
        combined.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> NetworkManager {
        NetworkManager::new("br0", Some("172.16.0.1/24".to_string()), "vmtap")
    }

    #[test]
    fn test_tap_name_format() {
        let m = manager();
        let name = m.tap_name("abcdef1234567890");
        assert_eq!(name, "vmtap-abcdef12");
        assert_eq!(name.len(), "vmtap".len() + 1 + 8);
    }

    #[test]
    fn test_tap_name_short_id() {
        let m = manager();
        assert_eq!(m.tap_name("abc"), "vmtap-abc");
    }

    #[test]
    fn test_generate_mac_known_vector() {
        let m = manager();
        // 'a'^'b' = 0x03, 'c'^'d' = 0x07, 'e'^'f' = 0x03, 'g'^'h' = 0x0f.
        assert_eq!(m.generate_mac("abcdefghij"), "02:FC:03:07:03:0f");
    }

    #[test]
    fn test_generate_mac_deterministic() {
        let m = manager();
        assert_eq!(m.generate_mac("vm-test-01"), m.generate_mac("vm-test-01"));
    }

    #[test]
    fn test_generate_mac_format() {
        let m = manager();
        for id in ["vm-1", "abcdefgh", "x", "a-much-longer-vm-identifier"] {
            let mac = m.generate_mac(id);
            let parts: Vec<&str> = mac.split(':').collect();
            assert_eq!(parts.len(), 6);
            assert_eq!(parts[0], "02");
            assert_eq!(parts[1], "FC");
            for octet in &parts[2..] {
                assert_eq!(octet.len(), 2);
                assert!(u8::from_str_radix(octet, 16).is_ok());
            }
        }
    }

    #[test]
    fn test_generate_mac_short_id_pads_zero() {
        let m = manager();
        // Only one full byte pair; the remaining octets are zero.
        assert_eq!(m.generate_mac("ab"), "02:FC:03:00:00:00");
    }

    #[test]
    fn test_generate_mac_distinct_ids() {
        let m = manager();
        assert_ne!(m.generate_mac("vm-aaaaaaaa"), m.generate_mac("vm-bbbbbbbb"));
    }

    #[tokio::test]
    async fn test_delete_tap_idempotent() {
        // Requires iproute2 but no privileges: deleting a device that does
        // not exist reports "Cannot find device", which is success.
        if Command::new("ip").arg("help").output().await.is_err() {
            eprintln!("skipping: ip(8) not available");
            return;
        }
        let m = manager();
        assert!(m.delete_tap("vmtap-definitely-absent").await.is_ok());
        assert!(m.delete_tap("vmtap-definitely-absent").await.is_ok());
    }
}
