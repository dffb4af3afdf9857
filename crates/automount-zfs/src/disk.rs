//! Disk-type detection for TRIM eligibility.

use crate::command::CommandExecutor;
use crate::parse::{parse_member_devices, DeviceFacts};
use automount_core::model::{Disk, DiskProtocol, PoolDiskInfo};
use log::{debug, warn};
use std::path::{Path, PathBuf};

#[cfg(not(target_os = "macos"))]
const INVENTORY_BINARY: &str = "lsblk";

#[cfg(target_os = "macos")]
const INVENTORY_BINARY: &str = "/usr/sbin/diskutil";

/// Looks up the member disks of a pool and classifies each one.
#[derive(Debug, Clone)]
pub struct DiskDetector {
    inventory: PathBuf,
}

impl Default for DiskDetector {
    fn default() -> Self {
        Self::new(INVENTORY_BINARY)
    }
}

impl DiskDetector {
    pub fn new(inventory: impl Into<PathBuf>) -> Self {
        Self {
            inventory: inventory.into(),
        }
    }

    /// Member disks of `pool`. Detection failures yield an empty or partial
    /// set, which rates the pool as not TRIM-eligible.
    pub async fn pool_disks<E: CommandExecutor + ?Sized>(
        &self,
        executor: &E,
        zpool: &Path,
        pool: &str,
    ) -> PoolDiskInfo {
        let status = match executor.run(zpool, &["status", "-P", "-L", pool]).await {
            Ok(out) if out.success() => out.stdout,
            Ok(out) => {
                warn!("zpool status {pool} failed: {}", out.diagnostic());
                return PoolDiskInfo::new(pool, Vec::new());
            }
            Err(err) => {
                warn!("zpool status {pool} failed: {err}");
                return PoolDiskInfo::new(pool, Vec::new());
            }
        };

        let mut disks = Vec::new();
        for device in parse_member_devices(&status) {
            disks.push(self.classify(executor, &device).await);
        }
        let info = PoolDiskInfo::new(pool, disks);
        debug!(
            "pool {pool}: {} ({})",
            info.summary(),
            info.trim_support.label()
        );
        info
    }

    async fn classify<E: CommandExecutor + ?Sized>(&self, executor: &E, device: &str) -> Disk {
        let path = if device.starts_with("/dev/") {
            device.to_string()
        } else {
            format!("/dev/{device}")
        };
        let device_name = path.trim_start_matches("/dev/").to_string();

        let facts = match executor.run(&self.inventory, &inventory_args(&path)).await {
            Ok(out) if out.success() => parse_inventory(&out.stdout),
            Ok(out) => {
                warn!("cannot classify {path}: {}", out.diagnostic());
                None
            }
            Err(err) => {
                warn!("cannot classify {path}: {err}");
                None
            }
        };
        let facts = facts.unwrap_or(DeviceFacts {
            is_ssd: false,
            protocol: DiskProtocol::Unknown,
            model: String::new(),
        });

        Disk {
            path,
            device_name,
            is_ssd: facts.is_ssd,
            protocol: facts.protocol,
            model: facts.model,
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn inventory_args(path: &str) -> [&str; 6] {
    ["-n", "-P", "-s", "-o", "NAME,ROTA,TRAN,MODEL", path]
}

#[cfg(target_os = "macos")]
fn inventory_args(path: &str) -> [&str; 2] {
    ["info", path]
}

#[cfg(not(target_os = "macos"))]
fn parse_inventory(output: &str) -> Option<DeviceFacts> {
    crate::parse::parse_lsblk(output)
}

#[cfg(target_os = "macos")]
fn parse_inventory(output: &str) -> Option<DeviceFacts> {
    Some(crate::parse::parse_diskutil(output))
}
