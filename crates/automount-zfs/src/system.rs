//! System-backed pool inspector and administrative operations. Shells out to
//! the platform `zfs` and `zpool` binaries through a [`CommandExecutor`].

use crate::command::{CommandExecutor, Output, SystemRunner};
use crate::disk::DiskDetector;
use crate::parse::{parse_dataset_list, parse_pool_list, parse_scrub_status};
use async_trait::async_trait;
use automount_core::config::AutomountConfig;
use automount_core::error::AutomountResult;
use automount_core::model::{Dataset, Pool, ScrubInfo};
use automount_core::provider::PoolInspector;
use futures::future::join_all;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Install directories probed, in order, for `zfs` and `zpool`.
pub const SEARCH_DIRS: &[&str] = &[
    "/usr/local/zfs/bin",
    "/usr/local/sbin",
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/usr/sbin",
    "/sbin",
    "/usr/bin",
];

/// Used when no search directory holds the binary.
pub const FALLBACK_DIR: &str = "/usr/local/zfs/bin";

/// Locate `name` in [`SEARCH_DIRS`], falling back to [`FALLBACK_DIR`].
pub fn discover_binary(name: &str) -> PathBuf {
    discover_in(SEARCH_DIRS, name)
}

fn discover_in(dirs: &[&str], name: &str) -> PathBuf {
    for dir in dirs {
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            debug!("found {name} at {}", candidate.display());
            return candidate;
        }
    }
    let fallback = Path::new(FALLBACK_DIR).join(name);
    warn!(
        "{name} not found in {}; assuming {}",
        dirs.join(", "),
        fallback.display()
    );
    fallback
}

/// `zfs`/`zpool` front end.
pub struct SystemZfs<E: CommandExecutor = SystemRunner> {
    zfs: PathBuf,
    zpool: PathBuf,
    device_id_dir: PathBuf,
    executor: E,
    disks: DiskDetector,
}

impl SystemZfs<SystemRunner> {
    /// Build from settings: explicit binary paths win over discovery.
    pub fn from_config(config: &AutomountConfig) -> Self {
        let zfs = config
            .zfs_binary_path()
            .unwrap_or_else(|| discover_binary("zfs"));
        let zpool = config
            .zpool_binary_path()
            .unwrap_or_else(|| discover_binary("zpool"));
        info!(
            "using zfs at {} and zpool at {}",
            zfs.display(),
            zpool.display()
        );
        Self::with_executor(zfs, zpool, SystemRunner::new(config.command_timeout()))
            .device_id_dir(&config.paths.device_id_dir)
    }
}

impl<E: CommandExecutor> SystemZfs<E> {
    pub fn with_executor(zfs: impl Into<PathBuf>, zpool: impl Into<PathBuf>, executor: E) -> Self {
        Self {
            zfs: zfs.into(),
            zpool: zpool.into(),
            device_id_dir: PathBuf::from(automount_core::config::Paths::default().device_id_dir),
            executor,
            disks: DiskDetector::default(),
        }
    }

    pub fn device_id_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.device_id_dir = dir.into();
        self
    }

    pub fn disk_detector(mut self, detector: DiskDetector) -> Self {
        self.disks = detector;
        self
    }

    pub fn zfs_path(&self) -> &Path {
        &self.zfs
    }

    pub fn zpool_path(&self) -> &Path {
        &self.zpool
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    async fn run_checked(&self, binary: &Path, args: &[&str]) -> AutomountResult<Output> {
        self.executor.run(binary, args).await?.checked(binary, args)
    }

    /// `zpool import -a -d <device-id-dir>`.
    pub async fn import_pools(&self) -> AutomountResult<String> {
        let dir = self.device_id_dir.to_string_lossy();
        let out = self
            .run_checked(&self.zpool, &["import", "-a", "-d", dir.as_ref()])
            .await?;
        info!("imported pools from {dir}");
        Ok(out.stdout)
    }

    /// `zfs mount -a`.
    pub async fn mount_all(&self) -> AutomountResult<String> {
        let out = self.run_checked(&self.zfs, &["mount", "-a"]).await?;
        Ok(out.stdout)
    }

    /// `zfs load-key -L <location> <dataset>`. An already-loaded key counts
    /// as success.
    pub async fn load_key(&self, dataset: &str, location: &str) -> AutomountResult<String> {
        let args = ["load-key", "-L", location, dataset];
        let out = self.executor.run(&self.zfs, &args).await?;
        if !out.success() && out.diagnostic().contains("Key already loaded") {
            debug!("key for {dataset} was already loaded");
            return Ok("Key already loaded".to_string());
        }
        out.checked(&self.zfs, &args)?;
        Ok("Key loaded successfully".to_string())
    }

    /// `zpool scrub <pool>`.
    pub async fn scrub(&self, pool: &str) -> AutomountResult<String> {
        self.run_checked(&self.zpool, &["scrub", pool]).await?;
        Ok(format!("Scrub started on {pool}"))
    }

    /// `zpool trim <pool>`.
    pub async fn trim(&self, pool: &str) -> AutomountResult<String> {
        self.run_checked(&self.zpool, &["trim", pool]).await?;
        Ok(format!("TRIM started on {pool}"))
    }

    async fn scrub_info(&self, pool: &str) -> ScrubInfo {
        match self.run_checked(&self.zpool, &["status", pool]).await {
            Ok(out) => parse_scrub_status(&out.stdout),
            Err(err) => {
                warn!("cannot read scrub status of {pool}: {err}");
                ScrubInfo::unknown()
            }
        }
    }
}

#[async_trait]
impl<E: CommandExecutor> PoolInspector for SystemZfs<E> {
    async fn list_pools(&self) -> AutomountResult<Vec<Pool>> {
        let out = self
            .run_checked(&self.zpool, &["list", "-H", "-o", "name,health,size,allocated"])
            .await?;
        let rows = parse_pool_list(&out.stdout);

        let details = rows.into_iter().map(|row| async move {
            let (scrub, disks) = futures::join!(
                self.scrub_info(&row.name),
                self.disks.pool_disks(&self.executor, &self.zpool, &row.name)
            );
            Pool {
                name: row.name,
                health: row.health,
                size: row.size,
                allocated: row.allocated,
                scrub,
                disks,
            }
        });
        Ok(join_all(details).await)
    }

    async fn list_datasets(&self) -> AutomountResult<Vec<Dataset>> {
        let out = self
            .run_checked(
                &self.zfs,
                &[
                    "list",
                    "-H",
                    "-t",
                    "filesystem",
                    "-o",
                    "name,mountpoint,mounted,encryption,keyformat,keylocation",
                ],
            )
            .await?;
        Ok(parse_dataset_list(&out.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovery_prefers_earlier_directories() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        fs::write(first.path().join("zpool"), "").unwrap();
        fs::write(second.path().join("zpool"), "").unwrap();
        fs::write(second.path().join("zfs"), "").unwrap();

        let a = first.path().to_str().unwrap();
        let b = second.path().to_str().unwrap();
        assert_eq!(discover_in(&[a, b], "zpool"), first.path().join("zpool"));
        assert_eq!(discover_in(&[a, b], "zfs"), second.path().join("zfs"));
    }

    #[test]
    fn discovery_falls_back_to_default_location() {
        let empty = tempdir().unwrap();
        let dir = empty.path().to_str().unwrap();
        assert_eq!(
            discover_in(&[dir], "zfs"),
            Path::new(FALLBACK_DIR).join("zfs")
        );
    }
}
