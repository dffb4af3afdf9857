use crate::error::{AutomountError, AutomountResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/zfs/automount.toml";

/// Environment variable that overrides [`DEFAULT_SETTINGS_PATH`].
pub const SETTINGS_ENV: &str = "ZFS_AUTOMOUNT_CONFIG";

/// Service name every credential is filed under.
pub const DEFAULT_SERVICE: &str = "org.openzfs.automount";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Paths {
    pub zfs_path: Option<String>,
    pub zpool_path: Option<String>,
    pub mount_config: String,
    /// Directory of stable device identifiers handed to `zpool import -d`.
    pub device_id_dir: String,
    pub command_timeout_secs: u64,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            zfs_path: None,
            zpool_path: None,
            mount_config: "/etc/zfs/automount.conf".to_string(),
            device_id_dir: default_device_id_dir().to_string(),
            command_timeout_secs: 120,
        }
    }
}

#[cfg(target_os = "macos")]
fn default_device_id_dir() -> &'static str {
    "/var/run/disk/by-id"
}

#[cfg(not(target_os = "macos"))]
fn default_device_id_dir() -> &'static str {
    "/dev/disk/by-id"
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HelperCfg {
    pub socket_path: String,
    pub socket_mode: u32,
    /// Peers allowed to talk to the helper; empty defers to socket permissions.
    pub allowed_uids: Vec<u32>,
    pub request_timeout_secs: u64,
}

impl Default for HelperCfg {
    fn default() -> Self {
        Self {
            socket_path: "/var/run/zfs-automount.sock".to_string(),
            socket_mode: 0o660,
            allowed_uids: Vec::new(),
            request_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct KeystoreCfg {
    pub system_dir: String,
    pub user_dir: Option<String>,
    pub service: String,
}

impl Default for KeystoreCfg {
    fn default() -> Self {
        Self {
            system_dir: default_system_store().to_string(),
            user_dir: None,
            service: DEFAULT_SERVICE.to_string(),
        }
    }
}

#[cfg(target_os = "macos")]
fn default_system_store() -> &'static str {
    "/var/db/zfs-automount/keys"
}

#[cfg(not(target_os = "macos"))]
fn default_system_store() -> &'static str {
    "/var/lib/zfs-automount/keys"
}

/// One read-only inventory probe run by the boot gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProbeCommand {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BootCfg {
    pub auto_import: bool,
    pub auto_mount: bool,
    pub probe: Vec<ProbeCommand>,
    pub sync_binary: String,
    pub sentinel: String,
    pub sentinel_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub settle_secs: u64,
    pub cookie_path: Option<String>,
}

impl Default for BootCfg {
    fn default() -> Self {
        Self {
            auto_import: true,
            auto_mount: true,
            probe: default_probe(),
            sync_binary: "/bin/sync".to_string(),
            sentinel: default_sentinel().to_string(),
            sentinel_timeout_secs: 60,
            poll_interval_ms: 100,
            settle_secs: 5,
            cookie_path: Some("/var/run/org.openzfs.automount.didRun".to_string()),
        }
    }
}

#[cfg(target_os = "macos")]
fn default_probe() -> Vec<ProbeCommand> {
    vec![ProbeCommand {
        binary: "/usr/sbin/system_profiler".to_string(),
        args: [
            "SPStorageDataType",
            "SPUSBDataType",
            "SPThunderboltDataType",
            "SPSerialATADataType",
            "SPPCIDataType",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }]
}

#[cfg(not(target_os = "macos"))]
fn default_probe() -> Vec<ProbeCommand> {
    vec![
        ProbeCommand {
            binary: "/usr/bin/lsblk".to_string(),
            args: vec!["--all".to_string()],
        },
        ProbeCommand {
            binary: "/usr/bin/udevadm".to_string(),
            args: vec!["info".to_string(), "--export-db".to_string()],
        },
    ]
}

#[cfg(target_os = "macos")]
fn default_sentinel() -> &'static str {
    "/var/run/disk/invariant.idle"
}

#[cfg(not(target_os = "macos"))]
fn default_sentinel() -> &'static str {
    "/dev/disk/by-id"
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AutomountConfig {
    pub paths: Paths,
    pub helper: HelperCfg,
    pub keystore: KeystoreCfg,
    pub boot: BootCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl AutomountConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> AutomountResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };
        cfg.path = path.to_path_buf();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `path` if it exists; otherwise fall back to built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AutomountResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                ..Self::default()
            });
        }
        Self::load(path)
    }

    /// Settings path from the environment, or the default.
    pub fn default_path() -> PathBuf {
        env::var(SETTINGS_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH))
    }

    fn validate(&self) -> AutomountResult<()> {
        if self.helper.socket_path.trim().is_empty() {
            return Err(AutomountError::InvalidConfig(
                "helper.socket_path must not be empty".to_string(),
            ));
        }
        if self.boot.poll_interval_ms == 0 {
            return Err(AutomountError::InvalidConfig(
                "boot.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.keystore.service.trim().is_empty() {
            return Err(AutomountError::InvalidConfig(
                "keystore.service must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.paths.command_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.helper.request_timeout_secs.max(1))
    }

    pub fn mount_config_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.mount_config)
    }

    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.helper.socket_path)
    }

    pub fn zfs_binary_path(&self) -> Option<PathBuf> {
        self.paths.zfs_path.as_ref().map(PathBuf::from)
    }

    pub fn zpool_binary_path(&self) -> Option<PathBuf> {
        self.paths.zpool_path.as_ref().map(PathBuf::from)
    }

    pub fn system_store_dir(&self) -> PathBuf {
        PathBuf::from(&self.keystore.system_dir)
    }

    /// User-scoped store directory; `None` without a resolvable home.
    pub fn user_store_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.keystore.user_dir {
            return Some(PathBuf::from(dir));
        }
        let base = env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))?;
        Some(base.join("zfs-automount").join("keys"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = AutomountConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.boot.sentinel_timeout_secs, 60);
        assert_eq!(cfg.keystore.service, DEFAULT_SERVICE);
        assert!(cfg.boot.auto_import);
    }

    #[test]
    fn toml_overrides_partial_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("automount.toml");
        fs::write(
            &path,
            r#"
[paths]
zpool_path = "/opt/zfs/zpool"

[helper]
allowed_uids = [501]

[boot]
auto_mount = false
settle_secs = 1
"#,
        )
        .unwrap();
        let cfg = AutomountConfig::load(&path).unwrap();
        assert_eq!(cfg.zpool_binary_path(), Some(PathBuf::from("/opt/zfs/zpool")));
        assert_eq!(cfg.helper.allowed_uids, vec![501]);
        assert!(!cfg.boot.auto_mount);
        assert_eq!(cfg.boot.settle_secs, 1);
        assert_eq!(cfg.boot.sentinel_timeout_secs, 60);
        assert_eq!(cfg.path, path);
    }

    #[test]
    fn yaml_is_accepted_for_other_extensions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("automount.yaml");
        fs::write(&path, "keystore:\n  user_dir: /tmp/keys\n").unwrap();
        let cfg = AutomountConfig::load(&path).unwrap();
        assert_eq!(cfg.user_store_dir(), Some(PathBuf::from("/tmp/keys")));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("automount.toml");
        fs::write(&path, "[boot]\npoll_interval_ms = 0\n").unwrap();
        let err = AutomountConfig::load(&path).unwrap_err();
        assert!(matches!(err, AutomountError::InvalidConfig(_)));
    }
}
