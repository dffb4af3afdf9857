//! Pool, dataset, and disk snapshots as reported by the administrative tools.
//!
//! Everything here is rebuilt from tool output on each refresh and never
//! mutated in place afterwards.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Pool health as reported by `zpool list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Online,
    Degraded,
    Faulted,
    Unknown,
}

impl PoolHealth {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => PoolHealth::Online,
            "DEGRADED" => PoolHealth::Degraded,
            "FAULTED" | "UNAVAIL" => PoolHealth::Faulted,
            _ => PoolHealth::Unknown,
        }
    }
}

impl fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PoolHealth::Online => "ONLINE",
            PoolHealth::Degraded => "DEGRADED",
            PoolHealth::Faulted => "FAULTED",
            PoolHealth::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Outcome of the most recent scrub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrubStatus {
    NeverRun,
    InProgress,
    Clean,
    ErrorsFound,
    Unknown,
}

impl fmt::Display for ScrubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScrubStatus::NeverRun => "Never run",
            ScrubStatus::InProgress => "In progress",
            ScrubStatus::Clean => "Clean",
            ScrubStatus::ErrorsFound => "Errors found",
            ScrubStatus::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Scrub status plus the completion time when the tool printed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubInfo {
    pub status: ScrubStatus,
    pub last_scrub: Option<NaiveDateTime>,
}

impl ScrubInfo {
    pub fn unknown() -> Self {
        Self {
            status: ScrubStatus::Unknown,
            last_scrub: None,
        }
    }

    /// Human label for the last scrub, e.g. `Oct 15, 2025`.
    pub fn last_scrub_label(&self) -> String {
        match (self.status, self.last_scrub) {
            (_, Some(at)) => at.format("%b %-d, %Y").to_string(),
            (ScrubStatus::NeverRun, None) => "Never".to_string(),
            (ScrubStatus::InProgress, None) => "Now".to_string(),
            (ScrubStatus::Clean | ScrubStatus::ErrorsFound, None) => "Recently".to_string(),
            (ScrubStatus::Unknown, None) => "-".to_string(),
        }
    }
}

/// Link protocol between host and disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiskProtocol {
    NVMe,
    Sata,
    Usb,
    Thunderbolt,
    Unknown,
}

impl fmt::Display for DiskProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiskProtocol::NVMe => "NVMe",
            DiskProtocol::Sata => "SATA",
            DiskProtocol::Usb => "USB",
            DiskProtocol::Thunderbolt => "Thunderbolt",
            DiskProtocol::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// A member disk of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub path: String,
    pub device_name: String,
    pub is_ssd: bool,
    pub protocol: DiskProtocol,
    pub model: String,
}

/// Whether `zpool trim` is safe to schedule for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimSupport {
    Supported,
    NotSupported,
    MaybeSupported,
}

impl TrimSupport {
    /// Derive eligibility from the member disks of a pool.
    ///
    /// Every disk must be solid-state. Bridged links (USB, Thunderbolt) often
    /// drop or mangle TRIM, so they only rate a "maybe".
    pub fn for_disks(disks: &[Disk]) -> Self {
        if disks.is_empty() || !disks.iter().all(|disk| disk.is_ssd) {
            return TrimSupport::NotSupported;
        }

        let protocols: BTreeSet<DiskProtocol> = disks.iter().map(|disk| disk.protocol).collect();
        if protocols.contains(&DiskProtocol::Usb) || protocols.contains(&DiskProtocol::Thunderbolt)
        {
            return TrimSupport::MaybeSupported;
        }
        if protocols.contains(&DiskProtocol::NVMe) || protocols.contains(&DiskProtocol::Sata) {
            return TrimSupport::Supported;
        }
        TrimSupport::NotSupported
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrimSupport::Supported => "Eligible",
            TrimSupport::NotSupported => "Not eligible",
            TrimSupport::MaybeSupported => "Maybe (test first)",
        }
    }
}

/// Member disks of a pool and the TRIM verdict derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDiskInfo {
    pub pool: String,
    pub disks: Vec<Disk>,
    pub trim_support: TrimSupport,
}

impl PoolDiskInfo {
    pub fn new(pool: impl Into<String>, disks: Vec<Disk>) -> Self {
        let trim_support = TrimSupport::for_disks(&disks);
        Self {
            pool: pool.into(),
            disks,
            trim_support,
        }
    }

    pub fn all_ssds(&self) -> bool {
        !self.disks.is_empty() && self.disks.iter().all(|disk| disk.is_ssd)
    }

    /// Short description such as `2x NVMe SSD` or `1x SSD + 1x HDD`.
    pub fn summary(&self) -> String {
        if self.disks.is_empty() {
            return "Unknown".to_string();
        }
        let ssd = self.disks.iter().filter(|disk| disk.is_ssd).count();
        let hdd = self.disks.len() - ssd;
        match (ssd, hdd) {
            (ssd, 0) => {
                let protocols: BTreeSet<String> = self
                    .disks
                    .iter()
                    .map(|disk| disk.protocol.to_string())
                    .collect();
                let joined = protocols.into_iter().collect::<Vec<_>>().join("/");
                format!("{ssd}x {joined} SSD")
            }
            (0, hdd) => format!("{hdd}x HDD"),
            (ssd, hdd) => format!("{ssd}x SSD + {hdd}x HDD"),
        }
    }
}

/// A pool as seen at the last refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub name: String,
    pub health: PoolHealth,
    /// Size and allocation are kept as the tool printed them.
    pub size: String,
    pub allocated: String,
    pub scrub: ScrubInfo,
    pub disks: PoolDiskInfo,
}

impl Pool {
    pub fn trim_support(&self) -> TrimSupport {
        self.disks.trim_support
    }

    pub fn trim_status(&self) -> &'static str {
        self.disks.trim_support.label()
    }
}

/// Dataset key format (`keyformat` property).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    Raw,
    Hex,
    Passphrase,
    None,
}

impl KeyFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "raw" => KeyFormat::Raw,
            "hex" => KeyFormat::Hex,
            "passphrase" => KeyFormat::Passphrase,
            _ => KeyFormat::None,
        }
    }

    /// Encoding used when key text for this format crosses the helper channel.
    ///
    /// Datasets without a known format are treated as raw.
    pub fn encoding(&self) -> KeyEncoding {
        match self {
            KeyFormat::Raw | KeyFormat::None => KeyEncoding::Raw,
            KeyFormat::Hex | KeyFormat::Passphrase => KeyEncoding::Passphrase,
        }
    }
}

/// How key text is interpreted once it reaches the privileged helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEncoding {
    /// Binary key carried as hex text.
    Raw,
    /// UTF-8 text written verbatim.
    Passphrase,
}

impl KeyEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyEncoding::Raw => "raw",
            KeyEncoding::Passphrase => "passphrase",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "raw" => Some(KeyEncoding::Raw),
            "passphrase" => Some(KeyEncoding::Passphrase),
            _ => None,
        }
    }
}

/// A filesystem dataset as seen at the last refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub mountpoint: String,
    pub mounted: bool,
    pub encrypted: bool,
    pub key_format: KeyFormat,
    pub key_location: Option<String>,
}

impl Dataset {
    /// True when the dataset is `pool` itself or sits underneath it.
    pub fn belongs_to(&self, pool: &str) -> bool {
        self.name == pool
            || self
                .name
                .strip_prefix(pool)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn needs_key(&self) -> bool {
        self.encrypted && !self.mounted
    }
}
