//! Helpers for turning `zfs`, `zpool`, and disk-inventory output into data
//! structures the rest of the crate can reason about.

use automount_core::model::{Dataset, DiskProtocol, KeyFormat, PoolHealth, ScrubInfo, ScrubStatus};
use chrono::NaiveDateTime;
use regex::Regex;
use std::sync::OnceLock;

/// One row of `zpool list -H -o name,health,size,allocated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolRow {
    pub name: String,
    pub health: PoolHealth,
    pub size: String,
    pub allocated: String,
}

pub(crate) fn parse_pool_list(output: &str) -> Vec<PoolRow> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 4 || parts[0].trim().is_empty() {
                return None;
            }
            Some(PoolRow {
                name: parts[0].trim().to_string(),
                health: PoolHealth::parse(parts[1]),
                size: parts[2].trim().to_string(),
                allocated: parts[3].trim().to_string(),
            })
        })
        .collect()
}

/// Parse `zfs list -H -o name,mountpoint,mounted,encryption,keyformat,keylocation`.
pub(crate) fn parse_dataset_list(output: &str) -> Vec<Dataset> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').map(str::trim).collect();
            if parts.len() < 6 || parts[0].is_empty() {
                return None;
            }
            Some(Dataset {
                name: parts[0].to_string(),
                mountpoint: parts[1].to_string(),
                mounted: parts[2] == "yes",
                encrypted: parts[3] != "off" && parts[3] != "-",
                key_format: KeyFormat::parse(parts[4]),
                key_location: optional(parts[5]),
            })
        })
        .collect()
}

fn optional(value: &str) -> Option<String> {
    match value {
        "" | "-" | "none" => None,
        other => Some(other.to_string()),
    }
}

fn scrub_date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"on ([A-Za-z]{3} [A-Za-z]{3}\s+\d+ \d+:\d+:\d+ \d{4})")
            .expect("valid scrub date regex")
    })
}

fn scrub_errors_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"with (\d+) errors?").expect("valid scrub error regex")
    })
}

/// Scrub state from the `scan:` line of `zpool status`.
pub(crate) fn parse_scrub_status(status: &str) -> ScrubInfo {
    for line in status.lines().map(str::trim) {
        if !(line.contains("scan:") || line.contains("scrub:")) {
            continue;
        }
        if line.contains("none requested") {
            return ScrubInfo {
                status: ScrubStatus::NeverRun,
                last_scrub: None,
            };
        }
        if line.contains("scrub in progress") {
            return ScrubInfo {
                status: ScrubStatus::InProgress,
                last_scrub: None,
            };
        }
        let errors = scrub_errors_pattern()
            .captures(line)
            .and_then(|caps| caps[1].parse::<u64>().ok());
        if line.contains("scrub repaired") {
            let last_scrub = scrub_date_pattern()
                .captures(line)
                .and_then(|caps| parse_scrub_date(&caps[1]));
            let status = match errors {
                Some(count) if count > 0 => ScrubStatus::ErrorsFound,
                _ => ScrubStatus::Clean,
            };
            return ScrubInfo { status, last_scrub };
        }
        let errors_found = match errors {
            Some(count) => count > 0,
            None => line.contains("with") && line.contains("errors"),
        };
        if errors_found {
            return ScrubInfo {
                status: ScrubStatus::ErrorsFound,
                last_scrub: None,
            };
        }
    }
    ScrubInfo::unknown()
}

fn parse_scrub_date(text: &str) -> Option<NaiveDateTime> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%a %b %e %H:%M:%S %Y").ok()
}

fn member_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(/dev/\S+|disk\d+\S*)").expect("valid member regex")
    })
}

/// Device paths of the leaf vdevs in `zpool status -P -L` output.
pub(crate) fn parse_member_devices(status: &str) -> Vec<String> {
    let mut devices = Vec::new();
    for line in status.lines().map(str::trim) {
        if let Some(caps) = member_pattern().captures(line) {
            let device = caps[1].to_string();
            if !devices.contains(&device) {
                devices.push(device);
            }
        }
    }
    devices
}

/// What the platform inventory tool says about one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeviceFacts {
    pub is_ssd: bool,
    pub protocol: DiskProtocol,
    pub model: String,
}

#[cfg(any(not(target_os = "macos"), test))]
fn lsblk_pair_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"([A-Z]+)="([^"]*)""#).expect("valid lsblk regex")
    })
}

/// Parse `lsblk -n -P -s -o NAME,ROTA,TRAN,MODEL <device>`.
///
/// `-s` lists the device first and its parents after it; partitions carry no
/// transport or model, so those come from the first row that has them.
#[cfg(any(not(target_os = "macos"), test))]
pub(crate) fn parse_lsblk(output: &str) -> Option<DeviceFacts> {
    let rows: Vec<std::collections::HashMap<&str, &str>> = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            lsblk_pair_pattern()
                .captures_iter(line)
                .filter_map(|caps| {
                    let key = caps.get(1)?.as_str();
                    let value = caps.get(2)?.as_str();
                    Some((key, value))
                })
                .collect()
        })
        .collect();
    let first = rows.first()?;

    let is_ssd = first.get("ROTA").map(|rota| rota.trim() == "0")?;
    let field = |key: &str| {
        rows.iter()
            .filter_map(|row| row.get(key))
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
            .unwrap_or("")
            .to_string()
    };
    let transport = field("TRAN").to_ascii_lowercase();
    let name = field("NAME");
    let protocol = match transport.as_str() {
        "nvme" => DiskProtocol::NVMe,
        "sata" | "ata" => DiskProtocol::Sata,
        "usb" => DiskProtocol::Usb,
        "" if name.starts_with("nvme") => DiskProtocol::NVMe,
        _ => DiskProtocol::Unknown,
    };
    Some(DeviceFacts {
        is_ssd,
        protocol,
        model: field("MODEL"),
    })
}

/// Parse `diskutil info <device>`.
#[cfg(any(target_os = "macos", test))]
pub(crate) fn parse_diskutil(output: &str) -> DeviceFacts {
    let mut facts = DeviceFacts {
        is_ssd: false,
        protocol: DiskProtocol::Unknown,
        model: String::new(),
    };
    for line in output.lines().map(str::trim) {
        if line.contains("Solid State:") {
            facts.is_ssd = line.contains("Yes");
        } else if line.contains("Protocol:") {
            facts.protocol = if line.contains("NVMe") {
                DiskProtocol::NVMe
            } else if line.contains("SATA") {
                DiskProtocol::Sata
            } else if line.contains("USB") {
                DiskProtocol::Usb
            } else if line.contains("Thunderbolt") {
                DiskProtocol::Thunderbolt
            } else {
                DiskProtocol::Unknown
            };
        } else if line.contains("Media Name:") {
            if let Some((_, model)) = line.split_once(':') {
                facts.model = model.trim().to_string();
                let upper = facts.model.to_ascii_uppercase();
                if upper.contains("SSD") || upper.contains("NVME") {
                    facts.is_ssd = true;
                }
            }
        }
    }
    facts
}
