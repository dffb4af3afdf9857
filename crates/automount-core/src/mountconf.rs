//! Per-dataset mount options stored in a flat `automount.conf` file.
//!
//! Each non-comment line reads `<dataset> [option=value ...]`. The file is
//! always rewritten as a whole.

use crate::error::AutomountResult;
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Option carrying a `file://` reference to a dataset's keyfile.
pub const KEYLOCATION: &str = "keylocation";

const HEADER: &[&str] = &[
    "# ZFS AutoMount Configuration",
    "# Format: pool/dataset option=value [option=value ...]",
];

const DEFAULT_BODY: &str = "
# Available options:
#   keylocation   - Path to keyfile (e.g., file:///path/to/keyfile)
#   readonly      - Mount readonly (on/off)
#   canmount      - Control mounting (on/off/noauto)
#   mountpoint    - Custom mount point

# Examples:
# tank/enc1 keylocation=file:///Volumes/external/keys/enc1.key
# media/enc2 readonly=on
# tank/backup canmount=noauto
";

/// Options configured for a single dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub dataset: String,
    pub options: BTreeMap<String, String>,
}

impl MountEntry {
    pub fn new(dataset: impl Into<String>, options: BTreeMap<String, String>) -> Self {
        Self {
            dataset: dataset.into(),
            options,
        }
    }

    /// Keyfile path when `keylocation` is a `file://` reference.
    pub fn keyfile(&self) -> Option<PathBuf> {
        self.options
            .get(KEYLOCATION)
            .and_then(|location| location.strip_prefix("file://"))
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    fn render(&self) -> String {
        let mut line = self.dataset.clone();
        for (key, value) in &self.options {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(value);
        }
        line
    }
}

/// Handle on the mount configuration file.
#[derive(Debug, Clone)]
pub struct MountConfig {
    path: PathBuf,
}

impl MountConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry; a missing file is an empty configuration.
    pub fn entries(&self) -> AutomountResult<Vec<MountEntry>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(parse(&contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn entry(&self, dataset: &str) -> AutomountResult<Option<MountEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|entry| entry.dataset == dataset))
    }

    /// Replace any entry for `dataset` with `options`.
    pub fn update(&self, dataset: &str, options: BTreeMap<String, String>) -> AutomountResult<()> {
        let mut entries = self.entries()?;
        entries.retain(|entry| entry.dataset != dataset);
        entries.push(MountEntry::new(dataset, options));
        self.write(&entries)
    }

    /// Drop the entry for `dataset`. Returns whether one existed.
    pub fn remove(&self, dataset: &str) -> AutomountResult<bool> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|entry| entry.dataset != dataset);
        let removed = entries.len() != before;
        if removed {
            self.write(&entries)?;
        }
        Ok(removed)
    }

    /// Write the commented template if no file exists yet.
    pub fn write_default(&self) -> AutomountResult<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut contents = HEADER.join("\n");
        contents.push('\n');
        contents.push_str(DEFAULT_BODY);
        fs::write(&self.path, contents)?;
        debug!("wrote default mount config to {}", self.path.display());
        Ok(true)
    }

    fn write(&self, entries: &[MountEntry]) -> AutomountResult<()> {
        let mut lines: Vec<String> = HEADER.iter().map(|line| line.to_string()).collect();
        lines.push(String::new());
        lines.extend(entries.iter().map(MountEntry::render));
        let mut contents = lines.join("\n");
        contents.push('\n');

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(contents.as_bytes())?;
        // Readable by the unprivileged CLI; it holds paths, not keys.
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

/// Parse configuration text. Later duplicates of a dataset are ignored.
pub fn parse(contents: &str) -> Vec<MountEntry> {
    let mut entries: Vec<MountEntry> = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut parts = trimmed.split_whitespace();
        let Some(dataset) = parts.next() else {
            continue;
        };
        if entries.iter().any(|entry| entry.dataset == dataset) {
            continue;
        }

        let options = parts
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                if key.is_empty() || value.contains('=') {
                    return None;
                }
                Some((key.to_string(), value.to_string()))
            })
            .collect();
        entries.push(MountEntry::new(dataset, options));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let text = "# header\n\n  tank/enc1 keylocation=file:///keys/enc1.key readonly=on\nmedia/enc2\n   # indented comment\n";
        let entries = parse(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].dataset, "tank/enc1");
        assert_eq!(
            entries[0].keyfile(),
            Some(PathBuf::from("/keys/enc1.key"))
        );
        assert_eq!(entries[0].options.get("readonly").map(String::as_str), Some("on"));
        assert!(entries[1].options.is_empty());
    }

    #[test]
    fn parse_ignores_malformed_options() {
        let entries = parse("tank/a junk a=b=c =x ok=1\n");
        assert_eq!(entries[0].options, opts(&[("ok", "1")]));
    }

    #[test]
    fn keyfile_requires_file_scheme() {
        let entry = MountEntry::new("tank/a", opts(&[(KEYLOCATION, "prompt")]));
        assert_eq!(entry.keyfile(), None);
    }

    #[test]
    fn update_replaces_only_target_entry() {
        let dir = tempdir().unwrap();
        let config = MountConfig::new(dir.path().join("automount.conf"));
        config
            .update("tank/enc1", opts(&[(KEYLOCATION, "file:///old.key")]))
            .unwrap();
        config.update("media/enc2", opts(&[("readonly", "on")])).unwrap();
        config
            .update(
                "tank/enc1",
                opts(&[(KEYLOCATION, "file:///new.key"), ("mountpoint", "/mnt/enc1")]),
            )
            .unwrap();

        let entries = config.entries().unwrap();
        let enc1: Vec<_> = entries.iter().filter(|e| e.dataset == "tank/enc1").collect();
        assert_eq!(enc1.len(), 1);
        assert_eq!(
            enc1[0].options,
            opts(&[(KEYLOCATION, "file:///new.key"), ("mountpoint", "/mnt/enc1")])
        );
        let enc2 = config.entry("media/enc2").unwrap().unwrap();
        assert_eq!(enc2.options, opts(&[("readonly", "on")]));
    }

    #[test]
    fn rewrite_replaces_file_in_place() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let config = MountConfig::new(dir.path().join("automount.conf"));
        config.update("tank/enc1", opts(&[("readonly", "on")])).unwrap();
        config.update("tank/enc1", opts(&[("readonly", "off")])).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("automount.conf")]);
        let mode = fs::metadata(config.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn remove_reports_presence() {
        let dir = tempdir().unwrap();
        let config = MountConfig::new(dir.path().join("automount.conf"));
        config.update("tank/enc1", BTreeMap::new()).unwrap();
        assert!(config.remove("tank/enc1").unwrap());
        assert!(!config.remove("tank/enc1").unwrap());
        assert!(config.entries().unwrap().is_empty());
    }

    #[test]
    fn write_default_leaves_existing_file_alone() {
        let dir = tempdir().unwrap();
        let config = MountConfig::new(dir.path().join("zfs").join("automount.conf"));
        assert!(config.write_default().unwrap());
        assert!(config.entries().unwrap().is_empty());
        config.update("tank/enc1", BTreeMap::new()).unwrap();
        assert!(!config.write_default().unwrap());
        assert_eq!(config.entries().unwrap().len(), 1);
    }
}
