//! Message types exchanged with the privileged helper.
//!
//! Frames are newline-delimited JSON. A request carries a correlation id and
//! one [`HelperCommand`]; the reply carries the same id and exactly one of
//! `output` or `error`.

use crate::error::AutomountError;
use crate::model::KeyEncoding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The complete command vocabulary of the helper.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HelperCommand {
    ImportPools,
    MountAll,
    /// An empty `key` asks the helper to consult the boot-scoped store.
    LoadKey {
        dataset: String,
        format: KeyEncoding,
        #[serde(default)]
        key: String,
    },
    ScrubPool {
        pool: String,
    },
    TrimPool {
        pool: String,
    },
}

/// Start of the helper's reply when the boot-scoped store has no entry.
pub const NO_BOOT_KEY: &str = "No key found in system keychain";

impl HelperCommand {
    /// Reject commands whose pool or dataset name is empty or would be read
    /// as an option by `zfs`/`zpool`.
    pub fn validate(&self) -> Result<(), AutomountError> {
        let target = match self {
            HelperCommand::ImportPools | HelperCommand::MountAll => return Ok(()),
            HelperCommand::LoadKey { dataset, .. } => dataset,
            HelperCommand::ScrubPool { pool } | HelperCommand::TrimPool { pool } => pool,
        };
        if valid_name(target) {
            Ok(())
        } else {
            Err(AutomountError::UnknownCommand(format!(
                "invalid {} command format: bad name `{target}`",
                self.name()
            )))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HelperCommand::ImportPools => "import_pools",
            HelperCommand::MountAll => "mount_all",
            HelperCommand::LoadKey { .. } => "load_key",
            HelperCommand::ScrubPool { .. } => "scrub_pool",
            HelperCommand::TrimPool { .. } => "trim_pool",
        }
    }
}

// Key text never reaches logs.
impl fmt::Debug for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelperCommand::ImportPools | HelperCommand::MountAll => f.write_str(self.name()),
            HelperCommand::LoadKey {
                dataset,
                format,
                key,
            } => {
                let shown = if key.is_empty() { "" } else { "<redacted>" };
                write!(f, "load_key:{dataset}:{}:{shown}", format.as_str())
            }
            HelperCommand::ScrubPool { pool } => write!(f, "scrub_pool:{pool}"),
            HelperCommand::TrimPool { pool } => write!(f, "trim_pool:{pool}"),
        }
    }
}

/// Parse the colon-delimited operator form, e.g. `scrub_pool:tank` or
/// `load_key:tank/enc1:passphrase:`.
///
/// The key field of `load_key` takes the remainder of the line so keys may
/// contain colons.
impl FromStr for HelperCommand {
    type Err = AutomountError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim_end_matches(['\r', '\n']);
        let (name, rest) = match text.split_once(':') {
            Some((name, rest)) => (name, Some(rest)),
            None => (text, None),
        };

        let malformed = || AutomountError::UnknownCommand(format!("invalid {name} command format"));

        let command = match (name, rest) {
            ("import_pools", None) => Ok(HelperCommand::ImportPools),
            ("mount_all", None) => Ok(HelperCommand::MountAll),
            ("load_key", Some(rest)) => {
                let mut fields = rest.splitn(3, ':');
                let dataset = fields.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
                let format = fields
                    .next()
                    .and_then(KeyEncoding::parse)
                    .ok_or_else(malformed)?;
                let key = fields.next().ok_or_else(malformed)?;
                Ok(HelperCommand::LoadKey {
                    dataset: dataset.to_string(),
                    format,
                    key: key.to_string(),
                })
            }
            ("scrub_pool", Some(pool)) if !pool.contains(':') => Ok(HelperCommand::ScrubPool {
                pool: pool.to_string(),
            }),
            ("trim_pool", Some(pool)) if !pool.contains(':') => Ok(HelperCommand::TrimPool {
                pool: pool.to_string(),
            }),
            ("import_pools" | "mount_all" | "load_key" | "scrub_pool" | "trim_pool", _) => {
                Err(malformed())
            }
            _ => Err(AutomountError::UnknownCommand(text.to_string())),
        }?;
        command.validate().map_err(|_| malformed())?;
        Ok(command)
    }
}

fn valid_name(value: &str) -> bool {
    !value.trim().is_empty() && !value.starts_with('-')
}

/// One framed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperRequest {
    pub id: u64,
    #[serde(flatten)]
    pub command: HelperCommand,
}

/// One framed reply. Success is exactly `error.is_none()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperReply {
    pub id: u64,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl HelperReply {
    pub fn success(id: u64, output: impl Into<String>) -> Self {
        Self {
            id,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into the caller-facing result.
    pub fn into_result(self) -> Result<String, AutomountError> {
        match self.error {
            None => Ok(self.output.unwrap_or_default()),
            Some(error) => Err(AutomountError::Helper(error)),
        }
    }
}
