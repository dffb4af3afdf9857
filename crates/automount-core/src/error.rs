use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type AutomountResult<T> = Result<T, AutomountError>;

#[derive(Error, Debug)]
pub enum AutomountError {
    #[error("[AM1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[AM1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[AM1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[AM1003] json frame error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[AM1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[AM1200] failed to launch {binary}: {source}")]
    Launch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[AM1201] {binary} {args} exited with code {status}: {stderr}")]
    CommandFailed {
        binary: PathBuf,
        args: String,
        status: i32,
        stderr: String,
    },

    #[error("[AM1202] {binary} timed out after {secs}s")]
    Timeout { binary: PathBuf, secs: u64 },

    #[error("[AM1300] invalid key material: {0}")]
    InvalidKey(String),

    #[error("[AM1301] failed to decode keyfile {path}: {reason}")]
    KeyfileDecode { path: PathBuf, reason: String },

    #[error("[AM1400] failed to load keys:\n{0}")]
    KeyResolution(String),

    #[error("[AM1401] failed to mount datasets: {}", .0.join(", "))]
    VerificationMismatch(Vec<String>),

    #[error("[AM1402] cancelled: {0}")]
    Cancelled(String),

    #[error("[AM1403] no key source yielded a key for dataset `{0}`")]
    MissingKeySource(String),

    #[error("[AM2000] helper error: {0}")]
    Helper(String),

    #[error("[AM2001] helper channel error: {0}")]
    Channel(String),

    #[error("[AM2002] unknown helper command: {0}")]
    UnknownCommand(String),

    #[error("[AM3000] maintenance failed:\n{0}")]
    Maintenance(String),
}

impl AutomountError {
    pub fn code(&self) -> &'static str {
        match self {
            AutomountError::Io(_) => "AM1000",
            AutomountError::Toml(_) => "AM1001",
            AutomountError::Yaml(_) => "AM1002",
            AutomountError::Json(_) => "AM1003",
            AutomountError::InvalidConfig(_) => "AM1100",
            AutomountError::Launch { .. } => "AM1200",
            AutomountError::CommandFailed { .. } => "AM1201",
            AutomountError::Timeout { .. } => "AM1202",
            AutomountError::InvalidKey(_) => "AM1300",
            AutomountError::KeyfileDecode { .. } => "AM1301",
            AutomountError::KeyResolution(_) => "AM1400",
            AutomountError::VerificationMismatch(_) => "AM1401",
            AutomountError::Cancelled(_) => "AM1402",
            AutomountError::MissingKeySource(_) => "AM1403",
            AutomountError::Helper(_) => "AM2000",
            AutomountError::Channel(_) => "AM2001",
            AutomountError::UnknownCommand(_) => "AM2002",
            AutomountError::Maintenance(_) => "AM3000",
        }
    }

    /// Text suitable for the `error` half of a helper reply.
    ///
    /// Command failures carry the captured stderr rather than the full
    /// diagnostic so the orchestrator sees what the tool actually said.
    pub fn reply_text(&self) -> String {
        match self {
            AutomountError::CommandFailed { stderr, .. } if !stderr.is_empty() => stderr.clone(),
            AutomountError::Helper(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_mismatch_names_every_dataset() {
        let err = AutomountError::VerificationMismatch(vec![
            "tank/enc1".to_string(),
            "media/enc2".to_string(),
        ]);
        assert_eq!(err.code(), "AM1401");
        assert!(err.to_string().contains("tank/enc1, media/enc2"));
    }

    #[test]
    fn reply_text_prefers_stderr() {
        let err = AutomountError::CommandFailed {
            binary: PathBuf::from("/sbin/zpool"),
            args: "scrub tank".into(),
            status: 1,
            stderr: "cannot open 'tank': no such pool".into(),
        };
        assert_eq!(err.reply_text(), "cannot open 'tank': no such pool");
    }
}
