//! Process-wide logger for the CLI, boot automation and the helper.
//!
//! Every record is tagged with the component that wrote it and its pid, so
//! helper and boot lines can be told apart once they land in the same
//! journal.

use env_logger::Env;
use serde_json::{json, Value};
use std::env;
use std::io::Write;
use std::process;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "AUTOMOUNT_LOG_FORMAT";
const LEVEL_ENV: &str = "AUTOMOUNT_LOG_LEVEL";

/// Which binary or entry point is logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Cli,
    Boot,
    Helper,
}

impl Component {
    pub fn tag(self) -> &'static str {
        match self {
            Component::Cli => "cli",
            Component::Boot => "boot",
            Component::Helper => "helper",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Plain,
}

impl Format {
    fn from_setting(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("plain") | Some("text") => Format::Plain,
            _ => Format::Json,
        }
    }
}

/// `RUST_LOG` wins, then `AUTOMOUNT_LOG_LEVEL`, then the caller's default.
fn filter(rust_log: Option<String>, level: Option<String>, default_level: &str) -> String {
    rust_log
        .or(level)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_level.to_string())
}

fn json_record(
    timestamp: &str,
    component: Component,
    level: log::Level,
    target: &str,
    message: &str,
) -> Value {
    json!({
        "timestamp": timestamp,
        "component": component.tag(),
        "pid": process::id(),
        "level": level.as_str().to_ascii_lowercase(),
        "target": target,
        "message": message,
    })
}

/// Initialize the global logger. The first caller wins.
pub fn init(component: Component, default_level: &str) {
    let _ = INIT.get_or_init(|| configure(component, default_level));
}

fn configure(component: Component, default_level: &str) {
    let filter = filter(
        env::var("RUST_LOG").ok(),
        env::var(LEVEL_ENV).ok(),
        default_level,
    );
    let format = Format::from_setting(env::var(FORMAT_ENV).ok().as_deref());

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(filter));
    match format {
        Format::Json => {
            builder.format(move |buf, record| {
                let payload = json_record(
                    &buf.timestamp().to_string(),
                    component,
                    record.level(),
                    record.target(),
                    &record.args().to_string(),
                );
                writeln!(buf, "{payload}")
            });
        }
        Format::Plain => {
            builder.format(move |buf, record| {
                writeln!(
                    buf,
                    "{} {:<5} zfs-automount[{}:{}] {} - {}",
                    buf.timestamp(),
                    record.level().as_str().to_ascii_lowercase(),
                    component.tag(),
                    process::id(),
                    record.target(),
                    record.args()
                )
            });
        }
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {err}");
    }
}
