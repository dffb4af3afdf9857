//! zfs-automount: boot automation and operator tooling for encrypted pools.

use anyhow::{bail, Context, Result};
use automount_core::{
    client::HelperClient,
    config::AutomountConfig,
    keystore::{CredentialStore, FileCredentialStore},
    logging::{self, Component},
    mountconf::MountConfig,
    protocol::HelperCommand,
    provider::{HelperLink, PoolInspector},
    service::Orchestrator,
};
use automount_zfs::SystemZfs;
use clap::{Parser, Subcommand};
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroizing;

mod boot;
mod prompt;

use boot::Automation;
use prompt::TerminalPrompt;

/// Top-level command-line options.
#[derive(Parser, Debug)]
#[command(
    name = "zfs-automount",
    version,
    about = "Import pools, load keys, and mount encrypted ZFS datasets."
)]
struct Cli {
    /// Settings file (defaults to $ZFS_AUTOMOUNT_CONFIG or /etc/zfs/automount.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Boot entry point: wait for devices, import, load keys, mount.
    #[arg(long, conflicts_with_all = ["run_scrub", "run_trim"])]
    boot_mount: bool,

    /// Scheduled entry point: scrub every imported pool.
    #[arg(long, conflicts_with = "run_trim")]
    run_scrub: bool,

    /// Scheduled entry point: TRIM every eligible pool.
    #[arg(long)]
    run_trim: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show pools and datasets (default).
    Status,

    /// Import every pool visible under the stable device-id directory.
    Import,

    /// Resolve keys for locked datasets and mount everything.
    Mount,

    /// Start a scrub on POOL, or on every imported pool.
    Scrub { pool: Option<String> },

    /// Start a TRIM on POOL, or on every eligible pool.
    Trim { pool: Option<String> },

    /// Inspect or edit the per-dataset mount configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage stored dataset keys.
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Send one command to the helper, e.g. `scrub_pool:tank`.
    HelperExec { command: String },

    /// Validate a settings file or emit the settings schema.
    Validate {
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        #[arg(long)]
        schema: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print every configured dataset.
    Show,

    /// Write a commented template if the file does not exist.
    Init,

    /// Replace the options of DATASET, e.g. `keylocation=file:///keys/enc1`.
    Set {
        dataset: String,
        #[arg(value_parser = parse_option)]
        options: Vec<(String, String)>,
    },

    /// Drop DATASET from the file.
    Remove { dataset: String },
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /// Prompt for a key and store it.
    Save {
        dataset: String,
        /// Use the system keychain the helper reads at boot (root only).
        #[arg(long)]
        system: bool,
    },

    /// Forget the stored key of DATASET.
    Delete {
        dataset: String,
        #[arg(long)]
        system: bool,
    },

    /// List datasets with a stored key.
    List {
        #[arg(long)]
        system: bool,
    },
}

fn parse_option(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() && !val.is_empty() => {
            Ok((key.to_string(), val.to_string()))
        }
        _ => Err(format!("expected option=value, got `{value}`")),
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let component = if cli.boot_mount || cli.run_scrub || cli.run_trim {
        Component::Boot
    } else {
        Component::Cli
    };
    logging::init(component, "info");
    let config_path = cli.config.clone().unwrap_or_else(AutomountConfig::default_path);

    if let Some(Commands::Validate { file, schema }) = &cli.command {
        if *schema {
            println!("{}", to_string_pretty(&schema_for!(AutomountConfig))?);
            return Ok(());
        }
        let file = file.clone().unwrap_or(config_path);
        let cfg = AutomountConfig::load(&file)
            .with_context(|| format!("failed to load configuration from {}", file.display()))?;
        println!(
            "Configuration valid (helper socket {}, mount config {}).",
            cfg.socket_path().display(),
            cfg.mount_config_path().display()
        );
        return Ok(());
    }

    let config = AutomountConfig::load_or_default(&config_path).with_context(|| {
        format!(
            "failed to load configuration from {}",
            config_path.display()
        )
    })?;

    if cli.boot_mount {
        return boot::run(&config, Automation::Mount).await;
    }
    if cli.run_scrub {
        return boot::run(&config, Automation::Scrub).await;
    }
    if cli.run_trim {
        return boot::run(&config, Automation::Trim).await;
    }

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => status(&config).await,
        Commands::Import => {
            interactive(&config).import_pools().await?;
            println!("Pools imported.");
            Ok(())
        }
        Commands::Mount => {
            let report = interactive(&config).mount_all().await;
            for warning in &report.warnings {
                warn!("{warning}");
            }
            let report = report.into_result()?;
            for (dataset, source) in &report.keys {
                println!("{dataset}: key loaded from {source}");
            }
            println!("All encrypted datasets mounted.");
            Ok(())
        }
        Commands::Scrub { pool } => {
            let report = interactive(&config).run_scrub(pool.as_deref()).await?;
            boot::finish_maintenance(report)
        }
        Commands::Trim { pool } => {
            let report = interactive(&config).run_trim(pool.as_deref()).await?;
            boot::finish_maintenance(report)
        }
        Commands::Config { action } => mount_config(&config, action),
        Commands::Keys { action } => keys(&config, action),
        Commands::HelperExec { command } => {
            let command: HelperCommand = command.parse()?;
            let client = HelperClient::new(config.socket_path(), config.request_timeout());
            let output = client.execute(command).await?;
            if !output.is_empty() {
                println!("{output}");
            }
            Ok(())
        }
        Commands::Validate { .. } => Ok(()),
    }
}

/// Orchestrator with every key source, for a human at a terminal.
fn interactive(config: &AutomountConfig) -> Orchestrator {
    let inspector = Arc::new(SystemZfs::from_config(config));
    let helper = Arc::new(HelperClient::new(
        config.socket_path(),
        config.request_timeout(),
    ));
    let mut builder = Orchestrator::builder(inspector, helper, config.mount_config_path())
        .prompt(Arc::new(TerminalPrompt::default()));
    match user_store(config) {
        Some(store) => builder = builder.user_store(store),
        None => warn!("no home directory; user keychain disabled"),
    }
    builder.build()
}

fn user_store(config: &AutomountConfig) -> Option<Arc<dyn CredentialStore>> {
    let dir = config.user_store_dir()?;
    Some(Arc::new(FileCredentialStore::new(
        "user",
        dir,
        &config.keystore.service,
    )))
}

fn store_for(config: &AutomountConfig, system: bool) -> Result<Arc<dyn CredentialStore>> {
    if system {
        return Ok(Arc::new(FileCredentialStore::new(
            "system",
            config.system_store_dir(),
            &config.keystore.service,
        )));
    }
    match user_store(config) {
        Some(store) => Ok(store),
        None => bail!("cannot locate the user keychain: neither XDG_DATA_HOME nor HOME is set"),
    }
}

async fn status(config: &AutomountConfig) -> Result<()> {
    let zfs = SystemZfs::from_config(config);
    let (pools, datasets) = tokio::join!(zfs.list_pools(), zfs.list_datasets());
    let pools = pools.context("list pools")?;
    let datasets = datasets.context("list datasets")?;
    let helper = HelperClient::new(config.socket_path(), config.request_timeout());
    println!(
        "zfs: {}  zpool: {}  helper: {}{}",
        zfs.zfs_path().display(),
        zfs.zpool_path().display(),
        helper.socket().display(),
        if helper.socket().exists() { "" } else { " (not running)" }
    );
    println!();

    if pools.is_empty() {
        println!("No pools imported.");
    } else {
        println!(
            "{:<16} {:<10} {:>8} {:>8}  {:<14} {:<14} {}",
            "POOL", "HEALTH", "SIZE", "ALLOC", "SCRUB", "LAST SCRUB", "TRIM"
        );
        for pool in &pools {
            println!(
                "{:<16} {:<10} {:>8} {:>8}  {:<14} {:<14} {} ({})",
                pool.name,
                pool.health.to_string(),
                pool.size,
                pool.allocated,
                pool.scrub.status.to_string(),
                pool.scrub.last_scrub_label(),
                pool.trim_status(),
                pool.disks.summary()
            );
        }
    }

    let encrypted: Vec<_> = datasets.iter().filter(|ds| ds.encrypted).collect();
    if !encrypted.is_empty() {
        println!();
        println!("{:<32} {:<8} {}", "ENCRYPTED DATASET", "MOUNTED", "MOUNTPOINT");
        for ds in encrypted {
            println!(
                "{:<32} {:<8} {}",
                ds.name,
                if ds.mounted { "yes" } else { "no" },
                ds.mountpoint
            );
        }
    }
    Ok(())
}

fn mount_config(config: &AutomountConfig, action: ConfigAction) -> Result<()> {
    let file = MountConfig::new(config.mount_config_path());
    match action {
        ConfigAction::Show => {
            let entries = file.entries()?;
            if entries.is_empty() {
                println!("No datasets configured in {}.", file.path().display());
            }
            for entry in entries {
                let options: Vec<String> = entry
                    .options
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect();
                println!("{} {}", entry.dataset, options.join(" "));
            }
        }
        ConfigAction::Init => {
            if file.write_default()? {
                println!("Wrote {}.", file.path().display());
            } else {
                println!("{} already exists.", file.path().display());
            }
        }
        ConfigAction::Set { dataset, options } => {
            let options: BTreeMap<String, String> = options.into_iter().collect();
            file.update(&dataset, options)?;
            println!("Updated {dataset}.");
        }
        ConfigAction::Remove { dataset } => {
            if file.remove(&dataset)? {
                println!("Removed {dataset}.");
            } else {
                println!("{dataset} was not configured.");
            }
        }
    }
    Ok(())
}

fn keys(config: &AutomountConfig, action: KeysAction) -> Result<()> {
    match action {
        KeysAction::Save { dataset, system } => {
            let store = store_for(config, system)?;
            let key = Zeroizing::new(prompt_password(format!("Key for {dataset}: "))?);
            if key.is_empty() {
                bail!("empty key; nothing saved");
            }
            store.save(&dataset, &key)?;
            println!("Saved key for {dataset} to the {} keychain.", store.scope());
        }
        KeysAction::Delete { dataset, system } => {
            let store = store_for(config, system)?;
            if store.delete(&dataset)? {
                println!("Deleted key for {dataset}.");
            } else {
                println!("No stored key for {dataset}.");
            }
        }
        KeysAction::List { system } => {
            let store = store_for(config, system)?;
            let accounts = store.list()?;
            if accounts.is_empty() {
                println!("No keys in the {} keychain.", store.scope());
            }
            for account in accounts {
                println!("{account}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_arguments_means_status() {
        let cli = Cli::try_parse_from(["zfs-automount"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.boot_mount);
    }

    #[test]
    fn automation_flags_are_exclusive() {
        assert!(Cli::try_parse_from(["zfs-automount", "--boot-mount"]).unwrap().boot_mount);
        assert!(Cli::try_parse_from(["zfs-automount", "--boot-mount", "--run-scrub"]).is_err());
    }

    #[test]
    fn config_set_parses_options() {
        let cli = Cli::try_parse_from([
            "zfs-automount",
            "config",
            "set",
            "tank/enc1",
            "keylocation=file:///keys/enc1",
            "readonly=on",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Config {
                action: ConfigAction::Set { dataset, options },
            }) => {
                assert_eq!(dataset, "tank/enc1");
                assert_eq!(options.len(), 2);
                assert_eq!(options[0].0, "keylocation");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
        assert!(parse_option("readonly").is_err());
    }
}
