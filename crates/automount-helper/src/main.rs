use anyhow::{Context, Result};
use automount_core::logging::{self, Component};
use automount_core::{config::AutomountConfig, keystore::FileCredentialStore};
use automount_zfs::SystemZfs;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::{select, signal};

mod executor;
mod server;

use executor::Dispatcher;
use server::PeerPolicy;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("helper exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init(Component::Helper, "info");
    let config_path = AutomountConfig::default_path();
    let config = AutomountConfig::load_or_default(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    info!(
        "zfs-automount helper starting (config: {})",
        config_path.display()
    );
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        warn!("helper is not running as root; pool operations will likely fail");
    }

    let zfs = SystemZfs::from_config(&config);
    let boot_store = Arc::new(FileCredentialStore::new(
        "system",
        config.system_store_dir(),
        &config.keystore.service,
    ));
    let dispatcher = Arc::new(Dispatcher::new(zfs, boot_store));

    let listener = server::bind(&config.socket_path(), config.helper.socket_mode)?;
    let policy = PeerPolicy::new(config.helper.allowed_uids.clone());

    select! {
        res = server::serve(listener, dispatcher, policy) => res?,
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    if let Err(err) = std::fs::remove_file(config.socket_path()) {
        warn!("could not remove {}: {err}", config.socket_path().display());
    }
    Ok(())
}
