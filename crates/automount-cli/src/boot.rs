//! Unattended entry points run by the system at boot or on a schedule.

use anyhow::{Context, Result};
use automount_core::{
    client::HelperClient, config::AutomountConfig, service::Orchestrator, MaintenanceReport,
    PoolOutcome,
};
use automount_zfs::{BootGate, SystemRunner, SystemZfs};
use log::{info, warn};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// What the automation was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Automation {
    Mount,
    Scrub,
    Trim,
}

/// Orchestrator wired for unattended use: no user store and no prompt.
pub fn unattended(config: &AutomountConfig) -> Orchestrator {
    let inspector = Arc::new(SystemZfs::from_config(config));
    let helper = Arc::new(HelperClient::new(
        config.socket_path(),
        config.request_timeout(),
    ));
    Orchestrator::builder(inspector, helper, config.mount_config_path()).build()
}

pub async fn run(config: &AutomountConfig, task: Automation) -> Result<()> {
    match task {
        Automation::Mount => boot_mount(config).await,
        Automation::Scrub => {
            let report = unattended(config).run_scrub(None).await?;
            finish_maintenance(report)
        }
        Automation::Trim => {
            let report = unattended(config).run_trim(None).await?;
            finish_maintenance(report)
        }
    }
}

async fn boot_mount(config: &AutomountConfig) -> Result<()> {
    let boot = &config.boot;
    if !boot.auto_import && !boot.auto_mount {
        info!("boot import and mount are both disabled; nothing to do");
        return Ok(());
    }

    let runner = SystemRunner::new(config.command_timeout());
    BootGate::from_config(boot).run(&runner).await;

    let orchestrator = unattended(config);
    if boot.auto_mount {
        let report = orchestrator.run_mount_cycle().await;
        for warning in &report.warnings {
            warn!("{warning}");
        }
        report.into_result().context("boot mount cycle")?;
    } else {
        orchestrator.import_pools().await.context("boot import")?;
    }

    if let Some(cookie) = &boot.cookie_path {
        touch(Path::new(cookie))?;
    }
    info!("boot automation finished");
    Ok(())
}

fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create cookie directory {}", parent.display()))?;
    }
    fs::write(path, b"").with_context(|| format!("write boot cookie {}", path.display()))
}

pub fn finish_maintenance(report: MaintenanceReport) -> Result<()> {
    for (pool, outcome) in &report.pools {
        match outcome {
            PoolOutcome::Started(_) => println!("{pool}: {} started", report.action),
            PoolOutcome::Skipped(reason) => println!("{pool}: skipped ({reason})"),
            PoolOutcome::Failed(err) => println!("{pool}: {} failed: {err}", report.action),
        }
    }
    if report.pools.is_empty() {
        println!("No pools eligible for {}.", report.action);
    }
    report.into_result()?;
    Ok(())
}
