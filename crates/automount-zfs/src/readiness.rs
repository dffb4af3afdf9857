//! Boot readiness gate: coax the kernel into enumerating storage, flush
//! buffers, wait a bounded time for stable device identifiers, then settle.

use crate::command::CommandExecutor;
use automount_core::config::{BootCfg, ProbeCommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// What the sentinel poll observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    SentinelSeen { waited: Duration },
    TimedOut { waited: Duration },
}

#[derive(Debug, Clone)]
pub struct BootGate {
    probes: Vec<ProbeCommand>,
    sync_binary: PathBuf,
    sentinel: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    settle: Duration,
}

impl BootGate {
    pub fn from_config(cfg: &BootCfg) -> Self {
        Self {
            probes: cfg.probe.clone(),
            sync_binary: PathBuf::from(&cfg.sync_binary),
            sentinel: PathBuf::from(&cfg.sentinel),
            timeout: Duration::from_secs(cfg.sentinel_timeout_secs),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            settle: Duration::from_secs(cfg.settle_secs),
        }
    }

    /// Run every step. Never fails: each step is best effort and the gate
    /// always proceeds.
    pub async fn run<E: CommandExecutor + ?Sized>(&self, executor: &E) -> GateOutcome {
        info!("boot gate: probing storage devices");
        for probe in &self.probes {
            let args: Vec<&str> = probe.args.iter().map(String::as_str).collect();
            match executor.run(Path::new(&probe.binary), &args).await {
                Ok(out) if out.success() => {}
                Ok(out) => warn!("probe {} exited with {}", probe.binary, out.status),
                Err(err) => warn!("probe {} failed: {err}", probe.binary),
            }
        }

        info!("boot gate: syncing filesystems");
        if let Err(err) = executor.run(&self.sync_binary, &[]).await {
            warn!("sync failed: {err}");
        }

        info!(
            "boot gate: waiting up to {:?} for {}",
            self.timeout,
            self.sentinel.display()
        );
        let outcome = self.wait_for_sentinel().await;
        match outcome {
            GateOutcome::SentinelSeen { waited } => {
                info!("boot gate: device identifiers ready after {waited:?}")
            }
            GateOutcome::TimedOut { waited } => warn!(
                "boot gate: {} did not appear within {waited:?}; proceeding anyway",
                self.sentinel.display()
            ),
        }

        if !self.settle.is_zero() {
            info!("boot gate: settling for {:?}", self.settle);
            tokio::time::sleep(self.settle).await;
        }
        outcome
    }

    async fn wait_for_sentinel(&self) -> GateOutcome {
        let start = Instant::now();
        loop {
            if self.sentinel.exists() {
                return GateOutcome::SentinelSeen {
                    waited: start.elapsed(),
                };
            }
            let waited = start.elapsed();
            if waited >= self.timeout {
                return GateOutcome::TimedOut { waited };
            }
            tokio::time::sleep(self.poll_interval.min(self.timeout - waited)).await;
        }
    }
}
