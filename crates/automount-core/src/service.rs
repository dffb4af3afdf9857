//! Mount-cycle orchestration: import, key resolution, mount, and the
//! verify-after-act reconciliation that decides whether a cycle worked.

use crate::error::{AutomountError, AutomountResult};
use crate::keychain::{KeyChain, KeyResolution, KeySource};
use crate::keystore::CredentialStore;
use crate::model::{Dataset, Pool, TrimSupport};
use crate::mountconf::MountConfig;
use crate::protocol::HelperCommand;
use crate::provider::{HelperLink, KeyPrompt, PoolInspector};
use chrono::{DateTime, Local};
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

/// Phase of the current (or last) mount cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Importing,
    KeyResolution,
    Mounting,
    Reconciling,
    Done,
    Failed,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Importing => "importing",
            CyclePhase::KeyResolution => "key resolution",
            CyclePhase::Mounting => "mounting",
            CyclePhase::Reconciling => "reconciling",
            CyclePhase::Done => "done",
            CyclePhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Pools and datasets as observed by the last refresh.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub pools: Vec<Pool>,
    pub datasets: Vec<Dataset>,
    pub refreshed_at: Option<DateTime<Local>>,
}

impl Snapshot {
    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.iter().find(|pool| pool.name == name)
    }

    /// Encrypted datasets that are not mounted.
    pub fn locked(&self) -> Vec<&Dataset> {
        self.datasets.iter().filter(|ds| ds.needs_key()).collect()
    }
}

/// Outcome of one mount cycle.
#[derive(Debug)]
pub struct CycleReport {
    /// `Done` or `Failed`.
    pub phase: CyclePhase,
    /// Phase that was running when the cycle failed.
    pub failed_during: Option<CyclePhase>,
    /// Datasets whose key was loaded, with the source that supplied it.
    pub keys: Vec<(String, KeySource)>,
    pub warnings: Vec<String>,
    pub error: Option<AutomountError>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            phase: CyclePhase::Idle,
            failed_during: None,
            keys: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Split the report into the cycle error, if any.
    pub fn into_result(mut self) -> AutomountResult<CycleReport> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Pool maintenance kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceAction {
    Scrub,
    Trim,
}

impl fmt::Display for MaintenanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceAction::Scrub => f.write_str("scrub"),
            MaintenanceAction::Trim => f.write_str("trim"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolOutcome {
    Started(String),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct MaintenanceReport {
    pub action: MaintenanceAction,
    pub pools: Vec<(String, PoolOutcome)>,
}

impl MaintenanceReport {
    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.pools
            .iter()
            .filter_map(|(pool, outcome)| match outcome {
                PoolOutcome::Failed(err) => Some((pool.as_str(), err.as_str())),
                _ => None,
            })
            .collect()
    }

    /// `Err(Maintenance)` listing every pool that failed to start.
    pub fn into_result(self) -> AutomountResult<MaintenanceReport> {
        let failures = self.failures();
        if failures.is_empty() {
            return Ok(self);
        }
        let summary = failures
            .iter()
            .map(|(pool, err)| format!("{pool}: {err}"))
            .collect::<Vec<_>>()
            .join("\n");
        Err(AutomountError::Maintenance(summary))
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    inspector: Arc<dyn PoolInspector>,
    helper: Arc<dyn HelperLink>,
    mount_config: PathBuf,
    user_store: Option<Arc<dyn CredentialStore>>,
    prompt: Option<Arc<dyn KeyPrompt>>,
}

impl OrchestratorBuilder {
    /// Attach the user-scoped credential store (interactive sessions only).
    pub fn user_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.user_store = Some(store);
        self
    }

    /// Attach the last-resort interactive prompt (interactive sessions only).
    pub fn prompt(mut self, prompt: Arc<dyn KeyPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn build(self) -> Orchestrator {
        let mut keychain = KeyChain::new(MountConfig::new(self.mount_config), self.helper.clone());
        if let Some(store) = self.user_store {
            keychain = keychain.with_user_store(store);
        }
        if let Some(prompt) = self.prompt {
            keychain = keychain.with_prompt(prompt);
        }
        Orchestrator {
            inspector: self.inspector,
            helper: self.helper,
            keychain,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            phase: Mutex::new(CyclePhase::Idle),
        }
    }
}

/// Unprivileged controller that drives the privileged helper.
pub struct Orchestrator {
    inspector: Arc<dyn PoolInspector>,
    helper: Arc<dyn HelperLink>,
    keychain: KeyChain,
    snapshot: RwLock<Arc<Snapshot>>,
    phase: Mutex<CyclePhase>,
}

impl Orchestrator {
    pub fn builder(
        inspector: Arc<dyn PoolInspector>,
        helper: Arc<dyn HelperLink>,
        mount_config: impl Into<PathBuf>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            inspector,
            helper,
            mount_config: mount_config.into(),
            user_store: None,
            prompt: None,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase.lock().map(|phase| *phase).unwrap_or(CyclePhase::Idle)
    }

    fn enter(&self, phase: CyclePhase) {
        debug!("mount cycle phase: {phase}");
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    /// Latest snapshot. Cheap; the snapshot is shared, not copied.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-query pools and datasets and replace the snapshot wholesale.
    pub async fn refresh(&self) -> AutomountResult<Arc<Snapshot>> {
        let (pools, datasets) =
            futures::join!(self.inspector.list_pools(), self.inspector.list_datasets());
        let snapshot = Arc::new(Snapshot {
            pools: pools?,
            datasets: datasets?,
            refreshed_at: Some(Local::now()),
        });
        debug!(
            "refreshed state: {} pools, {} datasets",
            snapshot.pools.len(),
            snapshot.datasets.len()
        );
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot.clone(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
        }
        Ok(snapshot)
    }

    /// Datasets of `pool` from the latest snapshot.
    pub fn datasets_for_pool(&self, pool: &str) -> Vec<Dataset> {
        self.snapshot()
            .datasets
            .iter()
            .filter(|ds| ds.belongs_to(pool))
            .cloned()
            .collect()
    }

    pub async fn import_pools(&self) -> AutomountResult<()> {
        info!("importing pools");
        self.helper.execute(HelperCommand::ImportPools).await?;
        self.refresh().await?;
        Ok(())
    }

    /// Resolve keys for every locked dataset in the latest snapshot.
    ///
    /// All datasets are attempted concurrently; every failure is collected.
    pub async fn resolve_keys(&self) -> AutomountResult<Vec<KeyResolution>> {
        let snapshot = self.snapshot();
        let locked = snapshot.locked();
        if locked.is_empty() {
            debug!("no locked encrypted datasets");
            return Ok(Vec::new());
        }
        info!("resolving keys for {} dataset(s)", locked.len());

        let results = join_all(locked.iter().map(|ds| self.keychain.resolve(ds))).await;

        let mut resolved = Vec::new();
        let mut failures = Vec::new();
        for (ds, result) in locked.iter().zip(results) {
            match result {
                Ok(resolution) => resolved.push(resolution),
                Err(err) => {
                    warn!("key for {} unavailable: {err}", ds.name);
                    failures.push(format!("{}: {err}", ds.name));
                }
            }
        }
        if !failures.is_empty() {
            return Err(AutomountError::KeyResolution(failures.join("\n")));
        }
        Ok(resolved)
    }

    /// Refresh, resolve keys, mount everything, then verify the result.
    pub async fn mount_all(&self) -> CycleReport {
        let mut report = CycleReport::new();
        self.mount_phases(&mut report).await;
        self.finish(report)
    }

    /// Import, then [`Orchestrator::mount_all`].
    pub async fn run_mount_cycle(&self) -> CycleReport {
        let mut report = CycleReport::new();
        self.enter(CyclePhase::Importing);
        match self.import_pools().await {
            Ok(()) => self.mount_phases(&mut report).await,
            Err(err) => fail(&mut report, CyclePhase::Importing, err),
        }
        self.finish(report)
    }

    async fn mount_phases(&self, report: &mut CycleReport) {
        self.enter(CyclePhase::KeyResolution);
        if let Err(err) = self.refresh().await {
            return fail(report, CyclePhase::KeyResolution, err);
        }
        match self.resolve_keys().await {
            Ok(resolved) => {
                report.keys = resolved
                    .into_iter()
                    .map(|resolution| (resolution.dataset, resolution.source))
                    .collect();
            }
            Err(err) => return fail(report, CyclePhase::KeyResolution, err),
        }

        self.enter(CyclePhase::Mounting);
        let mount_error = match self.helper.execute(HelperCommand::MountAll).await {
            Ok(_) => None,
            Err(err) => {
                warn!("mount all reported an error: {err}");
                Some(err)
            }
        };

        self.enter(CyclePhase::Reconciling);
        let snapshot = match self.refresh().await {
            Ok(snapshot) => snapshot,
            Err(err) => return fail(report, CyclePhase::Reconciling, err),
        };
        let unmounted: Vec<String> = snapshot
            .locked()
            .into_iter()
            .map(|ds| ds.name.clone())
            .collect();

        if let Some(err) = mount_error {
            report
                .warnings
                .push(format!("mount all reported an error: {}", err.reply_text()));
        }
        if !unmounted.is_empty() {
            return fail(
                report,
                CyclePhase::Reconciling,
                AutomountError::VerificationMismatch(unmounted),
            );
        }
    }

    fn finish(&self, mut report: CycleReport) -> CycleReport {
        report.phase = if report.error.is_some() {
            CyclePhase::Failed
        } else {
            CyclePhase::Done
        };
        self.enter(report.phase);
        match &report.error {
            Some(err) => error!(
                "mount cycle failed during {}: {err}",
                report.failed_during.unwrap_or(CyclePhase::Idle)
            ),
            None => info!(
                "mount cycle complete: {} key(s) loaded, {} warning(s)",
                report.keys.len(),
                report.warnings.len()
            ),
        }
        report
    }

    /// Start a scrub on `pool`, or on every imported pool.
    pub async fn run_scrub(&self, pool: Option<&str>) -> AutomountResult<MaintenanceReport> {
        let snapshot = self.refresh().await?;
        let targets: Vec<(String, Option<String>)> = match pool {
            Some(name) => vec![(name.to_string(), None)],
            None => snapshot
                .pools
                .iter()
                .map(|pool| (pool.name.clone(), None))
                .collect(),
        };
        Ok(self.maintain(MaintenanceAction::Scrub, targets).await)
    }

    /// Start a TRIM on `pool`, or on every pool whose disks all support it.
    ///
    /// Pools rated only "maybe" are skipped; TRIM over some USB bridges can
    /// hang the device.
    pub async fn run_trim(&self, pool: Option<&str>) -> AutomountResult<MaintenanceReport> {
        let snapshot = self.refresh().await?;
        let candidates: Vec<&Pool> = match pool {
            Some(name) => match snapshot.pool(name) {
                Some(found) => vec![found],
                None => {
                    return Err(AutomountError::Maintenance(format!(
                        "{name}: pool is not imported"
                    )))
                }
            },
            None => snapshot.pools.iter().collect(),
        };
        let targets = candidates
            .into_iter()
            .map(|pool| {
                let skip = match pool.trim_support() {
                    TrimSupport::Supported => None,
                    other => Some(format!("TRIM {}", other.label().to_lowercase())),
                };
                (pool.name.clone(), skip)
            })
            .collect();
        Ok(self.maintain(MaintenanceAction::Trim, targets).await)
    }

    async fn maintain(
        &self,
        action: MaintenanceAction,
        targets: Vec<(String, Option<String>)>,
    ) -> MaintenanceReport {
        let runs = targets.into_iter().map(|(pool, skip)| async move {
            if let Some(reason) = skip {
                debug!("skipping {action} on {pool}: {reason}");
                return (pool, PoolOutcome::Skipped(reason));
            }
            let command = match action {
                MaintenanceAction::Scrub => HelperCommand::ScrubPool { pool: pool.clone() },
                MaintenanceAction::Trim => HelperCommand::TrimPool { pool: pool.clone() },
            };
            match self.helper.execute(command).await {
                Ok(output) => {
                    info!("{action} started on {pool}");
                    (pool, PoolOutcome::Started(output))
                }
                Err(err) => {
                    error!("{action} on {pool} failed: {err}");
                    (pool, PoolOutcome::Failed(err.reply_text()))
                }
            }
        });
        let pools = join_all(runs).await;
        if pools.is_empty() {
            info!("no pools eligible for {action}");
        }
        MaintenanceReport { action, pools }
    }
}

fn fail(report: &mut CycleReport, phase: CyclePhase, err: AutomountError) {
    report.failed_during = Some(phase);
    report.error = Some(err);
}
