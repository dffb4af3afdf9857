//! In-memory doubles for the collaborator traits.

use crate::error::{AutomountError, AutomountResult};
use crate::keystore::CredentialStore;
use crate::model::{
    Dataset, Disk, DiskProtocol, KeyFormat, Pool, PoolDiskInfo, PoolHealth, ScrubInfo,
};
use crate::protocol::{HelperCommand, NO_BOOT_KEY};
use crate::provider::{HelperLink, KeyPrompt, PoolInspector, PromptResponse};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use zeroize::Zeroizing;

pub fn encrypted(name: &str, key_format: KeyFormat, mounted: bool) -> Dataset {
    Dataset {
        name: name.to_string(),
        mountpoint: format!("/{name}"),
        mounted,
        encrypted: true,
        key_format,
        key_location: Some("prompt".to_string()),
    }
}

pub fn plain(name: &str, mounted: bool) -> Dataset {
    Dataset {
        name: name.to_string(),
        mountpoint: format!("/{name}"),
        mounted,
        encrypted: false,
        key_format: KeyFormat::None,
        key_location: None,
    }
}

pub fn pool(name: &str, ssd: bool, protocol: DiskProtocol) -> Pool {
    let disk = Disk {
        path: format!("/dev/{name}0"),
        device_name: format!("{name}0"),
        is_ssd: ssd,
        protocol,
        model: "test disk".to_string(),
    };
    Pool {
        name: name.to_string(),
        health: PoolHealth::Online,
        size: "1T".to_string(),
        allocated: "100G".to_string(),
        scrub: ScrubInfo::unknown(),
        disks: PoolDiskInfo::new(name, vec![disk]),
    }
}

/// Pretends to be both the pool inspector and the privileged helper.
///
/// A `load_key` with key text always succeeds; an empty one succeeds only for
/// datasets registered with [`FakeZfs::accept_empty_key_for`]. `mount_all`
/// mounts every dataset that is unencrypted or had its key loaded, except
/// those registered with [`FakeZfs::keep_unmounted`].
#[derive(Default)]
pub struct FakeZfs {
    pools: Mutex<Vec<Pool>>,
    datasets: Mutex<Vec<Dataset>>,
    commands: Mutex<Vec<String>>,
    boot_keys: Mutex<BTreeSet<String>>,
    loaded: Mutex<BTreeSet<String>>,
    stuck: Mutex<BTreeSet<String>>,
    failures: Mutex<BTreeMap<String, String>>,
    listings: AtomicUsize,
}

impl FakeZfs {
    pub fn with(pools: Vec<Pool>, datasets: Vec<Dataset>) -> Self {
        let fake = Self::default();
        *fake.pools.lock().unwrap() = pools;
        *fake.datasets.lock().unwrap() = datasets;
        fake
    }

    pub fn accept_empty_key_for(&self, dataset: &str) {
        self.boot_keys.lock().unwrap().insert(dataset.to_string());
    }

    pub fn keep_unmounted(&self, dataset: &str) {
        self.stuck.lock().unwrap().insert(dataset.to_string());
    }

    /// Make every command whose colon form starts with `prefix` fail.
    pub fn fail(&self, prefix: &str, error: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(prefix.to_string(), error.to_string());
    }

    /// Colon forms of every command received, key text included.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    fn unredacted(command: &HelperCommand) -> String {
        match command {
            HelperCommand::LoadKey {
                dataset,
                format,
                key,
            } => format!("load_key:{dataset}:{}:{key}", format.as_str()),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl PoolInspector for FakeZfs {
    async fn list_pools(&self) -> AutomountResult<Vec<Pool>> {
        Ok(self.pools.lock().unwrap().clone())
    }

    async fn list_datasets(&self) -> AutomountResult<Vec<Dataset>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self.datasets.lock().unwrap().clone())
    }
}

#[async_trait]
impl HelperLink for FakeZfs {
    async fn execute(&self, command: HelperCommand) -> AutomountResult<String> {
        let line = Self::unredacted(&command);
        self.commands.lock().unwrap().push(line.clone());

        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, error)| error.clone());
        if let Some(error) = failure {
            return Err(AutomountError::Helper(error));
        }

        match command {
            HelperCommand::LoadKey { dataset, key, .. } => {
                if key.is_empty() && !self.boot_keys.lock().unwrap().contains(&dataset) {
                    return Err(AutomountError::Helper(format!(
                        "{NO_BOOT_KEY} for {dataset}"
                    )));
                }
                self.loaded.lock().unwrap().insert(dataset);
                Ok("Key loaded successfully".to_string())
            }
            HelperCommand::MountAll => {
                let loaded = self.loaded.lock().unwrap().clone();
                let stuck = self.stuck.lock().unwrap().clone();
                for ds in self.datasets.lock().unwrap().iter_mut() {
                    if (!ds.encrypted || loaded.contains(&ds.name)) && !stuck.contains(&ds.name) {
                        ds.mounted = true;
                    }
                }
                Ok(String::new())
            }
            HelperCommand::ImportPools => Ok(String::new()),
            HelperCommand::ScrubPool { pool } => Ok(format!("scrub started on {pool}")),
            HelperCommand::TrimPool { pool } => Ok(format!("trim started on {pool}")),
        }
    }
}

/// Credential store that counts reads.
#[derive(Default)]
pub struct TrackingStore {
    secrets: Mutex<BTreeMap<String, String>>,
    reads: AtomicUsize,
}

impl TrackingStore {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        let store = Self::default();
        for (account, secret) in entries {
            store
                .secrets
                .lock()
                .unwrap()
                .insert(account.to_string(), secret.to_string());
        }
        store
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl CredentialStore for TrackingStore {
    fn scope(&self) -> &str {
        "user"
    }

    fn get(&self, account: &str) -> AutomountResult<Option<Zeroizing<String>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(account)
            .map(|secret| Zeroizing::new(secret.clone())))
    }

    fn save(&self, account: &str, secret: &str) -> AutomountResult<()> {
        self.secrets
            .lock()
            .unwrap()
            .insert(account.to_string(), secret.to_string());
        Ok(())
    }

    fn delete(&self, account: &str) -> AutomountResult<bool> {
        Ok(self.secrets.lock().unwrap().remove(account).is_some())
    }

    fn list(&self) -> AutomountResult<Vec<String>> {
        Ok(self.secrets.lock().unwrap().keys().cloned().collect())
    }
}

/// Prompt that gives the same answer every time.
pub struct ScriptedPrompt {
    answer: Option<(String, bool)>,
    asked: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn answering(key: &str, remember: bool) -> Self {
        Self {
            answer: Some((key.to_string(), remember)),
            asked: AtomicUsize::new(0),
        }
    }

    pub fn declining() -> Self {
        Self {
            answer: None,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyPrompt for ScriptedPrompt {
    async fn prompt(&self, _dataset: &Dataset) -> AutomountResult<Option<PromptResponse>> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.as_ref().map(|(key, remember)| PromptResponse {
            key: Zeroizing::new(key.clone()),
            remember: *remember,
        }))
    }
}
