pub mod client;
pub mod config;
pub mod error;
pub mod keychain;
pub mod keyfile;
pub mod keystore;
pub mod logging;
pub mod model;
pub mod mountconf;
pub mod protocol;
pub mod provider;
pub mod service;

#[cfg(test)]
mod testing;

pub use client::HelperClient;
pub use config::{AutomountConfig, BootCfg, HelperCfg, KeystoreCfg, Paths, ProbeCommand};
pub use error::{AutomountError, AutomountResult};
pub use keychain::{KeyChain, KeyMaterial, KeyResolution, KeySource};
pub use keystore::{CredentialStore, FileCredentialStore};
pub use model::{
    Dataset, Disk, DiskProtocol, KeyEncoding, KeyFormat, Pool, PoolDiskInfo, PoolHealth,
    ScrubInfo, ScrubStatus, TrimSupport,
};
pub use mountconf::{MountConfig, MountEntry};
pub use protocol::{HelperCommand, HelperReply, HelperRequest};
pub use provider::{HelperLink, KeyPrompt, PoolInspector, PromptResponse};
pub use service::{
    CyclePhase, CycleReport, MaintenanceAction, MaintenanceReport, Orchestrator,
    OrchestratorBuilder, PoolOutcome, Snapshot,
};
