use crate::error::AutomountResult;
use crate::model::{Dataset, Pool};
use crate::protocol::HelperCommand;
use async_trait::async_trait;
use zeroize::Zeroizing;

/// Read-only view of pools and datasets.
///
/// Implementations return a full snapshot on every call; the administrative
/// tools offer nothing incremental.
#[async_trait]
pub trait PoolInspector: Send + Sync {
    /// Every imported pool with scrub and TRIM information filled in.
    async fn list_pools(&self) -> AutomountResult<Vec<Pool>>;

    /// Every filesystem dataset across all imported pools.
    async fn list_datasets(&self) -> AutomountResult<Vec<Dataset>>;
}

/// Channel to the privileged helper.
#[async_trait]
pub trait HelperLink: Send + Sync {
    /// Send one command and wait for its reply. `Ok` carries the helper's
    /// output text; a helper-reported failure is `AutomountError::Helper`.
    async fn execute(&self, command: HelperCommand) -> AutomountResult<String>;
}

/// What the operator typed at an interactive key prompt.
pub struct PromptResponse {
    pub key: Zeroizing<String>,
    /// Persist the key in the user-scoped store for next time.
    pub remember: bool,
}

/// Last-resort interactive key entry.
#[async_trait]
pub trait KeyPrompt: Send + Sync {
    /// Ask for the key of `dataset`. `Ok(None)` means the operator declined.
    async fn prompt(&self, dataset: &Dataset) -> AutomountResult<Option<PromptResponse>>;
}
