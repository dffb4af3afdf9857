//! Command dispatch for the privileged helper.

use automount_core::error::{AutomountError, AutomountResult};
use automount_core::keyfile::materialize_key;
use automount_core::keystore::CredentialStore;
use automount_core::model::KeyEncoding;
use automount_core::protocol::{HelperCommand, HelperReply, HelperRequest, NO_BOOT_KEY};
use automount_zfs::{CommandExecutor, SystemZfs};
use log::{debug, info, warn};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Executes [`HelperCommand`]s against the local `zfs`/`zpool`.
pub struct Dispatcher<E: CommandExecutor> {
    zfs: SystemZfs<E>,
    boot_store: Arc<dyn CredentialStore>,
}

impl<E: CommandExecutor> Dispatcher<E> {
    pub fn new(zfs: SystemZfs<E>, boot_store: Arc<dyn CredentialStore>) -> Self {
        Self { zfs, boot_store }
    }

    /// Decode one request frame and execute it.
    ///
    /// A frame that does not decode is answered with an error and nothing
    /// runs. The id is echoed when it can be recovered.
    pub async fn handle_line(&self, line: &str) -> HelperReply {
        match serde_json::from_str::<HelperRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(err) => {
                let id = serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|value| value.get("id").and_then(|id| id.as_u64()))
                    .unwrap_or(0);
                warn!("rejecting undecodable request {id}: {err}");
                HelperReply::failure(id, format!("Unknown command: {err}"))
            }
        }
    }

    pub async fn handle(&self, request: HelperRequest) -> HelperReply {
        let label = request.command.to_string();
        info!("request {}: {label}", request.id);
        match self.execute(request.command).await {
            Ok(output) => HelperReply::success(request.id, output),
            Err(err) => {
                warn!("request {} ({label}) failed: {err}", request.id);
                HelperReply::failure(request.id, err.reply_text())
            }
        }
    }

    pub async fn execute(&self, command: HelperCommand) -> AutomountResult<String> {
        command.validate()?;
        match command {
            HelperCommand::ImportPools => self.zfs.import_pools().await,
            HelperCommand::MountAll => self.zfs.mount_all().await,
            HelperCommand::LoadKey {
                dataset,
                format,
                key,
            } => self.load_key(&dataset, format, Zeroizing::new(key)).await,
            HelperCommand::ScrubPool { pool } => self.zfs.scrub(&pool).await,
            HelperCommand::TrimPool { pool } => self.zfs.trim(&pool).await,
        }
    }

    async fn load_key(
        &self,
        dataset: &str,
        format: KeyEncoding,
        key: Zeroizing<String>,
    ) -> AutomountResult<String> {
        let key = if key.is_empty() {
            debug!("no key supplied for {dataset}; checking the system keychain");
            self.boot_store.get(dataset)?.ok_or_else(|| {
                AutomountError::Helper(format!("{NO_BOOT_KEY} for {dataset}"))
            })?
        } else {
            key
        };

        let file = materialize_key(format, &key)?;
        let result = self.zfs.load_key(dataset, &file.url()).await;
        drop(file);
        result
    }
}
