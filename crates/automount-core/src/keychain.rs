//! Ordered key-resolution chain for encrypted datasets.
//!
//! Sources are tried in this order:
//!
//! 1. the keyfile named by the dataset's `keylocation=file://...` entry in
//!    the mount configuration,
//! 2. the boot-scoped store, which only the privileged helper can read (an
//!    empty `load_key` asks it to look),
//! 3. the user-scoped store of the invoking user,
//! 4. an interactive prompt.
//!
//! Boot automation has no user session, so it builds the chain without
//! sources 3 and 4.

use crate::error::{AutomountError, AutomountResult};
use crate::keyfile::read_keyfile;
use crate::keystore::CredentialStore;
use crate::model::{Dataset, KeyEncoding, KeyFormat};
use crate::mountconf::MountConfig;
use crate::protocol::{HelperCommand, NO_BOOT_KEY};
use crate::provider::{HelperLink, KeyPrompt};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Where a dataset's key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Keyfile,
    BootStore,
    UserStore,
    Prompt,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeySource::Keyfile => "keyfile",
            KeySource::BootStore => "system keychain",
            KeySource::UserStore => "user keychain",
            KeySource::Prompt => "prompt",
        };
        f.write_str(label)
    }
}

/// Key text plus how the helper should interpret it.
pub struct KeyMaterial {
    pub text: Zeroizing<String>,
    pub encoding: KeyEncoding,
}

/// Successful resolution for one dataset.
pub struct KeyResolution {
    pub dataset: String,
    pub source: KeySource,
    /// `None` when the key never left the privileged helper.
    pub material: Option<KeyMaterial>,
}

/// The resolution chain; see the module docs for the order.
pub struct KeyChain {
    mount_config: MountConfig,
    helper: Arc<dyn HelperLink>,
    user_store: Option<Arc<dyn CredentialStore>>,
    prompt: Option<Arc<dyn KeyPrompt>>,
}

impl KeyChain {
    pub fn new(mount_config: MountConfig, helper: Arc<dyn HelperLink>) -> Self {
        Self {
            mount_config,
            helper,
            user_store: None,
            prompt: None,
        }
    }

    pub fn with_user_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.user_store = Some(store);
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn KeyPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Find a key for `dataset` and have the helper load it.
    pub async fn resolve(&self, dataset: &Dataset) -> AutomountResult<KeyResolution> {
        let name = dataset.name.as_str();
        let encoding = dataset.key_format.encoding();

        if let Some(text) = self.from_keyfile(dataset)? {
            info!("loading key for {name} from configured keyfile");
            self.load(name, encoding, &text).await?;
            return Ok(resolved(name, KeySource::Keyfile, Some((text, encoding))));
        }

        // Rejections from the stores are kept so a chain that ends without
        // a key reports what zfs actually said.
        let mut last_failure = None;

        debug!("asking helper to check the system keychain for {name}");
        match self.load(name, encoding, "").await {
            Ok(()) => {
                info!("helper loaded key for {name} from the system keychain");
                return Ok(resolved(name, KeySource::BootStore, None));
            }
            Err(err) if is_missing_boot_key(&err) => {
                debug!("system keychain has no key for {name}")
            }
            Err(err) => {
                warn!("system keychain key for {name} was not loaded: {err}");
                last_failure = Some(err);
            }
        }

        if let Some(store) = &self.user_store {
            match store.get(name) {
                Ok(Some(text)) => match self.load(name, encoding, &text).await {
                    Ok(()) => {
                        info!("loaded key for {name} from the {} keychain", store.scope());
                        return Ok(resolved(name, KeySource::UserStore, Some((text, encoding))));
                    }
                    Err(err) => {
                        warn!("key from the {} keychain was rejected for {name}: {err}", store.scope());
                        last_failure = Some(err);
                    }
                },
                Ok(None) => debug!("no entry for {name} in the {} keychain", store.scope()),
                Err(err) => warn!("reading the {} keychain for {name} failed: {err}", store.scope()),
            }
        }

        let Some(prompt) = &self.prompt else {
            return Err(last_failure
                .unwrap_or_else(|| AutomountError::MissingKeySource(name.to_string())));
        };

        let response = prompt
            .prompt(dataset)
            .await?
            .ok_or_else(|| AutomountError::Cancelled(format!("key entry for {name} declined")))?;

        // Typed keys default to passphrase text when zfs reports no format.
        let encoding = match dataset.key_format {
            KeyFormat::None => KeyEncoding::Passphrase,
            other => other.encoding(),
        };
        self.load(name, encoding, &response.key).await?;

        if response.remember {
            if let Some(store) = &self.user_store {
                match store.save(name, &response.key) {
                    Ok(()) => info!("saved key for {name} to the {} keychain", store.scope()),
                    Err(err) => warn!("could not save key for {name} to the {} keychain: {err}", store.scope()),
                }
            }
        }
        Ok(resolved(name, KeySource::Prompt, Some((response.key, encoding))))
    }

    /// Source 1. `Ok(None)` when there is no entry or the file is unusable.
    fn from_keyfile(&self, dataset: &Dataset) -> AutomountResult<Option<Zeroizing<String>>> {
        let entry = match self.mount_config.entry(&dataset.name) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    "cannot read mount config {}: {err}",
                    self.mount_config.path().display()
                );
                None
            }
        };
        let Some(path) = entry.and_then(|entry| entry.keyfile()) else {
            return Ok(None);
        };
        debug!("found keylocation for {} in config: {}", dataset.name, path.display());
        read_keyfile(&path, dataset.key_format)
    }

    async fn load(&self, dataset: &str, format: KeyEncoding, key: &str) -> AutomountResult<()> {
        self.helper
            .execute(HelperCommand::LoadKey {
                dataset: dataset.to_string(),
                format,
                key: key.to_string(),
            })
            .await
            .map(|_| ())
    }
}

fn is_missing_boot_key(err: &AutomountError) -> bool {
    matches!(err, AutomountError::Helper(msg) if msg.starts_with(NO_BOOT_KEY))
}

fn resolved(
    dataset: &str,
    source: KeySource,
    material: Option<(Zeroizing<String>, KeyEncoding)>,
) -> KeyResolution {
    KeyResolution {
        dataset: dataset.to_string(),
        source,
        material: material.map(|(text, encoding)| KeyMaterial { text, encoding }),
    }
}
