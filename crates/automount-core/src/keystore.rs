//! Secure credential stores keyed by (service, dataset).
//!
//! Two instances exist at runtime: a boot-scoped store in a root-only system
//! directory, read only by the privileged helper, and a user-scoped store in
//! the invoking user's data directory, read by the unprivileged CLI.

use crate::error::AutomountResult;
use crate::keyfile::write_secret_file;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Read/write access to stored dataset keys.
pub trait CredentialStore: Send + Sync {
    /// Short label used in logs (`system`, `user`, ...).
    fn scope(&self) -> &str;

    /// Fetch the secret filed under `account`, if any.
    fn get(&self, account: &str) -> AutomountResult<Option<Zeroizing<String>>>;

    /// Store `secret` under `account`, replacing any previous value.
    fn save(&self, account: &str, secret: &str) -> AutomountResult<()>;

    /// Remove the secret for `account`. Returns whether one existed.
    fn delete(&self, account: &str) -> AutomountResult<bool>;

    /// Accounts that currently hold a secret.
    fn list(&self) -> AutomountResult<Vec<String>>;
}

/// Credential store backed by one owner-only file per account.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    scope: String,
    root: PathBuf,
}

impl FileCredentialStore {
    /// Store rooted at `<dir>/<service>`.
    pub fn new(scope: impl Into<String>, dir: impl AsRef<Path>, service: &str) -> Self {
        Self {
            scope: scope.into(),
            root: dir.as_ref().join(escape(service)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, account: &str) -> PathBuf {
        self.root.join(escape(account))
    }
}

impl CredentialStore for FileCredentialStore {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn get(&self, account: &str) -> AutomountResult<Option<Zeroizing<String>>> {
        let path = self.entry_path(account);
        match fs::read_to_string(&path) {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, account: &str, secret: &str) -> AutomountResult<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
        }
        fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700))?;
        write_secret_file(&self.entry_path(account), secret.as_bytes())
    }

    fn delete(&self, account: &str) -> AutomountResult<bool> {
        match fs::remove_file(self.entry_path(account)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> AutomountResult<Vec<String>> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut accounts = Vec::new();
        for entry in dir {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                continue;
            }
            if let Some(account) = unescape(&name) {
                accounts.push(account);
            }
        }
        accounts.sort();
        Ok(accounts)
    }
}

/// Percent-escape anything that is not safe in a single path component.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b':' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    if out.starts_with('.') {
        out.replace_range(0..1, "%2E");
    }
    out
}

fn unescape(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = value.get(idx + 1..idx + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}
