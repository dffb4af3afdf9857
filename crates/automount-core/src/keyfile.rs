//! Key material helpers: keyfile decoding, hex transport encoding, and the
//! private temporary files handed to `zfs load-key`.

use crate::error::{AutomountError, AutomountResult};
use crate::model::{KeyEncoding, KeyFormat};
use log::{debug, warn};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile};
use zeroize::Zeroizing;

/// Read a keyfile and normalise it into transport text for `format`.
///
/// Raw keys become lowercase hex; passphrase and hex keys are decoded as
/// UTF-8 and trimmed. `Ok(None)` means the file is absent or unreadable and
/// the caller should try the next source. A file that reads fine but is not
/// valid UTF-8 for a text format is a hard error.
pub fn read_keyfile(path: &Path, format: KeyFormat) -> AutomountResult<Option<Zeroizing<String>>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => Zeroizing::new(bytes),
        Err(err) => {
            warn!("keyfile {} not readable: {}", path.display(), err);
            return Ok(None);
        }
    };

    match format.encoding() {
        KeyEncoding::Raw => {
            let text = encode_hex_key(&bytes);
            debug!(
                "read raw key from {} ({} bytes -> {} hex chars)",
                path.display(),
                bytes.len(),
                text.len()
            );
            Ok(Some(text))
        }
        KeyEncoding::Passphrase => {
            let text = std::str::from_utf8(&bytes).map_err(|err| AutomountError::KeyfileDecode {
                path: PathBuf::from(path),
                reason: format!("passphrase is not valid UTF-8: {err}"),
            })?;
            debug!("read passphrase key from {}", path.display());
            Ok(Some(Zeroizing::new(text.trim().to_string())))
        }
    }
}

/// Hex-encode raw key bytes for the text-only helper channel.
pub fn encode_hex_key(bytes: &[u8]) -> Zeroizing<String> {
    Zeroizing::new(hex::encode(bytes))
}

/// Validate and decode hex transport text back into raw key bytes.
pub fn decode_hex_key(text: &str) -> AutomountResult<Zeroizing<Vec<u8>>> {
    if text.is_empty() {
        return Err(AutomountError::InvalidKey("hex key is empty".to_string()));
    }
    if text.len() % 2 != 0 {
        return Err(AutomountError::InvalidKey(format!(
            "hex key must have an even number of digits (got {})",
            text.len()
        )));
    }
    if let Some(bad) = text.bytes().find(|byte| !byte.is_ascii_hexdigit()) {
        return Err(AutomountError::InvalidKey(format!(
            "found non-hex byte 0x{bad:02x}"
        )));
    }
    let bytes = hex::decode(text)
        .map_err(|err| AutomountError::InvalidKey(format!("hex decode failed: {err}")))?;
    Ok(Zeroizing::new(bytes))
}

/// Key material written to a caller-only temporary file.
///
/// The file is removed when this value drops, whichever way the caller exits.
pub struct TempKeyFile {
    file: NamedTempFile,
}

impl TempKeyFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// `file://` URL accepted by `zfs load-key -L`.
    pub fn url(&self) -> String {
        format!("file://{}", self.file.path().display())
    }
}

/// Decode `text` per `encoding` and write it to a fresh `0600` temp file.
pub fn materialize_key(encoding: KeyEncoding, text: &str) -> AutomountResult<TempKeyFile> {
    let bytes = match encoding {
        KeyEncoding::Raw => decode_hex_key(text)?,
        KeyEncoding::Passphrase => Zeroizing::new(text.as_bytes().to_vec()),
    };

    let mut file = Builder::new().prefix("zfs_key_").tempfile()?;
    fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))?;
    file.write_all(&bytes)?;
    file.flush()?;
    file.as_file().sync_all()?;
    Ok(TempKeyFile { file })
}

/// Write secret bytes to `path` with owner-only permissions.
pub fn write_secret_file(path: &Path, secret: &[u8]) -> AutomountResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;

    // NamedTempFile is created 0600 and renamed into place.
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(secret)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}
