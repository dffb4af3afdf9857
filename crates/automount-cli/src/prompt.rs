//! Masked terminal prompt used as the last key source.

use async_trait::async_trait;
use automount_core::error::{AutomountError, AutomountResult};
use automount_core::model::Dataset;
use automount_core::provider::{KeyPrompt, PromptResponse};
use rpassword::prompt_password;
use std::io::{self, BufRead, Write};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

/// Asks on the controlling terminal. One prompt at a time.
#[derive(Default)]
pub struct TerminalPrompt {
    turn: Mutex<()>,
}

#[async_trait]
impl KeyPrompt for TerminalPrompt {
    async fn prompt(&self, dataset: &Dataset) -> AutomountResult<Option<PromptResponse>> {
        let _turn = self.turn.lock().await;
        let name = dataset.name.clone();
        tokio::task::spawn_blocking(move || ask(&name))
            .await
            .map_err(|err| AutomountError::Cancelled(format!("prompt aborted: {err}")))?
    }
}

fn ask(dataset: &str) -> AutomountResult<Option<PromptResponse>> {
    let key = Zeroizing::new(prompt_password(format!(
        "Encryption key for {dataset} (empty to skip): "
    ))?);
    if key.is_empty() {
        return Ok(None);
    }

    print!("Save to keychain? [Y/n] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(Some(PromptResponse {
        key,
        remember: wants_to_remember(&answer),
    }))
}

/// Defaults to yes; only an explicit no opts out.
fn wants_to_remember(answer: &str) -> bool {
    !matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_defaults_to_yes() {
        assert!(wants_to_remember("\n"));
        assert!(wants_to_remember("y"));
        assert!(wants_to_remember("YES\n"));
        assert!(!wants_to_remember("n\n"));
        assert!(!wants_to_remember(" No "));
    }
}
