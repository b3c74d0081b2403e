//! Confirmation gate for actions the model flags with `require_confirmation`.

use std::future::Future;
use std::io::{BufRead, Write};

use tracing::warn;

use crate::types::ProposedAction;

/// Decides whether a flagged action may run. Waits as long as it needs to.
pub trait Confirmer {
    fn confirm(&mut self, action: &ProposedAction) -> impl Future<Output = bool> + Send;
}

impl<F> Confirmer for F
where
    F: FnMut(&ProposedAction) -> bool,
{
    fn confirm(&mut self, action: &ProposedAction) -> impl Future<Output = bool> + Send {
        std::future::ready(self(action))
    }
}

/// Approves everything (`--auto-confirm`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl Confirmer for AutoConfirm {
    fn confirm(&mut self, action: &ProposedAction) -> impl Future<Output = bool> + Send {
        warn!(action = %action.name, "auto-confirming flagged action");
        std::future::ready(true)
    }
}

/// Asks the operator on the terminal. Only `y`/`yes` approves; EOF declines.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&mut self, action: &ProposedAction) -> impl Future<Output = bool> + Send {
        let prompt = format!(
            "Model requested confirmation for action '{}'.\nArgs: {}\nProceed? [y/N]: ",
            action.name, action.args
        );
        async move {
            let answer = tokio::task::spawn_blocking(move || {
                let mut stderr = std::io::stderr();
                let _ = write!(stderr, "{prompt}");
                let _ = stderr.flush();
                let mut line = String::new();
                match std::io::stdin().lock().read_line(&mut line) {
                    Ok(0) | Err(_) => None,
                    Ok(_) => Some(line),
                }
            })
            .await;
            match answer {
                Ok(Some(line)) => is_yes(&line),
                Ok(None) => false,
                Err(e) => {
                    warn!(error = %e, "confirmation prompt failed");
                    false
                }
            }
        }
    }
}

fn is_yes(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
