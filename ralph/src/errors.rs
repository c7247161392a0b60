//! Typed errors that abort the whole run.
//!
//! Everything else in the supervisor is reported through `anyhow` and handled
//! locally by the iteration that produced it. A [`ConfigError`] means the same
//! failure would recur on every iteration, so it is escalated to `main`, which
//! recovers it with `downcast_ref` to pick the exit code.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid model '{model}': only [A-Za-z0-9._-] characters are allowed")]
    InvalidModel { model: String },

    #[error("prompt path '{requested}' escapes trusted directory {root}")]
    PromptOutsideRoot { requested: PathBuf, root: PathBuf },

    #[error("prompt file not found: {0}")]
    PromptNotFound(PathBuf),

    #[error("read prompt file {path}")]
    PromptUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no worker binary found in PATH (tried: {})", .candidates.join(", "))]
    WorkerNotFound { candidates: Vec<String> },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// One-line suggestion printed under the error message.
    pub fn hint(&self) -> &'static str {
        match self {
            ConfigError::InvalidModel { .. } => {
                "Pass a model name such as 'auto' via --model or RALPH_MODEL."
            }
            ConfigError::PromptOutsideRoot { .. } => {
                "Keep prompt_file relative to scripts/ralph/cursor/ without '..' components."
            }
            ConfigError::PromptNotFound(_) | ConfigError::PromptUnreadable { .. } => {
                "Create the prompt file under scripts/ralph/cursor/ (see the installer templates)."
            }
            ConfigError::WorkerNotFound { .. } => {
                "Install the Cursor CLI and make sure 'cursor-agent' or 'agent' is on PATH."
            }
            ConfigError::Invalid(_) => "Fix scripts/ralph/config.toml or the RALPH_* environment.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_not_found_lists_candidates() {
        let err = ConfigError::WorkerNotFound {
            candidates: vec!["cursor-agent".to_string(), "agent".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no worker binary found in PATH (tried: cursor-agent, agent)"
        );
    }

    #[test]
    fn config_error_survives_anyhow_round_trip() {
        let err: anyhow::Error = ConfigError::InvalidModel {
            model: "bad model".to_string(),
        }
        .into();
        let err = err.context("iteration 1");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidModel { .. })
        ));
    }
}
