//! Worker binary discovery and command line construction.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::errors::ConfigError;

/// Name of the generic timeout wrapper looked up on `PATH`.
const TIMEOUT_WRAPPER: &str = "timeout";

/// Exit status `timeout(1)` reports when it had to stop the command.
pub const TIMEOUT_WRAPPER_EXIT_CODE: i32 = 124;

/// First candidate found on `PATH`, in preference order.
pub fn locate_worker(candidates: &[String]) -> Result<PathBuf, ConfigError> {
    candidates
        .iter()
        .find_map(|name| match which::which(name) {
            Ok(path) => {
                debug!(name = %name, path = %path.display(), "worker binary found");
                Some(path)
            }
            Err(_) => None,
        })
        .ok_or_else(|| ConfigError::WorkerNotFound {
            candidates: candidates.to_vec(),
        })
}

/// `timeout` on `PATH`, if present.
pub fn locate_timeout_wrapper() -> Option<PathBuf> {
    which::which(TIMEOUT_WRAPPER).ok()
}

/// Everything needed to launch one worker process.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub binary: PathBuf,
    pub model: String,
    pub prompt: String,
    /// Ask the worker for one JSON record per line with partial output.
    pub streaming: bool,
    pub timeout_wrapper: Option<PathBuf>,
    pub timeout: Duration,
}

impl WorkerInvocation {
    pub fn uses_timeout_wrapper(&self) -> bool {
        self.timeout_wrapper.is_some()
    }

    /// `[timeout <secs>] <binary> --model <m> --print --force --approve-mcps
    /// [--output-format stream-json --stream-partial-output] <prompt>`
    pub fn command(&self) -> Command {
        let mut cmd = match &self.timeout_wrapper {
            Some(wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.arg(self.timeout.as_secs().max(1).to_string())
                    .arg(&self.binary);
                cmd
            }
            None => Command::new(&self.binary),
        };
        cmd.arg("--model")
            .arg(&self.model)
            .args(["--print", "--force", "--approve-mcps"]);
        if self.streaming {
            cmd.args(["--output-format", "stream-json", "--stream-partial-output"]);
        }
        cmd.arg(&self.prompt);
        cmd
    }
}
