//! Task tracker queries used for archival bookkeeping.
//!
//! The tracker is an external CLI (`bd`). The supervisor only needs the branch
//! name attached to the first open work item, if there is one.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Cap on captured tracker output.
const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Source of the branch identifier the current run works on.
pub trait TaskTracker {
    fn current_branch(&self) -> Result<Option<String>>;
}

/// Tracker backed by the `bd` command line.
#[derive(Debug, Clone)]
pub struct BeadsTracker {
    command: String,
    timeout: Duration,
}

impl BeadsTracker {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    /// Stdout of a successful query; `None` when the command failed or timed out.
    fn query(&self, args: &[&str]) -> Result<Option<String>> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args);
        let output = run_command_with_timeout(cmd, self.timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run {} {}", self.command, args.join(" ")))?;
        if output.timed_out || !output.status.success() {
            debug!(args = ?args, exit_code = ?output.status.code(), "tracker query failed");
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

impl TaskTracker for BeadsTracker {
    #[instrument(skip_all, fields(command = %self.command))]
    fn current_branch(&self) -> Result<Option<String>> {
        let Some(listing) = self.query(&["list", "--status", "open"])? else {
            return Ok(None);
        };
        let Some(id) = parse_item_ids(&listing).into_iter().next() else {
            debug!("no open items");
            return Ok(None);
        };
        let Some(details) = self.query(&["show", &id])? else {
            warn!(id = %id, "could not read tracker item");
            return Ok(None);
        };
        Ok(parse_branch(&details))
    }
}

/// Item ids from `bd list` output: the first token of each nonblank line.
pub fn parse_item_ids(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Value of the first `branch:` line in `bd show` output.
pub fn parse_branch(details: &str) -> Option<String> {
    details.lines().find_map(|line| {
        let line = line.trim();
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("branch") {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}
