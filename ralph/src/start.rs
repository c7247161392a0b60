//! Bookkeeping before the first iteration of a run.
//!
//! When the tracker reports a different branch than the one recorded by the
//! previous run, the previous PRD and progress log are archived and the
//! progress log starts over. The branch marker is then updated and the
//! progress log created if it does not exist yet.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::io::archive::{archive_run, init_progress_file, reset_progress_file};
use crate::io::paths::RalphPaths;
use crate::io::run_state::{load_last_branch, write_last_branch};
use crate::io::tracker::TaskTracker;

/// What `prepare_run` found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub current_branch: Option<String>,
    pub previous_branch: Option<String>,
    /// Set when the previous run was archived.
    pub archived_to: Option<PathBuf>,
}

pub fn prepare_run<T: TaskTracker>(
    paths: &RalphPaths,
    tracker: &T,
    now: DateTime<Local>,
) -> Result<StartOutcome> {
    let current_branch = match tracker.current_branch() {
        Ok(branch) => branch,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "task tracker unavailable, skipping branch check");
            None
        }
    };
    let previous_branch = load_last_branch(&paths.last_branch_path)
        .with_context(|| format!("load {}", paths.last_branch_path.display()))?;
    debug!(current = ?current_branch, previous = ?previous_branch, "branch bookkeeping");

    let mut archived_to = None;
    if let (Some(current), Some(previous)) = (&current_branch, &previous_branch)
        && current != previous
    {
        info!(from = %previous, to = %current, "branch changed, archiving previous run");
        let folder = archive_run(paths, previous, now)?;
        println!("Archived previous run to {}", folder.display());
        reset_progress_file(&paths.progress_path, now)?;
        archived_to = Some(folder);
    }

    if let Some(current) = &current_branch {
        write_last_branch(&paths.last_branch_path, current)?;
    }
    if init_progress_file(&paths.progress_path, now)? {
        debug!(path = %paths.progress_path.display(), "progress log initialized");
    }

    Ok(StartOutcome {
        current_branch,
        previous_branch,
        archived_to,
    })
}
