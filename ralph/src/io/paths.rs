//! Canonical file locations under `scripts/ralph/`.

use std::path::PathBuf;

/// All paths the supervisor reads or writes for a repository root.
#[derive(Debug, Clone)]
pub struct RalphPaths {
    pub root: PathBuf,
    pub ralph_dir: PathBuf,
    /// Trusted directory prompt files are resolved against.
    pub prompt_dir: PathBuf,
    pub config_path: PathBuf,
    pub prd_path: PathBuf,
    pub progress_path: PathBuf,
    pub archive_dir: PathBuf,
    pub last_branch_path: PathBuf,
    pub logs_dir: PathBuf,
    /// Created by the worker to ask for a restart.
    pub restart_signal_path: PathBuf,
}

impl RalphPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ralph_dir = root.join("scripts").join("ralph");
        Self {
            root: root.clone(),
            ralph_dir: ralph_dir.clone(),
            prompt_dir: ralph_dir.join("cursor"),
            config_path: ralph_dir.join("config.toml"),
            prd_path: ralph_dir.join("prd.yml"),
            progress_path: ralph_dir.join("progress.txt"),
            archive_dir: ralph_dir.join("archive"),
            last_branch_path: ralph_dir.join(".last-branch"),
            logs_dir: ralph_dir.join("logs"),
            restart_signal_path: ralph_dir.join(".restart-signal"),
        }
    }
}
