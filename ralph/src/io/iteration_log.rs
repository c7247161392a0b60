//! Per-iteration log files under `scripts/ralph/logs/`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::debug;

/// Append-only log for a single debug-mode iteration.
#[derive(Debug)]
pub struct IterationLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl IterationLog {
    /// `iteration-<NNN>-<YYYYmmdd_HHMMSS>.log`
    pub fn path_for(logs_dir: &Path, iteration: u32, started: DateTime<Local>) -> PathBuf {
        logs_dir.join(format!(
            "iteration-{iteration:03}-{}.log",
            started.format("%Y%m%d_%H%M%S")
        ))
    }

    pub fn create(logs_dir: &Path, iteration: u32, started: DateTime<Local>) -> Result<Self> {
        fs::create_dir_all(logs_dir)
            .with_context(|| format!("create log directory {}", logs_dir.display()))?;
        let path = Self::path_for(logs_dir, iteration, started);
        let file =
            File::create(&path).with_context(|| format!("create log file {}", path.display()))?;
        debug!(path = %path.display(), "iteration log created");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a fragment and flush so the file can be tailed while the worker runs.
    pub fn append(&mut self, fragment: &str) -> Result<()> {
        self.writer
            .write_all(fragment.as_bytes())
            .and_then(|()| self.writer.flush())
            .with_context(|| format!("append to {}", self.path.display()))
    }
}
