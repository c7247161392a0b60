//! Test-only helpers: scratch repositories, fake workers and scripted
//! iterations.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::IterationOutcome;
use crate::errors::ConfigError;
use crate::io::config::{IterationConfig, RalphConfig, Timings};
use crate::io::paths::RalphPaths;
use crate::io::tracker::TaskTracker;
use crate::iteration::Iteration;

/// Prompt text written by [`TestRepo::new`].
pub const TEST_PROMPT: &str = "Pick the next task and finish it.\n";

/// Timings small enough for tests to finish quickly.
pub fn fast_timings() -> Timings {
    Timings {
        poll_interval: Duration::from_millis(20),
        signal_poll_interval: Duration::from_millis(50),
        terminate_grace: Duration::from_millis(500),
        restart_grace: Duration::from_millis(500),
        reader_join_timeout: Duration::from_secs(2),
    }
}

/// Temporary repository with the `scripts/ralph/` layout and a prompt file.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { temp };
        let paths = repo.paths();
        fs::create_dir_all(&paths.prompt_dir).context("create prompt dir")?;
        let prompt_file = RalphConfig::default().worker.prompt_file;
        fs::write(paths.prompt_dir.join(prompt_file), TEST_PROMPT).context("write prompt")?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> RalphPaths {
        RalphPaths::new(self.root())
    }

    /// Defaults with fast timings and no `timeout` wrapper.
    pub fn iteration_config(&self) -> IterationConfig {
        let mut config = IterationConfig::from_config(&RalphConfig::default());
        config.use_timeout_wrapper = false;
        config.timings = fast_timings();
        config
    }

    /// Write an executable `sh` script standing in for the worker binary.
    ///
    /// The worker's arguments are available to `body` as `"$@"`.
    pub fn write_worker_script(&self, name: &str, body: &str) -> Result<PathBuf> {
        let dir = self.root().join("bin");
        fs::create_dir_all(&dir).context("create bin dir")?;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n"))
            .with_context(|| format!("write {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("chmod {}", path.display()))?;
        }
        Ok(path)
    }
}

enum Script {
    Sequence(VecDeque<IterationOutcome>),
    Repeat(IterationOutcome),
    Fail(Option<ConfigError>),
}

type CallHook = Box<dyn Fn(u32) + Send>;

/// [`Iteration`] that replays predetermined outcomes without spawning anything.
pub struct ScriptedIteration {
    script: Mutex<Script>,
    calls: Mutex<Vec<u32>>,
    hook: Option<CallHook>,
}

impl ScriptedIteration {
    fn with_script(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    /// Return `outcomes` in order; running past the end is an error.
    pub fn new(outcomes: Vec<IterationOutcome>) -> Self {
        Self::with_script(Script::Sequence(outcomes.into()))
    }

    pub fn repeating(outcome: IterationOutcome) -> Self {
        Self::with_script(Script::Repeat(outcome))
    }

    /// Fail the first call with `err`.
    pub fn failing(err: ConfigError) -> Self {
        Self::with_script(Script::Fail(Some(err)))
    }

    /// Run `hook` with the iteration number before each outcome is returned.
    pub fn on_call(mut self, hook: impl Fn(u32) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Iteration numbers seen so far.
    pub fn calls(&self) -> Vec<u32> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Iteration for ScriptedIteration {
    fn run(&self, iteration: u32) -> Result<IterationOutcome> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(iteration);
        if let Some(hook) = &self.hook {
            hook(iteration);
        }
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *script {
            Script::Sequence(outcomes) => outcomes
                .pop_front()
                .ok_or_else(|| anyhow!("scripted iteration {iteration} has no outcome")),
            Script::Repeat(outcome) => Ok(outcome.clone()),
            Script::Fail(err) => Err(err
                .take()
                .map(anyhow::Error::from)
                .unwrap_or_else(|| anyhow!("scripted failure already returned"))),
        }
    }
}

/// Tracker that always reports the same branch.
#[derive(Debug, Clone, Default)]
pub struct FixedTracker {
    branch: Option<String>,
}

impl FixedTracker {
    pub fn branch(branch: &str) -> Self {
        Self {
            branch: Some(branch.to_string()),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

impl TaskTracker for FixedTracker {
    fn current_branch(&self) -> Result<Option<String>> {
        Ok(self.branch.clone())
    }
}
