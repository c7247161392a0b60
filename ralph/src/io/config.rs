//! Supervisor configuration: defaults, `scripts/ralph/config.toml`, environment, CLI.
//!
//! Layers are applied in that order; each later layer overrides the earlier one.
//! The resolved [`RalphConfig`] is turned into the immutable [`IterationConfig`]
//! once at startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ConfigError;

pub const DEFAULT_MODEL: &str = "auto";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

pub const ENV_TIMEOUT: &str = "RALPH_CURSOR_TIMEOUT";
pub const ENV_MODEL: &str = "RALPH_MODEL";
pub const ENV_DEBUG: &str = "RALPH_DEBUG";
pub const ENV_TEST_MODE: &str = "RALPH_TEST_MODE";

/// Supervisor configuration (TOML).
///
/// Missing fields default to the values the wrapper has always used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RalphConfig {
    /// Model passed to the worker as `--model`.
    pub model: String,

    /// Per-iteration wall-clock budget in seconds.
    pub iteration_timeout_secs: u64,

    pub max_iterations: u32,

    /// Stream structured worker output into per-iteration log files.
    pub debug: bool,

    /// Pause between iterations that did not complete, in seconds.
    pub pause_secs: u64,

    /// Whether a restart-triggered iteration counts toward `max_iterations`.
    pub restarts_consume_budget: bool,

    pub worker: WorkerConfig,

    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker binaries to look for on `PATH`, in preference order.
    pub binaries: Vec<String>,

    /// Prompt file, relative to `scripts/ralph/cursor/`.
    pub prompt_file: PathBuf,

    /// Prompt file used when `RALPH_TEST_MODE=1`.
    pub test_prompt_file: PathBuf,

    /// Prefix the worker with `timeout <secs>` when that tool is available.
    pub use_timeout_wrapper: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binaries: vec!["cursor-agent".to_string(), "agent".to_string()],
            prompt_file: PathBuf::from("prompt.cursor.md"),
            test_prompt_file: PathBuf::from("prompt.cursor.test.md"),
            use_timeout_wrapper: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Task tracker CLI queried for the current branch.
    pub command: String,

    pub query_timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: "bd".to_string(),
            query_timeout_secs: 5,
        }
    }
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            iteration_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            debug: false,
            pause_secs: 2,
            restarts_consume_budget: true,
            worker: WorkerConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

/// Values given on the command line. `None` keeps the lower layers.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_iterations: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub model: Option<String>,
    pub debug: bool,
}

impl RalphConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iteration_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "iteration_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid("max_iterations must be > 0".to_string()));
        }
        if self.worker.binaries.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "worker.binaries must name at least one binary".to_string(),
            ));
        }
        if self.tracker.query_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "tracker.query_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `RALPH_*` variables read through `lookup`.
    ///
    /// An unusable timeout falls back to [`DEFAULT_TIMEOUT_SECS`] with a warning
    /// rather than failing the run.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TIMEOUT) {
            self.iteration_timeout_secs = match raw.trim().parse::<i64>() {
                Ok(secs) if secs > 0 => secs.unsigned_abs(),
                Ok(_) => {
                    warn!(value = %raw, "{ENV_TIMEOUT} must be positive");
                    eprintln!(
                        "Warning: {ENV_TIMEOUT} must be positive, using default {DEFAULT_TIMEOUT_SECS}"
                    );
                    DEFAULT_TIMEOUT_SECS
                }
                Err(_) => {
                    warn!(value = %raw, "invalid {ENV_TIMEOUT}");
                    eprintln!(
                        "Warning: Invalid {ENV_TIMEOUT} value, using default {DEFAULT_TIMEOUT_SECS}"
                    );
                    DEFAULT_TIMEOUT_SECS
                }
            };
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|m| !m.is_empty()) {
            self.model = model;
        }
        if let Some(raw) = lookup(ENV_DEBUG) {
            self.debug = matches!(raw.trim(), "1" | "true" | "yes");
        }
        if lookup(ENV_TEST_MODE).as_deref() == Some("1") {
            debug!("test mode prompt selected");
            self.worker.prompt_file = self.worker.test_prompt_file.clone();
        }
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(max) = cli.max_iterations {
            self.max_iterations = max;
        }
        if let Some(secs) = cli.timeout_secs {
            self.iteration_timeout_secs = secs;
        }
        if let Some(model) = &cli.model {
            self.model = model.clone();
        }
        if cli.debug {
            self.debug = true;
        }
    }
}

/// Control-loop timings that are not user-facing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Sleep between checks of the exit/timeout/interrupt race.
    pub poll_interval: Duration,
    /// How often the watcher looks for the restart signal file.
    pub signal_poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL on interrupt.
    pub terminate_grace: Duration,
    /// Grace period when the worker asked for a restart.
    pub restart_grace: Duration,
    /// Upper bound on waiting for the output reader after the worker stops.
    pub reader_join_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            signal_poll_interval: Duration::from_millis(500),
            terminate_grace: Duration::from_secs(2),
            restart_grace: Duration::from_secs(1),
            reader_join_timeout: Duration::from_secs(2),
        }
    }
}

/// Immutable per-run worker parameters.
#[derive(Debug, Clone)]
pub struct IterationConfig {
    pub worker_candidates: Vec<String>,
    pub model: String,
    pub timeout: Duration,
    pub debug: bool,
    /// Requested prompt path, relative to the trusted prompt directory.
    pub prompt_file: PathBuf,
    pub use_timeout_wrapper: bool,
    pub timings: Timings,
}

impl IterationConfig {
    pub fn from_config(cfg: &RalphConfig) -> Self {
        Self {
            worker_candidates: cfg
                .worker
                .binaries
                .iter()
                .filter(|b| !b.trim().is_empty())
                .cloned()
                .collect(),
            model: cfg.model.clone(),
            timeout: Duration::from_secs(cfg.iteration_timeout_secs),
            debug: cfg.debug,
            prompt_file: cfg.worker.prompt_file.clone(),
            use_timeout_wrapper: cfg.worker.use_timeout_wrapper,
            timings: Timings::default(),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        return Ok(RalphConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig = toml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("parse {}: {err}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RalphConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = RalphConfig {
            model: "gpt-5".to_string(),
            restarts_consume_budget: false,
            ..RalphConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "model = \"sonnet-4\"\n[worker]\nbinaries = [\"agent\"]\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.model, "sonnet-4");
        assert_eq!(cfg.worker.binaries, vec!["agent".to_string()]);
        assert_eq!(cfg.worker.prompt_file, PathBuf::from("prompt.cursor.md"));
        assert_eq!(cfg.iteration_timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "iteration_timeout_secs = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn env_overrides_model_timeout_and_debug() {
        let mut cfg = RalphConfig::default();
        cfg.apply_env(env(&[
            (ENV_TIMEOUT, "60"),
            (ENV_MODEL, "claude-3.5-sonnet"),
            (ENV_DEBUG, "1"),
        ]));
        assert_eq!(cfg.iteration_timeout_secs, 60);
        assert_eq!(cfg.model, "claude-3.5-sonnet");
        assert!(cfg.debug);
    }

    #[test]
    fn bad_env_timeout_falls_back_to_default() {
        for raw in ["0", "-5", "soon", ""] {
            let mut cfg = RalphConfig {
                iteration_timeout_secs: 42,
                ..RalphConfig::default()
            };
            cfg.apply_env(env(&[(ENV_TIMEOUT, raw)]));
            assert_eq!(cfg.iteration_timeout_secs, DEFAULT_TIMEOUT_SECS, "{raw:?}");
        }
    }

    #[test]
    fn test_mode_switches_prompt_file() {
        let mut cfg = RalphConfig::default();
        cfg.apply_env(env(&[(ENV_TEST_MODE, "1")]));
        assert_eq!(cfg.worker.prompt_file, PathBuf::from("prompt.cursor.test.md"));
    }

    #[test]
    fn cli_wins_over_env() {
        let mut cfg = RalphConfig::default();
        cfg.apply_env(env(&[(ENV_MODEL, "from-env")]));
        cfg.apply_cli(&CliOverrides {
            max_iterations: Some(3),
            timeout_secs: Some(5),
            model: Some("from-cli".to_string()),
            debug: false,
        });
        assert_eq!(cfg.model, "from-cli");
        assert_eq!(cfg.max_iterations, 3);
        assert_eq!(cfg.iteration_timeout_secs, 5);
    }

    #[test]
    fn iteration_config_drops_blank_candidates() {
        let mut cfg = RalphConfig::default();
        cfg.worker.binaries = vec![" ".to_string(), "agent".to_string()];
        let iteration = IterationConfig::from_config(&cfg);
        assert_eq!(iteration.worker_candidates, vec!["agent".to_string()]);
        assert_eq!(iteration.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }
}
