//! One supervised worker invocation.
//!
//! [`IterationRunner::run`] validates the configuration, spawns the worker,
//! and races its natural exit against the per-iteration timeout, the
//! process-wide interrupt flag, and the restart signal file. Exactly one
//! [`IterationOutcome`] comes out of every call.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, info, instrument, warn};

use crate::core::completion::contains_completion_marker;
use crate::core::model::validate_model;
use crate::core::types::IterationOutcome;
use crate::errors::ConfigError;
use crate::io::collector::{CollectMode, CollectedOutput, OutputCollector};
use crate::io::config::IterationConfig;
use crate::io::iteration_log::IterationLog;
use crate::io::paths::RalphPaths;
use crate::io::process::ProcessHandle;
use crate::io::prompt::{load_prompt, resolve_prompt_path};
use crate::io::signal_file::SignalFile;
use crate::io::watcher::{SignalWatcher, WatchSettings};
use crate::io::worker::{
    TIMEOUT_WRAPPER_EXIT_CODE, WorkerInvocation, locate_timeout_wrapper, locate_worker,
};
use crate::shutdown::Shutdown;

/// Something that can run numbered iterations for the loop controller.
///
/// `Err` is reserved for failures that would recur on every iteration
/// (a [`crate::errors::ConfigError`] inside the `anyhow::Error`). Everything
/// else is reported through the returned outcome.
pub trait Iteration {
    fn run(&self, iteration: u32) -> Result<IterationOutcome>;
}

pub struct IterationRunner {
    config: IterationConfig,
    paths: RalphPaths,
    shutdown: Arc<Shutdown>,
}

/// How the exit/timeout/interrupt/restart race ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Race {
    Restart,
    Interrupted,
    Exited(ExitStatus),
    TimedOut,
}

/// Terminates the worker if supervision bails out early.
struct TerminateOnDrop<'a> {
    process: &'a ProcessHandle,
    grace: Duration,
}

impl Drop for TerminateOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.process.terminate(self.grace) {
            warn!(
                pid = self.process.pid(),
                label = self.process.label(),
                err = %format!("{err:#}"),
                "failed to stop worker"
            );
        }
    }
}

impl IterationRunner {
    pub fn new(config: IterationConfig, paths: RalphPaths, shutdown: Arc<Shutdown>) -> Self {
        Self {
            config,
            paths,
            shutdown,
        }
    }

    /// Validation and lookups that must succeed before anything is spawned.
    fn prepare(&self, signal: &SignalFile) -> Result<WorkerInvocation> {
        if signal.clear()? {
            debug!("removed stale restart signal");
        }

        validate_model(&self.config.model)?;
        let prompt_path = resolve_prompt_path(&self.paths.prompt_dir, &self.config.prompt_file)?;
        let binary = locate_worker(&self.config.worker_candidates)?;
        let prompt = load_prompt(&prompt_path)?;

        let timeout_wrapper = if self.config.use_timeout_wrapper {
            locate_timeout_wrapper()
        } else {
            None
        };
        debug!(
            binary = %binary.display(),
            prompt = %prompt_path.display(),
            wrapper = timeout_wrapper.is_some(),
            "worker prepared"
        );

        Ok(WorkerInvocation {
            binary,
            model: self.config.model.clone(),
            prompt,
            streaming: self.config.debug,
            timeout_wrapper,
            timeout: self.config.timeout,
        })
    }

    fn collect_mode(&self, iteration: u32) -> Result<(CollectMode, Option<PathBuf>)> {
        if !self.config.debug {
            return Ok((CollectMode::Buffered, None));
        }
        let log = IterationLog::create(&self.paths.logs_dir, iteration, Local::now())?;
        let path = log.path().to_path_buf();
        Ok((CollectMode::Incremental(log), Some(path)))
    }

    fn supervise(
        &self,
        iteration: u32,
        invocation: &WorkerInvocation,
        signal: &SignalFile,
    ) -> Result<IterationOutcome> {
        let timings = self.config.timings;
        let (mode, log_path) = self.collect_mode(iteration)?;
        if let Some(path) = &log_path {
            eprintln!("Streaming output to {}", path.display());
        }

        let process = self
            .shutdown
            .registry()
            .spawn(invocation.command(), "worker")?;
        let _guard = TerminateOnDrop {
            process: &process,
            grace: timings.terminate_grace,
        };

        // The shutdown sweep may have run before the worker was registered.
        if self.shutdown.is_interrupted() {
            process.terminate(timings.terminate_grace)?;
            return Ok(IterationOutcome::Interrupted);
        }

        let output = process
            .take_output()
            .context("worker output pipe already taken")?;
        let collector = OutputCollector::start(output, mode)?;
        let watcher = SignalWatcher::spawn(
            Arc::clone(&process),
            signal.clone(),
            Arc::clone(&self.shutdown),
            WatchSettings {
                poll_interval: timings.signal_poll_interval,
                terminate_grace: timings.restart_grace,
            },
        )?;

        let started = Instant::now();
        let race = loop {
            if watcher.wait_for_restart(timings.poll_interval) {
                break Race::Restart;
            }
            if self.shutdown.is_interrupted() {
                break Race::Interrupted;
            }
            if let Some(status) = process.wait_for(Duration::ZERO)? {
                break Race::Exited(status);
            }
            if started.elapsed() >= self.config.timeout {
                break Race::TimedOut;
            }
        };
        let restart_seen = watcher.stop();
        debug!(
            ?race,
            restart_seen,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "race resolved"
        );

        let late_signal = matches!(race, Race::Exited(_)) && signal.is_raised();
        if race == Race::Restart || restart_seen || late_signal {
            process.terminate(timings.restart_grace)?;
            signal.clear()?;
            self.finish_output(iteration, collector);
            info!(iteration, "worker requested a restart");
            return Ok(IterationOutcome::RestartRequested);
        }

        if race == Race::Interrupted || self.shutdown.is_interrupted() {
            process.terminate(timings.terminate_grace)?;
            self.finish_output(iteration, collector);
            return Ok(IterationOutcome::Interrupted);
        }

        if race == Race::TimedOut {
            process.kill()?;
            let collected = self.finish_output(iteration, collector);
            self.echo_buffered(&collected.text);
            return Ok(self.timed_out(iteration));
        }

        // Helpers the worker left in its group would hold the output pipe open.
        process.terminate(timings.terminate_grace)?;
        let collected = self.finish_output(iteration, collector);
        self.echo_buffered(&collected.text);

        if let Race::Exited(status) = race
            && invocation.uses_timeout_wrapper()
            && status.code() == Some(TIMEOUT_WRAPPER_EXIT_CODE)
        {
            return Ok(self.timed_out(iteration));
        }

        if contains_completion_marker(&collected.text) {
            Ok(IterationOutcome::Completed(collected.text))
        } else {
            Ok(IterationOutcome::Unfinished(collected.text))
        }
    }

    fn finish_output(&self, iteration: u32, collector: OutputCollector) -> CollectedOutput {
        let collected = collector.finish(self.config.timings.reader_join_timeout);
        if !collected.drained {
            debug!(iteration, "output reader still running after worker exit");
        }
        collected
    }

    fn timed_out(&self, iteration: u32) -> IterationOutcome {
        let secs = self.config.timeout.as_secs();
        warn!(iteration, timeout_secs = secs, "worker timed out");
        eprintln!("Warning: iteration {iteration} timed out after {secs}s");
        IterationOutcome::TimedOut
    }

    /// Buffered output is only shown once the worker is done.
    fn echo_buffered(&self, text: &str) {
        if !self.config.debug && !text.is_empty() {
            eprint!("{text}");
            if !text.ends_with('\n') {
                eprintln!();
            }
        }
    }
}

impl Iteration for IterationRunner {
    #[instrument(skip(self), fields(model = %self.config.model, debug = self.config.debug))]
    fn run(&self, iteration: u32) -> Result<IterationOutcome> {
        let signal = SignalFile::new(&self.paths.restart_signal_path);
        let invocation = match self.prepare(&signal) {
            Ok(invocation) => invocation,
            Err(err) if err.downcast_ref::<ConfigError>().is_some() => return Err(err),
            Err(err) => return Ok(failed(iteration, &err)),
        };

        let outcome = self
            .supervise(iteration, &invocation, &signal)
            .unwrap_or_else(|err| failed(iteration, &err));

        if let Err(err) = signal.clear() {
            warn!(err = %format!("{err:#}"), "failed to remove restart signal");
        }
        debug!(iteration, outcome = outcome.label(), "iteration finished");
        Ok(outcome)
    }
}

fn failed(iteration: u32, err: &anyhow::Error) -> IterationOutcome {
    let reason = format!("{err:#}");
    warn!(iteration, err = %reason, "iteration failed");
    eprintln!("Warning: iteration {iteration} failed: {reason}");
    IterationOutcome::Failed(reason)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::process::ProcessRegistry;
    use crate::test_support::TestRepo;

    fn runner_with_worker(repo: &TestRepo, script: &str) -> (IterationRunner, Arc<Shutdown>) {
        let worker = repo.write_worker_script("fake-agent", script).expect("worker");
        let shutdown = Shutdown::new(ProcessRegistry::new(), Duration::from_millis(200));
        let mut config = repo.iteration_config();
        config.worker_candidates = vec![worker.display().to_string()];
        (
            IterationRunner::new(config, repo.paths(), Arc::clone(&shutdown)),
            shutdown,
        )
    }

    #[test]
    fn marker_means_completed_even_on_failure_exit() {
        let repo = TestRepo::new().expect("repo");
        let script = "echo 'done <promise>COMPLETE</promise>'; exit 3";
        let (runner, _) = runner_with_worker(&repo, script);

        let outcome = runner.run(1).expect("run");
        assert!(matches!(outcome, IterationOutcome::Completed(text) if text.contains("done")));
    }

    #[test]
    fn plain_exit_is_unfinished() {
        let repo = TestRepo::new().expect("repo");
        let (runner, _) = runner_with_worker(&repo, "echo working");

        let outcome = runner.run(1).expect("run");
        assert_eq!(outcome, IterationOutcome::Unfinished("working\n".to_string()));
    }

    #[test]
    fn invalid_model_is_escalated_before_spawn() {
        let repo = TestRepo::new().expect("repo");
        let marker = repo.root().join("spawned");
        let script = format!("touch '{}'", marker.display());
        let (mut runner, _) = runner_with_worker(&repo, &script);
        runner.config.model = "gpt 4; rm -rf /".to_string();

        let err = runner.run(1).expect_err("invalid model");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidModel { .. })
        ));
        assert!(!marker.exists());
    }

    #[test]
    fn stale_signal_is_cleared_before_spawn() {
        let repo = TestRepo::new().expect("repo");
        let signal = SignalFile::new(repo.paths().restart_signal_path);
        signal.raise().expect("raise");
        let (runner, _) = runner_with_worker(&repo, "sleep 0.2; echo ok");

        let outcome = runner.run(1).expect("run");
        assert_eq!(outcome, IterationOutcome::Unfinished("ok\n".to_string()));
        assert!(!signal.is_raised());
    }

    #[test]
    fn signal_left_behind_by_exiting_worker_counts_as_restart() {
        let repo = TestRepo::new().expect("repo");
        let signal_path = repo.paths().restart_signal_path;
        let script = format!("touch '{}'; echo bye", signal_path.display());
        let (runner, _) = runner_with_worker(&repo, &script);

        let outcome = runner.run(1).expect("run");
        assert_eq!(outcome, IterationOutcome::RestartRequested);
        assert!(!signal_path.exists());
    }

    #[test]
    fn interrupt_before_run_yields_interrupted() {
        let repo = TestRepo::new().expect("repo");
        let (runner, shutdown) = runner_with_worker(&repo, "sleep 30");
        shutdown.request();

        let outcome = runner.run(1).expect("run");
        assert_eq!(outcome, IterationOutcome::Interrupted);
        assert!(shutdown.registry().is_empty());
    }

    #[test]
    fn background_helpers_do_not_outlive_the_worker() {
        let repo = TestRepo::new().expect("repo");
        let survivor = repo.root().join("survived");
        let script = format!("(sleep 1; touch '{}') &\necho hi", survivor.display());
        let (runner, _) = runner_with_worker(&repo, &script);

        let started = Instant::now();
        let outcome = runner.run(1).expect("run");
        assert_eq!(outcome, IterationOutcome::Unfinished("hi\n".to_string()));
        assert!(started.elapsed() < repo.iteration_config().timings.reader_join_timeout);

        std::thread::sleep(Duration::from_millis(1500));
        assert!(!survivor.exists());
    }

    #[test]
    fn spawn_failure_is_a_non_fatal_failed_outcome() {
        use std::os::unix::fs::PermissionsExt;

        let repo = TestRepo::new().expect("repo");
        let (mut runner, shutdown) = runner_with_worker(&repo, "echo unused");
        let broken = repo.root().join("bin").join("broken-agent");
        std::fs::write(&broken, "#!/nonexistent/interp\necho never\n").expect("write");
        std::fs::set_permissions(&broken, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");
        runner.config.worker_candidates = vec![broken.display().to_string()];

        let outcome = runner.run(1).expect("transient errors are not escalated");
        assert!(
            matches!(&outcome, IterationOutcome::Failed(reason) if reason.contains("spawn worker")),
            "{outcome:?}"
        );
        assert!(shutdown.registry().is_empty());
    }
}
