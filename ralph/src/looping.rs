//! Bounded iteration loop.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::types::IterationOutcome;
use crate::exit_codes;
use crate::io::config::RalphConfig;
use crate::iteration::Iteration;
use crate::shutdown::Shutdown;

/// Loop-level settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// Pause between iterations that did not finish the work.
    pub pause: Duration,
    /// Whether a restart-triggered iteration uses up one of `max_iterations`.
    pub restarts_consume_budget: bool,
}

impl LoopConfig {
    pub fn from_config(cfg: &RalphConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            pause: Duration::from_secs(cfg.pause_secs),
            restarts_consume_budget: cfg.restarts_consume_budget,
        }
    }
}

/// Loop bookkeeping, owned by [`run_loop`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    /// Number of the iteration currently running or last run (1-based).
    pub iteration: u32,
    pub max_iterations: u32,
    /// Iterations charged against `max_iterations`.
    pub budget_used: u32,
    pub restarts: u32,
    pub timeouts: u32,
    pub failures: u32,
    /// Set once, never cleared.
    pub interrupted: bool,
    /// Branch recorded for this run, if the tracker reported one.
    pub last_branch: Option<String>,
}

impl RunState {
    fn budget_left(&self) -> bool {
        self.budget_used < self.max_iterations
    }

    fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }
}

/// Progress notifications for the caller (banner lines, separators).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent<'a> {
    Started { iteration: u32, max_iterations: u32 },
    Finished { iteration: u32, outcome: &'a IterationOutcome },
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The worker emitted the completion marker.
    Completed { iteration: u32 },
    /// An interrupt arrived before or during `iteration`.
    Interrupted { iteration: u32 },
    /// Every iteration in the budget ran without completing.
    BudgetExhausted { max_iterations: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub state: RunState,
}

impl LoopOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.stop {
            LoopStop::Completed { .. } => exit_codes::OK,
            LoopStop::Interrupted { .. } => exit_codes::INTERRUPTED,
            LoopStop::BudgetExhausted { .. } => exit_codes::EXHAUSTED,
        }
    }
}

/// Run iterations until completion, interrupt, or budget exhaustion.
///
/// Returns `Err` only when an iteration reports a configuration error; all
/// other iteration problems are absorbed and the loop moves on.
#[instrument(skip_all, fields(max_iterations = config.max_iterations))]
pub fn run_loop<I: Iteration, F: FnMut(LoopEvent<'_>)>(
    runner: &I,
    config: &LoopConfig,
    shutdown: &Shutdown,
    last_branch: Option<String>,
    mut on_event: F,
) -> Result<LoopOutcome> {
    let mut state = RunState {
        max_iterations: config.max_iterations,
        last_branch,
        ..RunState::default()
    };

    while state.budget_left() {
        if shutdown.is_interrupted() {
            state.mark_interrupted();
            return Ok(stop_interrupted(state));
        }

        state.iteration += 1;
        on_event(LoopEvent::Started {
            iteration: state.iteration,
            max_iterations: state.max_iterations,
        });
        let outcome = runner.run(state.iteration)?;
        debug!(
            iteration = state.iteration,
            outcome = outcome.label(),
            output_bytes = outcome.output().map_or(0, str::len),
            "iteration outcome"
        );
        on_event(LoopEvent::Finished {
            iteration: state.iteration,
            outcome: &outcome,
        });

        match outcome {
            IterationOutcome::Completed(_) => {
                state.budget_used += 1;
                info!(iteration = state.iteration, "work completed");
                let iteration = state.iteration;
                return Ok(LoopOutcome {
                    stop: LoopStop::Completed { iteration },
                    state,
                });
            }
            IterationOutcome::Interrupted => {
                state.budget_used += 1;
                state.mark_interrupted();
                return Ok(stop_interrupted(state));
            }
            IterationOutcome::RestartRequested => {
                state.restarts += 1;
                if config.restarts_consume_budget {
                    state.budget_used += 1;
                }
                info!(
                    iteration = state.iteration,
                    restarts = state.restarts,
                    "restarting with fresh context"
                );
                continue;
            }
            IterationOutcome::TimedOut => state.timeouts += 1,
            IterationOutcome::Failed(reason) => {
                state.failures += 1;
                warn!(
                    iteration = state.iteration,
                    reason = %reason,
                    "iteration failed, continuing"
                );
            }
            IterationOutcome::Unfinished(_) => {}
        }
        state.budget_used += 1;

        if state.budget_left() && !shutdown.sleep(config.pause) {
            state.mark_interrupted();
            return Ok(stop_interrupted(state));
        }
    }

    if shutdown.is_interrupted() {
        state.mark_interrupted();
        return Ok(stop_interrupted(state));
    }
    info!(budget_used = state.budget_used, "iteration budget exhausted");
    Ok(LoopOutcome {
        stop: LoopStop::BudgetExhausted {
            max_iterations: state.max_iterations,
        },
        state,
    })
}

fn stop_interrupted(state: RunState) -> LoopOutcome {
    info!(iteration = state.iteration, "loop interrupted");
    LoopOutcome {
        stop: LoopStop::Interrupted {
            iteration: state.iteration,
        },
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigError;
    use crate::io::process::ProcessRegistry;
    use crate::test_support::ScriptedIteration;
    use std::sync::Arc;

    fn shutdown() -> Arc<Shutdown> {
        Shutdown::new(ProcessRegistry::new(), Duration::from_millis(100))
    }

    fn config(max_iterations: u32) -> LoopConfig {
        LoopConfig {
            max_iterations,
            pause: Duration::ZERO,
            restarts_consume_budget: true,
        }
    }

    #[test]
    fn completion_stops_the_loop_with_exit_zero() {
        let runner = ScriptedIteration::new(vec![
            IterationOutcome::Unfinished(String::new()),
            IterationOutcome::Completed("<promise>COMPLETE</promise>".to_string()),
            IterationOutcome::Unfinished(String::new()),
        ]);

        let outcome = run_loop(&runner, &config(5), &shutdown(), None, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::Completed { iteration: 2 });
        assert_eq!(outcome.exit_code(), exit_codes::OK);
        assert_eq!(runner.calls(), vec![1, 2]);
    }

    #[test]
    fn exhausted_budget_runs_exactly_max_iterations() {
        let runner = ScriptedIteration::repeating(IterationOutcome::Unfinished(String::new()));

        let outcome = run_loop(&runner, &config(3), &shutdown(), None, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::BudgetExhausted { max_iterations: 3 });
        assert_eq!(outcome.exit_code(), exit_codes::EXHAUSTED);
        assert_eq!(runner.calls(), vec![1, 2, 3]);
    }

    #[test]
    fn failures_and_timeouts_do_not_stop_the_loop() {
        let runner = ScriptedIteration::new(vec![
            IterationOutcome::Failed("spawn failed".to_string()),
            IterationOutcome::TimedOut,
            IterationOutcome::Completed(String::new()),
        ]);

        let outcome = run_loop(&runner, &config(5), &shutdown(), None, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::Completed { iteration: 3 });
        assert_eq!(outcome.state.failures, 1);
        assert_eq!(outcome.state.timeouts, 1);
    }

    #[test]
    fn restarts_consume_budget_by_default() {
        let runner = ScriptedIteration::repeating(IterationOutcome::RestartRequested);

        let outcome = run_loop(&runner, &config(2), &shutdown(), None, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::BudgetExhausted { max_iterations: 2 });
        assert_eq!(outcome.state.restarts, 2);
        assert_eq!(runner.calls(), vec![1, 2]);
    }

    #[test]
    fn restarts_can_be_excluded_from_budget() {
        let runner = ScriptedIteration::new(vec![
            IterationOutcome::RestartRequested,
            IterationOutcome::RestartRequested,
            IterationOutcome::Unfinished(String::new()),
        ]);
        let config = LoopConfig {
            restarts_consume_budget: false,
            ..config(1)
        };

        let outcome = run_loop(&runner, &config, &shutdown(), None, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::BudgetExhausted { max_iterations: 1 });
        assert_eq!(outcome.state.restarts, 2);
        assert_eq!(outcome.state.budget_used, 1);
        assert_eq!(runner.calls(), vec![1, 2, 3]);
    }

    #[test]
    fn interrupted_iteration_exits_130() {
        let runner = ScriptedIteration::new(vec![
            IterationOutcome::Unfinished(String::new()),
            IterationOutcome::Interrupted,
        ]);

        let outcome = run_loop(&runner, &config(5), &shutdown(), None, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::Interrupted { iteration: 2 });
        assert_eq!(outcome.exit_code(), exit_codes::INTERRUPTED);
        assert!(outcome.state.interrupted);
    }

    #[test]
    fn interrupt_before_start_runs_nothing() {
        let runner = ScriptedIteration::repeating(IterationOutcome::Unfinished(String::new()));
        let shutdown = shutdown();
        shutdown.request();

        let outcome = run_loop(&runner, &config(5), &shutdown, None, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::Interrupted { iteration: 0 });
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn interrupt_during_pause_stops_the_loop() {
        let shutdown = shutdown();
        let trigger = Arc::clone(&shutdown);
        let runner = ScriptedIteration::repeating(IterationOutcome::Unfinished(String::new()))
            .on_call(move |_| trigger.request());
        let config = LoopConfig {
            pause: Duration::from_secs(30),
            ..config(5)
        };

        let outcome = run_loop(&runner, &config, &shutdown, None, |_| {}).expect("loop");

        assert_eq!(outcome.stop, LoopStop::Interrupted { iteration: 1 });
        assert_eq!(runner.calls(), vec![1]);
    }

    #[test]
    fn config_error_aborts_the_loop() {
        let runner = ScriptedIteration::failing(ConfigError::InvalidModel {
            model: "bad model".to_string(),
        });

        let err = run_loop(&runner, &config(5), &shutdown(), None, |_| {}).expect_err("config");

        assert!(err.downcast_ref::<ConfigError>().is_some());
        assert_eq!(runner.calls(), vec![1]);
    }

    #[test]
    fn events_bracket_each_iteration() {
        let runner = ScriptedIteration::new(vec![IterationOutcome::Completed(String::new())]);
        let mut events = Vec::new();

        run_loop(&runner, &config(3), &shutdown(), None, |event| {
            events.push(match event {
                LoopEvent::Started { iteration, .. } => format!("start {iteration}"),
                LoopEvent::Finished { iteration, outcome } => {
                    format!("end {iteration} {}", outcome.label())
                }
            });
        })
        .expect("loop");

        assert_eq!(events, ["start 1", "end 1 completed"]);
    }
}
