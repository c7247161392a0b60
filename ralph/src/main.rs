//! `ralph`: run an autonomous coding agent in a bounded loop.
//!
//! Each iteration launches the worker with the prompt from
//! `scripts/ralph/cursor/`, and the loop ends when the worker prints the
//! completion marker, the iteration budget runs out, or the user interrupts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing::info;

use ralph::core::model::validate_model;
use ralph::core::types::IterationOutcome;
use ralph::errors::ConfigError;
use ralph::exit_codes;
use ralph::io::config::{CliOverrides, IterationConfig, RalphConfig, load_config};
use ralph::io::paths::RalphPaths;
use ralph::io::process::ProcessRegistry;
use ralph::io::tracker::BeadsTracker;
use ralph::iteration::IterationRunner;
use ralph::logging;
use ralph::looping::{LoopConfig, LoopEvent, LoopOutcome, LoopStop, run_loop};
use ralph::shutdown::{Shutdown, install_signal_handlers};
use ralph::start::prepare_run;

const RULE: &str = "===============================================================";

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Run an autonomous coding agent until its task list is done"
)]
struct Cli {
    /// Maximum number of iterations (default: 10, or `max_iterations` in config.toml).
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    max_iterations: Option<u32>,

    /// Per-iteration timeout in seconds (overrides RALPH_CURSOR_TIMEOUT).
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    cursor_timeout: Option<u64>,

    /// Worker model (overrides RALPH_MODEL).
    #[arg(long)]
    model: Option<String>,

    /// Stream structured worker output to scripts/ralph/logs/.
    #[arg(long)]
    debug: bool,

    /// Repository root containing scripts/ralph/.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Config file (default: <root>/scripts/ralph/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => report_error(&err),
    };
    std::process::exit(code);
}

fn report_error(err: &anyhow::Error) -> i32 {
    eprintln!("Error: {err:#}");
    match err.downcast_ref::<ConfigError>() {
        Some(config_err) => {
            eprintln!("Hint: {}", config_err.hint());
            exit_codes::CONFIG
        }
        None => exit_codes::EXHAUSTED,
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("resolve repository root {}", cli.root.display()))?;
    let paths = RalphPaths::new(&root);

    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_path.clone());
    let mut config = load_config(&config_path)?;
    config.apply_env(|name| std::env::var(name).ok());
    config.apply_cli(&CliOverrides {
        max_iterations: cli.max_iterations,
        timeout_secs: cli.cursor_timeout,
        model: cli.model.clone(),
        debug: cli.debug,
    });
    config.validate()?;
    validate_model(&config.model)?;

    let iteration_config = IterationConfig::from_config(&config);
    let registry = ProcessRegistry::new();
    let shutdown = Shutdown::new(registry, iteration_config.timings.terminate_grace);
    install_signal_handlers(Arc::clone(&shutdown))?;

    let tracker = BeadsTracker::new(
        config.tracker.command.clone(),
        Duration::from_secs(config.tracker.query_timeout_secs),
    );
    let start = prepare_run(&paths, &tracker, Local::now())?;

    print_banner(&config);
    let loop_config = LoopConfig::from_config(&config);
    let runner = IterationRunner::new(iteration_config, paths.clone(), Arc::clone(&shutdown));
    let result = run_loop(
        &runner,
        &loop_config,
        &shutdown,
        start.current_branch,
        print_event,
    );
    // Same teardown as an interrupt: nothing registered outlives the supervisor.
    shutdown.request();
    let outcome = result?;

    print_summary(&outcome, &paths);
    Ok(outcome.exit_code())
}

fn print_banner(config: &RalphConfig) {
    println!("Starting Ralph - Max iterations: {}", config.max_iterations);
    println!(
        "Model: {} | Timeout: {}s | Debug: {}",
        config.model,
        config.iteration_timeout_secs,
        if config.debug { "on" } else { "off" }
    );
}

fn print_event(event: LoopEvent<'_>) {
    match event {
        LoopEvent::Started {
            iteration,
            max_iterations,
        } => {
            println!();
            println!("{RULE}");
            println!("  Ralph Iteration {iteration} of {max_iterations}");
            println!("{RULE}");
        }
        LoopEvent::Finished { iteration, outcome } => match outcome {
            IterationOutcome::RestartRequested => {
                println!("Iteration {iteration}: restart requested, starting fresh...");
            }
            IterationOutcome::Completed(_) | IterationOutcome::Interrupted => {}
            other => println!(
                "Iteration {iteration} finished ({}). Continuing...",
                other.label()
            ),
        },
    }
}

fn print_summary(outcome: &LoopOutcome, paths: &RalphPaths) {
    let state = &outcome.state;
    info!(
        stop = ?outcome.stop,
        iterations = state.iteration,
        budget_used = state.budget_used,
        restarts = state.restarts,
        timeouts = state.timeouts,
        failures = state.failures,
        branch = ?state.last_branch,
        "loop finished"
    );
    println!();
    match outcome.stop {
        LoopStop::Completed { iteration } => {
            println!("Ralph completed all tasks!");
            println!("Completed at iteration {iteration} of {}", state.max_iterations);
        }
        LoopStop::Interrupted { iteration } => {
            println!("Ralph interrupted during iteration {iteration}.");
        }
        LoopStop::BudgetExhausted { max_iterations } => {
            println!(
                "Ralph reached max iterations ({max_iterations}) without completing all tasks."
            );
            println!("Check {} for status.", paths.progress_path.display());
        }
    }
    println!(
        "Iterations: {} | Restarts: {} | Timeouts: {} | Failures: {}",
        state.iteration, state.restarts, state.timeouts, state.failures
    );
}
