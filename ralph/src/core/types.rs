//! Shared types passed between the iteration runner and the loop controller.

use std::fmt;

/// Result of one supervised worker invocation.
///
/// Exactly one variant is produced per iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The output contained the completion marker.
    Completed(String),
    /// The worker asked for a fresh iteration through the restart signal file.
    /// Its output is discarded.
    RestartRequested,
    /// The worker ran past the per-iteration timeout and was killed.
    TimedOut,
    /// A process-wide interrupt arrived while the iteration was running.
    Interrupted,
    /// Spawning or talking to the worker failed; the loop carries on.
    Failed(String),
    /// The worker exited on its own without signalling completion.
    Unfinished(String),
}

impl IterationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IterationOutcome::Completed(_) => "completed",
            IterationOutcome::RestartRequested => "restart_requested",
            IterationOutcome::TimedOut => "timed_out",
            IterationOutcome::Interrupted => "interrupted",
            IterationOutcome::Failed(_) => "failed",
            IterationOutcome::Unfinished(_) => "unfinished",
        }
    }

    /// Output the worker produced, if the outcome keeps any.
    pub fn output(&self) -> Option<&str> {
        match self {
            IterationOutcome::Completed(output) | IterationOutcome::Unfinished(output) => {
                Some(output)
            }
            _ => None,
        }
    }
}

impl fmt::Display for IterationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterationOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}
