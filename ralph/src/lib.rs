//! Iteration supervisor for autonomous coding agents.
//!
//! `ralph` launches an external worker (the Cursor CLI agent) once per
//! iteration, enforces a timeout, collects its output, and watches two
//! out-of-band signals: the completion marker in the output and a restart
//! signal file the worker creates when it wants a fresh context. The loop stops
//! on completion, on interrupt, or when the iteration budget is spent.
//!
//! - **[`core`]**: Pure, deterministic logic (outcomes, marker detection,
//!   stream text extraction, naming rules). No I/O.
//! - **[`io`]**: Side-effecting operations (files under `scripts/ralph/`,
//!   child processes, watcher and reader threads).
//!
//! Orchestration modules ([`start`], [`iteration`], [`looping`]) combine the
//! two; [`shutdown`] owns the process-wide interrupt path.

pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod shutdown;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
