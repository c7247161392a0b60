//! Stable exit codes for the `ralph` command.

/// The worker emitted the completion marker.
pub const OK: i32 = 0;
/// The iteration budget ran out, or the run failed for a reason other than
/// configuration.
pub const EXHAUSTED: i32 = 1;
/// Configuration error (invalid model, prompt outside its directory, no worker
/// binary). Reported before any worker is spawned.
pub const CONFIG: i32 = 2;
/// SIGINT or SIGTERM ended the run (128 + SIGINT).
pub const INTERRUPTED: i32 = 130;
