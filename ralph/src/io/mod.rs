//! I/O helpers for the supervisor: files under `scripts/ralph/`, child
//! processes, and the threads that watch them.

pub mod archive;
pub mod collector;
pub mod config;
pub mod iteration_log;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod signal_file;
pub mod tracker;
pub mod watcher;
pub mod worker;
