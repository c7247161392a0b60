//! Deterministic, pure logic shared by the supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod archive_name;
pub mod completion;
pub mod model;
pub mod stream_text;
pub mod types;
