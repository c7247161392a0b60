//! Completion marker detection.

/// Literal substring a worker prints once all tracked work is done.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

pub fn contains_completion_marker(output: &str) -> bool {
    output.contains(COMPLETION_MARKER)
}
