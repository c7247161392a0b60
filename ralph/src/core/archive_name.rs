//! Archive folder naming for previous runs.

const BRANCH_PREFIX: &str = "ralph/";

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
///
/// The result is always a single path component.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Folder name `<date>-<branch>` with the `ralph/` prefix dropped.
pub fn archive_folder_name(date: &str, branch: &str) -> String {
    let stripped = branch.strip_prefix(BRANCH_PREFIX).unwrap_or(branch);
    let name = sanitize_identifier(stripped);
    if name.is_empty() {
        return format!("{date}-unnamed");
    }
    format!("{date}-{name}")
}
