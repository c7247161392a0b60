//! Branch marker persisted between runs (`scripts/ralph/.last-branch`).

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Last branch recorded by a previous run. A missing or blank file is `None`.
pub fn load_last_branch(path: &Path) -> Result<Option<String>> {
    debug!(path = %path.display(), "loading last branch");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let branch = contents.trim();
    Ok((!branch.is_empty()).then(|| branch.to_string()))
}

/// Atomically write the branch marker (temp file + rename).
pub fn write_last_branch(path: &Path, branch: &str) -> Result<()> {
    debug!(path = %path.display(), branch, "writing last branch");
    let parent = path
        .parent()
        .with_context(|| format!("branch marker path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, format!("{branch}\n"))
        .with_context(|| format!("write temp branch marker {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
