//! Archival of a previous run's PRD and progress log.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::{info, warn};

use crate::core::archive_name::archive_folder_name;
use crate::io::paths::RalphPaths;

/// Copy `prd.yml` and `progress.txt` into
/// `archive/<YYYY-MM-DD>-<previous branch>`. Returns the archive folder.
///
/// Missing source files are skipped; a failed copy is logged and the rest of
/// the archive is still written.
pub fn archive_run(
    paths: &RalphPaths,
    previous_branch: &str,
    now: DateTime<Local>,
) -> Result<PathBuf> {
    let date = now.format("%Y-%m-%d").to_string();
    let folder = paths
        .archive_dir
        .join(archive_folder_name(&date, previous_branch));
    fs::create_dir_all(&folder)
        .with_context(|| format!("create archive directory {}", folder.display()))?;

    for source in [&paths.prd_path, &paths.progress_path] {
        copy_into(source, &folder);
    }
    info!(folder = %folder.display(), branch = previous_branch, "previous run archived");
    Ok(folder)
}

fn copy_into(source: &Path, folder: &Path) {
    if !source.exists() {
        return;
    }
    let Some(name) = source.file_name() else {
        return;
    };
    let target = folder.join(name);
    if let Err(err) = fs::copy(source, &target) {
        warn!(
            source = %source.display(),
            target = %target.display(),
            err = %err,
            "failed to archive file"
        );
    }
}

fn progress_header(now: DateTime<Local>) -> String {
    format!(
        "# Ralph Progress Log\nStarted: {}\n---\n",
        now.format("%a %b %e %H:%M:%S %Y")
    )
}

/// Replace the progress log with a fresh header.
pub fn reset_progress_file(path: &Path, now: DateTime<Local>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, progress_header(now))
        .with_context(|| format!("reset progress log {}", path.display()))
}

/// Write the header only if the progress log does not exist yet.
/// Returns whether a new file was created.
pub fn init_progress_file(path: &Path, now: DateTime<Local>) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    reset_progress_file(path, now)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 1, 2, 9, 30, 0)
            .single()
            .expect("unambiguous time")
    }

    #[test]
    fn archives_prd_and_progress_under_sanitized_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RalphPaths::new(temp.path());
        fs::create_dir_all(&paths.ralph_dir).expect("mkdir");
        fs::write(&paths.prd_path, "items: []\n").expect("write prd");
        fs::write(&paths.progress_path, "progress\n").expect("write progress");

        let folder = archive_run(&paths, "ralph/feat/login x", fixed_time()).expect("archive");

        assert_eq!(folder, paths.archive_dir.join("2026-01-02-feat_login_x"));
        assert_eq!(
            fs::read_to_string(folder.join("prd.yml")).expect("read"),
            "items: []\n"
        );
        assert_eq!(
            fs::read_to_string(folder.join("progress.txt")).expect("read"),
            "progress\n"
        );
    }

    #[test]
    fn missing_sources_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RalphPaths::new(temp.path());

        let folder = archive_run(&paths, "old", fixed_time()).expect("archive");
        assert!(folder.is_dir());
        assert!(!folder.join("prd.yml").exists());
    }

    #[test]
    fn init_only_writes_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.txt");

        assert!(init_progress_file(&path, fixed_time()).expect("init"));
        fs::write(&path, "kept").expect("write");
        assert!(!init_progress_file(&path, fixed_time()).expect("init"));
        assert_eq!(fs::read_to_string(&path).expect("read"), "kept");

        reset_progress_file(&path, fixed_time()).expect("reset");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.starts_with("# Ralph Progress Log\nStarted: Fri Jan  2 09:30:00 2026\n---\n"));
    }
}
