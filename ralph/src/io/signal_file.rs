//! Restart side channel backed by the existence of a file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// The worker creates this file to ask for a fresh iteration.
///
/// The supervisor clears it before every iteration and right after consuming
/// it, so it never survives an iteration boundary.
#[derive(Debug, Clone)]
pub struct SignalFile {
    path: PathBuf,
}

impl SignalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_raised(&self) -> bool {
        self.path.exists()
    }

    /// Create the file. Workers normally do this; tests use it to simulate them.
    pub fn raise(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&self.path, b"").with_context(|| format!("write {}", self.path.display()))
    }

    /// Remove the file. Returns whether it was present.
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "restart signal cleared");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_then_clear() {
        let temp = tempfile::tempdir().expect("tempdir");
        let signal = SignalFile::new(temp.path().join("nested/.restart-signal"));
        assert!(!signal.is_raised());

        signal.raise().expect("raise");
        assert!(signal.is_raised());

        assert!(signal.clear().expect("clear"));
        assert!(!signal.is_raised());
    }

    #[test]
    fn clearing_missing_file_is_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let signal = SignalFile::new(temp.path().join(".restart-signal"));
        assert!(!signal.clear().expect("clear"));
    }
}
