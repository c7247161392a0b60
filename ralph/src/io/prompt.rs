//! Prompt file resolution inside the trusted prompt directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::errors::ConfigError;

/// Resolve `requested` against `root`, refusing anything that could land
/// outside it.
///
/// Absolute paths and `..` components are rejected outright. When the target
/// exists, its canonical form must still live under the canonical root, which
/// catches symlinks pointing elsewhere. Nothing is read before this check.
pub fn resolve_prompt_path(root: &Path, requested: &Path) -> Result<PathBuf, ConfigError> {
    let outside = || ConfigError::PromptOutsideRoot {
        requested: requested.to_path_buf(),
        root: root.to_path_buf(),
    };

    let lexically_safe = requested.components().all(|component| {
        matches!(component, Component::Normal(_) | Component::CurDir)
    });
    if !lexically_safe || requested.as_os_str().is_empty() {
        return Err(outside());
    }

    let candidate = root.join(requested);
    if let (Ok(real_root), Ok(real_candidate)) = (root.canonicalize(), candidate.canonicalize())
        && !real_candidate.starts_with(&real_root)
    {
        return Err(outside());
    }

    debug!(path = %candidate.display(), "prompt path resolved");
    Ok(candidate)
}

/// Read the prompt text. A missing file is a configuration error.
pub fn load_prompt(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            ConfigError::PromptNotFound(path.to_path_buf())
        } else {
            ConfigError::PromptUnreadable {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_resolves_under_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("prompt.cursor.md"), "do work").expect("write");

        let path = resolve_prompt_path(temp.path(), Path::new("prompt.cursor.md")).expect("resolve");
        assert_eq!(path, temp.path().join("prompt.cursor.md"));
        assert_eq!(load_prompt(&path).expect("load"), "do work");
    }

    #[test]
    fn traversal_and_absolute_paths_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        for requested in ["../secret.md", "nested/../../secret.md", "/etc/passwd", ""] {
            let err = resolve_prompt_path(temp.path(), Path::new(requested))
                .expect_err("should reject");
            assert!(
                matches!(err, ConfigError::PromptOutsideRoot { .. }),
                "{requested}: {err}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("cursor");
        fs::create_dir_all(&root).expect("mkdir");
        let outside = temp.path().join("outside.md");
        fs::write(&outside, "secret").expect("write");
        std::os::unix::fs::symlink(&outside, root.join("prompt.md")).expect("symlink");

        let err = resolve_prompt_path(&root, Path::new("prompt.md")).expect_err("should reject");
        assert!(matches!(err, ConfigError::PromptOutsideRoot { .. }));
    }

    #[test]
    fn missing_prompt_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = resolve_prompt_path(temp.path(), Path::new("absent.md")).expect("resolve");
        let err = load_prompt(&path).expect_err("missing");
        assert!(matches!(err, ConfigError::PromptNotFound(_)));
    }
}
