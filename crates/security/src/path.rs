//! Path validation — confining commands and searches to approved roots.
//!
//! Paths are expanded (`~`), made absolute, cleaned of `.`/`..` and
//! canonicalized as far as they exist on disk, then compared component-wise
//! against the configured roots.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside allowed roots")]
    OutsideAllowedRoots { path: String },

    #[error("Path '{path}' matches forbidden pattern '{pattern}'")]
    ForbiddenPath { path: String, pattern: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },
}

/// Validate that a path given by the planner is safe to access.
///
/// Checks:
/// 1. No `..` sequences in the raw string
/// 2. Not inside a forbidden path
/// 3. Inside one of the allowed roots (if any are specified)
///
/// Returns the normalized path on success.
pub fn validate_path(
    path: &str,
    allowed_roots: &[String],
    forbidden_paths: &[String],
) -> Result<PathBuf, PathValidationError> {
    let raw = path.replace('\\', "/");
    if raw.contains("../") || raw.contains("/..") || raw == ".." {
        return Err(PathValidationError::PathTraversal { path: path.into() });
    }

    let normalized = normalize(&expand_tilde(path));

    if let Some(pattern) = forbidden_paths
        .iter()
        .find(|f| is_within(&normalized, &normalize(&expand_tilde(f))))
    {
        return Err(PathValidationError::ForbiddenPath {
            path: path.into(),
            pattern: pattern.clone(),
        });
    }

    if !allowed_roots.is_empty() && !within_any(&normalized, &resolve_roots(allowed_roots)) {
        return Err(PathValidationError::OutsideAllowedRoots { path: path.into() });
    }

    Ok(normalized)
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(home) = home_dir() {
        if path == "~" {
            return home;
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand and normalize a list of configured roots.
pub fn resolve_roots(roots: &[String]) -> Vec<PathBuf> {
    roots.iter().map(|r| normalize(&expand_tilde(r))).collect()
}

/// Make a path absolute and resolve it as far as it exists.
///
/// The longest existing prefix is canonicalized (following symlinks); the
/// non-existing remainder is appended after lexical cleanup.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let cleaned = lexical_clean(&absolute);

    let mut existing = cleaned.clone();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in missing.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name);
                existing = parent.to_path_buf();
            }
            _ => return cleaned,
        }
    }
}

/// Resolve a (possibly relative) argument against a working directory.
pub fn resolve_against(base: &Path, arg: &str) -> PathBuf {
    let expanded = expand_tilde(arg);
    if expanded.is_absolute() {
        normalize(&expanded)
    } else {
        normalize(&base.join(expanded))
    }
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Component-wise containment; both paths should be normalized.
pub fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

pub fn within_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| is_within(path, root))
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_path_no_restrictions() {
        let result = validate_path("/home/user/project/file.txt", &[], &[]);
        assert!(result.is_ok());
    }

    #[test]
    fn path_traversal_blocked() {
        let result = validate_path("../../../etc/passwd", &[], &[]);
        match result.unwrap_err() {
            PathValidationError::PathTraversal { .. } => {}
            other => panic!("Expected PathTraversal, got: {other}"),
        }
    }

    #[test]
    fn forbidden_path_blocked() {
        let forbidden = vec!["/etc".into()];
        match validate_path("/etc/passwd", &[], &forbidden).unwrap_err() {
            PathValidationError::ForbiddenPath { pattern, .. } => assert_eq!(pattern, "/etc"),
            other => panic!("Expected ForbiddenPath, got: {other}"),
        }
    }

    #[test]
    fn allowed_roots_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let inside = dir.path().join("docs/report.pdf");

        assert!(validate_path(&inside.to_string_lossy(), &[root.clone()], &[]).is_ok());
        match validate_path("/definitely/elsewhere.txt", &[root], &[]).unwrap_err() {
            PathValidationError::OutsideAllowedRoots { .. } => {}
            other => panic!("Expected OutsideAllowedRoots, got: {other}"),
        }
    }

    #[test]
    fn sibling_prefix_is_not_inside() {
        let roots = vec![PathBuf::from("/srv/project1")];
        assert!(within_any(Path::new("/srv/project1/a.rs"), &roots));
        assert!(!within_any(Path::new("/srv/project10/a.rs"), &roots));
    }

    #[test]
    fn forbidden_takes_precedence_over_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let secret = dir.path().join(".ssh");
        let forbidden = vec![secret.to_string_lossy().to_string()];
        let target = secret.join("id_rsa");
        assert!(validate_path(&target.to_string_lossy(), &[root], &forbidden).is_err());
    }

    #[test]
    fn forbidden_with_tilde_expansion() {
        if let Some(home) = home_dir() {
            let forbidden = vec!["~/.ssh".into()];
            let ssh_path = home.join(".ssh/id_rsa");
            assert!(validate_path(&ssh_path.to_string_lossy(), &[], &forbidden).is_err());
        }
    }

    #[test]
    fn resolve_against_handles_relative_parents() {
        let dir = tempfile::tempdir().unwrap();
        let base = normalize(dir.path());
        let resolved = resolve_against(&base.join("sub"), "../out/file.txt");
        assert_eq!(resolved, base.join("out/file.txt"));
    }

    #[test]
    fn normalize_keeps_missing_tail() {
        let dir = tempfile::tempdir().unwrap();
        let base = normalize(dir.path());
        let missing = normalize(&dir.path().join("a/./b/../c"));
        assert_eq!(missing, base.join("a/c"));
    }
}
