//! Mirror path safety.
//!
//! Sync I/O is confined to the workspace directory. Every read or write
//! target passes through [`resolve_mirror_path`] before the first byte
//! moves; rejection reasons are surfaced with kind `path_unsafe`. Paths
//! into a version-control directory are refused unconditionally — the
//! engine never touches one, even by accident.

use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{BeadsError, Result};

/// Directory names whose contents sync must never touch.
const VCS_DIR_NAMES: &[&str] = &[".git", ".hg", ".svn", ".jj"];

/// Validate a mirror (or temp-file) path against the workspace allowlist
/// and return its absolute form.
///
/// Rejected before any I/O:
/// - parent-directory traversal (`..`) anywhere in the input;
/// - version-control directories, in the raw or resolved path;
/// - platform roots (`/`, a bare drive);
/// - anything that does not land inside the canonicalized workspace,
///   including symlinks pointing out of it.
///
/// # Errors
///
/// `PathUnsafe` with the reason; `Io` when the workspace itself cannot be
/// canonicalized.
pub fn resolve_mirror_path(path: &Path, workspace_dir: &Path) -> Result<PathBuf> {
    if has_parent_traversal(path) {
        return reject(path, "contains parent-directory traversal");
    }
    if names_vcs_dir(path) {
        return reject(path, "targets a version-control directory");
    }

    let workspace = workspace_dir.canonicalize().map_err(|err| {
        BeadsError::path_unsafe(
            workspace_dir,
            format!("workspace cannot be canonicalized: {err}"),
        )
    })?;
    if names_vcs_dir(&workspace) {
        return reject(&workspace, "workspace resolves into a version-control directory");
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };

    if is_platform_root(&absolute) {
        return reject(&absolute, "targets a filesystem root");
    }

    // Canonicalize through the nearest existing ancestor so symlinked
    // segments cannot smuggle the target out of the workspace. The file
    // itself may not exist yet (fresh export).
    let resolved = resolve_existing_prefix(&absolute)?;
    if names_vcs_dir(&resolved) {
        return reject(&resolved, "resolves into a version-control directory");
    }
    if !resolved.starts_with(&workspace) {
        warn!(path = %path.display(), resolved = %resolved.display(), "Mirror path escapes workspace");
        return Err(BeadsError::path_unsafe(
            path,
            format!(
                "resolves to '{}' outside the workspace '{}'",
                resolved.display(),
                workspace.display()
            ),
        ));
    }

    debug!(path = %resolved.display(), "Mirror path validated");
    Ok(resolved)
}

/// The temp sibling used for atomic export; must live next to the target.
///
/// # Errors
///
/// `PathUnsafe` when the target has no parent directory.
pub fn temp_sibling(target: &Path) -> Result<PathBuf> {
    let Some(file_name) = target.file_name() else {
        return Err(BeadsError::path_unsafe(target, "has no file name"));
    };
    let mut name = file_name.to_os_string();
    name.push(".tmp");
    Ok(target.with_file_name(name))
}

fn reject(path: &Path, reason: &str) -> Result<PathBuf> {
    warn!(path = %path.display(), reason, "Mirror path rejected");
    Err(BeadsError::path_unsafe(path, reason))
}

fn has_parent_traversal(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}

fn names_vcs_dir(path: &Path) -> bool {
    path.components().any(|component| {
        matches!(component, Component::Normal(name)
            if VCS_DIR_NAMES.iter().any(|vcs| name == *vcs))
    })
}

fn is_platform_root(path: &Path) -> bool {
    path.parent().is_none()
}

/// Canonicalize the longest existing ancestor of `path`, then re-append
/// the non-existing tail.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut out = resolved;
                for segment in tail.iter().rev() {
                    out.push(segment);
                }
                return Ok(out);
            }
            Err(_) => {
                let Some(name) = existing.file_name() else {
                    // Ran out of ancestors without finding one that
                    // exists; treat the input as-is.
                    return Ok(path.to_path_buf());
                };
                tail.push(name.to_os_string());
                existing = existing
                    .parent()
                    .map_or_else(|| PathBuf::from("/"), Path::to_path_buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn kind_of(result: Result<PathBuf>) -> ErrorKind {
        result.unwrap_err().kind()
    }

    #[test]
    fn workspace_relative_mirror_is_allowed() {
        let dir = TempDir::new().unwrap();
        let resolved = resolve_mirror_path(Path::new("issues.jsonl"), dir.path()).unwrap();
        assert!(resolved.ends_with("issues.jsonl"));
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn traversal_is_rejected_before_io() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            kind_of(resolve_mirror_path(
                Path::new("../outside/issues.jsonl"),
                dir.path()
            )),
            ErrorKind::PathUnsafe
        );
        assert_eq!(
            kind_of(resolve_mirror_path(
                Path::new("sub/../../issues.jsonl"),
                dir.path()
            )),
            ErrorKind::PathUnsafe
        );
    }

    #[test]
    fn absolute_path_outside_workspace_is_rejected() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let foreign = other.path().join("issues.jsonl");
        assert_eq!(
            kind_of(resolve_mirror_path(&foreign, dir.path())),
            ErrorKind::PathUnsafe
        );
    }

    #[test]
    fn platform_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            kind_of(resolve_mirror_path(Path::new("/"), dir.path())),
            ErrorKind::PathUnsafe
        );
    }

    #[test]
    fn vcs_directories_are_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        assert_eq!(
            kind_of(resolve_mirror_path(
                Path::new(".git/issues.jsonl"),
                dir.path()
            )),
            ErrorKind::PathUnsafe
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let workspace = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let link = workspace.path().join("mirror-link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        assert_eq!(
            kind_of(resolve_mirror_path(
                &link.join("issues.jsonl"),
                workspace.path()
            )),
            ErrorKind::PathUnsafe
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_to_vcs_dir_is_rejected() {
        let workspace = TempDir::new().unwrap();
        std::fs::create_dir(workspace.path().join(".git")).unwrap();
        let link = workspace.path().join("innocent");
        std::os::unix::fs::symlink(workspace.path().join(".git"), &link).unwrap();

        assert_eq!(
            kind_of(resolve_mirror_path(
                &link.join("issues.jsonl"),
                workspace.path()
            )),
            ErrorKind::PathUnsafe
        );
    }

    #[test]
    fn nonexistent_target_in_workspace_is_fine() {
        let dir = TempDir::new().unwrap();
        let resolved =
            resolve_mirror_path(Path::new("not-yet-created.jsonl"), dir.path()).unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn temp_sibling_stays_next_to_target() {
        let temp = temp_sibling(Path::new("/ws/issues.jsonl")).unwrap();
        assert_eq!(temp, PathBuf::from("/ws/issues.jsonl.tmp"));
    }
}
