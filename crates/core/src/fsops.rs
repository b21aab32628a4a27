use std::path::{Component, Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::model::{ChangeType, CodeChange, CodeChanges};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Unsafe path: {0}")]
    UnsafePath(String),

    #[error("File already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Backup directory does not exist: {0}")]
    MissingBackup(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Snapshot directory created next to the repository root, named
/// `<root-name>_backup_<YYYYMMDD_HHMMSS>`. Populated lazily: each modified
/// or deleted file is copied in just before mutation.
pub fn create_backup(root: &Path) -> Result<PathBuf, ApplyError> {
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo");
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let parent = root.parent().unwrap_or_else(|| Path::new("."));
    let backup = parent.join(format!("{name}_backup_{timestamp}"));
    std::fs::create_dir_all(&backup)?;
    info!(backup = %backup.display(), "Created backup directory");
    Ok(backup)
}

/// Reject absolute paths, parent traversal, and anything that would land
/// outside the repository root.
pub fn validate_change_path(file_path: &str, root: &Path) -> Result<(), ApplyError> {
    let path = Path::new(file_path);
    if path.is_absolute() {
        return Err(ApplyError::UnsafePath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(ApplyError::UnsafePath(format!(
                    "path traversal detected: {file_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(ApplyError::UnsafePath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            _ => {}
        }
    }
    // Normal components only, so the join cannot escape, but a canonical
    // check still catches symlinked ancestors.
    let joined = root.join(path);
    if let (Ok(root_canon), Ok(parent_canon)) = (
        root.canonicalize(),
        joined.parent().map(|p| p.canonicalize()).unwrap_or_else(|| root.canonicalize()),
    ) {
        if !parent_canon.starts_with(&root_canon) {
            return Err(ApplyError::UnsafePath(format!(
                "path escapes repository: {file_path}"
            )));
        }
    }
    Ok(())
}

/// Validate every change, returning one message per rejected path.
pub fn validate_paths(changes: &CodeChanges, root: &Path) -> Vec<String> {
    changes
        .changes
        .iter()
        .filter_map(|c| validate_change_path(&c.file_path, root).err())
        .map(|e| e.to_string())
        .collect()
}

/// Apply one change under `root`. `modified` and `deleted` back up the
/// prior file into `backup` (preserving the relative path) before mutating.
pub fn apply_change(
    change: &CodeChange,
    root: &Path,
    backup: Option<&Path>,
) -> Result<PathBuf, ApplyError> {
    validate_change_path(&change.file_path, root)?;
    let target = root.join(&change.file_path);
    debug!(path = %change.file_path, kind = %change.change_type, "Applying change");

    match change.change_type {
        ChangeType::Created => {
            if target.exists() {
                return Err(ApplyError::AlreadyExists(target));
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &change.modified_content)?;
        }
        ChangeType::Modified => {
            if !target.exists() {
                warn!(path = %change.file_path, "Modified target missing; creating instead");
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
            } else if let Some(backup) = backup {
                backup_file(&target, backup, root)?;
            }
            std::fs::write(&target, &change.modified_content)?;
        }
        ChangeType::Deleted => {
            if !target.exists() {
                warn!(path = %change.file_path, "Delete target missing; skipping");
                return Ok(target);
            }
            if let Some(backup) = backup {
                backup_file(&target, backup, root)?;
            }
            std::fs::remove_file(&target)?;
        }
    }

    Ok(target)
}

fn backup_file(target: &Path, backup: &Path, root: &Path) -> Result<(), ApplyError> {
    let relative = target.strip_prefix(root).unwrap_or(target);
    let backup_path = backup.join(relative);
    if let Some(parent) = backup_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(target, &backup_path)?;
    debug!(path = %relative.display(), "Backed up prior version");
    Ok(())
}

/// Copy every file in the backup back into the root, preserving relative
/// paths. Files created after the backup are left in place; callers that
/// need byte-identical restoration combine this with deleting the paths
/// they created (the pipeline tracks those in its change list).
pub fn restore_backup(backup: &Path, root: &Path) -> Result<usize, ApplyError> {
    if !backup.exists() {
        return Err(ApplyError::MissingBackup(backup.to_path_buf()));
    }
    info!(backup = %backup.display(), root = %root.display(), "Restoring from backup");

    let mut restored = 0;
    let mut stack = vec![backup.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let relative = path.strip_prefix(backup).unwrap_or(&path);
            let target = root.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&path, &target)?;
            restored += 1;
        }
    }
    info!(restored, "Backup restore complete");
    Ok(restored)
}

/// Best-effort removal of a snapshot directory.
pub fn cleanup_backup(backup: &Path) {
    if !backup.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(backup) {
        warn!(backup = %backup.display(), error = %e, "Failed to clean up backup");
    } else {
        info!(backup = %backup.display(), "Cleaned up backup directory");
    }
}

/// Best-effort removal of a cloned working copy.
pub fn cleanup_clone(root: &Path) {
    if !root.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(root) {
        warn!(root = %root.display(), error = %e, "Failed to clean up clone");
    } else {
        info!(root = %root.display(), "Cleaned up cloned repository");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChangeType;

    fn change(path: &str, kind: ChangeType, content: &str) -> CodeChange {
        CodeChange {
            file_path: path.into(),
            change_type: kind,
            original_content: None,
            modified_content: content.into(),
            diff: String::new(),
            lines_added: 0,
            lines_removed: 0,
            class_name: None,
            package_name: None,
            imports_added: vec![],
            methods_added: vec![],
            annotations_added: vec![],
        }
    }

    #[test]
    fn create_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("A.java"), "old").unwrap();
        let err = apply_change(&change("A.java", ChangeType::Created, "new"), dir.path(), None)
            .unwrap_err();
        assert!(matches!(err, ApplyError::AlreadyExists(_)));
    }

    #[test]
    fn create_makes_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        apply_change(
            &change("src/main/java/A.java", ChangeType::Created, "x"),
            dir.path(),
            None,
        )
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/main/java/A.java")).unwrap(),
            "x"
        );
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["../evil.java", "/etc/passwd", "a/../../evil.java"] {
            let err = validate_change_path(bad, dir.path()).unwrap_err();
            assert!(matches!(err, ApplyError::UnsafePath(_)), "{bad}");
        }
        validate_change_path("src/ok.java", dir.path()).unwrap();
    }

    #[test]
    fn modify_and_delete_back_up_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/A.java"), "original a").unwrap();
        std::fs::write(root.join("src/B.java"), "original b").unwrap();

        let backup = create_backup(&root).unwrap();
        apply_change(
            &change("src/A.java", ChangeType::Modified, "patched a"),
            &root,
            Some(&backup),
        )
        .unwrap();
        apply_change(&change("src/B.java", ChangeType::Deleted, ""), &root, Some(&backup))
            .unwrap();

        assert_eq!(std::fs::read_to_string(root.join("src/A.java")).unwrap(), "patched a");
        assert!(!root.join("src/B.java").exists());

        let restored = restore_backup(&backup, &root).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(std::fs::read_to_string(root.join("src/A.java")).unwrap(), "original a");
        assert_eq!(std::fs::read_to_string(root.join("src/B.java")).unwrap(), "original b");
    }

    #[test]
    fn validate_paths_collects_offenders() {
        let dir = tempfile::tempdir().unwrap();
        let mut changes = CodeChanges::new("plan_1");
        changes.push(change("ok.java", ChangeType::Created, ""));
        changes.push(change("../bad.java", ChangeType::Created, ""));
        let errors = validate_paths(&changes, dir.path());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("bad.java"));
    }

    #[test]
    fn cleanup_is_silent_for_missing_dirs() {
        cleanup_backup(Path::new("/nonexistent/backup_dir"));
        cleanup_clone(Path::new("/nonexistent/clone_dir"));
    }
}
