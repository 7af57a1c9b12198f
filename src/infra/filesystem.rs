//! Filesystem operations
//!
//! Handles file and directory operations, build directories and stamps.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::defaults;
use crate::error::FilesystemError;

/// Create a directory and all parent directories
pub fn create_dir_all(path: &Path) -> Result<(), FilesystemError> {
    std::fs::create_dir_all(path).map_err(|e| FilesystemError::CreateDir {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Remove a directory and all its contents
pub fn remove_dir_all(path: &Path) -> Result<(), FilesystemError> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|e| FilesystemError::RemoveDir {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
    }
    Ok(())
}

/// Write content to a file
pub fn write_file(path: &Path, content: &str) -> Result<(), FilesystemError> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    std::fs::write(path, content).map_err(|e| FilesystemError::WriteFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Read content from a file
pub fn read_file(path: &Path) -> Result<String, FilesystemError> {
    std::fs::read_to_string(path).map_err(|e| FilesystemError::ReadFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Create a fresh, uniquely named build directory under `root`
pub fn make_build_dir(root: &Path) -> Result<PathBuf, FilesystemError> {
    create_dir_all(root)?;
    let dir = tempfile::Builder::new()
        .prefix(defaults::BUILD_DIR_PREFIX)
        .tempdir_in(root)
        .map_err(|e| FilesystemError::CreateDir {
            path: root.to_path_buf(),
            error: e.to_string(),
        })?;
    Ok(dir.keep())
}

/// Whether sources were already put in place in `dir`
pub fn has_stamp(dir: &Path) -> bool {
    dir.join(defaults::STAMP_FILE).is_file()
}

/// Mark sources of `dir` as in place
pub fn write_stamp(dir: &Path) -> Result<(), FilesystemError> {
    write_file(&dir.join(defaults::STAMP_FILE), "")
}

/// Guess the source directory inside a build directory
///
/// `.` when there is no directory, the directory when there is exactly one,
/// `None` otherwise.
pub fn guess_subdir(dir: &Path) -> Result<Option<String>, FilesystemError> {
    let entries = std::fs::read_dir(dir).map_err(|e| FilesystemError::ReadFile {
        path: dir.to_path_buf(),
        error: e.to_string(),
    })?;
    let mut found = None;
    let mut count = 0;
    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            count += 1;
            if count > 1 {
                return Ok(None);
            }
            found = Some(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(Some(found.unwrap_or_else(|| ".".to_string())))
}

/// Recursively copy `from` into `to`, keeping symlinks as symlinks
pub fn copy_dir(from: &Path, to: &Path) -> Result<(), FilesystemError> {
    let copy_error = |e: &dyn std::fmt::Display| FilesystemError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        error: e.to_string(),
    };
    create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| copy_error(&e))?;
        let relative = entry.path().strip_prefix(from).map_err(|e| copy_error(&e))?;
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path()).map_err(|e| copy_error(&e))?;
            symlink(&link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| copy_error(&e))?;
        }
    }
    Ok(())
}

/// Create a symlink at `link` pointing to `target`, replacing an existing one
pub fn symlink(target: &Path, link: &Path) -> Result<(), FilesystemError> {
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(link).map_err(|e| FilesystemError::WriteFile {
            path: link.to_path_buf(),
            error: e.to_string(),
        })?;
    }
    std::os::unix::fs::symlink(target, link).map_err(|e| FilesystemError::WriteFile {
        path: link.to_path_buf(),
        error: e.to_string(),
    })
}
