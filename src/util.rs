//! Small path helpers shared by the installer and loader.
//!
//! `dunce` strips Windows' `\\?\` UNC prefix from an otherwise-ordinary
//! canonicalized path, and `path_slash` then forces `/` separators so a
//! path computed on Windows reads the same in a log message or an error as
//! it would on Unix.

use std::path::{Path, PathBuf};

/// Canonicalizes `path`, rendering the result with forward slashes even on
/// Windows. Falls back to a lexical join against the current directory
/// (still slash-normalized) if the path doesn't exist yet, since install
/// targets and not-yet-built outputs are often referenced before they're
/// created.
pub fn display_path(path: &Path) -> PathBuf {
    let resolved = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    slash_normalized(&resolved)
}

#[cfg(windows)]
fn slash_normalized(path: &Path) -> PathBuf {
    use path_slash::PathExt;
    PathBuf::from(path.to_slash_lossy().as_ref())
}

#[cfg(not(windows))]
fn slash_normalized(path: &Path) -> PathBuf {
    path.to_path_buf()
}

/// Recursively lists files under `root` whose extension matches one of
/// `extensions`, for populating change-detection's `build_system_files`
/// set.
pub fn discover_files_with_extensions(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}
