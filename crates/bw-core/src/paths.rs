//! Filename sanitization and symlink-safe path joining.
//!
//! Every externally-supplied name (frames from peers, file lists from
//! agents) passes through [`sanitize_filename`] before it touches the
//! filesystem, and every join against a library root goes through
//! [`safe_join`], which follows symlinks before checking containment.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty filename")]
    Empty,
    #[error("filename contains a path separator")]
    Separator,
    #[error("filename refers to a parent directory")]
    ParentTraversal,
    #[error("hidden filenames are not allowed")]
    Hidden,
    #[error("filename contains a control character")]
    ControlCharacter,
    #[error("path escapes its root directory")]
    OutsideRoot,
    #[error("root directory cannot be resolved: {0}")]
    BadRoot(String),
}

/// Validate a bare filename.
///
/// Rejects empty names, anything containing a path separator or NUL/control
/// characters, `.`/`..`, and hidden-file prefixes.  Returns the name
/// unchanged on success so call sites can shadow the unvalidated binding.
pub fn sanitize_filename(name: &str) -> Result<String, PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(PathError::Separator);
    }
    if name == "." || name == ".." || name.contains("..") {
        return Err(PathError::ParentTraversal);
    }
    if name.starts_with('.') {
        return Err(PathError::Hidden);
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(PathError::ControlCharacter);
    }
    Ok(name.to_owned())
}

/// Join `name` onto `root`, guaranteeing the result stays inside `root`
/// after symlinks are followed.
///
/// `name` must be a single path component (no separators, no `..`); the
/// root must exist.  The candidate itself may not exist yet — containment
/// is checked on the canonicalized root.
pub fn safe_join(root: &Path, name: &str) -> Result<PathBuf, PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    let component_count = Path::new(name).components().count();
    if component_count != 1 {
        return Err(PathError::Separator);
    }
    if matches!(
        Path::new(name).components().next(),
        Some(Component::ParentDir | Component::CurDir | Component::RootDir)
    ) {
        return Err(PathError::ParentTraversal);
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|e| PathError::BadRoot(e.to_string()))?;
    let candidate = canonical_root.join(name);

    // The name is a single normal component, but the entry itself may be a
    // symlink pointing outside the root.
    if let Ok(resolved) = candidate.canonicalize() {
        if !resolved.starts_with(&canonical_root) {
            return Err(PathError::OutsideRoot);
        }
    }

    Ok(candidate)
}
