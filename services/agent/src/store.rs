//! The agent's broadcastable file library.
//!
//! Only `.wav` files count; listing is sorted by name and removal accepts
//! a single sanitized filename or the literal `all`.

use std::path::Path;

use bw_protocol::FileInfo;
use chrono::{DateTime, Local};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Provided filename raised a security violation")]
    Security(#[from] bw_core::PathError),
    #[error("File not found")]
    NotFound,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub async fn list_files(dir: &Path) -> Result<Vec<FileInfo>, StoreError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.to_lowercase().ends_with(".wav") || !path.is_file() {
            continue;
        }
        let metadata = entry.metadata().await?;
        let modified = metadata
            .modified()
            .map(|mtime| DateTime::<Local>::from(mtime).to_rfc3339())
            .unwrap_or_default();
        files.push(FileInfo {
            name: name.to_owned(),
            size: metadata.len(),
            modified,
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Remove one file, or every `.wav` when `filename` is `all`.  Returns the
/// success message for the OK reply.
pub async fn remove_file(dir: &Path, filename: &str) -> Result<String, StoreError> {
    if filename.eq_ignore_ascii_case("all") {
        let mut removed = 0u32;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_wav = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_lowercase().ends_with(".wav"));
            if is_wav && path.is_file() {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        info!(removed, "library wiped");
        return Ok(format!("Removed {removed} files"));
    }

    let filename = bw_core::sanitize_filename(filename)?;
    let path = bw_core::safe_join(dir, &filename)?;
    if !path.exists() {
        return Err(StoreError::NotFound);
    }
    tokio::fs::remove_file(&path).await?;
    info!(filename = %filename, "removed");
    Ok(format!("Removed {filename}"))
}
