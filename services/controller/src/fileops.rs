//! File distribution operations: pushing library files to agents, URL
//! downloads, remote listing and removal.
//!
//! These are the minting side of the transfer service — size and extension
//! policy is enforced here, never at the HTTP endpoints.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bw_core::media;
use bw_protocol::{commands, Frame};
use tracing::{error, info, warn};

use crate::registry;
use crate::state::AppState;

pub const MAX_UPLOAD_SIZE: u64 = 500 * 1024 * 1024;

/// Directories operator-supplied upload sources may come from.
fn allowed_source_roots(state: &AppState) -> Vec<PathBuf> {
    let mut roots = vec![PathBuf::from("/tmp"), state.cfg.base_dir.clone()];
    if let Some(home) = dirs::home_dir() {
        roots.push(home);
    }
    roots
}

fn source_is_allowed(state: &AppState, path: &Path) -> bool {
    let Ok(resolved) = path.canonicalize() else {
        return false;
    };
    allowed_source_roots(state)
        .iter()
        .any(|root| match root.canonicalize() {
            Ok(root) => resolved.starts_with(root),
            Err(_) => false,
        })
}

/// Push one file (or a whole folder) to the targets.
///
/// Non-WAV sources in the supported set are converted first; each target
/// gets its own single-use download token.
pub async fn upload_file(state: &AppState, targets: &[String], filepath: &Path) -> bool {
    if targets.is_empty() {
        warn!("no client(s) found matching the query");
        return false;
    }
    if !source_is_allowed(state, filepath) {
        error!(path = %filepath.display(), "source path is outside the allowed directories");
        return false;
    }
    if filepath.is_dir() {
        return Box::pin(upload_folder(state, targets, filepath)).await;
    }

    let metadata = match tokio::fs::metadata(filepath).await {
        Ok(metadata) => metadata,
        Err(e) => {
            error!(path = %filepath.display(), error = %e, "file does not exist");
            return false;
        }
    };
    if metadata.len() > MAX_UPLOAD_SIZE {
        error!(size = metadata.len(), "file too large");
        return false;
    }

    let base_name = filepath
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let filename = match bw_core::sanitize_filename(base_name) {
        Ok(filename) => filename,
        Err(e) => {
            error!(error = %e, "invalid filename");
            return false;
        }
    };

    // Convert anything that is not already WAV.  The converted temp file is
    // deliberately persisted: outstanding download tokens reference it.
    let (send_path, send_name) = if media::extension_of(filepath) == "wav" {
        (filepath.to_path_buf(), filename)
    } else {
        let temp = match tempfile::Builder::new().suffix(".wav").tempfile() {
            Ok(temp) => temp,
            Err(e) => {
                error!(error = %e, "could not create conversion temp file");
                return false;
            }
        };
        let temp_path = match temp.into_temp_path().keep() {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "could not persist conversion temp file");
                return false;
            }
        };
        if let Err(e) = media::convert_to_wav(filepath, &temp_path).await {
            error!(error = %e, "conversion failed");
            let _ = tokio::fs::remove_file(&temp_path).await;
            return false;
        }
        let stem = Path::new(&filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("converted");
        (temp_path, format!("{stem}.wav"))
    };

    let size = tokio::fs::metadata(&send_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    let mut sent = 0;
    for agent_id in targets {
        let token = state.tokens.mint_download(send_path.clone()).await;
        let frame = Frame::new(commands::DOWNLOAD_TOKEN)
            .kw("token", token)
            .kw("filename", send_name.as_str())
            .kw("size", size);
        if registry::send_to(state, agent_id, frame).await {
            info!(agent_id = %agent_id, filename = %send_name, "download token sent");
            sent += 1;
        } else {
            error!(agent_id = %agent_id, "client not found");
        }
    }
    info!(sent, total = targets.len(), "upload tokens sent");
    sent > 0
}

/// Push every supported file in `folder` to the targets, pacing sends.
pub async fn upload_folder(state: &AppState, targets: &[String], folder: &Path) -> bool {
    let mut entries = match tokio::fs::read_dir(folder).await {
        Ok(entries) => entries,
        Err(e) => {
            error!(folder = %folder.display(), error = %e, "folder not found");
            return false;
        }
    };

    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        warn!(folder = %folder.display(), "no files found");
        return false;
    }

    info!(count = files.len(), folder = %folder.display(), "uploading folder contents");
    let mut succeeded = 0;
    let total = files.len();
    for (idx, path) in files.into_iter().enumerate() {
        if media::is_supported_source(&path) {
            info!(index = idx + 1, total, path = %path.display(), "processing");
            if Box::pin(upload_file(state, targets, &path)).await {
                succeeded += 1;
            }
        } else {
            warn!(path = %path.display(), "skipping unsupported file");
        }
        if idx + 1 < total {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
    info!(succeeded, total, "folder upload completed");
    succeeded > 0
}

/// Ask the targets to fetch a URL themselves.
pub async fn download_url(state: &AppState, targets: &[String], url: &str) -> bool {
    if targets.is_empty() {
        warn!("no client(s) found matching the query");
        return false;
    }
    let filename = url.rsplit('/').next().unwrap_or("download").to_owned();
    let frame = Frame::new(commands::DOWNLOAD_URL)
        .kw("url", url)
        .kw("filename", filename);
    for agent_id in targets {
        if registry::send_to(state, agent_id, frame.clone()).await {
            info!(agent_id = %agent_id, "download request sent");
        } else {
            error!(agent_id = %agent_id, "client not found");
        }
    }
    true
}

/// Remove a file (or `all`) from the targets' libraries.
pub async fn remove_file(state: &AppState, targets: &[String], filename: &str) -> bool {
    if targets.is_empty() {
        warn!("no client(s) found matching the query");
        return false;
    }
    info!(filename = %filename, targets = targets.len(), "removing from client(s)");
    let frame = Frame::new(commands::REMOVE_FILE).kw("filename", filename);
    for agent_id in targets {
        if registry::send_to(state, agent_id, frame.clone()).await {
            info!(agent_id = %agent_id, "remove request sent");
        } else {
            error!(agent_id = %agent_id, "client not found");
        }
    }
    true
}

/// Interactive file listing across the targets (10 s per agent).
pub async fn list_files(state: &AppState, targets: &[String]) -> bool {
    if targets.is_empty() {
        warn!("no client(s) found matching the query");
        return false;
    }
    info!(targets = targets.len(), "listing files");
    for agent_id in targets {
        match registry::request_file_list(state, agent_id, Duration::from_secs(10)).await {
            Ok(files) => {
                println!("{agent_id}: {} file(s)", files.len());
                for file in files {
                    println!("    {} ({})", file.name, format_size(file.size));
                }
            }
            Err(e) => error!(agent_id = %agent_id, error = %e, "file list failed"),
        }
    }
    true
}

fn format_size(size: u64) -> String {
    if size < 1024 {
        format!("{size} B")
    } else if size < 1024 * 1024 {
        format!("{:.1} KB", size as f64 / 1024.0)
    } else {
        format!("{:.1} MB", size as f64 / (1024.0 * 1024.0))
    }
}
