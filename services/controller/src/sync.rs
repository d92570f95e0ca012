//! Three-mode file synchronization engine.
//!
//! Mode is chosen by which operands end in `/`:
//!
//! - `sync /dir/ <agent>`   — agent → local directory
//! - `sync <agents> /dir/`  — local directory → agents
//! - `sync <agents> <agent>` — agent → agents (via a temp directory)
//!
//! Files land under hidden `.sync_temp_…` names and are renamed onto their
//! final names only once their size has been stable across three 500 ms
//! samples and the file opens; a failure leaves the final path untouched.

use std::path::Path;
use std::time::Duration;

use bw_protocol::{commands, Frame};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::fileops;
use crate::registry;
use crate::state::AppState;

const FILE_LIST_TIMEOUT: Duration = Duration::from_secs(30);
const PER_FILE_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const STABLE_SAMPLES: u32 = 3;
const RENAME_RETRIES: u32 = 3;

pub async fn sync_files(state: &AppState, target_expr: &str, source_expr: &str) -> bool {
    warn!("sync is in beta and may be unstable");
    let target_is_dir = target_expr.ends_with('/');
    let source_is_dir = source_expr.ends_with('/');

    match (target_is_dir, source_is_dir) {
        (true, false) => {
            let dir = Path::new(target_expr.trim_end_matches('/'));
            sync_agent_to_dir(state, source_expr, dir).await
        }
        (false, true) => {
            let dir = Path::new(source_expr.trim_end_matches('/'));
            sync_dir_to_agents(state, dir, target_expr).await
        }
        (false, false) => sync_agent_to_agents(state, target_expr, source_expr).await,
        (true, true) => {
            error!("at least one side of a sync must be a client");
            false
        }
    }
}

/// Resolve a source expression that must name exactly one agent.
async fn resolve_single_source(state: &AppState, source_expr: &str) -> Option<String> {
    let sources = registry::resolve_targets(state, source_expr).await;
    if sources.len() != 1 {
        error!(source = %source_expr, "source must resolve to exactly one client");
        return None;
    }
    sources.into_iter().next()
}

/// Mode 1: pull every file from one agent into a local directory.
async fn sync_agent_to_dir(state: &AppState, source_expr: &str, dir: &Path) -> bool {
    if !dir.is_dir() {
        error!(dir = %dir.display(), "directory does not exist");
        return false;
    }
    let Some(source_id) = resolve_single_source(state, source_expr).await else {
        return false;
    };

    info!(source = %source_id, dir = %dir.display(), "syncing from client to local folder");
    let files = match registry::request_file_list(state, &source_id, FILE_LIST_TIMEOUT).await {
        Ok(files) => files,
        Err(e) => {
            error!(error = %e, "could not get file list from client");
            return false;
        }
    };
    if files.is_empty() {
        warn!(source = %source_id, "client has no files");
        return true;
    }

    info!(count = files.len(), "files to sync");
    let mut succeeded = 0;
    let total = files.len();
    for file in files {
        match pull_one_file(state, &source_id, dir, &file.name).await {
            Ok(size) => {
                info!(filename = %file.name, size, "synced");
                succeeded += 1;
            }
            Err(e) => error!(filename = %file.name, error = %e, "sync failed"),
        }
    }

    if succeeded > 0 {
        info!(succeeded, total, "sync completed");
        true
    } else {
        error!("sync failed: no files transferred");
        false
    }
}

/// Pull one file from `source_id` into `dir` through a hidden temp name,
/// renaming onto the final name only once the upload has settled.
async fn pull_one_file(
    state: &AppState,
    source_id: &str,
    dir: &Path,
    name: &str,
) -> Result<u64, String> {
    let filename = bw_core::sanitize_filename(name).map_err(|e| e.to_string())?;

    let unique = Uuid::new_v4().simple().to_string();
    let suffix = &unique[..8];
    let temp_name = format!(".sync_temp_{source_id}_{suffix}_{filename}");
    let temp_path = bw_core::safe_join(dir, &temp_name).map_err(|e| e.to_string())?;
    let final_path = bw_core::safe_join(dir, &filename).map_err(|e| e.to_string())?;

    // Advertised size 0: the uploading agent streams the real body and the
    // endpoint treats 0 as "unknown".
    let token = state
        .tokens
        .mint_upload(dir.to_path_buf(), temp_name.clone(), 0)
        .await;
    let frame = Frame::new(commands::UPLOAD_TOKEN)
        .kw("token", token)
        .kw("filename", filename.as_str())
        .kw("size", 0);
    if !registry::send_to(state, source_id, frame).await {
        return Err("source client disconnected".to_owned());
    }

    if !wait_for_file_complete(&temp_path, PER_FILE_TIMEOUT).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err("file never settled".to_owned());
    }

    rename_with_retries(&temp_path, &final_path)
        .await
        .map_err(|e| e.to_string())?;

    tokio::fs::metadata(&final_path)
        .await
        .map(|m| m.len())
        .map_err(|e| e.to_string())
}

/// Mode 2: wipe each target's library, then push every supported file in a
/// local directory.
async fn sync_dir_to_agents(state: &AppState, dir: &Path, target_expr: &str) -> bool {
    if !dir.is_dir() {
        error!(dir = %dir.display(), "source folder not found");
        return false;
    }
    let targets = registry::resolve_targets(state, target_expr).await;
    if targets.is_empty() {
        warn!("no client(s) found matching the query");
        return false;
    }

    info!(dir = %dir.display(), targets = targets.len(), "syncing from local folder");
    info!("clearing existing files on targets");
    fileops::remove_file(state, &targets, "all").await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let success = fileops::upload_folder(state, &targets, dir).await;
    if success {
        info!("sync completed successfully");
    } else {
        error!("sync completed with errors");
    }
    success
}

/// Mode 3: agent → agents through a temporary directory.
async fn sync_agent_to_agents(state: &AppState, target_expr: &str, source_expr: &str) -> bool {
    let Some(source_id) = resolve_single_source(state, source_expr).await else {
        return false;
    };
    let mut targets = registry::resolve_targets(state, target_expr).await;
    targets.retain(|t| t != &source_id);
    if targets.is_empty() {
        warn!("no target clients (source was the only target)");
        return false;
    }

    // Removed on drop, on success and failure alike.
    let temp_dir = match tempfile::Builder::new().prefix("botwave_sync_").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "could not create sync temp directory");
            return false;
        }
    };

    info!(source = %source_id, targets = targets.len(), "syncing between clients");
    if !sync_agent_to_dir(state, source_expr, temp_dir.path()).await {
        error!("failed to download any files from source");
        return false;
    }

    info!("clearing files on target clients");
    fileops::remove_file(state, &targets, "all").await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    info!("uploading files to target clients");
    let success = fileops::upload_folder(state, &targets, temp_dir.path()).await;

    // Give the agents time to pull their download tokens before the temp
    // directory goes away.
    tokio::time::sleep(Duration::from_secs(2)).await;

    if success {
        info!("sync completed successfully");
    } else {
        error!("sync completed with errors");
    }
    success
}

/// Wait until `path` exists, opens, and its size has been stable across
/// three consecutive 500 ms samples.
pub async fn wait_for_file_complete(path: &Path, timeout: Duration) -> bool {
    let mut last_size: Option<u64> = None;
    let mut stable = 0u32;
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if let Ok(metadata) = tokio::fs::metadata(path).await {
            let openable = tokio::fs::File::open(path).await.is_ok();
            if openable {
                let size = metadata.len();
                if last_size == Some(size) {
                    stable += 1;
                } else {
                    stable = 0;
                    last_size = Some(size);
                }
                if stable >= STABLE_SAMPLES {
                    return true;
                }
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    false
}

/// Replace `final_path` with `temp_path`, retrying a handful of times in
/// case the destination is briefly locked.
async fn rename_with_retries(temp_path: &Path, final_path: &Path) -> std::io::Result<()> {
    let mut attempt = 0;
    loop {
        let result = tokio::fs::rename(temp_path, final_path).await;
        match result {
            Ok(()) => return Ok(()),
            Err(e) if attempt < RENAME_RETRIES => {
                attempt += 1;
                warn!(error = %e, attempt, "rename conflict, retrying");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(temp_path).await;
                return Err(e);
            }
        }
    }
}
