//! Fleet registry: live agent records, target-expression resolution, and
//! request/response correlation.
//!
//! At most one record exists per `agent_id`; a second successful handshake
//! for the same id evicts the first session before the new record is
//! installed.

use std::collections::HashMap;
use std::time::Duration;

use bw_protocol::{commands, FileInfo, Frame};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};
use uuid::Uuid;

use crate::state::AppState;

/// Commands the dispatcher sends to a session's socket task.
#[derive(Debug)]
pub enum SessionCommand {
    Send(Frame),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub hostname: String,
    pub machine: String,
    pub system: String,
    pub release: String,
}

impl MachineInfo {
    pub fn from_frame(frame: &Frame) -> Self {
        let get = |key: &str| frame.kwarg(key).unwrap_or("unknown").to_owned();
        MachineInfo {
            hostname: get("hostname"),
            machine: get("machine"),
            system: get("system"),
            release: get("release"),
        }
    }
}

/// One live, registered agent session.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    /// Distinguishes this session from a successor under the same id, so a
    /// stale session's cleanup never removes its evictor's record.
    pub session_serial: Uuid,
    pub machine: MachineInfo,
    pub protocol_version: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub authenticated: bool,
    pub tx: mpsc::Sender<SessionCommand>,
}

impl AgentRecord {
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.machine.hostname, self.agent_id)
    }
}

/// Keys of the pending-response map.  Only file lists are correlated today.
pub const PENDING_FILES: &str = "files";

pub type PendingKey = (String, &'static str);
pub type PendingSender = oneshot::Sender<Result<Vec<FileInfo>, String>>;
pub type PendingMap = HashMap<PendingKey, PendingSender>;

/// Hostname component of an `agent_id`.  Anything outside
/// `[A-Za-z0-9._-]` is flattened to `_` so the id stays a single clean
/// token on the wire.
pub fn sanitize_hostname(hostname: &str) -> String {
    let cleaned: String = hostname
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_owned()
    } else {
        cleaned
    }
}

/// Resolve an operator target expression to an ordered, deduplicated set of
/// live agent ids.
///
/// `all` selects every live agent.  Otherwise the expression is a
/// comma-separated token list; each token matches an exact `agent_id`
/// first, then the first record with that hostname.  Unknown tokens are
/// reported and skipped.
pub async fn resolve_targets(state: &AppState, expr: &str) -> Vec<String> {
    if expr.is_empty() {
        error!("no targets specified");
        return Vec::new();
    }

    let registry = state.registry.read().await;

    if expr.eq_ignore_ascii_case("all") {
        return registry.keys().cloned().collect();
    }

    let mut resolved = Vec::new();
    for token in expr.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let hit = if registry.contains_key(token) {
            Some(token.to_owned())
        } else {
            registry
                .values()
                .find(|record| record.machine.hostname == token)
                .map(|record| record.agent_id.clone())
        };
        match hit {
            Some(agent_id) if !resolved.contains(&agent_id) => resolved.push(agent_id),
            Some(_) => {}
            None => error!(target = %token, "client not found"),
        }
    }
    resolved
}

/// Send one frame to one agent.  Returns false when the agent is gone or
/// its outbound queue is closed.
pub async fn send_to(state: &AppState, agent_id: &str, frame: Frame) -> bool {
    let tx = {
        let registry = state.registry.read().await;
        match registry.get(agent_id) {
            Some(record) => record.tx.clone(),
            None => return false,
        }
    };
    tx.send(SessionCommand::Send(frame)).await.is_ok()
}

/// Ask one agent for its file list and await the correlated `OK files=…`
/// reply.
///
/// The pending entry is keyed `(agent_id, "files")`; the session dispatch
/// resolves it from the next matching OK/ERROR frame, and session cleanup
/// fails it with "disconnected".
pub async fn request_file_list(
    state: &AppState,
    agent_id: &str,
    timeout: Duration,
) -> Result<Vec<FileInfo>, String> {
    let (tx, rx) = oneshot::channel();
    {
        let mut pending = state.pending.lock().await;
        pending.insert((agent_id.to_owned(), PENDING_FILES), tx);
    }

    if !send_to(state, agent_id, Frame::new(commands::LIST_FILES)).await {
        let mut pending = state.pending.lock().await;
        pending.remove(&(agent_id.to_owned(), PENDING_FILES));
        return Err(format!("client {agent_id} not found"));
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("disconnected".to_owned()),
        Err(_) => {
            let mut pending = state.pending.lock().await;
            pending.remove(&(agent_id.to_owned(), PENDING_FILES));
            warn!(agent_id = %agent_id, "timeout waiting for file list");
            Err("timeout waiting for file list".to_owned())
        }
    }
}

/// Fail every pending correlation for one agent.  Called by session cleanup
/// and by KICK delivery.
pub async fn fail_pending_for(state: &AppState, agent_id: &str, reason: &str) {
    let mut pending = state.pending.lock().await;
    let keys: Vec<PendingKey> = pending
        .keys()
        .filter(|(id, _)| id == agent_id)
        .cloned()
        .collect();
    for key in keys {
        if let Some(tx) = pending.remove(&key) {
            let _ = tx.send(Err(reason.to_owned()));
        }
    }
}
