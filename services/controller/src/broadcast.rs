//! Broadcast coordinator: fan-out of START/STOP, delayed-start scheduling,
//! and live-stream token distribution.

use bw_protocol::{commands, Frame};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::capture::CaptureHandle;
use crate::registry::{self, SessionCommand};
use crate::state::AppState;

/// Seconds of preparation granted per extra target when `wait_start` is on.
const STAGGER_SECS: i64 = 20;

/// Fan a START frame out to every resolved target.
///
/// With `wait_start` and more than one target, every agent receives the
/// same `start_at = now + 20·(N−1)` so the fleet launches together;
/// otherwise `start_at = 0` means as-soon-as-possible.  Returns the agents
/// the command reached.
#[allow(clippy::too_many_arguments)]
pub async fn start_broadcast(
    state: &AppState,
    targets_expr: &str,
    filename: &str,
    frequency: f64,
    ps: &str,
    rt: &str,
    pi: &str,
    loop_flag: bool,
    trigger_manual: bool,
) -> Vec<String> {
    let targets = registry::resolve_targets(state, targets_expr).await;
    if targets.is_empty() {
        warn!("no client(s) found matching the query");
        return Vec::new();
    }

    if trigger_manual {
        state.queue.lock().await.manual_pause();
    }

    let start_at = if state.cfg.wait_start && targets.len() > 1 {
        let at = Utc::now().timestamp() + STAGGER_SECS * (targets.len() as i64 - 1);
        info!(start_at = at, "starting broadcast at shared fleet timestamp");
        at
    } else {
        info!("starting broadcast ASAP");
        0
    };

    let frame = Frame::new(commands::START)
        .kw("filename", filename)
        .kw("freq", frequency)
        .kw("ps", ps)
        .kw("rt", rt)
        .kw("pi", pi)
        .kw("loop", if loop_flag { "true" } else { "false" })
        .kw("start_at", start_at);

    let mut reached = Vec::new();
    for agent_id in &targets {
        if registry::send_to(state, agent_id, frame.clone()).await {
            info!(agent_id = %agent_id, "START command sent");
            reached.push(agent_id.clone());
        } else {
            error!(agent_id = %agent_id, "client not found");
        }
    }
    info!(
        sent = reached.len(),
        total = targets.len(),
        "broadcast start commands sent"
    );

    state.handlers.run(state, "s_onstart").await;
    reached
}

/// Unconditional stop fan-out.  Also tears down any live capture and pauses
/// the queue (stop is always a manual action).
pub async fn stop_broadcast(state: &AppState, targets_expr: &str) -> bool {
    if let Some(capture) = state.capture.lock().await.take() {
        capture.stop().await;
    }
    state.queue.lock().await.manual_pause();

    let targets = registry::resolve_targets(state, targets_expr).await;
    if targets.is_empty() {
        warn!("no client(s) found matching the query");
        return false;
    }

    let frame = Frame::new(commands::STOP);
    let mut sent = 0;
    for agent_id in &targets {
        if registry::send_to(state, agent_id, frame.clone()).await {
            info!(agent_id = %agent_id, "STOP command sent");
            sent += 1;
        }
    }
    info!(sent, total = targets.len(), "broadcast stop commands sent");

    state.handlers.run(state, "s_onstop").await;
    sent > 0
}

/// Live streaming: start the loopback capture and hand every target its
/// own single-use stream token.
pub async fn start_live(
    state: &AppState,
    targets_expr: &str,
    frequency: f64,
    ps: &str,
    rt: &str,
    pi: &str,
) -> bool {
    let targets = registry::resolve_targets(state, targets_expr).await;
    if targets.is_empty() {
        warn!("no client(s) found matching the query");
        return false;
    }

    state.queue.lock().await.manual_pause();

    {
        let mut capture_slot = state.capture.lock().await;
        if capture_slot.is_none() {
            match CaptureHandle::start(
                &state.cfg.capture_device,
                state.cfg.capture_rate,
                state.cfg.capture_channels,
            ) {
                Ok(capture) => *capture_slot = Some(capture),
                Err(e) => {
                    error!(error = %e, "live broadcast is not supported on this installation");
                    return false;
                }
            }
        }
    }

    info!(targets = targets.len(), "sending stream tokens");
    let mut sent = 0;
    for agent_id in &targets {
        let (token, rate, channels) = {
            let capture_slot = state.capture.lock().await;
            let Some(capture) = capture_slot.as_ref() else {
                break;
            };
            (
                state
                    .tokens
                    .mint_stream(capture.subscribe(), capture.rate, capture.channels)
                    .await,
                capture.rate,
                capture.channels,
            )
        };

        let frame = Frame::new(commands::STREAM_TOKEN)
            .kw("token", token)
            .kw("rate", rate)
            .kw("channels", channels)
            .kw("frequency", frequency)
            .kw("ps", ps)
            .kw("rt", rt)
            .kw("pi", pi);
        if registry::send_to(state, agent_id, frame).await {
            info!(agent_id = %agent_id, "stream token sent");
            sent += 1;
        } else {
            error!(agent_id = %agent_id, "client not found");
        }
    }
    info!(sent, total = targets.len(), "stream tokens sent");
    sent > 0
}

/// Kick the resolved targets: deliver KICK, close their sessions, evict
/// their records, and fail their pending correlations.
pub async fn kick(state: &AppState, targets_expr: &str, reason: &str) -> bool {
    let targets = registry::resolve_targets(state, targets_expr).await;
    if targets.is_empty() {
        warn!("no client(s) found matching the query");
        return false;
    }

    info!(targets = targets.len(), reason = %reason, "kicking client(s)");
    for agent_id in &targets {
        let record = {
            let mut registry = state.registry.write().await;
            registry.remove(agent_id)
        };
        let Some(record) = record else { continue };
        let frame = Frame::new(commands::KICK).kw("reason", reason);
        let _ = record.tx.send(SessionCommand::Send(frame)).await;
        let _ = record.tx.send(SessionCommand::Close).await;
        registry::fail_pending_for(state, agent_id, "disconnected").await;
        info!(agent_id = %agent_id, "kicked");
    }
    true
}
