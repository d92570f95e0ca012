//! Control-plane session layer.
//!
//! One TLS WebSocket listener accepts agents; each connection walks
//! OPEN → REGISTERING → READY → CLOSING.  Unregistered connections may
//! only send REGISTER/AUTH/VER (REGISTER first); anything else is fatal
//! for that session.  Once READY, frames dispatch to the handler table and
//! the socket task also drains the session's outbound queue.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bw_protocol::{commands, parse_file_list, reply, versions_compatible, Frame, PROTOCOL_VERSION};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::queue::QueueEvent;
use crate::registry::{
    self, sanitize_hostname, AgentRecord, MachineInfo, SessionCommand, PENDING_FILES,
};
use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_TIMEOUT: Duration = Duration::from_secs(90);
const OUTBOUND_DEPTH: usize = 64;

pub fn router(state: AppState) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, peer))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> bool {
    match frame.encode() {
        Ok(line) => socket.send(Message::Text(line.into())).await.is_ok(),
        Err(e) => {
            error!(command = %frame.command, error = %e, "unencodable frame dropped");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Registration FSM
// ---------------------------------------------------------------------------

/// Handshake accumulator, discarded on transition to READY.
#[derive(Default)]
struct RegScratch {
    machine: Option<MachineInfo>,
    authenticated: bool,
    version: Option<String>,
}

impl RegScratch {
    fn complete(&self) -> bool {
        self.machine.is_some() && self.authenticated && self.version.is_some()
    }
}

/// Outcome of feeding one frame into the registration FSM.
enum RegStep {
    Continue,
    Complete,
    /// Send this frame, then close.  Registration failures are always
    /// fatal for the session.
    Fatal(Frame),
}

fn registration_step(state: &AppState, scratch: &mut RegScratch, frame: &Frame) -> RegStep {
    match frame.command.as_str() {
        commands::REGISTER => {
            scratch.machine = Some(MachineInfo::from_frame(frame));
            if state.cfg.passkey.is_none() {
                scratch.authenticated = true;
            }
        }
        _ if scratch.machine.is_none() => {
            // REGISTER must come first.
            return RegStep::Fatal(reply(
                commands::ERROR,
                format!("Expected REGISTER, AUTH, or VER, got {}", frame.command),
            ));
        }
        commands::AUTH => match &state.cfg.passkey {
            None => scratch.authenticated = true,
            Some(passkey) => match frame.args.first() {
                None => return RegStep::Fatal(reply(commands::AUTH_FAILED, "Missing passkey")),
                Some(candidate) if candidate != passkey => {
                    return RegStep::Fatal(reply(commands::AUTH_FAILED, "Invalid passkey"));
                }
                Some(_) => scratch.authenticated = true,
            },
        },
        commands::VER => match frame.args.first() {
            None => return RegStep::Fatal(reply(commands::ERROR, "Missing protocol version")),
            Some(client_version) => {
                if !versions_compatible(PROTOCOL_VERSION, client_version) {
                    return RegStep::Fatal(
                        Frame::new(commands::VERSION_MISMATCH)
                            .kw("server_version", PROTOCOL_VERSION)
                            .kw("client_version", client_version.as_str())
                            .kw("message", "Protocol version mismatch. Please update."),
                    );
                }
                scratch.version = Some(client_version.clone());
            }
        },
        other => {
            return RegStep::Fatal(reply(
                commands::ERROR,
                format!("Expected REGISTER, AUTH, or VER, got {other}"),
            ));
        }
    }

    if scratch.complete() {
        RegStep::Complete
    } else {
        RegStep::Continue
    }
}

/// Run the registration phase.  Returns the accumulated handshake on
/// success; on failure the error frame has been sent and the socket is due
/// to close.
async fn registration_phase(
    socket: &mut WebSocket,
    state: &AppState,
    peer: SocketAddr,
) -> Option<(MachineInfo, String)> {
    let mut scratch = RegScratch::default();
    loop {
        let message = match tokio::time::timeout(SESSION_TIMEOUT, socket.recv()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                warn!(peer = %peer, error = %e, "WS error during registration");
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                warn!(peer = %peer, "registration timed out");
                return None;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(data) => {
                let _ = socket.send(Message::Pong(data)).await;
                continue;
            }
            Message::Close(_) => return None,
            _ => continue,
        };

        let frame = match Frame::parse(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer, error = %e, "unparsable frame during registration");
                send_frame(socket, &reply(commands::ERROR, format!("Bad frame: {e}"))).await;
                return None;
            }
        };

        if frame.command == commands::REGISTER {
            if let Some(hostname) = frame.kwarg("hostname") {
                info!(hostname = %hostname, peer = %peer, "registration attempt");
            }
        }

        match registration_step(state, &mut scratch, &frame) {
            RegStep::Continue => {}
            RegStep::Complete => {
                let machine = scratch.machine.take()?;
                let version = scratch.version.take()?;
                return Some((machine, version));
            }
            RegStep::Fatal(response) => {
                send_frame(socket, &response).await;
                let _ = socket.send(Message::Close(None)).await;
                warn!(peer = %peer, command = %response.command, "registration rejected");
                return None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

async fn handle_connection(mut socket: WebSocket, state: AppState, peer: SocketAddr) {
    let Some((machine, version)) = registration_phase(&mut socket, &state, peer).await else {
        return;
    };

    let agent_id = format!("{}_{}", sanitize_hostname(&machine.hostname), peer.ip());
    let session_serial = Uuid::new_v4();
    let (tx, mut outbound) = mpsc::channel(OUTBOUND_DEPTH);

    let record = AgentRecord {
        agent_id: agent_id.clone(),
        session_serial,
        machine: machine.clone(),
        protocol_version: version.clone(),
        connected_at: Utc::now(),
        last_seen: Utc::now(),
        authenticated: true,
        tx,
    };
    let display_name = record.display_name();
    state.install_agent(record).await;

    let register_ok = Frame::new(commands::REGISTER_OK)
        .kw("client_id", agent_id.as_str())
        .kw("server_version", PROTOCOL_VERSION);
    if !send_frame(&mut socket, &register_ok).await {
        state.remove_agent(&agent_id, session_serial).await;
        return;
    }

    info!(client = %display_name, version = %version, "client registered");
    if version != PROTOCOL_VERSION {
        info!(client = %display_name, client_version = %version, "client runs an older protocol; some features may degrade");
    }
    state.handlers.run(&state, "s_onconnect").await;

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            inbound = tokio::time::timeout(SESSION_TIMEOUT, socket.recv()) => {
                match inbound {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        state.touch_agent(&agent_id).await;
                        dispatch_frame(&state, &agent_id, text.as_str(), &mut socket).await;
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        state.touch_agent(&agent_id).await;
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        warn!(client = %display_name, error = %e, "WS error");
                        break;
                    }
                    Err(_) => {
                        warn!(client = %display_name, "session timed out");
                        break;
                    }
                }
            }
            command = outbound.recv() => {
                match command {
                    Some(SessionCommand::Send(frame)) => {
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                    Some(SessionCommand::Close) | None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if !send_frame(&mut socket, &Frame::new(commands::PING)).await {
                    break;
                }
            }
        }
    }

    // An evicted session must not tear down its successor's state.
    if state.remove_agent(&agent_id, session_serial).await {
        warn!(client = %display_name, "client disconnected");
        registry::fail_pending_for(&state, &agent_id, "disconnected").await;
        state.handlers.run(&state, "s_ondisconnect").await;
    }
}

// ---------------------------------------------------------------------------
// READY-state dispatch
// ---------------------------------------------------------------------------

async fn dispatch_frame(state: &AppState, agent_id: &str, raw: &str, socket: &mut WebSocket) {
    let frame = match Frame::parse(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(agent_id = %agent_id, error = %e, "unparsable frame");
            send_frame(socket, &reply(commands::ERROR, format!("Bad frame: {e}"))).await;
            return;
        }
    };

    match frame.command.as_str() {
        commands::PONG => {}
        commands::PING => {
            send_frame(socket, &Frame::new(commands::PONG)).await;
        }
        commands::OK => handle_ok(state, agent_id, &frame).await,
        commands::ERROR => handle_peer_error(state, agent_id, &frame).await,
        commands::END => handle_end(state, agent_id, &frame).await,
        other => {
            warn!(agent_id = %agent_id, command = %other, "unexpected command");
            send_frame(
                socket,
                &reply(commands::ERROR, format!("Unexpected command: {other}")),
            )
            .await;
        }
    }
}

async fn handle_ok(state: &AppState, agent_id: &str, frame: &Frame) {
    if let Some(files_json) = frame.kwarg("files") {
        let key = (agent_id.to_owned(), PENDING_FILES);
        match parse_file_list(files_json) {
            Ok(files) => {
                let waiter = state.pending.lock().await.remove(&key);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(files));
                    }
                    None => {
                        for file in &files {
                            info!(agent_id = %agent_id, name = %file.name, size = file.size, "file");
                        }
                    }
                }
                return;
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "unparsable file list");
                if let Some(tx) = state.pending.lock().await.remove(&key) {
                    let _ = tx.send(Err(format!("unparsable file list: {e}")));
                }
                return;
            }
        }
    }

    let message = frame.kwarg("message").unwrap_or("OK");
    info!(agent_id = %agent_id, "{message}");
}

async fn handle_peer_error(state: &AppState, agent_id: &str, frame: &Frame) {
    let message = frame.kwarg("message").unwrap_or("Error");
    error!(agent_id = %agent_id, "{message}");

    let key = (agent_id.to_owned(), PENDING_FILES);
    if let Some(tx) = state.pending.lock().await.remove(&key) {
        let _ = tx.send(Err(message.to_owned()));
    }
}

async fn handle_end(state: &AppState, agent_id: &str, frame: &Frame) {
    let filename = frame.kwarg("filename").unwrap_or("unknown").to_owned();
    match frame.kwarg("message") {
        Some(message) => error!(agent_id = %agent_id, "{message}"),
        None => info!(agent_id = %agent_id, filename = %filename, "finished broadcasting"),
    }

    let _ = state
        .queue_tx
        .send(QueueEvent::Ended {
            agent_id: agent_id.to_owned(),
            filename,
        })
        .await;
}
