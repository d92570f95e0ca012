//! Registered-session dispatch loop.
//!
//! Frames from the controller are handled in receipt order; transfers and
//! other long work run in spawned tasks and report back through the
//! outbound channel so the reader never blocks.

use std::sync::Arc;

use bw_protocol::{commands, encode_file_list, reply, Frame};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::playback::{params_from_frame, resolve_library_path, Player};
use crate::store;
use crate::transfer_client::TransferClient;
use crate::uplink::{self, UplinkError, WsStream};

const PCM_BUFFER_CHUNKS: usize = 64;

#[derive(Clone)]
pub struct AgentState {
    pub cfg: Arc<AgentConfig>,
    pub transfer: Arc<TransferClient>,
    pub player: Arc<Player>,
    pub out_tx: mpsc::Sender<Frame>,
}

/// Why a session ended cleanly.
#[derive(Debug)]
pub enum SessionEnd {
    Disconnected,
    Kicked(String),
}

pub async fn run_session(
    mut ws: WsStream,
    state: AgentState,
    mut out_rx: mpsc::Receiver<Frame>,
) -> Result<SessionEnd, UplinkError> {
    loop {
        tokio::select! {
            message = ws.next() => {
                match message {
                    None => return Ok(SessionEnd::Disconnected),
                    Some(Err(e)) => return Err(UplinkError::Ws(e.to_string())),
                    Some(Ok(Message::Text(text))) => {
                        let frame = match Frame::parse(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "unparsable frame from server");
                                let _ = state.out_tx.send(reply(commands::ERROR, format!("Bad frame: {e}"))).await;
                                continue;
                            }
                        };
                        if let Some(end) = handle_frame(&state, frame).await {
                            return Ok(end);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Disconnected),
                    Some(Ok(_)) => {}
                }
            }
            frame = out_rx.recv() => {
                if let Some(frame) = frame {
                    uplink::send_frame(&mut ws, &frame).await?;
                }
            }
        }
    }
}

/// Dispatch one frame.  Returns Some when the session should end.
async fn handle_frame(state: &AgentState, frame: Frame) -> Option<SessionEnd> {
    match frame.command.as_str() {
        commands::PING => {
            let _ = state.out_tx.send(Frame::new(commands::PONG)).await;
        }
        commands::START => {
            let response = state
                .player
                .handle_start(&state.cfg.upload_dir, &frame)
                .await;
            let _ = state.out_tx.send(response).await;
        }
        commands::STOP => {
            let response = if state.player.stop().await {
                reply(commands::OK, "Broadcast stopped")
            } else {
                reply(commands::ERROR, "No broadcast running")
            };
            let _ = state.out_tx.send(response).await;
        }
        commands::STREAM_TOKEN => {
            let state = state.clone();
            tokio::spawn(async move { handle_stream_token(&state, frame).await });
        }
        commands::UPLOAD_TOKEN => {
            let state = state.clone();
            tokio::spawn(async move { handle_upload_token(&state, frame).await });
        }
        commands::DOWNLOAD_TOKEN => {
            let state = state.clone();
            tokio::spawn(async move { handle_download_token(&state, frame).await });
        }
        commands::DOWNLOAD_URL => {
            let state = state.clone();
            tokio::spawn(async move { handle_download_url(&state, frame).await });
        }
        commands::LIST_FILES => {
            let response = handle_list_files(state).await;
            let _ = state.out_tx.send(response).await;
        }
        commands::REMOVE_FILE => {
            let response = handle_remove_file(state, &frame).await;
            let _ = state.out_tx.send(response).await;
        }
        commands::KICK => {
            let reason = frame
                .kwarg("reason")
                .unwrap_or("Kicked by administrator")
                .to_owned();
            warn!(reason = %reason, "kicked by server");
            return Some(SessionEnd::Kicked(reason));
        }
        other => {
            warn!(command = %other, "unknown command");
            let _ = state
                .out_tx
                .send(reply(
                    commands::ERROR,
                    format!("Unknown command: {other}. Perhaps a protocol mismatch ?"),
                ))
                .await;
        }
    }
    None
}

async fn handle_stream_token(state: &AgentState, frame: Frame) {
    let Some(token) = frame.kwarg("token").map(str::to_owned) else {
        let _ = state.out_tx.send(reply(commands::ERROR, "Missing token")).await;
        return;
    };
    let rate = frame
        .kwarg("rate")
        .and_then(|v| v.parse().ok())
        .unwrap_or(48_000);
    let channels = frame
        .kwarg("channels")
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    let params = params_from_frame(&frame);

    info!(rate, channels, "received stream token");

    let response = match state.transfer.open_stream(&token).await {
        Ok(http_response) => {
            // Bounded buffer between the HTTP chunk reader and the
            // modulator pull side.
            let (pcm_tx, pcm_rx) = mpsc::channel::<Bytes>(PCM_BUFFER_CHUNKS);
            tokio::spawn(async move {
                let mut chunks = http_response.bytes_stream();
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(chunk) => {
                            if pcm_tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "stream read failed");
                            break;
                        }
                    }
                }
            });

            let label: String = format!("stream:{}", token.chars().take(8).collect::<String>());
            match state
                .player
                .start_stream(&label, params, rate, channels, pcm_rx)
                .await
            {
                Ok(()) => reply(commands::OK, "Stream broadcast started"),
                Err(e) => reply(commands::ERROR, e),
            }
        }
        Err(e) => reply(commands::ERROR, format!("Stream error: {e}")),
    };
    let _ = state.out_tx.send(response).await;
}

async fn handle_upload_token(state: &AgentState, frame: Frame) {
    let (Some(token), Some(filename)) = (frame.kwarg("token"), frame.kwarg("filename")) else {
        let _ = state
            .out_tx
            .send(reply(commands::ERROR, "Missing token or filename"))
            .await;
        return;
    };

    let path = match resolve_library_path(&state.cfg.upload_dir, filename) {
        Ok(path) => path,
        Err(error_frame) => {
            let _ = state.out_tx.send(error_frame).await;
            return;
        }
    };

    info!(filename = %filename, "received upload token");
    let response = match state.transfer.upload(token, &path).await {
        Ok(()) => reply(commands::OK, format!("Uploaded {filename}")),
        Err(e) => {
            warn!(filename = %filename, error = %e, "upload failed");
            reply(commands::ERROR, "Upload failed")
        }
    };
    let _ = state.out_tx.send(response).await;
}

async fn handle_download_token(state: &AgentState, frame: Frame) {
    let (Some(token), Some(filename)) = (frame.kwarg("token"), frame.kwarg("filename")) else {
        let _ = state
            .out_tx
            .send(reply(commands::ERROR, "Missing token or filename"))
            .await;
        return;
    };

    let path = match resolve_library_path(&state.cfg.upload_dir, filename) {
        Ok(path) => path,
        Err(error_frame) => {
            let _ = state.out_tx.send(error_frame).await;
            return;
        }
    };

    info!(filename = %filename, "received download token");
    let response = match state.transfer.download(token, &path).await {
        Ok(size) => {
            info!(filename = %filename, size, "download completed");
            reply(commands::OK, format!("Downloaded {filename}"))
        }
        Err(e) => {
            warn!(filename = %filename, error = %e, "download failed");
            reply(commands::ERROR, "Download failed")
        }
    };
    let _ = state.out_tx.send(response).await;
}

async fn handle_download_url(state: &AgentState, frame: Frame) {
    let (Some(url), Some(filename)) = (
        frame.kwarg("url").map(str::to_owned),
        frame.kwarg("filename").map(str::to_owned),
    ) else {
        let _ = state
            .out_tx
            .send(reply(commands::ERROR, "Missing URL or filename"))
            .await;
        return;
    };

    let response = match fetch_and_convert(state, &url, &filename).await {
        Ok((name, converted)) => reply(
            commands::OK,
            format!(
                "Downloaded {name}{}",
                if converted { " (converted)" } else { "" }
            ),
        ),
        Err(message) => reply(commands::ERROR, message),
    };
    let _ = state.out_tx.send(response).await;
}

/// Fetch `url` into the library, converting non-WAV supported formats.
/// Returns the stored name and whether a conversion happened.
async fn fetch_and_convert(
    state: &AgentState,
    url: &str,
    filename: &str,
) -> Result<(String, bool), String> {
    let path = resolve_library_path(&state.cfg.upload_dir, filename)
        .map_err(|f| f.kwarg("message").unwrap_or("Invalid filename").to_owned())?;
    let ext = bw_core::media::extension_of(&path);

    info!(url = %url, "downloading from URL");

    if ext == "wav" {
        state
            .transfer
            .fetch_url(url, &path)
            .await
            .map_err(|e| format!("Network error: {e}"))?;
        return Ok((filename.to_owned(), false));
    }

    if !bw_core::SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(format!("Unsupported file type from URL: .{ext}"));
    }

    let temp = tempfile::Builder::new()
        .suffix(&format!(".{ext}"))
        .tempfile()
        .map_err(|e| format!("Error: {e}"))?;
    state
        .transfer
        .fetch_url(url, temp.path())
        .await
        .map_err(|e| format!("Network error: {e}"))?;

    let wav_name = format!(
        "{}.wav",
        std::path::Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("download")
    );
    let wav_path = resolve_library_path(&state.cfg.upload_dir, &wav_name)
        .map_err(|f| f.kwarg("message").unwrap_or("Invalid filename").to_owned())?;
    bw_core::convert_to_wav(temp.path(), &wav_path)
        .await
        .map_err(|e| format!("Error: {e}"))?;

    Ok((wav_name, true))
}

async fn handle_list_files(state: &AgentState) -> Frame {
    match store::list_files(&state.cfg.upload_dir).await {
        Ok(files) => match encode_file_list(&files) {
            Ok(json) => {
                info!(count = files.len(), "listed files");
                Frame::new(commands::OK)
                    .kw("message", format!("Found {} files", files.len()))
                    .kw("files", json)
            }
            Err(e) => reply(commands::ERROR, e.to_string()),
        },
        Err(e) => reply(commands::ERROR, e.to_string()),
    }
}

async fn handle_remove_file(state: &AgentState, frame: &Frame) -> Frame {
    let Some(filename) = frame.kwarg("filename") else {
        return reply(commands::ERROR, "Missing filename");
    };
    match store::remove_file(&state.cfg.upload_dir, filename).await {
        Ok(message) => reply(commands::OK, message),
        Err(e) => reply(commands::ERROR, e.to_string()),
    }
}
