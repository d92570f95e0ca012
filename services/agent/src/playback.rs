//! Broadcast playback state machine.
//!
//! One broadcast at a time, guarded by the player lock; starting a new one
//! implicitly stops the previous.  Non-loop playbacks that finish on their
//! own emit `END filename=<f>` toward the controller.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bw_protocol::{commands, reply, Frame};
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::modulator::{BroadcastParams, Modulator, PlaybackOutcome, StopHandle};

struct Active {
    generation: u64,
    stop: StopHandle,
}

pub struct Player {
    modulator: Arc<dyn Modulator>,
    out_tx: mpsc::Sender<Frame>,
    inner: Mutex<Option<Active>>,
    generation: AtomicU64,
}

impl Player {
    pub fn new(modulator: Arc<dyn Modulator>, out_tx: mpsc::Sender<Frame>) -> Arc<Self> {
        Arc::new(Player {
            modulator,
            out_tx,
            inner: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// Handle a START frame.  Returns the immediate reply; delayed starts
    /// reply `OK "Scheduled in …"` now and report the launch later through
    /// the outbound channel.
    pub async fn handle_start(self: &Arc<Self>, upload_dir: &Path, frame: &Frame) -> Frame {
        let Some(filename) = frame.kwarg("filename").map(str::to_owned) else {
            return reply(commands::ERROR, "Missing filename");
        };

        let path = match resolve_library_path(upload_dir, &filename) {
            Ok(path) => path,
            Err(frame) => return frame,
        };

        if !path.exists() {
            return Frame::new(commands::END)
                .kw("filename", filename.as_str())
                .kw("message", format!("File not found: {filename}"));
        }

        let params = params_from_frame(frame);
        let start_at = frame
            .kwarg("start_at")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);

        if start_at > 0.0 {
            let now = Utc::now().timestamp() as f64;
            if start_at > now {
                let delay = start_at - now;
                info!(delay, filename = %filename, "scheduled start");
                let player = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                    let response = match player.start_file(&path, &filename, params).await {
                        Ok(()) => reply(commands::OK, "Broadcast started"),
                        Err(e) => reply(commands::ERROR, e),
                    };
                    let _ = player.out_tx.send(response).await;
                });
                return reply(commands::OK, format!("Scheduled in {delay:.2}s"));
            }
        }

        match self.start_file(&path, &filename, params).await {
            Ok(()) => reply(commands::OK, "Broadcast started"),
            Err(e) => reply(commands::ERROR, e),
        }
    }

    pub async fn start_file(
        self: &Arc<Self>,
        path: &Path,
        filename: &str,
        params: BroadcastParams,
    ) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.take() {
            active.stop.stop();
        }

        let handle = self
            .modulator
            .start_file(&params, path)
            .await
            .map_err(|e| e.to_string())?;
        let (stop, done) = handle.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *inner = Some(Active { generation, stop });
        drop(inner);

        info!(filename = %filename, freq = params.frequency, "broadcasting");
        self.spawn_monitor(generation, filename.to_owned(), params.loop_flag, done);
        Ok(())
    }

    pub async fn start_stream(
        self: &Arc<Self>,
        label: &str,
        params: BroadcastParams,
        rate: u32,
        channels: u8,
        pcm: mpsc::Receiver<Bytes>,
    ) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.take() {
            active.stop.stop();
        }

        let handle = self
            .modulator
            .start_stream(&params, rate, channels, pcm)
            .await
            .map_err(|e| e.to_string())?;
        let (stop, done) = handle.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *inner = Some(Active { generation, stop });
        drop(inner);

        info!(label = %label, rate, channels, freq = params.frequency, "broadcasting stream");
        // Streams never loop; their natural end is not a playlist END.
        self.spawn_monitor(generation, label.to_owned(), true, done);
        Ok(())
    }

    /// Stop the current broadcast.  Returns whether one was running.
    pub async fn stop(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.take() {
            Some(active) => {
                active.stop.stop();
                info!("broadcast stopped");
                true
            }
            None => false,
        }
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        generation: u64,
        filename: String,
        suppress_end: bool,
        done: oneshot::Receiver<PlaybackOutcome>,
    ) {
        let player = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = done.await.unwrap_or(PlaybackOutcome::Stopped);

            let was_current = {
                let mut inner = player.inner.lock().await;
                match inner.as_ref() {
                    Some(active) if active.generation == generation => {
                        *inner = None;
                        true
                    }
                    _ => false,
                }
            };

            match outcome {
                PlaybackOutcome::Completed if was_current && !suppress_end => {
                    info!(filename = %filename, "playback finished");
                    let end = Frame::new(commands::END).kw("filename", filename.as_str());
                    let _ = player.out_tx.send(end).await;
                }
                PlaybackOutcome::Failed(e) => {
                    warn!(filename = %filename, error = %e, "playback failed");
                }
                _ => {}
            }
        });
    }
}

pub fn params_from_frame(frame: &Frame) -> BroadcastParams {
    BroadcastParams {
        frequency: frame
            .kwarg("freq")
            .or_else(|| frame.kwarg("frequency"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(90.0),
        ps: frame.kwarg("ps").unwrap_or("BotWave").to_owned(),
        rt: frame.kwarg("rt").unwrap_or("Broadcasting").to_owned(),
        pi: frame.kwarg("pi").unwrap_or("FFFF").to_owned(),
        loop_flag: frame
            .kwarg("loop")
            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
    }
}

/// Sanitize + join a peer-supplied filename against the library root.
pub fn resolve_library_path(upload_dir: &Path, filename: &str) -> Result<PathBuf, Frame> {
    let sanitized = bw_core::sanitize_filename(filename)
        .map_err(|_| reply(commands::ERROR, "Provided filename raised a security violation"))?;
    bw_core::safe_join(upload_dir, &sanitized)
        .map_err(|_| reply(commands::ERROR, "Provided filename raised a security violation"))
}
