//! FM modulator seam.
//!
//! The control plane only ever calls `start_*`/stop on this trait; the
//! production implementation drives an external transmitter process, and
//! tests inject a recording fake.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastParams {
    pub frequency: f64,
    pub ps: String,
    pub rt: String,
    pub pi: String,
    pub loop_flag: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ModulatorError {
    #[error("transmitter could not be spawned: {0}")]
    Spawn(String),
    #[error("transmitter I/O failed: {0}")]
    Io(String),
}

/// How a playback ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The source ran out on its own.
    Completed,
    /// `stop()` was called.
    Stopped,
    Failed(String),
}

/// Commands a running playback to stop.
pub struct StopHandle {
    tx: oneshot::Sender<()>,
}

impl StopHandle {
    pub fn stop(self) {
        let _ = self.tx.send(());
    }
}

/// A started playback: a stop side and a completion side.
pub struct PlaybackHandle {
    stop: StopHandle,
    done: oneshot::Receiver<PlaybackOutcome>,
}

impl PlaybackHandle {
    pub fn split(self) -> (StopHandle, oneshot::Receiver<PlaybackOutcome>) {
        (self.stop, self.done)
    }
}

#[async_trait]
pub trait Modulator: Send + Sync {
    /// Start transmitting a WAV file.
    async fn start_file(
        &self,
        params: &BroadcastParams,
        wav_path: &Path,
    ) -> Result<PlaybackHandle, ModulatorError>;

    /// Start transmitting raw PCM fed through a channel.
    async fn start_stream(
        &self,
        params: &BroadcastParams,
        rate: u32,
        channels: u8,
        pcm: mpsc::Receiver<Bytes>,
    ) -> Result<PlaybackHandle, ModulatorError>;
}

// ---------------------------------------------------------------------------
// Subprocess-backed implementation
// ---------------------------------------------------------------------------

/// Drives a transmitter binary.  File playback passes the WAV path; stream
/// playback pipes PCM into its stdin.
pub struct CommandModulator {
    program: String,
    verbose: bool,
}

impl CommandModulator {
    pub fn new(program: String, verbose: bool) -> Arc<Self> {
        Arc::new(CommandModulator { program, verbose })
    }

    fn base_command(&self, params: &BroadcastParams) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--freq")
            .arg(params.frequency.to_string())
            .arg("--ps")
            .arg(&params.ps)
            .arg("--rt")
            .arg(&params.rt)
            .arg("--pi")
            .arg(&params.pi);
        if params.loop_flag {
            command.arg("--loop");
        }
        command.stdin(Stdio::null());
        if self.verbose {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        command.kill_on_drop(true);
        command
    }
}

/// Watch the child until it exits or a stop arrives.
fn supervise(mut child: Child, done_tx: oneshot::Sender<PlaybackOutcome>) -> StopHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let outcome = match status {
                    Ok(status) if status.success() => PlaybackOutcome::Completed,
                    Ok(status) => PlaybackOutcome::Failed(format!("transmitter exited with {status}")),
                    Err(e) => PlaybackOutcome::Failed(e.to_string()),
                };
                let _ = done_tx.send(outcome);
            }
            _ = stop_rx => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "transmitter did not die cleanly");
                }
                let _ = done_tx.send(PlaybackOutcome::Stopped);
            }
        }
    });
    StopHandle { tx: stop_tx }
}

#[async_trait]
impl Modulator for CommandModulator {
    async fn start_file(
        &self,
        params: &BroadcastParams,
        wav_path: &Path,
    ) -> Result<PlaybackHandle, ModulatorError> {
        debug!(path = %wav_path.display(), freq = params.frequency, "starting file playback");
        let child = self
            .base_command(params)
            .arg(wav_path)
            .spawn()
            .map_err(|e| ModulatorError::Spawn(e.to_string()))?;

        let (done_tx, done) = oneshot::channel();
        let stop = supervise(child, done_tx);
        Ok(PlaybackHandle { stop, done })
    }

    async fn start_stream(
        &self,
        params: &BroadcastParams,
        rate: u32,
        channels: u8,
        mut pcm: mpsc::Receiver<Bytes>,
    ) -> Result<PlaybackHandle, ModulatorError> {
        debug!(rate, channels, freq = params.frequency, "starting stream playback");
        let mut child = self
            .base_command(params)
            .arg("--rate")
            .arg(rate.to_string())
            .arg("--channels")
            .arg(channels.to_string())
            .arg("-")
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| ModulatorError::Spawn(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ModulatorError::Io("transmitter stdin unavailable".to_owned()))?;

        // Feed PCM until the channel closes; closing stdin lets the
        // transmitter drain and exit, which surfaces as Completed.
        tokio::spawn(async move {
            while let Some(chunk) = pcm.recv().await {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });

        let (done_tx, done) = oneshot::channel();
        let stop = supervise(child, done_tx);
        Ok(PlaybackHandle { stop, done })
    }
}

// ---------------------------------------------------------------------------
// Hand-assembled handles (for fakes and tests)
// ---------------------------------------------------------------------------

impl PlaybackHandle {
    /// Build a handle from raw channel ends, for Modulator fakes that have
    /// no subprocess to supervise.
    pub fn from_parts(
        stop_tx: oneshot::Sender<()>,
        done: oneshot::Receiver<PlaybackOutcome>,
    ) -> Self {
        PlaybackHandle {
            stop: StopHandle { tx: stop_tx },
            done,
        }
    }
}
