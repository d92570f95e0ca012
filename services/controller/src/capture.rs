//! Loopback PCM capture for live broadcasts.
//!
//! The capture itself is an external collaborator: `arecord` reads the
//! loopback card and this module bridges its stdout into a broadcast
//! channel.  Each live stream token subscribes independently; dropping the
//! sender ends every attached HTTP stream.

use std::process::Stdio;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 4096;
const CHANNEL_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture process could not be spawned: {0}")]
    Spawn(String),
}

pub struct CaptureHandle {
    pub rate: u32,
    pub channels: u8,
    tx: broadcast::Sender<Bytes>,
    child: Child,
    reader: JoinHandle<()>,
}

impl CaptureHandle {
    /// Spawn `arecord` on `device` and start pumping raw 16-bit PCM into
    /// the broadcast channel.
    pub fn start(device: &str, rate: u32, channels: u8) -> Result<CaptureHandle, CaptureError> {
        let mut child = Command::new("arecord")
            .args(["-D", device, "-f", "S16_LE", "-t", "raw"])
            .args(["-r", &rate.to_string(), "-c", &channels.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Spawn(e.to_string()))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Spawn("capture stdout unavailable".to_owned()))?;

        let (tx, _rx) = broadcast::channel(CHANNEL_DEPTH);
        let pump = tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        // send only fails with zero subscribers; keep
                        // pumping so late subscribers still attach.
                        let _ = pump.send(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => {
                        warn!(error = %e, "capture read failed");
                        break;
                    }
                }
            }
            debug!("capture pump ended");
        });

        info!(device = %device, rate, channels, "loopback capture started");
        Ok(CaptureHandle {
            rate,
            channels,
            tx,
            child,
            reader,
        })
    }

    /// A fresh subscriber for one stream token.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Kill the capture process and end every attached stream.
    pub async fn stop(mut self) {
        self.reader.abort();
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "capture process did not die cleanly");
        }
        info!("loopback capture stopped");
    }
}
