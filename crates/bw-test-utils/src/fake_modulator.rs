//! A recording fake for the agent's modulator seam.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agent::modulator::{
    BroadcastParams, Modulator, ModulatorError, PlaybackHandle, PlaybackOutcome,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

pub enum StartSource {
    File(PathBuf),
    Stream {
        rate: u32,
        channels: u8,
        pcm: mpsc::Receiver<Bytes>,
    },
}

pub struct StartRecord {
    pub params: BroadcastParams,
    pub source: StartSource,
}

/// Records every start and lets tests decide how each playback ends.
#[derive(Default)]
pub struct FakeModulator {
    starts: Mutex<Vec<StartRecord>>,
    done_txs: Mutex<Vec<oneshot::Sender<PlaybackOutcome>>>,
}

impl FakeModulator {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeModulator::default())
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().expect("lock").len()
    }

    /// Take the recorded starts accumulated so far.
    pub fn take_starts(&self) -> Vec<StartRecord> {
        std::mem::take(&mut *self.starts.lock().expect("lock"))
    }

    /// Resolve the most recent playback with `outcome`.
    pub fn finish_last(&self, outcome: PlaybackOutcome) {
        let tx = self
            .done_txs
            .lock()
            .expect("lock")
            .pop()
            .expect("no playback to finish");
        let _ = tx.send(outcome);
    }

    fn record(&self, params: &BroadcastParams, source: StartSource) -> PlaybackHandle {
        self.starts.lock().expect("lock").push(StartRecord {
            params: params.clone(),
            source,
        });
        let (stop_tx, _stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.done_txs.lock().expect("lock").push(done_tx);
        PlaybackHandle::from_parts(stop_tx, done_rx)
    }
}

#[async_trait]
impl Modulator for FakeModulator {
    async fn start_file(
        &self,
        params: &BroadcastParams,
        wav_path: &Path,
    ) -> Result<PlaybackHandle, ModulatorError> {
        Ok(self.record(params, StartSource::File(wav_path.to_path_buf())))
    }

    async fn start_stream(
        &self,
        params: &BroadcastParams,
        rate: u32,
        channels: u8,
        pcm: mpsc::Receiver<Bytes>,
    ) -> Result<PlaybackHandle, ModulatorError> {
        Ok(self.record(
            params,
            StartSource::Stream {
                rate,
                channels,
                pcm,
            },
        ))
    }
}
