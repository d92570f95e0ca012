//! Transfer token table.
//!
//! A token is an unguessable capability string (16 random bytes, hex)
//! bound to exactly one operation: download a server file, upload to a
//! target name, or read a live PCM stream.  Claiming removes the entry, so
//! each token authorizes at most one HTTP operation of its kind; unclaimed
//! entries are swept after an idle timeout so nothing leaks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::RngCore;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// Idle lifetime of an unclaimed token.
pub const TOKEN_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub enum TokenKind {
    Download {
        path: PathBuf,
    },
    Upload {
        dir: PathBuf,
        target_name: String,
        /// 0 means the size is unknown; non-zero is an upper bound the
        /// endpoint enforces with 413.
        expected_size: u64,
    },
    Stream {
        rx: broadcast::Receiver<Bytes>,
        rate: u32,
        channels: u8,
    },
}

struct TokenEntry {
    kind: TokenKind,
    minted_at: Instant,
}

#[derive(Default)]
pub struct TokenTable {
    entries: Mutex<HashMap<String, TokenEntry>>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mint_download(&self, path: PathBuf) -> String {
        self.mint(TokenKind::Download { path }).await
    }

    pub async fn mint_upload(&self, dir: PathBuf, target_name: String, expected_size: u64) -> String {
        self.mint(TokenKind::Upload {
            dir,
            target_name,
            expected_size,
        })
        .await
    }

    pub async fn mint_stream(&self, rx: broadcast::Receiver<Bytes>, rate: u32, channels: u8) -> String {
        self.mint(TokenKind::Stream { rx, rate, channels }).await
    }

    async fn mint(&self, kind: TokenKind) -> String {
        let token = generate_token();
        let mut entries = self.entries.lock().await;
        entries.insert(
            token.clone(),
            TokenEntry {
                kind,
                minted_at: Instant::now(),
            },
        );
        token
    }

    /// Claim a download token.  Removes the entry only when the token
    /// exists and is of the download kind, so a request to the wrong
    /// endpoint cannot burn a token.
    pub async fn claim_download(&self, token: &str) -> Option<PathBuf> {
        let mut entries = self.entries.lock().await;
        match entries.get(token) {
            Some(TokenEntry {
                kind: TokenKind::Download { .. },
                ..
            }) => match entries.remove(token) {
                Some(TokenEntry {
                    kind: TokenKind::Download { path },
                    ..
                }) => Some(path),
                _ => None,
            },
            _ => None,
        }
    }

    pub async fn claim_upload(&self, token: &str) -> Option<(PathBuf, String, u64)> {
        let mut entries = self.entries.lock().await;
        match entries.get(token) {
            Some(TokenEntry {
                kind: TokenKind::Upload { .. },
                ..
            }) => match entries.remove(token) {
                Some(TokenEntry {
                    kind:
                        TokenKind::Upload {
                            dir,
                            target_name,
                            expected_size,
                        },
                    ..
                }) => Some((dir, target_name, expected_size)),
                _ => None,
            },
            _ => None,
        }
    }

    pub async fn claim_stream(&self, token: &str) -> Option<(broadcast::Receiver<Bytes>, u32, u8)> {
        let mut entries = self.entries.lock().await;
        match entries.get(token) {
            Some(TokenEntry {
                kind: TokenKind::Stream { .. },
                ..
            }) => match entries.remove(token) {
                Some(TokenEntry {
                    kind: TokenKind::Stream { rx, rate, channels },
                    ..
                }) => Some((rx, rate, channels)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Drop entries older than `ttl`.  Returns how many were swept.
    pub async fn sweep_expired(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.minted_at.elapsed() < ttl);
        let swept = before - entries.len();
        if swept > 0 {
            debug!(swept, "expired transfer tokens released");
        }
        swept
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        let released = entries.len();
        entries.clear();
        if released > 0 {
            info!(released, "outstanding transfer tokens released");
        }
    }
}

fn generate_token() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}
