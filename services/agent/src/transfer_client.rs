//! HTTPS transfer client for the token-gated side channel.
//!
//! Certificate verification is disabled toward the controller (the fleet
//! authenticates with the passkey, not PKI); public URL fetches use a
//! separate, normally-verifying client.

use std::path::Path;

use bw_protocol::PROTOCOL_VERSION;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transfer rejected with status {0}")]
    Status(u16),
    #[error("file error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TransferClient {
    controller: reqwest::Client,
    public: reqwest::Client,
    host: String,
    port: u16,
}

impl TransferClient {
    pub fn new(host: &str, port: u16) -> Result<Self, TransferError> {
        let controller = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        let public = reqwest::Client::builder()
            .user_agent(format!("BotWaveDownloads/{PROTOCOL_VERSION}"))
            .build()?;
        Ok(TransferClient {
            controller,
            public,
            host: host.to_owned(),
            port,
        })
    }

    fn endpoint(&self, kind: &str, token: &str) -> String {
        format!("https://{}:{}/{kind}/{token}", self.host, self.port)
    }

    /// POST a library file to `/upload/<token>`, streaming the body.
    pub async fn upload(&self, token: &str, path: &Path) -> Result<(), TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        debug!(path = %path.display(), len, "uploading");

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .controller
            .post(self.endpoint("upload", token))
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    /// GET `/download/<token>` into `dest`, through a `.part` sibling so a
    /// dropped connection never leaves a half file under the final name.
    pub async fn download(&self, token: &str, dest: &Path) -> Result<u64, TransferError> {
        let response = self
            .controller
            .get(self.endpoint("download", token))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status().as_u16()));
        }

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(TransferError::Http(e));
                }
            };
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        info!(dest = %dest.display(), written, "download complete");
        Ok(written)
    }

    /// Open `/stream/<token>`; the caller drains `bytes_stream()`.
    pub async fn open_stream(&self, token: &str) -> Result<reqwest::Response, TransferError> {
        let response = self
            .controller
            .get(self.endpoint("stream", token))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status().as_u16()));
        }
        Ok(response)
    }

    /// Fetch a public URL into `dest` (used by DOWNLOAD_URL).
    pub async fn fetch_url(&self, url: &str, dest: &Path) -> Result<u64, TransferError> {
        let response = self.public.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status().as_u16()));
        }

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(TransferError::Http(e));
                }
            };
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        Ok(written)
    }
}

fn part_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_owned());
    name.push_str(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_keeps_the_directory() {
        let part = part_path(Path::new("/opt/BotWave/uploads/song.wav"));
        assert_eq!(part, Path::new("/opt/BotWave/uploads/song.wav.part"));
    }
}
