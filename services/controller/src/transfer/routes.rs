//! Transfer endpoints: `/download/{token}`, `/upload/{token}`,
//! `/stream/{token}`.
//!
//! Responses: 200 on success, 404 on unknown/used tokens, 413 when a body
//! exceeds its preannounced size, 500 on I/O failure.  Size and extension
//! policy live on the minting side, not here.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download/{token}", get(download))
        .route("/upload/{token}", post(upload).put(upload))
        .route("/stream/{token}", get(stream))
        .with_state(state)
}

async fn download(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    let Some(path) = state.tokens.claim_download(&token).await else {
        warn!(token = %token, "download request with unknown or used token");
        return StatusCode::NOT_FOUND.into_response();
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "download source unreadable");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut response = Response::builder().status(StatusCode::OK);
    if let Ok(metadata) = file.metadata().await {
        response = response.header(header::CONTENT_LENGTH, metadata.len());
    }
    response = response.header(header::CONTENT_TYPE, "application/octet-stream");

    info!(path = %path.display(), "streaming download");
    match response.body(Body::from_stream(ReaderStream::new(file))) {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn upload(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some((dir, target_name, expected_size)) = state.tokens.claim_upload(&token).await else {
        warn!(token = %token, "upload request with unknown or used token");
        return StatusCode::NOT_FOUND.into_response();
    };

    if expected_size > 0 {
        let announced = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(announced) = announced {
            if announced > expected_size {
                warn!(announced, expected_size, "upload body preannouncement exceeds token size");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        }
    }

    // Write into a temp file beside the target so the rename is atomic; no
    // partial file is ever visible under the final name.
    let temp_dir = dir.clone();
    let temp = match tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(temp_dir))
        .await
    {
        Ok(Ok(temp)) => temp,
        _ => {
            warn!(dir = %dir.display(), "could not create upload temp file");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut file = match tokio::fs::File::create(temp.path()).await {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, "could not open upload temp file");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut written: u64 = 0;
    let mut body_stream = body.into_data_stream();
    while let Some(chunk) = body_stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "upload body aborted");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        written += chunk.len() as u64;
        if expected_size > 0 && written > expected_size {
            warn!(written, expected_size, "upload body exceeds token size");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
        if let Err(e) = file.write_all(&chunk).await {
            warn!(error = %e, "upload write failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    if let Err(e) = file.sync_all().await {
        warn!(error = %e, "upload sync failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    drop(file);

    let final_path = dir.join(&target_name);
    let persisted =
        tokio::task::spawn_blocking(move || temp.persist(final_path).map(|_| ())).await;
    match persisted {
        Ok(Ok(())) => {
            info!(target = %target_name, written, "upload stored");
            StatusCode::OK.into_response()
        }
        _ => {
            warn!(target = %target_name, "upload rename failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn stream(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    let Some((rx, rate, channels)) = state.tokens.claim_stream(&token).await else {
        warn!(token = %token, "stream request with unknown or used token");
        return StatusCode::NOT_FOUND.into_response();
    };

    info!(rate, channels, "live PCM stream attached");

    // Lagged receivers skip chunks rather than erroring out; the body ends
    // when the capture side drops its sender.
    let pcm = BroadcastStream::new(rx).filter_map(|chunk| {
        futures_util::future::ready(match chunk {
            Ok(bytes) => Some(Ok::<_, std::io::Error>(bytes)),
            Err(_) => None,
        })
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("x-pcm-rate", rate)
        .header("x-pcm-channels", u32::from(channels))
        .body(Body::from_stream(pcm));
    match response {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
