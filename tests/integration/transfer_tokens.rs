// Transfer-plane token properties: single use, kind scoping, size limits,
// and upload atomicity.

mod common;

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::sync::broadcast;

#[tokio::test]
async fn download_token_is_retired_after_first_use() {
    let (server, base) = common::spawn_controller().await;
    let client = common::insecure_http_client();

    let source = base.path().join("song.wav");
    tokio::fs::write(&source, b"RIFFdata").await.expect("seed");
    let token = server.state.tokens.mint_download(source).await;
    let url = format!("https://{}/download/{token}", server.transfer_addr);

    let first = client.get(&url).send().await.expect("first GET");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.bytes().await.expect("body").as_ref(), b"RIFFdata");

    let second = client.get(&url).send().await.expect("second GET");
    assert_eq!(second.status(), StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn upload_token_stores_atomically_and_retires() {
    let (server, base) = common::spawn_controller().await;
    let client = common::insecure_http_client();

    let dest_dir = base.path().join("uploads");
    let token = server
        .state
        .tokens
        .mint_upload(dest_dir.clone(), "incoming.wav".to_owned(), 0)
        .await;
    let url = format!("https://{}/upload/{token}", server.transfer_addr);

    let response = client
        .post(&url)
        .body(b"wav-bytes".to_vec())
        .send()
        .await
        .expect("POST");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        tokio::fs::read(dest_dir.join("incoming.wav"))
            .await
            .expect("stored file"),
        b"wav-bytes".to_vec()
    );

    let replay = client
        .post(&url)
        .body(b"other".to_vec())
        .send()
        .await
        .expect("replay POST");
    assert_eq!(replay.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        tokio::fs::read(dest_dir.join("incoming.wav"))
            .await
            .expect("stored file"),
        b"wav-bytes".to_vec()
    );

    server.shutdown().await;
}

#[tokio::test]
async fn oversized_upload_is_413_and_leaves_no_final_file() {
    let (server, base) = common::spawn_controller().await;
    let client = common::insecure_http_client();

    let dest_dir = base.path().join("uploads");
    let token = server
        .state
        .tokens
        .mint_upload(dest_dir.clone(), "small.wav".to_owned(), 4)
        .await;
    let url = format!("https://{}/upload/{token}", server.transfer_addr);

    let response = client
        .post(&url)
        .body(b"way too large".to_vec())
        .send()
        .await
        .expect("POST");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!dest_dir.join("small.wav").exists());

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_tokens_are_404_on_every_endpoint() {
    let (server, _base) = common::spawn_controller().await;
    let client = common::insecure_http_client();

    for endpoint in ["download", "upload", "stream"] {
        let url = format!(
            "https://{}/{endpoint}/{}",
            server.transfer_addr, "deadbeefdeadbeefdeadbeefdeadbeef"
        );
        let response = if endpoint == "upload" {
            client.post(&url).body(Vec::new()).send().await
        } else {
            client.get(&url).send().await
        }
        .expect("request");
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{endpoint}");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn wrong_endpoint_does_not_burn_a_token() {
    let (server, base) = common::spawn_controller().await;
    let client = common::insecure_http_client();

    let source = base.path().join("song.wav");
    tokio::fs::write(&source, b"RIFF").await.expect("seed");
    let token = server.state.tokens.mint_download(source).await;

    let wrong = client
        .get(format!("https://{}/stream/{token}", server.transfer_addr))
        .send()
        .await
        .expect("GET stream");
    assert_eq!(wrong.status(), StatusCode::NOT_FOUND);

    let right = client
        .get(format!("https://{}/download/{token}", server.transfer_addr))
        .send()
        .await
        .expect("GET download");
    assert_eq!(right.status(), StatusCode::OK);

    server.shutdown().await;
}

#[tokio::test]
async fn stream_token_delivers_pcm_until_the_producer_ends() {
    let (server, _base) = common::spawn_controller().await;
    let client = common::insecure_http_client();

    let (tx, rx) = broadcast::channel::<Bytes>(16);
    let token = server.state.tokens.mint_stream(rx, 48_000, 2).await;
    let url = format!("https://{}/stream/{token}", server.transfer_addr);

    let response = client.get(&url).send().await.expect("GET stream");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-pcm-rate").map(|v| v.as_bytes()),
        Some(b"48000".as_slice())
    );

    let feeder = tokio::spawn(async move {
        for chunk in [&b"abcd"[..], &b"efgh"[..]] {
            let _ = tx.send(Bytes::copy_from_slice(chunk));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // tx drops here, ending the stream.
    });

    let mut collected = Vec::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        collected.extend_from_slice(&chunk.expect("chunk"));
    }
    feeder.await.expect("feeder");
    assert_eq!(collected, b"abcdefgh");

    // Stream tokens are claim-once as well.
    let replay = client.get(&url).send().await.expect("replay GET");
    assert_eq!(replay.status(), StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_outstanding_tokens() {
    let (server, base) = common::spawn_controller().await;

    let source = base.path().join("song.wav");
    tokio::fs::write(&source, b"RIFF").await.expect("seed");
    let _token = server.state.tokens.mint_download(source).await;

    server.state.shutdown().await;
    assert_eq!(
        server
            .state
            .tokens
            .sweep_expired(Duration::from_secs(0))
            .await,
        0,
        "token table must already be empty after shutdown"
    );
}
