// Agent → local sync: files travel through hidden temp names, settle, and
// are renamed onto their final names; no temp residue survives.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use bw_protocol::{commands, encode_file_list, FileInfo, Frame};
use bw_test_utils::MockAgent;

/// Drive a mock source agent: answer LIST_FILES from `library`, and honor
/// UPLOAD_TOKEN commands by POSTing the real bodies to the transfer port.
fn run_source_agent(
    mut source: MockAgent,
    transfer_addr: std::net::SocketAddr,
    library: BTreeMap<String, Vec<u8>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = common::insecure_http_client();
        loop {
            let frame = match source.recv().await {
                Ok(frame) => frame,
                Err(_) => return,
            };
            match frame.command.as_str() {
                commands::PING => {
                    let _ = source.send(&Frame::new(commands::PONG)).await;
                }
                commands::LIST_FILES => {
                    let files: Vec<FileInfo> = library
                        .iter()
                        .map(|(name, body)| FileInfo {
                            name: name.clone(),
                            size: body.len() as u64,
                            modified: "2026-08-01T00:00:00+00:00".to_owned(),
                        })
                        .collect();
                    let json = encode_file_list(&files).expect("encode");
                    let reply = Frame::new(commands::OK)
                        .kw("message", format!("Found {} files", files.len()))
                        .kw("files", json);
                    let _ = source.send(&reply).await;
                }
                commands::UPLOAD_TOKEN => {
                    let token = frame.kwarg("token").expect("token").to_owned();
                    let name = frame.kwarg("filename").expect("filename").to_owned();
                    let body = library.get(&name).expect("known file").clone();
                    let url = format!("https://{transfer_addr}/upload/{token}");
                    let response = client.post(&url).body(body).send().await.expect("POST");
                    assert!(response.status().is_success());
                    let _ = source
                        .send(&bw_protocol::reply(commands::OK, format!("Uploaded {name}")))
                        .await;
                }
                _ => {}
            }
        }
    })
}

#[tokio::test]
async fn agent_to_local_sync_lands_files_without_temp_residue() {
    let (server, _base) = common::spawn_controller().await;

    let library: BTreeMap<String, Vec<u8>> = BTreeMap::from([
        ("alpha.wav".to_owned(), b"alpha-body".to_vec()),
        ("beta.wav".to_owned(), b"beta-body-longer".to_vec()),
    ]);

    let source = MockAgent::register(server.control_addr, "pi1", None)
        .await
        .expect("register");
    let source_task = run_source_agent(source, server.transfer_addr, library.clone());

    let dest = tempfile::tempdir().expect("dest dir");
    let dest_expr = format!("{}/", dest.path().display());

    let ok = controller::sync::sync_files(&server.state, &dest_expr, "pi1").await;
    assert!(ok, "sync must report success");

    // Final listing matches the source's library.
    let mut names: Vec<String> = std::fs::read_dir(dest.path())
        .expect("read dest")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["alpha.wav", "beta.wav"]);
    assert!(
        names.iter().all(|n| !n.starts_with(".sync_temp_")),
        "no temp residue may survive"
    );

    for (name, body) in &library {
        assert_eq!(
            &tokio::fs::read(dest.path().join(name)).await.expect("read"),
            body
        );
    }

    server.shutdown().await;
    source_task.abort();
}

#[tokio::test]
async fn sync_from_an_unknown_source_fails_cleanly() {
    let (server, _base) = common::spawn_controller().await;

    let dest = tempfile::tempdir().expect("dest dir");
    let dest_expr = format!("{}/", dest.path().display());

    let ok = controller::sync::sync_files(&server.state, &dest_expr, "ghost").await;
    assert!(!ok);
    assert_eq!(std::fs::read_dir(dest.path()).expect("read").count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn sync_into_a_missing_directory_fails_before_any_transfer() {
    let (server, _base) = common::spawn_controller().await;

    let _source = MockAgent::register(server.control_addr, "pi1", None)
        .await
        .expect("register");

    let ok =
        controller::sync::sync_files(&server.state, "/nonexistent/sync-target/", "pi1").await;
    assert!(!ok);

    // No upload token may be outstanding afterwards.
    assert_eq!(
        server
            .state
            .tokens
            .sweep_expired(Duration::from_secs(0))
            .await,
        0
    );

    server.shutdown().await;
}
