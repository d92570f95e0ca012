// Handshake flows: happy path, passkey gating, and ordering rules.

mod common;

use std::time::Duration;

use bw_protocol::{commands, Frame, PROTOCOL_VERSION};
use bw_test_utils::MockAgent;

#[tokio::test]
async fn register_then_ver_yields_register_ok_and_a_registry_entry() {
    let (server, _base) = common::spawn_controller().await;

    let agent = MockAgent::register(server.control_addr, "pi1", None)
        .await
        .expect("register");
    assert_eq!(agent.client_id, "pi1_127.0.0.1");

    let registry = server.state.registry.read().await;
    assert_eq!(registry.len(), 1);
    let record = registry.get("pi1_127.0.0.1").expect("record");
    assert_eq!(record.machine.hostname, "pi1");
    assert_eq!(record.machine.machine, "armv7");
    assert_eq!(record.protocol_version, PROTOCOL_VERSION);
    assert!(record.authenticated);
    drop(registry);

    server.shutdown().await;
}

#[tokio::test]
async fn correct_passkey_completes_the_handshake() {
    let (server, _base) =
        common::spawn_controller_with(|cfg| cfg.passkey = Some("hunter2".to_owned())).await;

    let agent = MockAgent::register(server.control_addr, "pi1", Some("hunter2"))
        .await
        .expect("register with passkey");
    assert_eq!(agent.client_id, "pi1_127.0.0.1");

    server.shutdown().await;
}

#[tokio::test]
async fn wrong_passkey_gets_auth_failed_and_close() {
    let (server, _base) =
        common::spawn_controller_with(|cfg| cfg.passkey = Some("hunter2".to_owned())).await;

    let mut agent = MockAgent::connect_raw(server.control_addr)
        .await
        .expect("connect");
    agent
        .send(&Frame::new(commands::REGISTER).kw("hostname", "pi1"))
        .await
        .expect("send REGISTER");
    agent
        .send(&Frame::new(commands::AUTH).arg("wrong"))
        .await
        .expect("send AUTH");

    let response = agent.expect(commands::AUTH_FAILED).await.expect("reply");
    assert_eq!(response.kwarg("message"), Some("Invalid passkey"));
    agent.expect_close().await.expect("close");

    assert!(server.state.registry.read().await.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn handshake_never_completes_without_auth() {
    let (server, _base) =
        common::spawn_controller_with(|cfg| cfg.passkey = Some("hunter2".to_owned())).await;

    let mut agent = MockAgent::connect_raw(server.control_addr)
        .await
        .expect("connect");
    agent
        .send(&Frame::new(commands::REGISTER).kw("hostname", "pi1"))
        .await
        .expect("send REGISTER");
    agent
        .send(&Frame::new(commands::VER).arg(PROTOCOL_VERSION))
        .await
        .expect("send VER");

    let reply = tokio::time::timeout(Duration::from_millis(500), agent.recv()).await;
    assert!(reply.is_err(), "REGISTER_OK must not arrive without AUTH");
    assert!(server.state.registry.read().await.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn non_handshake_first_frame_is_rejected_and_closed() {
    let (server, _base) = common::spawn_controller().await;

    let mut agent = MockAgent::connect_raw(server.control_addr)
        .await
        .expect("connect");
    agent
        .send(&Frame::new(commands::START).kw("filename", "a.wav"))
        .await
        .expect("send START");

    let response = agent.expect(commands::ERROR).await.expect("reply");
    assert_eq!(
        response.kwarg("message"),
        Some("Expected REGISTER, AUTH, or VER, got START")
    );
    agent.expect_close().await.expect("close");
    server.shutdown().await;
}
