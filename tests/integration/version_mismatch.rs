// Version negotiation: only the MAJOR field gates compatibility.

mod common;

use bw_protocol::{commands, Frame, PROTOCOL_VERSION};
use bw_test_utils::MockAgent;

#[tokio::test]
async fn incompatible_major_gets_version_mismatch_and_close() {
    let (server, _base) = common::spawn_controller().await;

    let mut agent = MockAgent::connect_raw(server.control_addr)
        .await
        .expect("connect");
    agent
        .send(&Frame::new(commands::REGISTER).kw("hostname", "pi1"))
        .await
        .expect("send REGISTER");
    agent
        .send(&Frame::new(commands::VER).arg("2.0.0"))
        .await
        .expect("send VER");

    let response = agent
        .expect(commands::VERSION_MISMATCH)
        .await
        .expect("reply");
    assert_eq!(response.kwarg("server_version"), Some(PROTOCOL_VERSION));
    assert_eq!(response.kwarg("client_version"), Some("2.0.0"));
    assert_eq!(
        response.kwarg("message"),
        Some("Protocol version mismatch. Please update.")
    );
    agent.expect_close().await.expect("close");

    assert!(server.state.registry.read().await.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn same_major_different_minor_is_accepted() {
    let (server, _base) = common::spawn_controller().await;

    let mut agent = MockAgent::connect_raw(server.control_addr)
        .await
        .expect("connect");
    agent
        .send(&Frame::new(commands::REGISTER).kw("hostname", "pi1"))
        .await
        .expect("send REGISTER");
    agent
        .send(&Frame::new(commands::VER).arg("1.9.9"))
        .await
        .expect("send VER");

    let response = agent.expect(commands::REGISTER_OK).await.expect("reply");
    assert_eq!(response.kwarg("client_id"), Some("pi1_127.0.0.1"));

    let registry = server.state.registry.read().await;
    assert_eq!(
        registry
            .get("pi1_127.0.0.1")
            .map(|r| r.protocol_version.clone()),
        Some("1.9.9".to_owned())
    );
    drop(registry);
    server.shutdown().await;
}

#[tokio::test]
async fn missing_version_argument_is_fatal() {
    let (server, _base) = common::spawn_controller().await;

    let mut agent = MockAgent::connect_raw(server.control_addr)
        .await
        .expect("connect");
    agent
        .send(&Frame::new(commands::REGISTER).kw("hostname", "pi1"))
        .await
        .expect("send REGISTER");
    agent
        .send(&Frame::new(commands::VER))
        .await
        .expect("send VER");

    let response = agent.expect(commands::ERROR).await.expect("reply");
    assert_eq!(response.kwarg("message"), Some("Missing protocol version"));
    agent.expect_close().await.expect("close");
    server.shutdown().await;
}
