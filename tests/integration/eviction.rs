// Agent-id collisions: a second successful handshake for the same id
// evicts the first session before the new record is installed.

mod common;

use std::time::Duration;

use bw_test_utils::MockAgent;

#[tokio::test]
async fn second_handshake_for_the_same_id_evicts_the_first_session() {
    let (server, _base) = common::spawn_controller().await;

    let mut first = MockAgent::register(server.control_addr, "pi1", None)
        .await
        .expect("first register");
    assert_eq!(first.client_id, "pi1_127.0.0.1");

    let second = MockAgent::register(server.control_addr, "pi1", None)
        .await
        .expect("second register");
    assert_eq!(second.client_id, "pi1_127.0.0.1");

    // The old socket is closed by the server.
    first.expect_close().await.expect("first session closed");

    // Exactly one record remains, and it is the new session's.
    let state = &server.state;
    let settled = common::wait_until(Duration::from_secs(2), move || async move {
        state.registry.read().await.len() == 1
    })
    .await;
    assert!(settled);
    assert!(
        server
            .state
            .registry
            .read()
            .await
            .contains_key("pi1_127.0.0.1")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn distinct_hostnames_coexist() {
    let (server, _base) = common::spawn_controller().await;

    let _first = MockAgent::register(server.control_addr, "pi1", None)
        .await
        .expect("pi1");
    let _second = MockAgent::register(server.control_addr, "pi2", None)
        .await
        .expect("pi2");

    let registry = server.state.registry.read().await;
    assert_eq!(registry.len(), 2);
    assert!(registry.contains_key("pi1_127.0.0.1"));
    assert!(registry.contains_key("pi2_127.0.0.1"));
    drop(registry);
    server.shutdown().await;
}
