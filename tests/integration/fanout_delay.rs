// Delayed-start fan-out: with wait_start and N targets, every agent
// receives one START frame carrying the identical start_at = now + 20·(N−1).

mod common;

use bw_protocol::commands;
use bw_test_utils::MockAgent;
use chrono::Utc;

#[tokio::test]
async fn three_targets_share_a_start_at_forty_seconds_out() {
    let (server, _base) = common::spawn_controller().await;

    let mut agents = Vec::new();
    for hostname in ["pi1", "pi2", "pi3"] {
        // Same peer IP, distinct hostnames → three distinct ids.
        agents.push(
            MockAgent::register(server.control_addr, hostname, None)
                .await
                .expect("register"),
        );
    }

    let t0 = Utc::now().timestamp();
    let reached = controller::broadcast::start_broadcast(
        &server.state,
        "all",
        "song.wav",
        100.0,
        "PS",
        "RT",
        "FFFF",
        false,
        true,
    )
    .await;
    assert_eq!(reached.len(), 3);

    let mut start_ats = Vec::new();
    for agent in &mut agents {
        let frame = agent.expect(commands::START).await.expect("START frame");
        assert_eq!(frame.kwarg("filename"), Some("song.wav"));
        assert_eq!(frame.kwarg("freq"), Some("100"));
        assert_eq!(frame.kwarg("ps"), Some("PS"));
        assert_eq!(frame.kwarg("rt"), Some("RT"));
        assert_eq!(frame.kwarg("pi"), Some("FFFF"));
        assert_eq!(frame.kwarg("loop"), Some("false"));
        let start_at: i64 = frame
            .kwarg("start_at")
            .expect("start_at")
            .parse()
            .expect("numeric start_at");
        start_ats.push(start_at);
    }

    // Identical across the fleet, and 20 s per extra target from t0.
    assert!(start_ats.windows(2).all(|w| w[0] == w[1]));
    let expected = t0 + 40;
    assert!(
        (start_ats[0] - expected).abs() <= 2,
        "start_at {} not within 2s of {expected}",
        start_ats[0]
    );

    server.shutdown().await;
}

#[tokio::test]
async fn single_target_starts_asap() {
    let (server, _base) = common::spawn_controller().await;

    let mut agent = MockAgent::register(server.control_addr, "pi1", None)
        .await
        .expect("register");

    let reached = controller::broadcast::start_broadcast(
        &server.state,
        "pi1",
        "song.wav",
        90.0,
        "BotWave",
        "song.wav",
        "FFFF",
        false,
        true,
    )
    .await;
    assert_eq!(reached, vec!["pi1_127.0.0.1"]);

    let frame = agent.expect(commands::START).await.expect("START frame");
    assert_eq!(frame.kwarg("start_at"), Some("0"));

    server.shutdown().await;
}

#[tokio::test]
async fn start_asap_mode_never_staggers() {
    let (server, _base) = common::spawn_controller_with(|cfg| cfg.wait_start = false).await;

    let mut agents = Vec::new();
    for hostname in ["pi1", "pi2"] {
        agents.push(
            MockAgent::register(server.control_addr, hostname, None)
                .await
                .expect("register"),
        );
    }

    controller::broadcast::start_broadcast(
        &server.state,
        "all",
        "song.wav",
        90.0,
        "BotWave",
        "song.wav",
        "FFFF",
        false,
        true,
    )
    .await;

    for agent in &mut agents {
        let frame = agent.expect(commands::START).await.expect("START frame");
        assert_eq!(frame.kwarg("start_at"), Some("0"));
    }

    server.shutdown().await;
}
