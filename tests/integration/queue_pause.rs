// Queue semantics end-to-end: END advances the queue, manual commands
// pause it, and a paused queue never advances.

mod common;

use std::time::Duration;

use bw_protocol::{commands, Frame};
use bw_test_utils::MockAgent;
use controller::queue::BroadcastIntent;

fn intent(filename: &str) -> BroadcastIntent {
    BroadcastIntent {
        targets: "pi1".to_owned(),
        filename: filename.to_owned(),
        frequency: 90.0,
        ps: "BotWave".to_owned(),
        rt: filename.to_owned(),
        pi: "FFFF".to_owned(),
        loop_flag: false,
    }
}

#[tokio::test]
async fn end_advances_the_queue_and_manual_start_pauses_it() {
    let (server, _base) = common::spawn_controller().await;
    let state = &server.state;

    let mut agent = MockAgent::register(server.control_addr, "pi1", None)
        .await
        .expect("register");

    {
        let mut queue = state.queue.lock().await;
        queue.push(intent("a.wav"));
        queue.push(intent("b.wav"));
    }

    // `queue !` resumes and steps into the first item.
    controller::queue::handle_command(state, &["!".to_owned()]).await;
    let first = agent.expect(commands::START).await.expect("START a.wav");
    assert_eq!(first.kwarg("filename"), Some("a.wav"));

    // END from the launched intent advances to the next item.
    agent
        .send(&Frame::new(commands::END).kw("filename", "a.wav"))
        .await
        .expect("send END");
    let second = agent.expect(commands::START).await.expect("START b.wav");
    assert_eq!(second.kwarg("filename"), Some("b.wav"));

    // A manual broadcast pauses the queue…
    {
        let mut queue = state.queue.lock().await;
        queue.push(intent("c.wav"));
    }
    controller::broadcast::start_broadcast(
        state, "pi1", "manual.wav", 90.0, "BotWave", "manual.wav", "FFFF", false, true,
    )
    .await;
    let manual = agent.expect(commands::START).await.expect("START manual");
    assert_eq!(manual.kwarg("filename"), Some("manual.wav"));
    assert!(state.queue.lock().await.is_paused());

    // …so END no longer advances anything.
    agent
        .send(&Frame::new(commands::END).kw("filename", "b.wav"))
        .await
        .expect("send END");
    let silence = tokio::time::timeout(Duration::from_millis(800), agent.recv()).await;
    assert!(silence.is_err(), "paused queue must not launch c.wav");
    assert_eq!(state.queue.lock().await.items().len(), 1);

    // Resuming and reporting the END lets c.wav launch.
    controller::queue::handle_command(state, &["!".to_owned()]).await;
    agent
        .send(&Frame::new(commands::END).kw("filename", "b.wav"))
        .await
        .expect("send END again");
    let third = agent.expect(commands::START).await.expect("START c.wav");
    assert_eq!(third.kwarg("filename"), Some("c.wav"));

    server.shutdown().await;
}

#[tokio::test]
async fn foreign_end_frames_do_not_consume_queue_items() {
    let (server, _base) = common::spawn_controller().await;
    let state = &server.state;

    let mut agent = MockAgent::register(server.control_addr, "pi1", None)
        .await
        .expect("register");

    {
        let mut queue = state.queue.lock().await;
        queue.push(intent("a.wav"));
        queue.push(intent("b.wav"));
    }
    controller::queue::handle_command(state, &["!".to_owned()]).await;
    let first = agent.expect(commands::START).await.expect("START a.wav");
    assert_eq!(first.kwarg("filename"), Some("a.wav"));

    // An END for a file the queue never launched is ignored.
    agent
        .send(&Frame::new(commands::END).kw("filename", "unrelated.wav"))
        .await
        .expect("send END");
    let silence = tokio::time::timeout(Duration::from_millis(800), agent.recv()).await;
    assert!(silence.is_err());
    assert_eq!(state.queue.lock().await.items().len(), 1);

    server.shutdown().await;
}
