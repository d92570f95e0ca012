//! Shared setup for the end-to-end suites: a controller on ephemeral TLS
//! ports, rooted in a scratch directory.

#![allow(dead_code)]

use std::time::Duration;

use controller::{ControllerConfig, ControllerServer};

pub async fn spawn_controller() -> (ControllerServer, tempfile::TempDir) {
    spawn_controller_with(|_| {}).await
}

pub async fn spawn_controller_with(
    tweak: impl FnOnce(&mut ControllerConfig),
) -> (ControllerServer, tempfile::TempDir) {
    let base = tempfile::tempdir().expect("tempdir");
    let mut cfg = ControllerConfig::for_tests(base.path());
    tweak(&mut cfg);
    let server = controller::spawn(cfg).await.expect("controller spawn");
    (server, base)
}

/// An HTTPS client that accepts the controller's self-signed certificate.
pub fn insecure_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .expect("http client")
}

/// Poll `probe` every 25 ms until it returns true or `timeout` elapses.
/// Callers pass `move || async move { … }` over `Copy` references so each
/// probe call builds an independent future.
pub async fn wait_until<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
