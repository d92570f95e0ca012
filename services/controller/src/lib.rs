// controller: BotWave fleet controller.
//
// Owns the TLS control listener (WebSocket command sessions with every
// agent), the TLS transfer listener (token-gated bulk transfers), the
// broadcast coordinator, the sync engine, and the playback queue.

use std::net::SocketAddr;

use tokio::task::JoinHandle;
use tracing::{error, info};

pub mod broadcast;
pub mod capture;
pub mod config;
pub mod console;
pub mod fileops;
pub mod handlers;
pub mod queue;
pub mod registry;
pub mod state;
pub mod sync;
pub mod tls;
pub mod transfer;
pub mod ws_control;

pub use config::{ControllerArgs, ControllerConfig};
pub use state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("filesystem setup failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] tls::TlsError),
    #[error("listener bind failed: {0}")]
    Bind(String),
}

/// A running controller: both listeners bound, queue task and token
/// sweeper live.
pub struct ControllerServer {
    pub state: AppState,
    pub control_addr: SocketAddr,
    pub transfer_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerServer {
    pub async fn shutdown(self) {
        self.state.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Bring up the controller: mint TLS material, bind the control and
/// transfer listeners, and start the background tasks.
pub async fn spawn(cfg: config::ControllerConfig) -> Result<ControllerServer, ServerError> {
    tokio::fs::create_dir_all(&cfg.upload_dir).await?;

    let material = tls::generate_self_signed(&cfg.host)?;
    info!("generated self-signed TLS certificate");
    let control_tls = tls::rustls_config(&material).await?;
    let transfer_tls = tls::rustls_config(&material).await?;

    let (state, queue_rx) = state::AppState::new(cfg);
    let mut tasks = Vec::new();

    let control_bind: SocketAddr = format!("{}:{}", state.cfg.host, state.cfg.control_port)
        .parse()
        .map_err(|e| ServerError::Bind(format!("control address: {e}")))?;
    let transfer_bind: SocketAddr = format!("{}:{}", state.cfg.host, state.cfg.transfer_port)
        .parse()
        .map_err(|e| ServerError::Bind(format!("transfer address: {e}")))?;

    {
        let app = ws_control::router(state.clone());
        let handle = state.control_handle.clone();
        tasks.push(tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum_server::bind_rustls(control_bind, control_tls)
                .handle(handle)
                .serve(service)
                .await
            {
                error!(error = %e, "control listener failed");
            }
        }));
    }
    {
        let app = transfer::router(state.clone());
        let handle = state.transfer_handle.clone();
        tasks.push(tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum_server::bind_rustls(transfer_bind, transfer_tls)
                .handle(handle)
                .serve(service)
                .await
            {
                error!(error = %e, "transfer listener failed");
            }
        }));
    }

    let control_addr = state
        .control_handle
        .listening()
        .await
        .ok_or_else(|| ServerError::Bind("control listener did not come up".to_owned()))?;
    let transfer_addr = state
        .transfer_handle
        .listening()
        .await
        .ok_or_else(|| ServerError::Bind("transfer listener did not come up".to_owned()))?;

    tasks.push(tokio::spawn(queue::run_queue_task(
        state.clone(),
        queue_rx,
    )));
    {
        let sweeper_state = state.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tick.tick().await;
                sweeper_state
                    .tokens
                    .sweep_expired(transfer::tokens::TOKEN_TTL)
                    .await;
            }
        }));
    }

    info!(control = %control_addr, transfer = %transfer_addr, "BotWave server started");
    info!(version = bw_protocol::PROTOCOL_VERSION, "protocol version");
    if state.cfg.passkey.is_some() {
        info!("server is using authentication with a passkey");
    }

    state.handlers.run(&state, "s_onready").await;

    Ok(ControllerServer {
        state,
        control_addr,
        transfer_addr,
        tasks,
    })
}
