// agent: BotWave edge agent.
//
// Connects to the controller over TLS WebSocket, registers, and then
// executes broadcast and file-management commands against the local
// library and the FM modulator seam.

use std::sync::Arc;

use tokio::sync::mpsc;

pub mod config;
pub mod modulator;
pub mod playback;
pub mod session;
pub mod store;
pub mod transfer_client;
pub mod uplink;

pub use config::{AgentArgs, AgentConfig};
pub use session::{AgentState, SessionEnd};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("filesystem setup failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transfer(#[from] transfer_client::TransferError),
    #[error(transparent)]
    Uplink(#[from] uplink::UplinkError),
}

/// Connect, register, and run the session until it ends.
pub async fn run(
    cfg: AgentConfig,
    modulator: Arc<dyn modulator::Modulator>,
) -> Result<SessionEnd, AgentError> {
    tokio::fs::create_dir_all(&cfg.upload_dir).await?;

    let (out_tx, out_rx) = mpsc::channel(64);
    let transfer = Arc::new(transfer_client::TransferClient::new(
        &cfg.http_host,
        cfg.http_port,
    )?);
    let player = playback::Player::new(modulator, out_tx.clone());

    let (ws, _client_id) = uplink::connect_and_register(&cfg).await?;

    let state = AgentState {
        cfg: Arc::new(cfg),
        transfer,
        player,
        out_tx,
    };
    Ok(session::run_session(ws, state, out_rx).await?)
}
