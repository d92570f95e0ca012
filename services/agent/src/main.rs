use agent::modulator::CommandModulator;
use agent::{AgentArgs, AgentConfig, SessionEnd};
use clap::Parser;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = AgentConfig::from(AgentArgs::parse());
    let modulator = CommandModulator::new(cfg.transmitter_cmd.clone(), cfg.talk);

    match agent::run(cfg, modulator).await {
        Ok(SessionEnd::Disconnected) => info!("server closed the session"),
        Ok(SessionEnd::Kicked(reason)) => warn!(reason = %reason, "kicked"),
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    }
}
