use clap::Parser;
use controller::{ControllerArgs, ControllerConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = ControllerConfig::from(ControllerArgs::parse());
    let daemon = cfg.daemon;

    let server = match controller::spawn(cfg).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("FATAL: failed to start server: {e}");
            std::process::exit(1);
        }
    };

    if daemon {
        let _ = tokio::signal::ctrl_c().await;
        server.shutdown().await;
    } else {
        // The console owns the lifetime; `exit` (or EOF) shuts everything
        // down before it returns.
        controller::console::run_console(server.state.clone()).await;
    }
}
