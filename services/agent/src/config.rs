//! Agent configuration, mirroring the deployed CLI flags.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "agent", about = "BotWave edge agent")]
pub struct AgentArgs {
    /// Controller hostname or IP.
    pub server_host: String,

    /// Controller control port.
    #[arg(long, default_value_t = 9938)]
    pub port: u16,

    /// File transfer host (defaults to the server host).
    #[arg(long)]
    pub fhost: Option<String>,

    /// File transfer port.
    #[arg(long, default_value_t = 9921)]
    pub fport: u16,

    /// Library directory for broadcastable files.
    #[arg(long, default_value = "/opt/BotWave/uploads")]
    pub upload_dir: PathBuf,

    /// Passkey presented during registration.
    #[arg(long = "pk")]
    pub passkey: Option<String>,

    /// Transmitter binary driving the FM modulator.
    #[arg(long, default_value = "bw-transmit")]
    pub transmitter_cmd: String,

    /// Let the transmitter print its own logs.
    #[arg(long)]
    pub talk: bool,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_host: String,
    pub ws_port: u16,
    pub http_host: String,
    pub http_port: u16,
    pub upload_dir: PathBuf,
    pub passkey: Option<String>,
    pub transmitter_cmd: String,
    pub talk: bool,
}

impl From<AgentArgs> for AgentConfig {
    fn from(args: AgentArgs) -> Self {
        let http_host = args.fhost.unwrap_or_else(|| args.server_host.clone());
        AgentConfig {
            server_host: args.server_host,
            ws_port: args.port,
            http_host,
            http_port: args.fport,
            upload_dir: args.upload_dir,
            passkey: args.passkey,
            transmitter_cmd: args.transmitter_cmd,
            talk: args.talk,
        }
    }
}
