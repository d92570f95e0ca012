//! Controller configuration.
//!
//! CLI flags are the sole config source, mirroring the deployed tooling.
//! `--base-dir` anchors both filesystem roots: `<base>/uploads` for the
//! broadcastable library and `<base>/handlers` for replay scripts (each
//! overridable).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "controller", about = "BotWave fleet controller")]
pub struct ControllerArgs {
    /// Bind host for both listeners.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Control port (TLS + WebSocket).
    #[arg(long, default_value_t = 9938)]
    pub port: u16,

    /// File transfer port (TLS + HTTP).
    #[arg(long, default_value_t = 9921)]
    pub fport: u16,

    /// Passkey agents must present during registration.
    #[arg(long = "pk")]
    pub passkey: Option<String>,

    /// Base directory for uploads and handlers.
    #[arg(long, default_value = "/opt/BotWave")]
    pub base_dir: PathBuf,

    /// Directory holding s_on* handler scripts (default: <base>/handlers).
    #[arg(long)]
    pub handlers_dir: Option<PathBuf>,

    /// Directory receiving uploaded files (default: <base>/uploads).
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Start broadcasts immediately (may cause fleet desync).
    #[arg(long = "start-asap")]
    pub start_asap: bool,

    /// Run without the interactive console.
    #[arg(long)]
    pub daemon: bool,

    /// ALSA capture device used for live broadcasts.
    #[arg(long, default_value = "hw:Loopback,1,0")]
    pub capture_device: String,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub host: String,
    pub control_port: u16,
    pub transfer_port: u16,
    pub passkey: Option<String>,
    pub base_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub handlers_dir: PathBuf,
    /// When true and a fan-out has more than one target, stagger the start
    /// 20 s per extra target so every agent has time to prepare.
    pub wait_start: bool,
    pub daemon: bool,
    pub capture_device: String,
    pub capture_rate: u32,
    pub capture_channels: u8,
}

impl From<ControllerArgs> for ControllerConfig {
    fn from(args: ControllerArgs) -> Self {
        let upload_dir = args
            .upload_dir
            .unwrap_or_else(|| args.base_dir.join("uploads"));
        let handlers_dir = args
            .handlers_dir
            .unwrap_or_else(|| args.base_dir.join("handlers"));
        ControllerConfig {
            host: args.host,
            control_port: args.port,
            transfer_port: args.fport,
            passkey: args.passkey,
            base_dir: args.base_dir,
            upload_dir,
            handlers_dir,
            wait_start: !args.start_asap,
            daemon: args.daemon,
            capture_device: args.capture_device,
            capture_rate: 48_000,
            capture_channels: 2,
        }
    }
}

impl ControllerConfig {
    /// A config rooted in `base` with ephemeral ports and no passkey,
    /// used by the integration suites.
    pub fn for_tests(base: &std::path::Path) -> Self {
        ControllerConfig {
            host: "127.0.0.1".to_owned(),
            control_port: 0,
            transfer_port: 0,
            passkey: None,
            base_dir: base.to_path_buf(),
            upload_dir: base.join("uploads"),
            handlers_dir: base.join("handlers"),
            wait_start: true,
            daemon: true,
            capture_device: "hw:Loopback,1,0".to_owned(),
            capture_rate: 48_000,
            capture_channels: 2,
        }
    }
}
