//! Uplink WebSocket client.
//!
//! Connects to the controller over TLS with certificate verification
//! disabled, then performs the REGISTER/AUTH/VER handshake.  The agent
//! considers itself registered once REGISTER_OK arrives, with a 5 s
//! timeout after which it gives up and disconnects.

use std::sync::Arc;
use std::time::Duration;

use bw_protocol::{commands, Frame, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::Connector;
use tracing::info;

use crate::config::AgentConfig;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum UplinkError {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("WebSocket error: {0}")]
    Ws(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("protocol version mismatch (server {server}, client {client})")]
    VersionMismatch { server: String, client: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("registration timeout")]
    RegistrationTimeout,
    #[error("disconnected")]
    Disconnected,
}

// ---------------------------------------------------------------------------
// TLS connector (verification disabled)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A tungstenite connector that accepts the controller's self-signed cert.
///
/// The ring provider is pinned explicitly so the config builds the same
/// way regardless of which providers other dependencies compile in.
pub fn insecure_connector() -> Result<Connector, UplinkError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| UplinkError::Connect(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

// ---------------------------------------------------------------------------
// Machine descriptor
// ---------------------------------------------------------------------------

/// Values for the REGISTER frame, best-effort gathered from the host.
pub fn machine_descriptor() -> (String, String, String, String) {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned());
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "unknown".to_owned());
    (
        host,
        std::env::consts::ARCH.to_owned(),
        std::env::consts::OS.to_owned(),
        release,
    )
}

// ---------------------------------------------------------------------------
// Connect + register
// ---------------------------------------------------------------------------

/// Open the control socket and register.  Returns the live stream and the
/// `client_id` the controller assigned.
pub async fn connect_and_register(cfg: &AgentConfig) -> Result<(WsStream, String), UplinkError> {
    let url = format!("wss://{}:{}", cfg.server_host, cfg.ws_port);
    info!(url = %url, "connecting");

    let (mut ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
        url.as_str(),
        None,
        false,
        Some(insecure_connector()?),
    )
    .await
    .map_err(|e| UplinkError::Connect(e.to_string()))?;

    let (host, machine, system, release) = machine_descriptor();
    let register = Frame::new(commands::REGISTER)
        .kw("hostname", host)
        .kw("machine", machine)
        .kw("system", system)
        .kw("release", release);
    send_frame(&mut ws, &register).await?;

    if let Some(passkey) = &cfg.passkey {
        send_frame(&mut ws, &Frame::new(commands::AUTH).arg(passkey.as_str())).await?;
    }
    send_frame(&mut ws, &Frame::new(commands::VER).arg(PROTOCOL_VERSION)).await?;

    let deadline = tokio::time::Instant::now() + REGISTRATION_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(UplinkError::RegistrationTimeout);
        }

        let message = match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => return Err(UplinkError::Ws(e.to_string())),
            Ok(None) => return Err(UplinkError::Disconnected),
            Err(_) => return Err(UplinkError::RegistrationTimeout),
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
                continue;
            }
            Message::Close(_) => return Err(UplinkError::Disconnected),
            _ => continue,
        };

        let frame = Frame::parse(text.as_str())
            .map_err(|e| UplinkError::Protocol(format!("bad frame: {e}")))?;
        match frame.command.as_str() {
            commands::REGISTER_OK => {
                let client_id = frame.kwarg("client_id").unwrap_or("unknown").to_owned();
                info!(client_id = %client_id, "registered");
                return Ok((ws, client_id));
            }
            commands::AUTH_FAILED => {
                return Err(UplinkError::AuthFailed(
                    frame.kwarg("message").unwrap_or("Invalid passkey").to_owned(),
                ));
            }
            commands::VERSION_MISMATCH => {
                return Err(UplinkError::VersionMismatch {
                    server: frame.kwarg("server_version").unwrap_or("unknown").to_owned(),
                    client: PROTOCOL_VERSION.to_owned(),
                });
            }
            commands::ERROR => {
                return Err(UplinkError::Protocol(
                    frame.kwarg("message").unwrap_or("Error").to_owned(),
                ));
            }
            _ => continue,
        }
    }
}

pub async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<(), UplinkError> {
    let line = frame
        .encode()
        .map_err(|e| UplinkError::Protocol(e.to_string()))?;
    ws.send(Message::Text(line.into()))
        .await
        .map_err(|e| UplinkError::Ws(e.to_string()))
}
