//! A scripted agent for controller tests.
//!
//! Connects to a real controller over TLS (verification disabled, like the
//! production agent), walks the REGISTER/AUTH/VER handshake, and then
//! sends/receives raw frames under test control.

use std::net::SocketAddr;

use agent::uplink::insecure_connector;
use bw_protocol::{commands, Frame, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type Error = Box<dyn std::error::Error + Send + Sync>;

pub struct MockAgent {
    ws: WsStream,
    pub client_id: String,
}

impl MockAgent {
    /// Open a socket without registering; the test drives the handshake.
    pub async fn connect_raw(addr: SocketAddr) -> Result<Self, Error> {
        let url = format!("wss://{addr}");
        let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            Some(insecure_connector()?),
        )
        .await?;
        Ok(MockAgent {
            ws,
            client_id: String::new(),
        })
    }

    /// Connect and complete a full handshake as `hostname`.
    pub async fn register(
        addr: SocketAddr,
        hostname: &str,
        passkey: Option<&str>,
    ) -> Result<Self, Error> {
        let mut agent = Self::connect_raw(addr).await?;
        agent
            .send(
                &Frame::new(commands::REGISTER)
                    .kw("hostname", hostname)
                    .kw("machine", "armv7")
                    .kw("system", "Linux")
                    .kw("release", "6.1"),
            )
            .await?;
        if let Some(passkey) = passkey {
            agent
                .send(&Frame::new(commands::AUTH).arg(passkey))
                .await?;
        }
        agent
            .send(&Frame::new(commands::VER).arg(PROTOCOL_VERSION))
            .await?;

        let response = agent.expect(commands::REGISTER_OK).await?;
        agent.client_id = response
            .kwarg("client_id")
            .ok_or("REGISTER_OK without client_id")?
            .to_owned();
        Ok(agent)
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        let line = frame.encode()?;
        self.ws.send(Message::Text(line.into())).await?;
        Ok(())
    }

    /// Next decoded frame; transport pings are answered transparently.
    pub async fn recv(&mut self) -> Result<Frame, Error> {
        loop {
            match self.ws.next().await {
                None => return Err("connection closed".into()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => return Ok(Frame::parse(text.as_str())?),
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => return Err("connection closed".into()),
                Some(Ok(_)) => {}
            }
        }
    }

    /// Skip liveness PINGs until a frame with `command` arrives; any other
    /// command is an error.
    pub async fn expect(&mut self, command: &str) -> Result<Frame, Error> {
        loop {
            let frame = self.recv().await?;
            if frame.command == commands::PING {
                self.send(&Frame::new(commands::PONG)).await?;
                continue;
            }
            if frame.command == command {
                return Ok(frame);
            }
            return Err(format!("expected {command}, got {}", frame.command).into());
        }
    }

    /// Wait for the server to close the socket.  Non-close frames other
    /// than liveness pings fail the expectation.
    pub async fn expect_close(&mut self) -> Result<(), Error> {
        loop {
            match self.ws.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(_)) => return Ok(()),
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Text(text))) => {
                    return Err(format!("expected close, got frame: {text}").into());
                }
                Some(Ok(_)) => {}
            }
        }
    }
}
