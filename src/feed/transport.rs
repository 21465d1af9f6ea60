use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{IngestError, Result};

/// What the socket produced, with protocol frames already handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Protocol ping/pong: proof of life, no payload
    Heartbeat,
    Closed,
}

/// One live connection. Reads must be cancel-safe.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn send_ping(&mut self) -> Result<()>;
    async fn next_message(&mut self) -> Result<Inbound>;
    async fn close(&mut self);
}

/// Opens transports. Shared by every live adapter in the process.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>>;
}

pub struct TungsteniteConnector {
    handshake_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Transport>> {
        url::Url::parse(url).map_err(IngestError::connection)?;
        let (ws, _) = timeout(self.handshake_timeout, connect_async(url))
            .await
            .map_err(|_| IngestError::Connection(format!("handshake timed out: {}", url)))?
            .map_err(IngestError::connection)?;
        Ok(Box::new(TungsteniteTransport { ws }))
    }
}

struct TungsteniteTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(IngestError::connection)
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.ws
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(IngestError::connection)
    }

    async fn next_message(&mut self) -> Result<Inbound> {
        match self.ws.next().await {
            None => Ok(Inbound::Closed),
            Some(Err(e)) => Err(IngestError::connection(e)),
            Some(Ok(Message::Text(t))) => Ok(Inbound::Text(t)),
            Some(Ok(Message::Binary(b))) => Ok(Inbound::Text(String::from_utf8_lossy(&b).into_owned())),
            Some(Ok(Message::Ping(payload))) => {
                self.ws
                    .send(Message::Pong(payload))
                    .await
                    .map_err(IngestError::connection)?;
                Ok(Inbound::Heartbeat)
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(Inbound::Heartbeat),
            Some(Ok(Message::Close(_))) => Ok(Inbound::Closed),
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
